use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::key::ResourceKey;
use crate::util::errors::FileError;

/// A parsed Kubernetes object from a repository.
///
/// Construction guarantees `apiVersion`, `kind` and `metadata.name` are
/// present and non-empty, so everything downstream of the parser can rely
/// on them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(Value);

impl Manifest {
    pub fn from_value(value: Value) -> Option<Self> {
        let has = |path: &[&str]| -> bool {
            let mut cur = &value;
            for p in path {
                cur = match cur.get(p) {
                    Some(v) => v,
                    None => return false,
                };
            }
            matches!(cur.as_str(), Some(s) if !s.is_empty())
        };
        if has(&["apiVersion"]) && has(&["kind"]) && has(&["metadata", "name"]) {
            Some(Manifest(value))
        } else {
            None
        }
    }

    pub fn api_version(&self) -> &str {
        self.0.get("apiVersion").and_then(Value::as_str).unwrap_or("")
    }

    pub fn kind(&self) -> &str {
        self.0.get("kind").and_then(Value::as_str).unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.0
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.0.pointer("/metadata/namespace").and_then(Value::as_str)
    }

    /// Fill in `metadata.namespace` when the document does not carry one.
    pub fn default_namespace(&mut self, namespace: &str) {
        if self.namespace().is_some() {
            return;
        }
        if let Some(metadata) = self.0.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert("namespace".to_string(), Value::String(namespace.to_string()));
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.0
            .pointer("/metadata/annotations")
            .and_then(Value::as_object)
            .and_then(|a| a.get(key))
            .and_then(Value::as_str)
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind(), self.namespace(), self.name())
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// Parse one file's content as a stream of YAML documents.
///
/// Nil and empty documents are dropped, as are documents lacking the
/// required identity fields. Undecodable documents are reported per file;
/// callers treat any reported error as fatal for the whole sync.
pub fn parse_yaml_documents(file: &str, content: &str) -> (Vec<Manifest>, Vec<FileError>) {
    let mut manifests = Vec::new();
    let mut errors = Vec::new();

    for doc in serde_yaml::Deserializer::from_str(content) {
        match Value::deserialize(doc) {
            Ok(Value::Null) => {}
            Ok(value) => {
                if let Some(manifest) = Manifest::from_value(value) {
                    manifests.push(manifest);
                }
            }
            Err(e) => errors.push(FileError {
                file: file.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    (manifests, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn configmap() -> Manifest {
        Manifest::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "app"},
            "data": {"k": "v"}
        }))
        .unwrap()
    }

    #[test]
    fn rejects_documents_missing_identity() {
        assert!(Manifest::from_value(json!({"kind": "ConfigMap"})).is_none());
        assert!(Manifest::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {}
        }))
        .is_none());
    }

    #[test]
    fn default_namespace_only_fills_absent() {
        let mut m = configmap();
        m.default_namespace("prod");
        assert_eq!(m.namespace(), Some("prod"));
        m.default_namespace("other");
        assert_eq!(m.namespace(), Some("prod"));
    }

    #[test]
    fn key_uses_default_namespace_when_unset() {
        let key = configmap().key();
        assert_eq!(key.to_string(), "ConfigMap/default/app");
    }

    #[test]
    fn parses_multi_document_stream() {
        let src = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: b\n";
        let (manifests, errors) = parse_yaml_documents("all.yaml", src);
        assert!(errors.is_empty());
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[1].kind(), "Secret");
    }

    #[test]
    fn reports_undecodable_documents() {
        let (manifests, errors) = parse_yaml_documents("bad.yaml", "foo: [unclosed");
        assert!(manifests.is_empty());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].file, "bad.yaml");
    }

    #[test]
    fn drops_non_resource_documents_silently() {
        let (manifests, errors) = parse_yaml_documents("notes.yaml", "just: a-scalar-map\n");
        assert!(manifests.is_empty());
        assert!(errors.is_empty());
    }
}
