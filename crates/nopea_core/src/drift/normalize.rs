use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::model::Manifest;

const VOLATILE_METADATA: [&str; 6] = [
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "generation",
    "managedFields",
    "selfLink",
];

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Strip the fields the API server owns so two renditions of the same
/// desired state hash identically: `status`, volatile `metadata` fields, and
/// kubectl's last-applied annotation.
pub fn normalize(manifest: &Manifest) -> Manifest {
    let mut value = manifest.as_value().clone();

    if let Some(obj) = value.as_object_mut() {
        obj.remove("status");
    }
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in VOLATILE_METADATA {
            metadata.remove(field);
        }
        let drop_annotations = match metadata.get_mut("annotations").and_then(Value::as_object_mut) {
            Some(annotations) => {
                annotations.remove(LAST_APPLIED_ANNOTATION);
                annotations.is_empty()
            }
            None => false,
        };
        if drop_annotations {
            metadata.remove("annotations");
        }
    }

    // Identity fields survive normalization, so the value is still a Manifest.
    Manifest::from_value(value).expect("normalization preserves identity fields")
}

/// Canonical content hash of a normalized manifest.
///
/// `serde_json` maps are ordered, so equal objects serialize to equal bytes.
pub fn hash(manifest: &Manifest) -> String {
    let canonical = serde_json::to_vec(manifest.as_value()).expect("manifest values serialize");
    let digest = Sha256::digest(&canonical);
    format!("sha256:{}", hex::encode(digest))
}

pub fn normalized_hash(manifest: &Manifest) -> String {
    hash(&normalize(manifest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn desired() -> Manifest {
        Manifest::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "app", "namespace": "prod"},
            "data": {"k": "v"}
        }))
        .unwrap()
    }

    fn live() -> Manifest {
        Manifest::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "app",
                "namespace": "prod",
                "uid": "7c9f1a2e",
                "resourceVersion": "482",
                "creationTimestamp": "2025-11-02T10:00:00Z",
                "generation": 4,
                "managedFields": [{"manager": "nopea"}],
                "selfLink": "/api/v1/namespaces/prod/configmaps/app",
                "annotations": {
                    "kubectl.kubernetes.io/last-applied-configuration": "{}"
                }
            },
            "data": {"k": "v"},
            "status": {"observed": true}
        }))
        .unwrap()
    }

    #[test]
    fn server_added_fields_do_not_change_the_hash() {
        assert_eq!(normalize(&desired()), normalize(&live()));
        assert_eq!(normalized_hash(&desired()), normalized_hash(&live()));
    }

    #[test]
    fn user_annotations_survive_normalization() {
        let m = Manifest::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "app",
                "annotations": {
                    "nopea.io/suspend-heal": "true",
                    "kubectl.kubernetes.io/last-applied-configuration": "{}"
                }
            },
        }))
        .unwrap();
        let normalized = normalize(&m);
        assert_eq!(normalized.annotation("nopea.io/suspend-heal"), Some("true"));
        assert_eq!(
            normalized.annotation("kubectl.kubernetes.io/last-applied-configuration"),
            None
        );
    }

    #[test]
    fn data_changes_change_the_hash() {
        let mut changed = desired().into_value();
        changed["data"]["k"] = json!("v2");
        let changed = Manifest::from_value(changed).unwrap();
        assert_ne!(normalized_hash(&desired()), normalized_hash(&changed));
    }

    #[test]
    fn hash_is_prefixed_and_stable() {
        let h = normalized_hash(&desired());
        assert!(h.starts_with("sha256:"));
        assert_eq!(h, normalized_hash(&desired()));
    }
}
