use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::util::errors::{Error, Result};

/// Identity of a cluster object the controller manages: `(kind, namespace, name)`.
///
/// The canonical text form is `Kind/Namespace/Name`; every key placed in the
/// state store round-trips through [`ResourceKey::from_str`] and [`fmt::Display`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        ResourceKey {
            kind: kind.into(),
            namespace: namespace.unwrap_or("default").to_string(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(namespace), Some(name))
                if !kind.is_empty() && !namespace.is_empty() && !name.is_empty() =>
            {
                Ok(ResourceKey {
                    kind: kind.to_string(),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(Error::InvalidResource(format!("malformed resource key: {s:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_defaults_when_absent() {
        let key = ResourceKey::new("ConfigMap", None, "app");
        assert_eq!(key.namespace, "default");
    }

    #[test]
    fn round_trips_through_text_form() {
        let key = ResourceKey::new("ConfigMap", Some("prod"), "app");
        let parsed: ResourceKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn rejects_malformed_text() {
        assert!("ConfigMap/app".parse::<ResourceKey>().is_err());
        assert!("//".parse::<ResourceKey>().is_err());
    }
}
