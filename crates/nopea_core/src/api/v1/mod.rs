use core::fmt;
use std::fmt::Display;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod gitrepository;

/// How the controller responds to out-of-band changes to applied resources.
#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealPolicy {
    #[default]
    Auto,
    Manual,
    Notify,
}

impl Display for HealPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HealPolicy::Auto => write!(f, "auto"),
            HealPolicy::Manual => write!(f, "manual"),
            HealPolicy::Notify => write!(f, "notify"),
        }
    }
}

/// Lifecycle phase of a repository worker, mirrored into the CRD status.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    Initializing,
    Syncing,
    Synced,
    Failed,
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Phase::Initializing => write!(f, "Initializing"),
            Phase::Syncing => write!(f, "Syncing"),
            Phase::Synced => write!(f, "Synced"),
            Phase::Failed => write!(f, "Failed"),
        }
    }
}

/// Annotation that suspends healing of a single live resource.
pub static SUSPEND_HEAL_ANNOTATION: &str = "nopea.io/suspend-heal";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heal_policy_round_trips_lowercase() {
        let auto: HealPolicy = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(auto, HealPolicy::Auto);
        assert_eq!(serde_json::to_string(&HealPolicy::Notify).unwrap(), "\"notify\"");
    }
}
