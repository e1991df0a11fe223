use std::env;
use std::path::PathBuf;

use tracing::warn;

/// Leader-election lease parameters.
#[derive(Clone, Debug)]
pub struct LeaseConfig {
    pub name: String,
    pub namespace: String,
    pub lease_duration_seconds: u64,
    pub renew_deadline_seconds: u64,
    pub retry_period_seconds: u64,
}

/// Process configuration, read once from the environment at boot.
#[derive(Clone, Debug)]
pub struct Config {
    pub pod_namespace: String,
    pub pod_name: String,
    pub watch_namespace: String,
    pub enable_leader_election: bool,
    pub cluster_enabled: bool,
    pub http_port: u16,
    pub webhook_secret: Option<String>,
    pub lease: LeaseConfig,
    pub repo_base_dir: PathBuf,
    pub git_socket: PathBuf,
    pub git_bin: Option<PathBuf>,
    pub events_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let pod_namespace = env_str("POD_NAMESPACE", "default");
        let pod_name = env_str("POD_NAME", "nopea-0");
        let watch_namespace = env_str("WATCH_NAMESPACE", &pod_namespace);
        let lease_namespace = env_str("NOPEA_LEADER_LEASE_NAMESPACE", &pod_namespace);

        Config {
            watch_namespace,
            enable_leader_election: env_bool("NOPEA_ENABLE_LEADER_ELECTION", false),
            cluster_enabled: env_bool("NOPEA_CLUSTER_ENABLED", false),
            http_port: env_int("NOPEA_HTTP_PORT", 4000),
            webhook_secret: env::var("NOPEA_WEBHOOK_SECRET").ok().filter(|s| !s.is_empty()),
            lease: LeaseConfig {
                name: env_str("NOPEA_LEADER_LEASE_NAME", "nopea-leader"),
                namespace: lease_namespace,
                lease_duration_seconds: env_int("NOPEA_LEADER_LEASE_DURATION", 15),
                renew_deadline_seconds: env_int("NOPEA_LEADER_LEASE_RENEW_DEADLINE", 10),
                retry_period_seconds: env_int("NOPEA_LEADER_LEASE_RETRY_PERIOD", 2),
            },
            repo_base_dir: PathBuf::from(env_str("NOPEA_REPO_BASE_DIR", "/var/lib/nopea/repos")),
            git_socket: PathBuf::from(env_str("NOPEA_GIT_SOCKET", "/var/run/nopea/git.sock")),
            git_bin: env::var("NOPEA_GIT_BIN").ok().filter(|s| !s.is_empty()).map(PathBuf::from),
            events_url: env::var("NOPEA_EVENTS_URL").ok().filter(|s| !s.is_empty()),
            pod_namespace,
            pod_name,
        }
    }

    /// Identity written into the leader lease: pod name is unique per replica.
    pub fn holder_identity(&self) -> String {
        self.pod_name.clone()
    }
}

fn env_str(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Err(_) => default,
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" | "" => false,
            other => {
                warn!(key, value = other, "invalid boolean, using default {default}");
                default
            }
        },
    }
}

fn env_int<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match env::var(key) {
        Err(_) => default,
        Ok(v) => v.parse().unwrap_or_else(|_| {
            warn!(key, value = %v, "invalid integer, using default {default}");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; run them against distinct keys to
    // stay independent of test ordering.

    #[test]
    fn int_fallback_on_garbage() {
        env::set_var("NOPEA_TEST_PORT", "not-a-number");
        assert_eq!(env_int::<u16>("NOPEA_TEST_PORT", 4000), 4000);
        env::set_var("NOPEA_TEST_PORT", "8080");
        assert_eq!(env_int::<u16>("NOPEA_TEST_PORT", 4000), 8080);
        env::remove_var("NOPEA_TEST_PORT");
    }

    #[test]
    fn bool_parsing() {
        env::set_var("NOPEA_TEST_FLAG", "TRUE");
        assert!(env_bool("NOPEA_TEST_FLAG", false));
        env::set_var("NOPEA_TEST_FLAG", "0");
        assert!(!env_bool("NOPEA_TEST_FLAG", true));
        env::set_var("NOPEA_TEST_FLAG", "maybe");
        assert!(env_bool("NOPEA_TEST_FLAG", true));
        env::remove_var("NOPEA_TEST_FLAG");
    }
}
