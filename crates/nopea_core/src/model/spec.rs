use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::api::v1::gitrepository::GitRepository;
use crate::api::v1::HealPolicy;
use crate::util::errors::{Error, Result};

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Immutable view of a `GitRepository` resource, resolved with defaults.
///
/// Workers never look at the raw CRD spec after construction; every decision
/// is made against this value.
#[derive(Clone, Debug, PartialEq)]
pub struct RepositorySpec {
    pub name: String,
    pub source_namespace: String,
    pub url: String,
    pub branch: String,
    pub subpath: Option<String>,
    pub target_namespace: String,
    pub poll_interval: Duration,
    pub suspend: bool,
    pub heal_policy: HealPolicy,
    pub heal_grace_period: Option<Duration>,
    pub generation: Option<i64>,
    pub observed_generation: Option<i64>,
}

impl RepositorySpec {
    pub fn from_resource(repo: &GitRepository) -> Result<Self> {
        let name = repo
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidResource("missing metadata.name".into()))?;
        let source_namespace = repo
            .metadata
            .namespace
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidResource(format!("{name}: missing metadata.namespace")))?;
        if repo.spec.url.is_empty() {
            return Err(Error::InvalidResource(format!("{name}: missing spec.url")));
        }

        let poll_interval = match repo.spec.interval.as_deref() {
            None => DEFAULT_POLL_INTERVAL,
            Some(s) => parse_duration(s).unwrap_or_else(|| {
                warn!(repo = %name, interval = %s, "invalid interval, using default");
                DEFAULT_POLL_INTERVAL
            }),
        };
        let heal_grace_period = repo.spec.heal_grace_period.as_deref().and_then(|s| {
            let parsed = parse_duration(s);
            if parsed.is_none() {
                warn!(repo = %name, grace = %s, "invalid healGracePeriod, healing immediately");
            }
            parsed
        });

        Ok(RepositorySpec {
            source_namespace: source_namespace.clone(),
            url: repo.spec.url.clone(),
            branch: repo
                .spec
                .branch
                .clone()
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            subpath: repo.spec.path.clone().filter(|p| !p.is_empty()),
            target_namespace: repo
                .spec
                .target_namespace
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or(source_namespace),
            poll_interval,
            suspend: repo.spec.suspend,
            heal_policy: repo.spec.heal_policy.unwrap_or_default(),
            heal_grace_period,
            generation: repo.metadata.generation,
            observed_generation: repo.status.as_ref().and_then(|s| s.observed_generation),
            name,
        })
    }

    /// Reconcile passes fire at twice the poll interval.
    pub fn reconcile_interval(&self) -> Duration {
        self.poll_interval * 2
    }

    /// Working directory for this repository under `base`.
    pub fn work_dir(&self, base: &Path) -> PathBuf {
        base.join(sanitize_repo_name(&self.name))
    }
}

/// Replace every character outside `[A-Za-z0-9_-]` so the repo name is a
/// safe single path component.
pub fn sanitize_repo_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Parse a duration of the form `<digits><s|m|h>`. Zero is disallowed.
pub fn parse_duration(s: &str) -> Option<Duration> {
    if s.len() < 2 {
        return None;
    }
    let (digits, unit) = s.split_at(s.len() - 1);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u64 = digits.parse().ok()?;
    if n == 0 {
        return None;
    }
    match unit {
        "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n * 60)),
        "h" => Some(Duration::from_secs(n * 3600)),
        _ => None,
    }
}

/// `metadata.generation` differing from `status.observedGeneration` means the
/// spec changed and the worker must be replaced.
pub fn spec_changed(repo: &GitRepository) -> bool {
    let observed = repo.status.as_ref().and_then(|s| s.observed_generation);
    match (repo.metadata.generation, observed) {
        (Some(generation), Some(observed)) => generation != observed,
        // Status has never been written: treat as new.
        (Some(_), None) => true,
        (None, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::gitrepository::{GitRepositorySpec, GitRepositoryStatus};
    use kube::core::ObjectMeta;

    fn repo(spec: GitRepositorySpec) -> GitRepository {
        GitRepository {
            metadata: ObjectMeta {
                name: Some("acme".to_string()),
                namespace: Some("team-a".to_string()),
                generation: Some(2),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    #[test]
    fn defaults_are_applied() {
        let spec = RepositorySpec::from_resource(&repo(GitRepositorySpec {
            url: "https://example/acme.git".to_string(),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(spec.branch, "main");
        assert_eq!(spec.target_namespace, "team-a");
        assert_eq!(spec.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(spec.heal_policy, HealPolicy::Auto);
        assert!(spec.heal_grace_period.is_none());
        assert!(!spec.suspend);
    }

    #[test]
    fn missing_url_is_rejected() {
        let err = RepositorySpec::from_resource(&repo(GitRepositorySpec::default())).unwrap_err();
        assert!(matches!(err, Error::InvalidResource(_)));
    }

    #[test]
    fn invalid_interval_falls_back_to_default() {
        let spec = RepositorySpec::from_resource(&repo(GitRepositorySpec {
            url: "https://example/acme.git".to_string(),
            interval: Some("soon".to_string()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(spec.poll_interval, DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn parse_duration_grammar() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("0s"), None);
        assert_eq!(parse_duration("5"), None);
        assert_eq!(parse_duration("5d"), None);
        assert_eq!(parse_duration("m5"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn sanitizes_work_dir_component() {
        assert_eq!(sanitize_repo_name("team/app.v2"), "team_app_v2");
        assert_eq!(sanitize_repo_name("plain-name_1"), "plain-name_1");
    }

    #[test]
    fn spec_change_detection() {
        let mut r = repo(GitRepositorySpec {
            url: "https://example/acme.git".to_string(),
            ..Default::default()
        });
        assert!(spec_changed(&r));

        r.status = Some(GitRepositoryStatus {
            observed_generation: Some(2),
            ..Default::default()
        });
        assert!(!spec_changed(&r));

        r.metadata.generation = Some(3);
        assert!(spec_changed(&r));
    }
}
