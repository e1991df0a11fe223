use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::model::CommitSha;

type HmacSha256 = Hmac<Sha256>;

/// Which forge delivered the webhook, detected from headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    GitHub,
    GitLab,
}

impl Provider {
    /// Detect the provider from the event headers. GitHub sends
    /// `X-GitHub-Event`, GitLab `X-Gitlab-Event`.
    pub fn detect(github_event: Option<&str>, gitlab_event: Option<&str>) -> Option<Provider> {
        match (github_event, gitlab_event) {
            (Some(_), _) => Some(Provider::GitHub),
            (None, Some(_)) => Some(Provider::GitLab),
            (None, None) => None,
        }
    }

    /// Only push events trigger a sync; other event types are acknowledged
    /// and dropped.
    pub fn is_push_event(&self, event: &str) -> bool {
        match self {
            Provider::GitHub => event == "push",
            Provider::GitLab => event == "Push Hook",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GitHub => "github",
            Provider::GitLab => "gitlab",
        }
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Verify GitHub's `X-Hub-Signature-256: sha256=<hmac>` header against the
/// raw body.
pub fn verify_github_signature(secret: &str, signature_header: &str, body: &[u8]) -> bool {
    let Some(signature) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(&expected, &signature.to_ascii_lowercase())
}

/// Verify GitLab's `X-Gitlab-Token` header.
pub fn verify_gitlab_token(secret: &str, token: &str) -> bool {
    constant_time_eq(secret, token)
}

/// Repo names accepted on the webhook URL.
pub fn valid_repo_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

/// What a push payload tells us: the commit pushed and the branch it landed on.
#[derive(Debug, Clone, PartialEq)]
pub struct PushInfo {
    pub commit: Option<CommitSha>,
    pub branch: Option<String>,
}

/// Extract commit and branch from a push payload. Both forges use `after`
/// for the new head and `ref` for the branch. A malformed commit value is an
/// error; an absent one is not.
pub fn parse_push_payload(body: &[u8]) -> Result<PushInfo, String> {
    let payload: Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON payload: {e}"))?;

    let commit = match payload.get("after").and_then(Value::as_str) {
        None => None,
        Some(raw) => Some(CommitSha::new(raw).map_err(|_| format!("invalid commit sha: {raw:?}"))?),
    };
    let branch = payload
        .get("ref")
        .and_then(Value::as_str)
        .map(|r| r.strip_prefix("refs/heads/").unwrap_or(r).to_string());

    Ok(PushInfo { commit, branch })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "hunter2";

    fn github_signature(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn github_signature_round_trip() {
        let body = br#"{"after":"abc"}"#;
        let header = github_signature(SECRET, body);
        assert!(verify_github_signature(SECRET, &header, body));
        assert!(!verify_github_signature("wrong", &header, body));
        assert!(!verify_github_signature(SECRET, &header, b"tampered"));
        assert!(!verify_github_signature(SECRET, "md5=abcdef", body));
    }

    #[test]
    fn gitlab_token_compare() {
        assert!(verify_gitlab_token(SECRET, SECRET));
        assert!(!verify_gitlab_token(SECRET, "hunter3"));
        assert!(!verify_gitlab_token(SECRET, ""));
    }

    #[test]
    fn repo_name_pattern() {
        assert!(valid_repo_name("acme-web.v2_prod"));
        assert!(!valid_repo_name(""));
        assert!(!valid_repo_name("acme/web"));
        assert!(!valid_repo_name("acme web"));
    }

    #[test]
    fn push_payload_extraction() {
        let sha = "a".repeat(40);
        let body = format!(r#"{{"after":"{sha}","ref":"refs/heads/main"}}"#);
        let info = parse_push_payload(body.as_bytes()).unwrap();
        assert_eq!(info.commit.unwrap().as_str(), sha);
        assert_eq!(info.branch.as_deref(), Some("main"));
    }

    #[test]
    fn push_payload_rejects_bad_sha() {
        let body = br#"{"after":"not-a-sha","ref":"refs/heads/main"}"#;
        assert!(parse_push_payload(body).is_err());
    }

    #[test]
    fn push_payload_tolerates_missing_fields() {
        let info = parse_push_payload(b"{}").unwrap();
        assert_eq!(info, PushInfo { commit: None, branch: None });
    }

    #[test]
    fn provider_detection_prefers_github() {
        assert_eq!(Provider::detect(Some("push"), None), Some(Provider::GitHub));
        assert_eq!(Provider::detect(None, Some("Push Hook")), Some(Provider::GitLab));
        assert_eq!(Provider::detect(None, None), None);
    }
}
