use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::drift::DriftKind;
use crate::model::{CommitSha, ResourceKey};

pub static DEPLOYED_TYPE: &str = "dev.cdevents.service.deployed.0.3.0";
pub static UPGRADED_TYPE: &str = "dev.cdevents.service.upgraded.0.3.0";
pub static REMOVED_TYPE: &str = "dev.cdevents.service.removed.0.3.0";
pub static DRIFTED_TYPE: &str = "dev.nopea.service.drifted.0.1.0";

/// A CloudEvents 1.0 envelope as emitted on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloudEvent {
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub specversion: String,
    pub time: String,
    pub subject: Subject,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub content: serde_json::Value,
}

/// Delivery target for events. The process ships a tracing-backed sink and
/// an HTTP POST sink; tests use a channel.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: CloudEvent);
}

/// Builds and dispatches events with a process-wide monotonic id.
///
/// Delivery runs on a single forwarder task so events leave the process in
/// the order they were produced.
pub struct EventEmitter {
    counter: AtomicU64,
    tx: tokio::sync::mpsc::UnboundedSender<CloudEvent>,
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<CloudEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.deliver(event).await;
            }
        });
        EventEmitter {
            counter: AtomicU64::new(1),
            tx,
        }
    }

    fn envelope(&self, repo: &str, event_type: &str, subject_id: String, content: serde_json::Value) -> CloudEvent {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        CloudEvent {
            id: format!("nopea-{seq:016}"),
            source: format!("/nopea/worker/{repo}"),
            event_type: event_type.to_string(),
            specversion: "1.0".to_string(),
            time: Utc::now().to_rfc3339(),
            subject: Subject {
                id: subject_id,
                content,
            },
        }
    }

    fn dispatch(&self, event: CloudEvent) {
        // The forwarder only stops at process shutdown; a send failure then
        // is harmless.
        let _ = self.tx.send(event);
    }

    /// First successful sync of a repository.
    pub fn deployed(&self, repo: &str, commit: &CommitSha) {
        let event = self.envelope(
            repo,
            DEPLOYED_TYPE,
            repo.to_string(),
            json!({"commit": commit.as_str()}),
        );
        self.dispatch(event);
    }

    /// Successful sync that moved the repository to a new commit.
    pub fn upgraded(&self, repo: &str, commit: &CommitSha, previous: &CommitSha) {
        let event = self.envelope(
            repo,
            UPGRADED_TYPE,
            repo.to_string(),
            json!({"commit": commit.as_str(), "previous_commit": previous.as_str()}),
        );
        self.dispatch(event);
    }

    /// A sync failed; the desired state could not be realized.
    pub fn removed(&self, repo: &str, reason: &str) {
        let event = self.envelope(repo, REMOVED_TYPE, repo.to_string(), json!({"reason": reason}));
        self.dispatch(event);
    }

    /// Drift detected for a single resource, healed or not.
    pub fn drifted(&self, repo: &str, key: &ResourceKey, kind: DriftKind, action: &str) {
        let event = self.envelope(
            repo,
            DRIFTED_TYPE,
            key.to_string(),
            json!({
                "resource": key.to_string(),
                "drift": kind.as_str(),
                "action": action,
            }),
        );
        self.dispatch(event);
    }
}

/// Logs events through tracing; the default sink.
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn deliver(&self, event: CloudEvent) {
        info!(
            id = %event.id,
            source = %event.source,
            subject = %event.subject.id,
            "event {}",
            event.event_type
        );
    }
}

/// POSTs events as JSON to a configured collector.
pub struct HttpSink {
    url: String,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(url: String) -> Self {
        HttpSink {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EventSink for HttpSink {
    async fn deliver(&self, event: CloudEvent) {
        let id = event.id.clone();
        match self.client.post(&self.url).json(&event).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!(id = %id, status = %response.status(), "event collector rejected event");
            }
            Ok(_) => {}
            Err(e) => warn!(id = %id, "event delivery failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<CloudEvent>);

    #[async_trait]
    impl EventSink for ChannelSink {
        async fn deliver(&self, event: CloudEvent) {
            let _ = self.0.send(event);
        }
    }

    fn sha(c: char) -> CommitSha {
        CommitSha::new(&c.to_string().repeat(40)).unwrap()
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_envelope_is_complete() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = EventEmitter::new(Arc::new(ChannelSink(tx)));

        emitter.deployed("acme", &sha('a'));
        emitter.upgraded("acme", &sha('b'), &sha('a'));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.id < second.id);
        assert_eq!(first.specversion, "1.0");
        assert_eq!(first.source, "/nopea/worker/acme");
        assert_eq!(first.event_type, DEPLOYED_TYPE);
        assert_eq!(second.subject.content["previous_commit"], sha('a').as_str());
    }

    #[tokio::test]
    async fn drifted_event_carries_resource_and_action() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = EventEmitter::new(Arc::new(ChannelSink(tx)));
        let key = ResourceKey::new("ConfigMap", Some("prod"), "app");

        emitter.drifted("acme", &key, DriftKind::ManualDrift, "healed");
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, DRIFTED_TYPE);
        assert_eq!(event.subject.content["resource"], "ConfigMap/prod/app");
        assert_eq!(event.subject.content["drift"], "manual_drift");
        assert_eq!(event.subject.content["action"], "healed");
    }
}
