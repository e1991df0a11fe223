use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::api::v1::Phase;
use crate::events::EventEmitter;
use crate::gitops::GitOps;
use crate::k8s::K8sOps;
use crate::model::CommitSha;
use crate::store::StateStore;
use crate::util::errors::Result;
use crate::util::metrics::Metrics;

mod actor;

pub use actor::MAILBOX_CAPACITY;

/// Everything a worker processes, strictly in arrival order.
#[derive(Debug)]
pub enum WorkerMsg {
    /// First sync after start; schedules the timers.
    StartupSync,
    /// Cheap change check on the poll timer.
    Poll,
    /// Drift-detection pass on the reconcile timer; does not re-fetch Git.
    Reconcile,
    /// Push notification; the commit is informational.
    Webhook { commit: Option<CommitSha> },
    /// Externally requested immediate sync.
    SyncNow {
        reply: oneshot::Sender<Result<CommitSha>>,
    },
    GetState {
        reply: oneshot::Sender<WorkerSnapshot>,
    },
    Stop,
}

/// Point-in-time view of a worker's state.
#[derive(Clone, Debug, serde::Serialize)]
pub struct WorkerSnapshot {
    pub name: String,
    pub phase: Phase,
    pub last_commit: Option<CommitSha>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub suspended: bool,
}

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<StateStore>,
    pub git: Arc<dyn GitOps>,
    pub k8s: Arc<dyn K8sOps>,
    pub events: Arc<EventEmitter>,
    pub metrics: Metrics,
    pub repo_base_dir: PathBuf,
}

/// Mailbox address of a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    pub name: String,
    tx: mpsc::Sender<WorkerMsg>,
}

impl WorkerHandle {
    pub fn sender(&self) -> mpsc::Sender<WorkerMsg> {
        self.tx.clone()
    }

    pub async fn send(&self, msg: WorkerMsg) -> bool {
        self.tx.send(msg).await.is_ok()
    }

    pub async fn state(&self) -> Option<WorkerSnapshot> {
        let (tx, rx) = oneshot::channel();
        if !self.send(WorkerMsg::GetState { reply: tx }).await {
            return None;
        }
        rx.await.ok()
    }

    pub async fn sync_now(&self) -> Option<Result<CommitSha>> {
        let (tx, rx) = oneshot::channel();
        if !self.send(WorkerMsg::SyncNow { reply: tx }).await {
            return None;
        }
        rx.await.ok()
    }

    pub async fn stop(&self) {
        let _ = self.send(WorkerMsg::Stop).await;
    }
}

/// Start a worker task for one repository. The worker re-reads its spec from
/// the custom resource before doing anything; if the resource is gone it
/// exits normally.
pub fn spawn(namespace: String, name: String, ctx: WorkerContext) -> (WorkerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let handle = WorkerHandle {
        name: name.clone(),
        tx,
    };
    let join = tokio::spawn(actor::run(namespace, name, ctx, rx));
    (handle, join)
}
