use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::gitops::client::GIT_OP_TIMEOUT;
use crate::worker::{self, WorkerContext, WorkerHandle};

pub mod cluster;
pub mod registry;

pub use cluster::{ClusterRegistry, LwwMap, NullTransport, Transport};
pub use registry::{LocalRegistry, Registry};

struct RunningWorker {
    id: u64,
    namespace: String,
    handle: WorkerHandle,
    abort: AbortHandle,
}

/// Owns worker lifecycles and enforces at most one live worker per
/// repository name (via the registry, cluster-wide in cluster mode).
///
/// Workers that panic are restarted one-for-one; deliberate stops are not.
pub struct Supervisor {
    ctx: WorkerContext,
    registry: Arc<dyn Registry>,
    workers: DashMap<String, RunningWorker>,
    next_id: AtomicU64,
}

impl Supervisor {
    pub fn new(ctx: WorkerContext, registry: Arc<dyn Registry>) -> Arc<Self> {
        Arc::new(Supervisor {
            ctx,
            registry,
            workers: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Start a worker for the named repository. Starting an already-running
    /// name is a no-op; a name placed on another node (cluster mode) is
    /// skipped. Returns whether a worker was started here.
    pub fn start_worker(self: &Arc<Self>, namespace: &str, name: &str) -> bool {
        if self.workers.contains_key(name) {
            debug!(repo = %name, "worker already running");
            return false;
        }
        if !self.registry.register(name) {
            debug!(repo = %name, "name placed elsewhere, not starting");
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (handle, join) = worker::spawn(namespace.to_string(), name.to_string(), self.ctx.clone());
        self.workers.insert(
            name.to_string(),
            RunningWorker {
                id,
                namespace: namespace.to_string(),
                handle,
                abort: join.abort_handle(),
            },
        );
        self.ctx.metrics.workers.inc();
        info!(repo = %name, "worker started");

        tokio::spawn(monitor(
            self.clone(),
            namespace.to_string(),
            name.to_string(),
            id,
            join,
        ));
        true
    }

    /// Stop a worker. Pending timers die with the task; an in-flight
    /// collaborator call is cut at its next suspension point, bounded by the
    /// Git operation timeout. Absence of the worker is not an error.
    pub async fn stop_worker(&self, name: &str) {
        let Some((_, running)) = self.workers.remove(name) else {
            return;
        };
        self.registry.unregister(name);
        self.ctx.metrics.workers.dec();
        running.handle.stop().await;
        let abort = running.abort;
        tokio::spawn(async move {
            tokio::time::sleep(GIT_OP_TIMEOUT).await;
            abort.abort();
        });
        info!(repo = %name, "worker stopped");
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.stop_worker(&name).await;
        }
    }

    pub fn lookup(&self, name: &str) -> Option<WorkerHandle> {
        self.workers.get(name).map(|e| e.handle.clone())
    }

    pub fn list(&self) -> Vec<String> {
        self.workers.iter().map(|e| e.key().clone()).collect()
    }

    /// Remove the tracking entry if it still belongs to worker `id`.
    fn untrack(&self, name: &str, id: u64) -> bool {
        let removed = self
            .workers
            .remove_if(name, |_, running| running.id == id)
            .is_some();
        if removed {
            self.registry.unregister(name);
            self.ctx.metrics.workers.dec();
        }
        removed
    }
}

/// Waits for a worker task to finish. A deliberate stop already cleaned up;
/// anything else is either a normal self-termination (resource deleted) or a
/// panic, which gets a one-for-one restart.
async fn monitor(
    supervisor: Arc<Supervisor>,
    namespace: String,
    name: String,
    id: u64,
    join: JoinHandle<()>,
) {
    let result = join.await;
    if !supervisor.untrack(&name, id) {
        return;
    }
    match result {
        Err(e) if e.is_panic() => {
            warn!(repo = %name, "worker panicked, restarting");
            supervisor.start_worker(&namespace, &name);
        }
        Err(_) => {
            // Cancelled by the stop watchdog after cleanup raced us.
        }
        Ok(()) => {
            debug!(repo = %name, "worker exited");
        }
    }
}
