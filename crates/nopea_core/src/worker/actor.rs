use std::path::PathBuf;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::api::v1::gitrepository::GitRepositoryStatus;
use crate::api::v1::Phase;
use crate::drift::DriftEngine;
use crate::model::{CommitSha, RepositorySpec};
use crate::store::SyncState;
use crate::sync::SyncExecutor;
use crate::util::errors::{Error, Result};
use crate::worker::{WorkerContext, WorkerMsg, WorkerSnapshot};

pub const MAILBOX_CAPACITY: usize = 32;

/// Worker entry point: re-read the spec from the cluster, run the startup
/// sync, then serve the mailbox until stopped.
pub(super) async fn run(
    namespace: String,
    name: String,
    ctx: WorkerContext,
    mut rx: mpsc::Receiver<WorkerMsg>,
) {
    // The custom resource is the source of truth, not whatever the caller
    // happened to hold when it started us.
    let repo = match ctx.k8s.get_repo(&namespace, &name).await {
        Ok(Some(repo)) => repo,
        Ok(None) => {
            info!(repo = %name, "resource already deleted, worker exiting");
            return;
        }
        Err(e) => {
            error!(repo = %name, "cannot read resource, worker exiting: {e}");
            return;
        }
    };
    let spec = match RepositorySpec::from_resource(&repo) {
        Ok(spec) => spec,
        Err(e) => {
            error!(repo = %name, "invalid resource, worker exiting: {e}");
            return;
        }
    };

    let executor = SyncExecutor::new(ctx.git.clone(), ctx.k8s.clone());
    let engine = DriftEngine::new(
        ctx.store.clone(),
        ctx.k8s.clone(),
        ctx.events.clone(),
        ctx.metrics.clone(),
    );
    let work_dir = spec.work_dir(&ctx.repo_base_dir);
    let mut worker = Worker {
        spec,
        ctx,
        executor,
        engine,
        work_dir,
        phase: Phase::Initializing,
        last_commit: None,
        last_sync_at: None,
        poll_at: None,
        reconcile_at: None,
    };

    worker.handle(WorkerMsg::StartupSync).await;

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                None | Some(WorkerMsg::Stop) => {
                    info!(repo = %worker.spec.name, "worker stopping");
                    break;
                }
                Some(msg) => worker.handle(msg).await,
            },
            _ = sleep_until(worker.poll_at.unwrap_or_else(Instant::now)),
                if worker.poll_at.is_some() =>
            {
                worker.poll_at = None;
                worker.handle(WorkerMsg::Poll).await;
            }
            _ = sleep_until(worker.reconcile_at.unwrap_or_else(Instant::now)),
                if worker.reconcile_at.is_some() =>
            {
                worker.reconcile_at = None;
                worker.handle(WorkerMsg::Reconcile).await;
            }
        }
    }
}

/// Per-repository state machine. All mutation happens inside `handle`, on
/// the worker's own task.
struct Worker {
    spec: RepositorySpec,
    ctx: WorkerContext,
    executor: SyncExecutor,
    engine: DriftEngine,
    work_dir: PathBuf,
    phase: Phase,
    last_commit: Option<CommitSha>,
    last_sync_at: Option<chrono::DateTime<Utc>>,
    poll_at: Option<Instant>,
    reconcile_at: Option<Instant>,
}

impl Worker {
    async fn handle(&mut self, msg: WorkerMsg) {
        match msg {
            WorkerMsg::StartupSync => {
                if self.spec.suspend {
                    info!(repo = %self.spec.name, "repository suspended, skipping startup sync");
                    self.schedule_poll();
                    return;
                }
                let result = self.full_sync().await;
                self.schedule_poll();
                if result.is_ok() {
                    self.schedule_reconcile();
                }
            }
            WorkerMsg::Poll => {
                if !self.spec.suspend {
                    self.poll().await;
                }
                self.schedule_poll();
            }
            WorkerMsg::Reconcile => {
                if !self.spec.suspend {
                    self.reconcile().await;
                }
                self.schedule_reconcile();
            }
            WorkerMsg::Webhook { commit } => {
                if self.spec.suspend {
                    debug!(repo = %self.spec.name, "webhook ignored, repository suspended");
                    return;
                }
                info!(
                    repo = %self.spec.name,
                    commit = commit.as_ref().map(|c| c.short().to_string()).unwrap_or_default(),
                    "webhook received, syncing"
                );
                let _ = self.full_sync().await;
            }
            WorkerMsg::SyncNow { reply } => {
                let result = if self.spec.suspend {
                    Err(Error::InvalidResource(format!("{} is suspended", self.spec.name)))
                } else {
                    self.full_sync().await
                };
                let _ = reply.send(result);
            }
            WorkerMsg::GetState { reply } => {
                let _ = reply.send(WorkerSnapshot {
                    name: self.spec.name.clone(),
                    phase: self.phase,
                    last_commit: self.last_commit.clone(),
                    last_sync_at: self.last_sync_at,
                    suspended: self.spec.suspend,
                });
            }
            WorkerMsg::Stop => unreachable!("Stop breaks the loop before handle"),
        }
    }

    /// Cheap change check: one git sync; a moved HEAD triggers a full cycle.
    async fn poll(&mut self) {
        let sha = match self
            .ctx
            .git
            .sync(&self.spec.url, &self.spec.branch, &self.work_dir, 1)
            .await
        {
            Ok(sha) => sha,
            Err(e) => {
                let err = Error::GitSyncFailed(e.to_string());
                warn!(repo = %self.spec.name, "poll failed: {err}");
                self.fail(&err).await;
                return;
            }
        };
        if self.last_commit.as_ref() == Some(&sha) {
            debug!(repo = %self.spec.name, commit = sha.short(), "no change");
            return;
        }
        let _ = self.full_sync().await;
    }

    /// Drift-detection pass over the current checkout. No fetch.
    async fn reconcile(&mut self) {
        let desired = match self.executor.desired_manifests(&self.spec, &self.work_dir).await {
            Ok(desired) => desired,
            Err(e) => {
                warn!(repo = %self.spec.name, "reconcile skipped: {e}");
                return;
            }
        };
        match self.engine.reconcile(&self.spec, &desired, Utc::now()).await {
            Ok(outcome) => {
                if !outcome.healed.is_empty() || !outcome.skipped.is_empty() {
                    info!(
                        repo = %self.spec.name,
                        healed = outcome.healed.len(),
                        skipped = outcome.skipped.len(),
                        "reconcile pass finished"
                    );
                }
            }
            Err(e) => warn!(repo = %self.spec.name, "reconcile failed: {e}"),
        }
    }

    async fn full_sync(&mut self) -> Result<CommitSha> {
        self.phase = Phase::Syncing;
        self.write_status(None).await;
        let _timer = self.ctx.metrics.count_and_measure(&self.spec.name);

        match self.executor.run(&self.spec, &self.work_dir).await {
            Ok(outcome) => {
                let name = &self.spec.name;
                let first = self.ctx.store.get_commit(name).is_none();
                let previous = self.last_commit.clone();
                let now = Utc::now();

                self.ctx.store.put_commit(name, outcome.commit.clone());
                for manifest in &outcome.desired {
                    self.ctx.store.put_last_applied(
                        name,
                        manifest.key(),
                        crate::drift::normalize(manifest),
                    );
                }
                self.phase = Phase::Synced;
                self.last_commit = Some(outcome.commit.clone());
                self.last_sync_at = Some(now);
                self.ctx.store.put_sync_state(
                    name,
                    SyncState {
                        commit: outcome.commit.clone(),
                        last_sync_at: now,
                        phase: Phase::Synced,
                    },
                );
                self.write_status(None).await;

                if first {
                    self.ctx.events.deployed(name, &outcome.commit);
                } else if previous.as_ref() != Some(&outcome.commit) {
                    let previous = previous.expect("not first implies a previous commit");
                    self.ctx.events.upgraded(name, &outcome.commit, &previous);
                }
                info!(
                    repo = %name,
                    commit = outcome.commit.short(),
                    applied = outcome.applied.len(),
                    "sync complete"
                );
                Ok(outcome.commit)
            }
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    /// Failure path: phase, status, metric, event. Never clears recorded state.
    async fn fail(&mut self, e: &Error) {
        self.phase = Phase::Failed;
        self.write_status(Some(e.to_string())).await;
        self.ctx.metrics.sync_failure(&self.spec.name, e);
        self.ctx.events.removed(&self.spec.name, &e.to_string());
    }

    async fn write_status(&self, message: Option<String>) {
        let status = GitRepositoryStatus {
            phase: Some(self.phase.to_string()),
            last_synced_commit: self.last_commit.as_ref().map(|c| c.as_str().to_string()),
            last_sync_time: self.last_sync_at.map(|t| t.to_rfc3339()),
            message,
            observed_generation: self.spec.generation,
        };
        if let Err(e) = self
            .ctx
            .k8s
            .update_status(&self.spec.source_namespace, &self.spec.name, status)
            .await
        {
            warn!(repo = %self.spec.name, "status update failed: {e}");
        }
    }

    fn schedule_poll(&mut self) {
        self.poll_at = Some(Instant::now() + self.spec.poll_interval);
    }

    fn schedule_reconcile(&mut self) {
        self.reconcile_at = Some(Instant::now() + self.spec.reconcile_interval());
    }
}
