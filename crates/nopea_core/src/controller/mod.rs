use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use kube::api::WatchEvent;
use kube::ResourceExt;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::api::v1::gitrepository::GitRepository;
use crate::k8s::K8sOps;
use crate::model::spec::spec_changed;
use crate::store::StateStore;
use crate::supervisor::Supervisor;

/// Delay before retrying a failed or ended list/watch.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

enum Exit {
    LostLeadership,
    Shutdown,
}

enum EventOutcome {
    /// Continue watching; maybe a fresher resource version.
    Tracked(Option<String>),
    /// The server no longer has our resource version; relist.
    Relist,
}

/// Watches `GitRepository` resources and keeps workers 1:1 with them.
///
/// Gated on leadership: standby until told `{leader, true}`, and on
/// `{leader, false}` every worker is stopped and tracking state cleared.
pub struct Controller {
    k8s: Arc<dyn K8sOps>,
    supervisor: Arc<Supervisor>,
    store: Arc<StateStore>,
    namespace: String,
    watching: Arc<AtomicBool>,
}

impl Controller {
    pub fn new(
        k8s: Arc<dyn K8sOps>,
        supervisor: Arc<Supervisor>,
        store: Arc<StateStore>,
        namespace: String,
    ) -> Self {
        Controller {
            k8s,
            supervisor,
            store,
            namespace,
            watching: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True while the controller has an open watch; feeds `/ready`.
    pub fn watching_flag(&self) -> Arc<AtomicBool> {
        self.watching.clone()
    }

    pub async fn run(self, mut leadership: watch::Receiver<bool>) {
        loop {
            if !*leadership.borrow() {
                info!("standby, waiting for leadership");
                loop {
                    if leadership.changed().await.is_err() {
                        return;
                    }
                    if *leadership.borrow() {
                        break;
                    }
                }
            }

            info!(namespace = %self.namespace, "leadership acquired, entering active mode");
            let exit = self.active(&mut leadership).await;
            self.watching.store(false, Ordering::Relaxed);
            self.supervisor.stop_all().await;
            match exit {
                Exit::LostLeadership => info!("leadership lost, workers stopped, back to standby"),
                Exit::Shutdown => return,
            }
        }
    }

    /// List existing resources, start their workers, then watch. Returns
    /// when leadership is lost or the election task goes away.
    async fn active(&self, leadership: &mut watch::Receiver<bool>) -> Exit {
        let mut tracked: HashSet<String> = HashSet::new();

        'relist: loop {
            let (repos, mut resource_version) = match self.k8s.list_repos(&self.namespace).await {
                Ok(listed) => listed,
                Err(e) => {
                    warn!("list failed, retrying: {e}");
                    if !*leadership.borrow() {
                        return Exit::LostLeadership;
                    }
                    sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            for repo in &repos {
                self.track(repo, &mut tracked);
            }

            loop {
                let mut stream = match self
                    .k8s
                    .watch_repos(&self.namespace, &resource_version)
                    .await
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("watch failed to open, relisting: {e}");
                        sleep(RECONNECT_DELAY).await;
                        continue 'relist;
                    }
                };
                self.watching.store(true, Ordering::Relaxed);

                loop {
                    tokio::select! {
                        changed = leadership.changed() => {
                            if changed.is_err() {
                                return Exit::Shutdown;
                            }
                            if !*leadership.borrow() {
                                return Exit::LostLeadership;
                            }
                        }
                        item = stream.next() => match item {
                            None => {
                                debug!("watch stream ended, reconnecting");
                                sleep(RECONNECT_DELAY).await;
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("watch error, reconnecting: {e}");
                                sleep(RECONNECT_DELAY).await;
                                break;
                            }
                            Some(Ok(event)) => match self.handle_event(event, &mut tracked).await {
                                EventOutcome::Tracked(Some(rv)) => resource_version = rv,
                                EventOutcome::Tracked(None) => {}
                                EventOutcome::Relist => continue 'relist,
                            },
                        }
                    }
                }
            }
        }
    }

    fn track(&self, repo: &GitRepository, tracked: &mut HashSet<String>) {
        let name = repo.name_any();
        let namespace = repo.namespace().unwrap_or_else(|| self.namespace.clone());
        if tracked.contains(&name) {
            return;
        }
        self.supervisor.start_worker(&namespace, &name);
        tracked.insert(name);
    }

    async fn handle_event(
        &self,
        event: WatchEvent<GitRepository>,
        tracked: &mut HashSet<String>,
    ) -> EventOutcome {
        match event {
            WatchEvent::Added(repo) => {
                let rv = repo.resource_version();
                self.track(&repo, tracked);
                EventOutcome::Tracked(rv)
            }
            WatchEvent::Modified(repo) => {
                let rv = repo.resource_version();
                let name = repo.name_any();
                let namespace = repo.namespace().unwrap_or_else(|| self.namespace.clone());
                if spec_changed(&repo) || !tracked.contains(&name) {
                    info!(repo = %name, "spec changed, replacing worker");
                    self.supervisor.stop_worker(&name).await;
                    self.supervisor.start_worker(&namespace, &name);
                    tracked.insert(name);
                } else {
                    // Status-only update; nothing to do beyond the version.
                    debug!(repo = %name, "status update observed");
                }
                EventOutcome::Tracked(rv)
            }
            WatchEvent::Deleted(repo) => {
                let rv = repo.resource_version();
                let name = repo.name_any();
                info!(repo = %name, "resource deleted, stopping worker");
                self.supervisor.stop_worker(&name).await;
                self.store.remove_repo(&name);
                tracked.remove(&name);
                EventOutcome::Tracked(rv)
            }
            WatchEvent::Bookmark(bookmark) => {
                EventOutcome::Tracked(Some(bookmark.metadata.resource_version))
            }
            WatchEvent::Error(e) if e.code == 410 => {
                info!("resource version expired, relisting");
                EventOutcome::Relist
            }
            WatchEvent::Error(e) => {
                warn!("ignoring watch error event: {e:?}");
                EventOutcome::Tracked(None)
            }
        }
    }
}
