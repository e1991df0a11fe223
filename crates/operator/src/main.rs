use std::sync::Arc;

use kube::Client;
use nopea_core::config::Config;
use nopea_core::controller::Controller;
use nopea_core::events::{EventEmitter, EventSink, HttpSink, TracingSink};
use nopea_core::gitops::{GitClient, GitOps};
use nopea_core::k8s::{K8sOps, KubeOps};
use nopea_core::leader::LeaderElection;
use nopea_core::store::StateStore;
use nopea_core::supervisor::{ClusterRegistry, LocalRegistry, NullTransport, Registry, Supervisor};
use nopea_core::util::{metrics::Metrics, telemetry};
use nopea_core::worker::WorkerContext;
use tokio::sync::watch;
use tracing::info;

mod handlers;
mod server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    let config = Config::from_env();
    info!(
        namespace = %config.watch_namespace,
        leader_election = config.enable_leader_election,
        cluster = config.cluster_enabled,
        "nopea starting"
    );

    let client = Client::try_default().await?;
    let k8s: Arc<dyn K8sOps> = Arc::new(KubeOps::new(client));
    let store = Arc::new(StateStore::new());
    let registry = prometheus::Registry::default();
    let metrics = Metrics::default().register(&registry)?;

    let sink: Arc<dyn EventSink> = match &config.events_url {
        Some(url) => Arc::new(HttpSink::new(url.clone())),
        None => Arc::new(TracingSink),
    };
    let events = Arc::new(EventEmitter::new(sink));

    let git: Arc<dyn GitOps> = Arc::new(GitClient::spawn(
        config.git_socket.clone(),
        config.git_bin.clone(),
    ));

    let ctx = WorkerContext {
        store: store.clone(),
        git,
        k8s: k8s.clone(),
        events,
        metrics: metrics.clone(),
        repo_base_dir: config.repo_base_dir.clone(),
    };
    let worker_registry: Arc<dyn Registry> = if config.cluster_enabled {
        Arc::new(ClusterRegistry::new(
            config.pod_name.clone(),
            Box::new(NullTransport),
        ))
    } else {
        Arc::new(LocalRegistry::new())
    };
    let supervisor = Supervisor::new(ctx, worker_registry);

    let controller = Controller::new(
        k8s.clone(),
        supervisor.clone(),
        store,
        config.watch_namespace.clone(),
    );
    let watching = controller.watching_flag();

    // Cluster mode does not elect a leader; every node hosts workers. HA
    // without cluster mode gates the controller on the lease.
    let elect = config.enable_leader_election && !config.cluster_enabled;
    let mut _always_leader: Option<watch::Sender<bool>> = None;
    let leadership = if elect {
        let (rx, _join) = LeaderElection::spawn(
            k8s.clone(),
            config.lease.clone(),
            config.holder_identity(),
        );
        rx
    } else {
        let (tx, rx) = watch::channel(true);
        _always_leader = Some(tx);
        rx
    };

    let state = server::AppState {
        supervisor,
        registry,
        metrics,
        webhook_secret: config.webhook_secret.clone(),
        leadership: leadership.clone(),
        leader_election_enabled: elect,
        watching,
    };

    let controller_task = tokio::spawn(controller.run(leadership));
    let web_server = server::start_server(state, config.http_port);

    // Run controller and server side by side; the process ends when the
    // server finishes its shutdown.
    let (_, served) = tokio::join!(controller_task, web_server);
    served?;
    Ok(())
}
