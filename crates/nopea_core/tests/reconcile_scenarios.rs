//! End-to-end scenarios against the in-memory collaborators: first sync,
//! no-op poll, git change, manual drift with and without grace, break-glass
//! and webhook-triggered syncs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use nopea_core::api::v1::gitrepository::{GitRepository, GitRepositorySpec};
use nopea_core::drift::{normalize, DriftEngine};
use nopea_core::events::{CloudEvent, EventEmitter, DEPLOYED_TYPE, DRIFTED_TYPE, REMOVED_TYPE, UPGRADED_TYPE};
use nopea_core::model::{Manifest, RepositorySpec, ResourceKey};
use nopea_core::store::StateStore;
use nopea_core::testing::{git_repository, sha, CollectingSink, FakeGit, FakeK8s};
use nopea_core::util::metrics::Metrics;
use nopea_core::worker::{self, WorkerContext, WorkerMsg};

const URL: &str = "https://example/acme.git";
const CONFIGMAP_V1: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app\ndata:\n  k: v\n";
const CONFIGMAP_V2: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app\ndata:\n  k: v2\n";

struct Harness {
    git: Arc<FakeGit>,
    k8s: Arc<FakeK8s>,
    store: Arc<StateStore>,
    events: mpsc::UnboundedReceiver<CloudEvent>,
    ctx: WorkerContext,
    _tmp: tempfile::TempDir,
}

fn harness() -> Harness {
    let git = FakeGit::new();
    let k8s = FakeK8s::new();
    let store = Arc::new(StateStore::new());
    let (sink, events) = CollectingSink::new();
    let tmp = tempfile::tempdir().unwrap();
    let ctx = WorkerContext {
        store: store.clone(),
        git: git.clone(),
        k8s: k8s.clone(),
        events: Arc::new(EventEmitter::new(sink)),
        metrics: Metrics::default(),
        repo_base_dir: tmp.path().to_path_buf(),
    };
    Harness {
        git,
        k8s,
        store,
        events,
        ctx,
        _tmp: tmp,
    }
}

fn acme() -> GitRepository {
    git_repository(
        "acme",
        "team-a",
        GitRepositorySpec {
            url: URL.to_string(),
            branch: Some("main".to_string()),
            path: Some("deploy".to_string()),
            target_namespace: Some("prod".to_string()),
            interval: Some("5m".to_string()),
            suspend: false,
            heal_policy: None,
            heal_grace_period: None,
        },
    )
}

fn app_key() -> ResourceKey {
    ResourceKey::new("ConfigMap", Some("prod"), "app")
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<CloudEvent>) -> CloudEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within deadline")
        .expect("emitter alive")
}

/// Deploy acme at `v1`, wait for the startup sync, drain the deployed event.
async fn synced_worker(h: &mut Harness) -> worker::WorkerHandle {
    h.k8s.put_repo(acme());
    h.git.set_remote(URL, sha('a'), &[("deploy/app.yaml", CONFIGMAP_V1)]);
    let (handle, _join) = worker::spawn("team-a".to_string(), "acme".to_string(), h.ctx.clone());
    let snapshot = handle.state().await.expect("worker alive");
    assert_eq!(snapshot.phase.to_string(), "Synced");
    let deployed = next_event(&mut h.events).await;
    assert_eq!(deployed.event_type, DEPLOYED_TYPE);
    handle
}

#[tokio::test]
async fn s1_first_sync_deploys_and_records_state() {
    let mut h = harness();
    h.k8s.put_repo(acme());
    h.git.set_remote(URL, sha('a'), &[("deploy/app.yaml", CONFIGMAP_V1)]);

    let (handle, _join) = worker::spawn("team-a".to_string(), "acme".to_string(), h.ctx.clone());
    let snapshot = handle.state().await.expect("worker alive");

    assert_eq!(snapshot.phase.to_string(), "Synced");
    assert_eq!(snapshot.last_commit, Some(sha('a')));
    assert!(snapshot.last_sync_at.is_some());

    assert_eq!(h.k8s.apply_count(), 1);
    assert_eq!(h.k8s.applied_log()[0].key(), app_key());
    assert!(h.store.get_last_applied("acme", &app_key()).is_some());
    assert_eq!(h.store.get_commit("acme"), Some(sha('a')));

    let phases: Vec<String> = h
        .k8s
        .statuses("acme")
        .into_iter()
        .filter_map(|s| s.phase)
        .collect();
    assert_eq!(phases, vec!["Syncing".to_string(), "Synced".to_string()]);
    let last = h.k8s.last_status("acme").unwrap();
    assert_eq!(last.last_synced_commit.as_deref(), Some(sha('a').as_str()));
    assert_eq!(last.observed_generation, Some(1));

    let deployed = next_event(&mut h.events).await;
    assert_eq!(deployed.event_type, DEPLOYED_TYPE);
    assert_eq!(deployed.source, "/nopea/worker/acme");
    assert_eq!(deployed.subject.content["commit"], sha('a').as_str());
}

#[tokio::test]
async fn s2_poll_with_unchanged_remote_is_a_noop() {
    let mut h = harness();
    let handle = synced_worker(&mut h).await;
    let syncs_before = h.git.sync_count();

    handle.send(WorkerMsg::Poll).await;
    let snapshot = handle.state().await.unwrap();

    assert_eq!(snapshot.phase.to_string(), "Synced");
    assert_eq!(h.git.sync_count(), syncs_before + 1);
    assert_eq!(h.k8s.apply_count(), 1, "no apply beyond the first");

    // The follow-up reconcile sees no drift either.
    handle.send(WorkerMsg::Reconcile).await;
    handle.state().await.unwrap();
    assert_eq!(h.k8s.apply_count(), 1);
    assert!(h.events.try_recv().is_err(), "no drift events for a clean pass");
}

#[tokio::test]
async fn s3_new_commit_triggers_full_sync_and_upgrade_event() {
    let mut h = harness();
    let handle = synced_worker(&mut h).await;

    h.git.set_remote(URL, sha('d'), &[("deploy/app.yaml", CONFIGMAP_V2)]);
    handle.send(WorkerMsg::Poll).await;
    let snapshot = handle.state().await.unwrap();

    assert_eq!(snapshot.last_commit, Some(sha('d')));
    assert_eq!(h.k8s.apply_count(), 2);
    let live = h.k8s.live_object("ConfigMap", "prod", "app").unwrap();
    assert_eq!(live.as_value()["data"]["k"], "v2");

    let upgraded = next_event(&mut h.events).await;
    assert_eq!(upgraded.event_type, UPGRADED_TYPE);
    assert_eq!(upgraded.subject.content["commit"], sha('d').as_str());
    assert_eq!(upgraded.subject.content["previous_commit"], sha('a').as_str());
}

#[tokio::test]
async fn s4_manual_drift_heals_immediately_with_auto_policy() {
    let mut h = harness();
    let handle = synced_worker(&mut h).await;

    let mut live = h.k8s.live_object("ConfigMap", "prod", "app").unwrap().into_value();
    live["data"]["k"] = json!("v9");
    h.k8s.set_live(Manifest::from_value(live).unwrap());

    handle.send(WorkerMsg::Reconcile).await;
    handle.state().await.unwrap();

    assert_eq!(h.k8s.apply_count(), 2, "one heal apply");
    let healed = h.k8s.live_object("ConfigMap", "prod", "app").unwrap();
    assert_eq!(healed.as_value()["data"]["k"], "v");

    let drifted = next_event(&mut h.events).await;
    assert_eq!(drifted.event_type, DRIFTED_TYPE);
    assert_eq!(drifted.subject.content["drift"], "manual_drift");
    assert_eq!(drifted.subject.content["action"], "healed");
    assert!(h.store.get_drift_first_seen("acme", &app_key()).is_none());
}

#[tokio::test]
async fn s5_manual_drift_respects_grace_period() {
    let h = harness();
    let mut resource = acme();
    resource.spec.heal_grace_period = Some("5m".to_string());
    let spec = RepositorySpec::from_resource(&resource).unwrap();

    let mut desired = Manifest::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": "app"},
        "data": {"k": "v2"}
    }))
    .unwrap();
    desired.default_namespace("prod");
    h.store
        .put_last_applied("acme", desired.key(), normalize(&desired));

    let mut drifted = desired.as_value().clone();
    drifted["data"]["k"] = json!("v9");
    h.k8s.set_live(Manifest::from_value(drifted).unwrap());

    let (sink, _events) = CollectingSink::new();
    let engine = DriftEngine::new(
        h.store.clone(),
        h.k8s.clone(),
        Arc::new(EventEmitter::new(sink)),
        Metrics::default(),
    );

    let t0 = Utc::now();
    let outcome = engine.reconcile(&spec, &[desired.clone()], t0).await.unwrap();
    assert!(outcome.healed.is_empty());
    assert_eq!(h.k8s.apply_count(), 0);
    assert_eq!(h.store.get_drift_first_seen("acme", &desired.key()), Some(t0));

    let outcome = engine
        .reconcile(&spec, &[desired.clone()], t0 + chrono::Duration::minutes(2))
        .await
        .unwrap();
    assert!(outcome.healed.is_empty());
    assert_eq!(h.k8s.apply_count(), 0, "still inside the grace window");

    let outcome = engine
        .reconcile(&spec, &[desired.clone()], t0 + chrono::Duration::minutes(6))
        .await
        .unwrap();
    assert_eq!(outcome.healed, vec![desired.key()]);
    assert_eq!(h.k8s.apply_count(), 1);
    assert!(h.store.get_drift_first_seen("acme", &desired.key()).is_none());
}

#[tokio::test]
async fn s6_break_glass_annotation_blocks_healing() {
    let mut h = harness();
    let handle = synced_worker(&mut h).await;

    let mut live = h.k8s.live_object("ConfigMap", "prod", "app").unwrap().into_value();
    live["data"]["k"] = json!("v9");
    live["metadata"]["annotations"] = json!({"nopea.io/suspend-heal": "true"});
    h.k8s.set_live(Manifest::from_value(live).unwrap());

    handle.send(WorkerMsg::Reconcile).await;
    handle.state().await.unwrap();

    assert_eq!(h.k8s.apply_count(), 1, "no heal apply");
    let drifted = next_event(&mut h.events).await;
    assert_eq!(drifted.subject.content["action"], "skipped");
    assert!(
        h.store.get_drift_first_seen("acme", &app_key()).is_some(),
        "grace clock keeps running under break-glass"
    );
}

#[tokio::test]
async fn s7_webhook_triggers_immediate_sync() {
    let mut h = harness();
    let handle = synced_worker(&mut h).await;

    h.git.set_remote(URL, sha('b'), &[("deploy/app.yaml", CONFIGMAP_V2)]);
    handle
        .send(WorkerMsg::Webhook {
            commit: Some(sha('b')),
        })
        .await;
    let snapshot = handle.state().await.unwrap();

    assert_eq!(snapshot.last_commit, Some(sha('b')));
    assert_eq!(h.k8s.apply_count(), 2);
    let upgraded = next_event(&mut h.events).await;
    assert_eq!(upgraded.event_type, UPGRADED_TYPE);
}

#[tokio::test]
async fn worker_exits_when_resource_is_gone() {
    let h = harness();
    let (handle, join) = worker::spawn("team-a".to_string(), "ghost".to_string(), h.ctx.clone());
    timeout(Duration::from_secs(2), join)
        .await
        .expect("worker exits promptly")
        .expect("no panic");
    assert!(handle.state().await.is_none());
}

#[tokio::test]
async fn failed_sync_reports_failure_and_keeps_state() {
    let mut h = harness();
    let handle = synced_worker(&mut h).await;

    h.git.fail_next_sync("remote hung up unexpectedly");
    handle.send(WorkerMsg::Poll).await;
    let snapshot = handle.state().await.unwrap();

    assert_eq!(snapshot.phase.to_string(), "Failed");
    // A failed sync never clears previously recorded state.
    assert_eq!(h.store.get_commit("acme"), Some(sha('a')));
    assert!(h.store.get_last_applied("acme", &app_key()).is_some());

    let status = h.k8s.last_status("acme").unwrap();
    assert_eq!(status.phase.as_deref(), Some("Failed"));
    assert!(status.message.unwrap().contains("GitSyncFailed"));

    let removed = next_event(&mut h.events).await;
    assert_eq!(removed.event_type, REMOVED_TYPE);

    // A healthy poll that finds a new commit recovers.
    h.git.set_remote(URL, sha('c'), &[("deploy/app.yaml", CONFIGMAP_V1)]);
    handle.send(WorkerMsg::Poll).await;
    let snapshot = handle.state().await.unwrap();
    assert_eq!(snapshot.phase.to_string(), "Synced");
    assert_eq!(snapshot.last_commit, Some(sha('c')));
}

#[tokio::test]
async fn suspended_repository_does_nothing() {
    let h = harness();
    let mut resource = acme();
    resource.spec.suspend = true;
    h.k8s.put_repo(resource);
    h.git.set_remote(URL, sha('a'), &[("deploy/app.yaml", CONFIGMAP_V1)]);

    let (handle, _join) = worker::spawn("team-a".to_string(), "acme".to_string(), h.ctx.clone());
    let snapshot = handle.state().await.unwrap();
    assert!(snapshot.suspended);
    assert_eq!(h.k8s.apply_count(), 0);
    assert_eq!(h.git.sync_count(), 0);

    handle.send(WorkerMsg::Reconcile).await;
    handle.state().await.unwrap();
    assert_eq!(h.k8s.apply_count(), 0);
}
