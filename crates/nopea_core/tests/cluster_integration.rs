//! Integration tests against a real cluster. Run with `cargo test -- --ignored`
//! and a kubeconfig pointing at a throwaway cluster.

use kube::Client;
use serde_json::json;

use nopea_core::drift::{normalized_hash, three_way, DriftKind};
use nopea_core::k8s::{K8sOps, KubeOps};
use nopea_core::model::Manifest;

fn configmap(name: &str, value: &str) -> Manifest {
    Manifest::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": "default"},
        "data": {"k": value}
    }))
    .unwrap()
}

#[tokio::test]
#[ignore = "uses k8s current-context"]
async fn integration_apply_then_get_live_round_trips() {
    let client = Client::try_default().await.unwrap();
    let ops = KubeOps::new(client);

    let desired = configmap("nopea-itest", "v1");
    let echo = ops.apply(&desired).await.unwrap();
    assert_eq!(echo.key(), desired.key());

    let live = ops
        .get_live("v1", "ConfigMap", "default", "nopea-itest")
        .await
        .unwrap()
        .expect("object exists after apply");

    // Cluster-assigned fields must not affect the content hash.
    assert_eq!(normalized_hash(&live), normalized_hash(&desired));
    assert_eq!(
        three_way(&desired, &desired, &live),
        DriftKind::NoDrift,
        "a freshly applied object is clean"
    );
}

#[tokio::test]
#[ignore = "uses k8s current-context"]
async fn integration_missing_object_reads_as_none() {
    let client = Client::try_default().await.unwrap();
    let ops = KubeOps::new(client);

    let live = ops
        .get_live("v1", "ConfigMap", "default", "nopea-itest-absent")
        .await
        .unwrap();
    assert!(live.is_none());
}
