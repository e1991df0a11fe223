//! Lease-based election: fresh acquire, takeover of an expired lease,
//! deference to a live holder, and step-down on write conflict.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::core::ObjectMeta;
use tokio::time::timeout;

use nopea_core::config::LeaseConfig;
use nopea_core::k8s::K8sOps;
use nopea_core::leader::LeaderElection;
use nopea_core::testing::FakeK8s;

fn lease_config() -> LeaseConfig {
    LeaseConfig {
        name: "nopea-leader".to_string(),
        namespace: "nopea-system".to_string(),
        lease_duration_seconds: 2,
        renew_deadline_seconds: 2,
        retry_period_seconds: 1,
    }
}

fn foreign_lease(holder: &str, renewed_secs_ago: i64) -> Lease {
    let renewed = Utc::now() - chrono::Duration::seconds(renewed_secs_ago);
    Lease {
        metadata: ObjectMeta {
            name: Some("nopea-leader".to_string()),
            namespace: Some("nopea-system".to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: Some(2),
            acquire_time: Some(MicroTime(renewed)),
            renew_time: Some(MicroTime(renewed)),
            lease_transitions: Some(0),
            ..Default::default()
        }),
    }
}

#[tokio::test]
async fn acquires_leadership_when_no_lease_exists() {
    let k8s = FakeK8s::new();
    let (mut rx, _join) = LeaderElection::spawn(k8s.clone(), lease_config(), "nopea-0".to_string());

    timeout(Duration::from_secs(2), rx.wait_for(|leader| *leader))
        .await
        .expect("leadership within deadline")
        .unwrap();

    let lease = k8s
        .get_lease("nopea-system", "nopea-leader")
        .await
        .unwrap()
        .unwrap();
    let spec = lease.spec.unwrap();
    assert_eq!(spec.holder_identity.as_deref(), Some("nopea-0"));
    assert_eq!(spec.lease_transitions, Some(0));
}

#[tokio::test]
async fn takes_over_an_expired_lease_and_bumps_transitions() {
    let k8s = FakeK8s::new();
    k8s.create_lease("nopea-system", "nopea-leader", &foreign_lease("nopea-1", 60))
        .await
        .unwrap();

    let (mut rx, _join) = LeaderElection::spawn(k8s.clone(), lease_config(), "nopea-0".to_string());
    timeout(Duration::from_secs(2), rx.wait_for(|leader| *leader))
        .await
        .expect("takeover within deadline")
        .unwrap();

    let lease = k8s
        .get_lease("nopea-system", "nopea-leader")
        .await
        .unwrap()
        .unwrap();
    let spec = lease.spec.unwrap();
    assert_eq!(spec.holder_identity.as_deref(), Some("nopea-0"));
    assert_eq!(spec.lease_transitions, Some(1));
}

#[tokio::test]
async fn defers_to_a_live_holder() {
    let k8s = FakeK8s::new();
    k8s.create_lease("nopea-system", "nopea-leader", &foreign_lease("nopea-1", 0))
        .await
        .unwrap();

    let (mut rx, _join) = LeaderElection::spawn(k8s.clone(), lease_config(), "nopea-0".to_string());
    let became_leader = timeout(Duration::from_millis(1500), rx.wait_for(|leader| *leader)).await;
    assert!(became_leader.is_err(), "must stay standby while the lease is fresh");
}

#[tokio::test]
async fn steps_down_when_the_lease_is_stolen() {
    let k8s = FakeK8s::new();
    let (mut rx, _join) = LeaderElection::spawn(k8s.clone(), lease_config(), "nopea-0".to_string());
    timeout(Duration::from_secs(2), rx.wait_for(|leader| *leader))
        .await
        .expect("initial leadership")
        .unwrap();

    // Another replica rewrites the lease with the current resource version;
    // our next renewal must hit the conflict or see the foreign holder.
    let mut stolen = k8s
        .get_lease("nopea-system", "nopea-leader")
        .await
        .unwrap()
        .unwrap();
    let spec = stolen.spec.get_or_insert_with(Default::default);
    spec.holder_identity = Some("nopea-1".to_string());
    spec.renew_time = Some(MicroTime(Utc::now()));
    k8s.update_lease("nopea-system", "nopea-leader", &stolen)
        .await
        .unwrap();

    timeout(Duration::from_secs(4), rx.wait_for(|leader| !*leader))
        .await
        .expect("step down after losing the lease")
        .unwrap();
}
