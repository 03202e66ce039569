use super::*;
use crate::network_policy::{compute_rules, policy_cloud_rules, NetworkPolicy};
use maplit::hashmap;

/// Rule derivation is idempotent: repeated computation yields identical
/// rules with identical hashes.
#[tokio::test]
async fn compute_rules_is_idempotent() {
    let mut h = TestHarness::new();
    let spec = mk_policy(
        "ns1",
        "p1",
        &["atg1"],
        vec![ingress_tcp(22, "10.0.0.0/8")],
        vec![egress_tcp(443, "10.1.0.0/16")],
    );
    h.np(Event::Added(spec.clone())).await;

    let mut policy = NetworkPolicy::new(spec);
    let first = compute_rules(&mut policy, &h.r.addr_sgs);
    let second = compute_rules(&mut policy, &h.r.addr_sgs);
    assert_eq!(first, second);

    let rules_a = policy_cloud_rules(&policy, "atg1/vpc1", "atg1").unwrap();
    let rules_b = policy_cloud_rules(&policy, "atg1/vpc1", "atg1").unwrap();
    assert_eq!(rules_a, rules_b);
    let hashes_a = rules_a.iter().map(|r| r.hash.clone()).collect::<Vec<_>>();
    let hashes_b = rules_b.iter().map(|r| r.hash.clone()).collect::<Vec<_>>();
    assert_eq!(hashes_a, hashes_b);
}

/// Tracker membership updates are idempotent per `(group, is_delete)`.
#[tokio::test]
async fn tracker_update_is_idempotent() {
    let mut h = TestHarness::new();
    let member = vm_member("vm1", "vpc1");

    h.r.tracker_update(&member, "atg1/vpc1", false);
    h.r.tracker_update(&member, "atg1/vpc1", false);
    let tracker = h.r.trackers.get(&member.to_string()).expect("tracker");
    assert_eq!(tracker.applied_to_sgs.len(), 1);
    assert!(tracker.prev_applied_to_sgs.is_empty());

    h.r.tracker_update(&member, "atg1/vpc1", true);
    h.r.tracker_update(&member, "atg1/vpc1", true);
    let tracker = h.r.trackers.get(&member.to_string()).expect("tracker");
    assert!(tracker.applied_to_sgs.is_empty());
    assert_eq!(tracker.prev_applied_to_sgs.len(), 1);

    // A delete for an unknown resource does not manufacture a tracker.
    let other = vm_member("vm2", "vpc1");
    h.r.tracker_update(&other, "atg1/vpc1", true);
    assert!(h.r.trackers.get(&other.to_string()).is_none());
}

/// A VM imported into several namespaces gets one status row per
/// namespace.
#[tokio::test]
async fn vm_in_multiple_namespaces_gets_rows_in_each() {
    let mut h = TestHarness::new();
    h.inventory.add_vm("ns1", "vm1", "vm1", "vpc1", &["eni1"]);
    h.inventory.add_vm("ns2", "vm1-import", "vm1", "vpc1", &["eni1"]);

    h.np(Event::Added(mk_policy(
        "ns1",
        "p1",
        &["atg1"],
        vec![ingress_tcp(22, "10.0.0.0/8")],
        vec![],
    )))
    .await;
    h.atg(Event::Added(mk_applied_to_group(
        "atg1",
        vec![vm_member("vm1", "vpc1")],
    )))
    .await;

    // The policy lives in ns1; only the ns1 import carries its status.
    let ns1 = h.status.get("ns1", "vm1").expect("ns1 row");
    assert_eq!(
        ns1.statuses,
        hashmap! { "p1".to_string() => "atg1/vpc1=applied".to_string() }.into_iter().collect::<HashMap<_, _>>()
    );
    assert!(h.status.get("ns2", "vm1-import").is_none());
}

/// A failed member push surfaces on every member's status row and clears
/// once the sync pass repairs the membership.
#[tokio::test]
async fn member_update_failure_surfaces_and_recovers() {
    let mut h = TestHarness::new();
    h.inventory.add_vm("ns1", "vm1", "vm1", "vpc1", &["eni1"]);
    h.inventory.add_vm("ns1", "vm2", "vm2", "vpc1", &["eni2"]);

    h.np(Event::Added(mk_policy(
        "ns1",
        "p1",
        &["atg1"],
        vec![ingress_tcp(22, "10.0.0.0/8")],
        vec![],
    )))
    .await;
    h.atg(Event::Added(mk_applied_to_group(
        "atg1",
        vec![vm_member("vm1", "vpc1")],
    )))
    .await;

    h.cloud.fail_member_updates(true);
    h.atg(Event::Modified(mk_applied_to_group(
        "atg1",
        vec![vm_member("vm1", "vpc1"), vm_member("vm2", "vpc1")],
    )))
    .await;

    for vm in ["vm1", "vm2"] {
        let status = h.status.get("ns1", vm).expect("status row");
        let entry = status.statuses.get("p1").expect("p1 entry");
        assert!(
            entry.starts_with("atg1/vpc1=") && entry.contains("injected member-update failure"),
            "unexpected status for {vm}: {entry}"
        );
    }

    h.cloud.fail_member_updates(false);
    h.sync().await;

    for vm in ["vm1", "vm2"] {
        let status = h.status.get("ns1", vm).expect("status row");
        assert_eq!(
            status.statuses,
            hashmap! { "p1".to_string() => "atg1/vpc1=applied".to_string() }.into_iter().collect::<HashMap<_, _>>()
        );
    }
}

/// Detaching a member removes its row once the tracker drains; the other
/// members keep theirs.
#[tokio::test]
async fn detached_member_row_drains() {
    let mut h = TestHarness::new();
    h.inventory.add_vm("ns1", "vm1", "vm1", "vpc1", &["eni1"]);
    h.inventory.add_vm("ns1", "vm2", "vm2", "vpc1", &["eni2"]);

    h.np(Event::Added(mk_policy(
        "ns1",
        "p1",
        &["atg1"],
        vec![ingress_tcp(22, "10.0.0.0/8")],
        vec![],
    )))
    .await;
    h.atg(Event::Added(mk_applied_to_group(
        "atg1",
        vec![vm_member("vm1", "vpc1"), vm_member("vm2", "vpc1")],
    )))
    .await;
    assert!(h.status.get("ns1", "vm1").is_some());
    assert!(h.status.get("ns1", "vm2").is_some());

    h.atg(Event::Modified(mk_applied_to_group(
        "atg1",
        vec![vm_member("vm1", "vpc1")],
    )))
    .await;

    assert!(h.status.get("ns1", "vm1").is_some());
    assert!(h.status.get("ns1", "vm2").is_none(), "vm2 row must drain");
    assert!(
        h.r.trackers
            .get(&vm_member("vm2", "vpc1").to_string())
            .is_none(),
        "empty tracker must be dropped"
    );
}
