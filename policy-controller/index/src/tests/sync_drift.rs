use super::*;
use cloudnet_policy_controller_core::CloudResource;

async fn realized_harness() -> TestHarness {
    let mut h = TestHarness::new();
    h.inventory.add_vm("ns1", "vm1", "vm1", "vpc1", &["eni1"]);
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
    h.cloud.take_calls();
    h
}

/// An extra rule observed in the cloud is revoked without touching the
/// declared rules.
#[tokio::test]
async fn drift_extra_cloud_rule_is_revoked() {
    let mut h = realized_harness().await;
    h.cloud
        .inject_ingress_rule("atg1/vpc1", ingress_tcp(80, "0.0.0.0/0"));

    h.sync().await;

    let rule_calls = h
        .cloud
        .take_calls()
        .into_iter()
        .filter(|c| matches!(c, CloudCall::UpdateRules { .. }))
        .collect::<Vec<_>>();
    assert_eq!(
        rule_calls,
        vec![CloudCall::UpdateRules {
            sg: "atg1/vpc1".to_string(),
            add: vec![],
            rm: vec![canonical_ingress(80, "0.0.0.0/0")],
        }]
    );

    let (ingress, _) = h.cloud.group_rules("atg1/vpc1");
    assert_eq!(ingress, vec![canonical_ingress(22, "10.0.0.0/8")]);
}

/// A managed-looking group the controller does not know is deleted once;
/// the next sync sees nothing to do.
#[tokio::test]
async fn orphan_group_is_deleted_once() {
    let mut h = realized_harness().await;
    h.cloud.seed_group(
        CloudResource::new(
            CloudResourceType::VirtualMachine,
            CloudResourceId::new("ghost", "vpc1"),
            "account-1",
            "aws",
        ),
        false,
        vec![],
        vec![],
    );

    h.sync().await;
    let deletes = h
        .cloud
        .take_calls()
        .into_iter()
        .filter(|c| matches!(c, CloudCall::Delete { sg, .. } if sg == "ghost/vpc1"))
        .count();
    assert_eq!(deletes, 1);

    h.sync().await;
    let deletes = h
        .cloud
        .take_calls()
        .into_iter()
        .filter(|c| matches!(c, CloudCall::Delete { .. }))
        .count();
    assert_eq!(deletes, 0);
}

/// Sync is a fixpoint: with no drift and no intervening events, a pass
/// makes no cloud mutations.
#[tokio::test]
async fn sync_twice_is_a_fixpoint() {
    let mut h = realized_harness().await;

    h.sync().await;
    h.sync().await;

    let mutations = h
        .cloud
        .take_calls()
        .into_iter()
        .filter(|c| !matches!(c, CloudCall::GetEnforced))
        .collect::<Vec<_>>();
    assert_eq!(mutations, vec![], "sync must not mutate a converged cloud");
}

/// A group missing from the cloud snapshot is recreated from scratch.
#[tokio::test]
async fn missing_group_is_recreated() {
    let mut h = realized_harness().await;

    // Simulate out-of-band deletion: drop the group from the cloud only.
    h.cloud.groups.lock().remove("atg1/vpc1");

    h.sync().await;

    let calls = h.cloud.take_calls();
    assert!(
        calls.contains(&CloudCall::Create {
            sg: "atg1/vpc1".to_string(),
            membership_only: false,
        }),
        "group must be recreated: {calls:?}"
    );
    assert!(
        calls
            .iter()
            .any(|c| matches!(c, CloudCall::UpdateRules { sg, add, .. } if sg == "atg1/vpc1" && !add.is_empty())),
        "rules must be re-pushed: {calls:?}"
    );

    let (ingress, _) = h.cloud.group_rules("atg1/vpc1");
    assert_eq!(ingress, vec![canonical_ingress(22, "10.0.0.0/8")]);
}

/// A member that carries a foreign security group gets one of its
/// appliedTo groups re-pushed so the adapter sheds the attachment.
#[tokio::test]
async fn foreign_group_on_member_triggers_nudge() {
    let mut h = realized_harness().await;
    h.cloud
        .mark_foreign_member("atg1/vpc1", vm_member("vm1", "vpc1"));

    h.sync().await;

    let member_updates = h
        .cloud
        .take_calls()
        .into_iter()
        .filter(|c| matches!(c, CloudCall::UpdateMembers { sg, .. } if sg == "atg1/vpc1"))
        .count();
    assert_eq!(member_updates, 1);

    // The nudge cleared the foreign attachment; the next pass is quiet.
    h.sync().await;
    let mutations = h
        .cloud
        .take_calls()
        .into_iter()
        .filter(|c| !matches!(c, CloudCall::GetEnforced))
        .count();
    assert_eq!(mutations, 0);
}

/// A policy blocked on an unrealized address group contributes nothing to
/// the drift histogram: sync passes stay quiet instead of re-pushing rules
/// forever, and the group does not report rule-ready until the dependency
/// realizes.
#[tokio::test]
async fn unready_policy_does_not_thrash_sync() {
    let mut h = TestHarness::new();
    h.inventory.add_vm("ns1", "vm1", "vm1", "vpc1", &["eni1"]);
    h.atg(Event::Added(mk_applied_to_group(
        "atg1",
        vec![vm_member("vm1", "vpc1")],
    )))
    .await;

    // The referenced address group cannot be created, so the policy's
    // dependency stays unrealized.
    h.cloud.fail_creates(true);
    let ingress = IngressRule {
        protocol: Some(6),
        from_port: Some(443),
        from_src_ip: vec![],
        from_security_groups: vec![CloudResourceId::new("peers", "vpc1")],
    };
    h.np(Event::Added(mk_policy("ns1", "p1", &["atg1"], vec![ingress], vec![])))
        .await;

    let status = h.status.get("ns1", "vm1").expect("vm1 status row");
    assert_eq!(
        status.statuses.get("p1"),
        Some(&"address group peers/vpc1 is not ready".to_string())
    );

    h.cloud.take_calls();
    h.sync().await;
    h.sync().await;
    let rule_calls = h
        .cloud
        .take_calls()
        .into_iter()
        .filter(|c| matches!(c, CloudCall::UpdateRules { .. }))
        .count();
    assert_eq!(rule_calls, 0, "an unrealized dependency is not drift");

    // Once the dependency realizes, the next pass pushes the rules.
    h.cloud.fail_creates(false);
    h.sync().await;
    assert!(h
        .cloud
        .take_calls()
        .iter()
        .any(|c| matches!(c, CloudCall::UpdateRules { sg, add, .. } if sg == "atg1/vpc1" && !add.is_empty())));
    let status = h.status.get("ns1", "vm1").expect("vm1 status row");
    assert_eq!(
        status.statuses.get("p1"),
        Some(&"atg1/vpc1=applied".to_string())
    );
}

/// A failed group delete is retried by the sync pass and never dropped.
#[tokio::test]
async fn failed_delete_is_retried_on_sync() {
    let mut h = realized_harness().await;

    h.cloud.fail_deletes(true);
    h.np(Event::Deleted(mk_policy(
        "ns1",
        "p1",
        &["atg1"],
        vec![ingress_tcp(22, "10.0.0.0/8")],
        vec![],
    )))
    .await;
    assert!(h.cloud.has_group("atg1/vpc1"), "delete failed; group remains");

    // The teardown failure is user visible while it lasts.
    let status = h.status.get("ns1", "vm1").expect("vm1 status row");
    let entry = status.statuses.values().next().expect("one entry");
    assert!(
        entry.starts_with("Deleting/Detaching appliedTo sg atg1/vpc1:"),
        "unexpected status: {entry}"
    );

    h.cloud.fail_deletes(false);
    h.cloud.take_calls();
    h.sync().await;

    assert!(!h.cloud.has_group("atg1/vpc1"));
    assert!(h.status.get("ns1", "vm1").is_none());
}
