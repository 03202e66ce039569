//! The in-memory network-policy object and its event handlers.
//!
//! A policy holds the parsed ingress/egress rules and tracks whether every
//! address group its rules reference has been realized. Once ready, the
//! policy's flattened rule set feeds the appliedTo security groups.

use crate::{
    reconciler::Reconciler,
    security_group::{AddressSecurityGroup, SgState},
    store::{Indexed, Store},
    IDX_POLICY_BY_ADDR_GRP, IDX_POLICY_BY_APPLIED_TO, IDX_SG_BY_GROUP,
};
use ahash::AHashSet as HashSet;
use anyhow::Result;
use cloudnet_policy_controller_core::{
    self as api, CloudResource, CloudResourceId, CloudResourceType, CloudRule, Event, Rule,
    RuleDescription,
};
use tracing::debug;

pub(crate) struct NetworkPolicy {
    pub(crate) spec: api::NetworkPolicy,
    pub(crate) rules_ready: bool,
}

impl NetworkPolicy {
    pub(crate) fn new(spec: api::NetworkPolicy) -> Self {
        Self {
            spec,
            rules_ready: false,
        }
    }
}

impl Indexed for NetworkPolicy {
    fn store_key(&self) -> String {
        self.spec.namespaced_name().to_string()
    }
}

pub(crate) fn policy_by_applied_to(policy: &NetworkPolicy) -> Vec<String> {
    policy.spec.applied_to_groups.clone()
}

pub(crate) fn policy_by_address_group(policy: &NetworkPolicy) -> Vec<String> {
    address_group_refs(&policy.spec)
        .into_iter()
        .map(|id| id.to_string())
        .collect()
}

/// The distinct address groups referenced by a policy's rules.
pub(crate) fn address_group_refs(spec: &api::NetworkPolicy) -> Vec<CloudResourceId> {
    let mut seen = HashSet::new();
    let mut refs = Vec::new();
    let groups = spec
        .ingress_rules
        .iter()
        .flat_map(|r| r.from_security_groups.iter())
        .chain(spec.egress_rules.iter().flat_map(|r| r.to_security_groups.iter()));
    for id in groups {
        if seen.insert(id.to_string()) {
            refs.push(id.clone());
        }
    }
    refs
}

/// Recomputes rule readiness: ready iff every referenced address group has
/// been realized in the cloud. Idempotent.
pub(crate) fn compute_rules(
    policy: &mut NetworkPolicy,
    addr_sgs: &Store<AddressSecurityGroup>,
) -> bool {
    let ready = address_group_refs(&policy.spec).iter().all(|id| {
        matches!(
            addr_sgs.get(&id.to_string()),
            Some(sg) if sg.core.state == SgState::Created && !sg.core.delete_pending
        )
    });
    policy.rules_ready = ready;
    ready
}

/// `None` when the policy's rules are ready to realize; otherwise names the
/// first dependency blocking it.
pub(crate) fn policy_status(
    policy: &NetworkPolicy,
    addr_sgs: &Store<AddressSecurityGroup>,
) -> Option<String> {
    if policy.rules_ready {
        return None;
    }
    for id in address_group_refs(&policy.spec) {
        let realized = matches!(
            addr_sgs.get(&id.to_string()),
            Some(sg) if sg.core.state == SgState::Created && !sg.core.delete_pending
        );
        if !realized {
            return Some(format!("address group {} is not ready", id));
        }
    }
    Some("rules are not ready".to_string())
}

/// Derives the cloud rules a policy contributes to one appliedTo group.
/// Deterministic: repeated calls yield identical rules and hashes.
pub(crate) fn policy_cloud_rules(
    policy: &NetworkPolicy,
    sg_key: &str,
    group_name: &str,
) -> Result<Vec<CloudRule>> {
    let policy_ref = policy.spec.namespaced_name().to_string();
    let description = RuleDescription::from_policy(&policy_ref, group_name)?.to_string();
    let mut rules = Vec::with_capacity(policy.spec.ingress_rules.len() + policy.spec.egress_rules.len());
    for rule in &policy.spec.ingress_rules {
        rules.push(
            CloudRule::new(Rule::Ingress(rule.clone()), sg_key, &policy_ref)
                .with_description(&description),
        );
    }
    for rule in &policy.spec.egress_rules {
        rules.push(
            CloudRule::new(Rule::Egress(rule.clone()), sg_key, &policy_ref)
                .with_description(&description),
        );
    }
    Ok(rules)
}

// === impl Reconciler: network-policy events ===

impl Reconciler {
    pub(crate) async fn handle_network_policy_event(&mut self, event: Event<api::NetworkPolicy>) {
        match event {
            Event::Added(spec) | Event::Modified(spec) => self.apply_network_policy(spec).await,
            Event::Deleted(spec) => self.delete_network_policy(spec).await,
            Event::Bookmark => self.process_bookmark().await,
        }
    }

    async fn apply_network_policy(&mut self, spec: api::NetworkPolicy) {
        let key = spec.namespaced_name().to_string();
        debug!(policy = %key, "applying network policy");
        let old = self.policies.remove(&key);

        // Lazily create address groups for every referenced peer group.
        let refs = address_group_refs(&spec);
        for id in &refs {
            self.ensure_address_sg(id).await;
        }

        self.policies.insert(NetworkPolicy::new(spec.clone()));
        if let Some(policy) = self.policies.get_mut(&key) {
            compute_rules(policy, &self.addr_sgs);
        }

        // Push rules to every appliedTo group the policy targets now or
        // targeted before this update, and republish member status either
        // way: the policy's realization state changed even when its rule
        // diff is empty.
        let mut group_names = spec.applied_to_groups.iter().cloned().collect::<HashSet<_>>();
        if let Some(old) = &old {
            group_names.extend(old.spec.applied_to_groups.iter().cloned());
        }
        for name in &group_names {
            for sg_key in self.applied_sgs.by_index(IDX_SG_BY_GROUP, name) {
                self.applied_sg_update_all_rules(&sg_key).await;
                self.mark_member_trackers_dirty(&sg_key);
            }
        }

        // Groups the update stopped referencing may now be unreferenced.
        if let Some(old) = old {
            self.cleanup_dereferenced_groups(&old.spec).await;
        }
    }

    async fn delete_network_policy(&mut self, spec: api::NetworkPolicy) {
        let key = spec.namespaced_name().to_string();
        debug!(policy = %key, "deleting network policy");
        if self.policies.remove(&key).is_none() {
            return;
        }

        // Removing the policy shrinks the desired rule set; the diff revokes
        // its rules from every targeted group. Groups that survive on other
        // policies still need their members' status rows refreshed.
        for name in &spec.applied_to_groups {
            for sg_key in self.applied_sgs.by_index(IDX_SG_BY_GROUP, name) {
                self.applied_sg_update_all_rules(&sg_key).await;
                self.mark_member_trackers_dirty(&sg_key);
            }
        }
        self.cleanup_dereferenced_groups(&spec).await;
    }

    /// Deletes security groups that lost their last policy reference.
    async fn cleanup_dereferenced_groups(&mut self, spec: &api::NetworkPolicy) {
        for name in &spec.applied_to_groups {
            if self
                .policies
                .by_index(IDX_POLICY_BY_APPLIED_TO, name)
                .is_empty()
            {
                for sg_key in self.applied_sgs.by_index(IDX_SG_BY_GROUP, name) {
                    self.applied_sg_delete(&sg_key).await;
                }
            }
        }
        for id in address_group_refs(spec) {
            let key = id.to_string();
            if self
                .policies
                .by_index(IDX_POLICY_BY_ADDR_GRP, &key)
                .is_empty()
            {
                self.address_sg_delete(&key).await;
            }
        }
    }

    /// Ensures an address security group exists for a policy-referenced peer
    /// group, creating the cloud group on first reference. Placement is
    /// derived from the reference's VPC; the owning account is learned from
    /// the group's members when they arrive.
    pub(crate) async fn ensure_address_sg(&mut self, id: &CloudResourceId) {
        let key = id.to_string();
        if !self.addr_sgs.contains_key(&key) {
            let resource = CloudResource::new(
                CloudResourceType::VirtualMachine,
                id.clone(),
                "",
                "",
            );
            self.addr_sgs.insert(AddressSecurityGroup::new(resource));
        }
        let needs_create = matches!(
            self.addr_sgs.get(&key),
            Some(sg) if sg.core.state == SgState::Init && !sg.core.delete_pending
        );
        if needs_create {
            self.address_sg_create(&key).await;
        }
    }

    /// Recomputes readiness for the policies referencing an address group,
    /// pushes rules for those that became ready, and republishes status for
    /// every policy whose readiness changed in either direction.
    pub(crate) async fn requeue_policies_for_address_group(&mut self, addr_sg_key: &str) {
        let policy_keys = self.policies.by_index(IDX_POLICY_BY_ADDR_GRP, addr_sg_key);
        let mut changed = Vec::new();
        for policy_key in &policy_keys {
            if let Some(policy) = self.policies.get_mut(policy_key) {
                let was_ready = policy.rules_ready;
                let ready = compute_rules(policy, &self.addr_sgs);
                if ready != was_ready {
                    changed.push((policy.spec.applied_to_groups.clone(), ready));
                }
            }
        }
        for (group_names, now_ready) in changed {
            for name in group_names {
                for sg_key in self.applied_sgs.by_index(IDX_SG_BY_GROUP, &name) {
                    if now_ready {
                        self.applied_sg_update_all_rules(&sg_key).await;
                    }
                    self.mark_member_trackers_dirty(&sg_key);
                }
            }
        }
    }
}
