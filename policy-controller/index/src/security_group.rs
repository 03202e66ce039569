//! Security-group state machines.
//!
//! Two variants share a common lifecycle: an *address* security group only
//! tracks membership (it exists so rules elsewhere can reference its
//! members), while an *appliedTo* security group tracks membership and
//! carries the realized cloud rules. All transitions are driven by the
//! reconciler task; cloud calls are serialized per account.

use crate::{
    network_policy::{compute_rules, policy_cloud_rules},
    reconciler::Reconciler,
    store::Indexed,
    IDX_POLICY_BY_APPLIED_TO, IDX_RULE_BY_APPLIED_TO,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use cloudnet_policy_controller_core::{
    CloudError, CloudResource, CloudResourceId, CloudResourceType, CloudRule,
};
use tracing::{debug, info, warn};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SgState {
    Init,
    Creating,
    Created,
    Updating,
    Deleting,
    Terminal,
}

/// Lifecycle state shared by both security-group variants.
#[derive(Clone, Debug)]
pub(crate) struct SecurityGroupCore {
    pub(crate) resource: CloudResource,
    #[allow(dead_code)]
    pub(crate) membership_only: bool,
    pub(crate) state: SgState,
    pub(crate) members: Vec<CloudResource>,
    pub(crate) delete_pending: bool,
    /// The most recent cloud failure, distinct from the state label.
    pub(crate) last_error: Option<String>,
}

impl SecurityGroupCore {
    pub(crate) fn new(resource: CloudResource, membership_only: bool) -> Self {
        Self {
            resource,
            membership_only,
            state: SgState::Init,
            members: Vec::new(),
            delete_pending: false,
            last_error: None,
        }
    }

    pub(crate) fn key(&self) -> String {
        self.resource.id.to_string()
    }
}

/// A membership-only group, referenced as a peer by policy rules.
#[derive(Clone, Debug)]
pub(crate) struct AddressSecurityGroup {
    pub(crate) core: SecurityGroupCore,
}

impl AddressSecurityGroup {
    pub(crate) fn new(resource: CloudResource) -> Self {
        Self {
            core: SecurityGroupCore::new(resource, true),
        }
    }
}

impl Indexed for AddressSecurityGroup {
    fn store_key(&self) -> String {
        self.core.key()
    }
}

pub(crate) fn address_sg_by_group(sg: &AddressSecurityGroup) -> Vec<String> {
    vec![sg.core.resource.id.name.clone()]
}

/// A group that policies apply to; owns the realized cloud rules.
#[derive(Clone, Debug)]
pub(crate) struct AppliedToSecurityGroup {
    pub(crate) core: SecurityGroupCore,
    pub(crate) has_members: bool,
    pub(crate) rule_ready: bool,
}

impl AppliedToSecurityGroup {
    pub(crate) fn new(resource: CloudResource) -> Self {
        Self {
            core: SecurityGroupCore::new(resource, false),
            has_members: false,
            rule_ready: false,
        }
    }

    /// `None` means the group is realized: created, no pending error, rules
    /// pushed. Anything else names the condition blocking realization.
    pub(crate) fn realization_status(&self) -> Option<String> {
        if let Some(error) = &self.core.last_error {
            return Some(error.clone());
        }
        if self.core.state != SgState::Created || !self.rule_ready {
            return Some("in progress".to_string());
        }
        None
    }
}

impl Indexed for AppliedToSecurityGroup {
    fn store_key(&self) -> String {
        self.core.key()
    }
}

pub(crate) fn applied_sg_by_group(sg: &AppliedToSecurityGroup) -> Vec<String> {
    vec![sg.core.resource.id.name.clone()]
}

pub(crate) fn same_member_set(a: &[CloudResource], b: &[CloudResource]) -> bool {
    let a = a.iter().map(|m| m.to_string()).collect::<HashSet<_>>();
    let b = b.iter().map(|m| m.to_string()).collect::<HashSet<_>>();
    a == b
}

enum RuleOp {
    Authorize,
    Revoke,
}

// === impl Reconciler: security-group operations ===

impl Reconciler {
    /// Expands VM members to their network interfaces; NIC members pass
    /// through unchanged.
    pub(crate) fn nics_of_cloud_resources(&self, members: &[CloudResource]) -> Vec<CloudResource> {
        if members
            .first()
            .map(|m| m.resource_type == CloudResourceType::NetworkInterface)
            .unwrap_or(true)
        {
            return members.to_vec();
        }
        let mut nics = Vec::with_capacity(members.len());
        for member in members {
            for vm in self.inventory.vms_by_cloud_id(&member.id.name) {
                for nic in &vm.network_interfaces {
                    nics.push(CloudResource::new(
                        CloudResourceType::NetworkInterface,
                        CloudResourceId::new(&nic.name, &member.id.vpc),
                        &member.account_id,
                        &member.provider,
                    ));
                }
            }
        }
        nics
    }

    /// Creates the address group in the cloud. On failure the group falls
    /// back to `Init` with its members retained, so a later pass retries.
    pub(crate) async fn address_sg_create(&mut self, key: &str) {
        let (resource, has_members) = match self.addr_sgs.get_mut(key) {
            Some(sg) if sg.core.state == SgState::Init && !sg.core.delete_pending => {
                sg.core.state = SgState::Creating;
                (sg.core.resource.clone(), !sg.core.members.is_empty())
            }
            _ => return,
        };

        let result = self.cloud_call(&resource.account_id, |cloud| {
            let resource = resource.clone();
            async move { cloud.create_security_group(&resource, true).await }
        })
        .await;

        match result {
            Ok(cloud_id) => {
                debug!(sg = %key, %cloud_id, "created address security group");
                if let Some(sg) = self.addr_sgs.get_mut(key) {
                    sg.core.state = SgState::Created;
                    sg.core.last_error = None;
                }
                if has_members {
                    self.address_sg_push_members(key).await;
                }
            }
            Err(error) => {
                warn!(sg = %key, %error, "failed to create address security group");
                if let Some(sg) = self.addr_sgs.get_mut(key) {
                    sg.core.state = SgState::Init;
                    sg.core.last_error = Some(error.to_string());
                }
            }
        }
    }

    /// Drives the cloud membership of an address group to the cached member
    /// set.
    pub(crate) async fn address_sg_push_members(&mut self, key: &str) {
        let (resource, members) = match self.addr_sgs.get_mut(key) {
            Some(sg) if sg.core.state == SgState::Created => {
                sg.core.state = SgState::Updating;
                (sg.core.resource.clone(), sg.core.members.clone())
            }
            _ => return,
        };

        let effective = self.nics_of_cloud_resources(&members);
        let result = self.cloud_call(&resource.account_id, |cloud| {
            let resource = resource.clone();
            async move {
                cloud
                    .update_security_group_members(&resource, &effective, true)
                    .await
            }
        })
        .await;

        if let Some(sg) = self.addr_sgs.get_mut(key) {
            sg.core.state = SgState::Created;
            match result {
                Ok(()) => sg.core.last_error = None,
                Err(error) => {
                    warn!(sg = %key, %error, "failed to update address group members");
                    sg.core.last_error = Some(error.to_string());
                }
            }
        }
    }

    /// Detaches members and deletes the address group. A missing group is
    /// treated as already deleted.
    pub(crate) async fn address_sg_delete(&mut self, key: &str) {
        let (resource, created) = match self.addr_sgs.get_mut(key) {
            Some(sg) => {
                sg.core.delete_pending = true;
                let created = !matches!(sg.core.state, SgState::Init | SgState::Creating);
                sg.core.state = SgState::Deleting;
                (sg.core.resource.clone(), created)
            }
            None => return,
        };

        if created {
            let detach = self.cloud_call(&resource.account_id, |cloud| {
                let resource = resource.clone();
                async move {
                    cloud
                        .update_security_group_members(&resource, &[], true)
                        .await
                }
            })
            .await;
            if let Err(error) = detach {
                if !error.is_not_found() {
                    warn!(sg = %key, %error, "failed to detach address group members");
                    if let Some(sg) = self.addr_sgs.get_mut(key) {
                        sg.core.last_error = Some(error.to_string());
                    }
                    return;
                }
            }

            let result = self.cloud_call(&resource.account_id, |cloud| {
                let resource = resource.clone();
                async move { cloud.delete_security_group(&resource, true).await }
            })
            .await;
            match result {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {}
                Err(error) => {
                    warn!(sg = %key, %error, "failed to delete address security group");
                    if let Some(sg) = self.addr_sgs.get_mut(key) {
                        sg.core.last_error = Some(error.to_string());
                    }
                    return;
                }
            }
        }

        if let Some(mut sg) = self.addr_sgs.remove(key) {
            sg.core.state = SgState::Terminal;
            info!(sg = %key, "address security group deleted");
        }
    }

    /// Creates the appliedTo group in the cloud. Members and rules are
    /// pushed by follow-up operations so rule pushes precede attachment.
    pub(crate) async fn applied_sg_create(&mut self, key: &str) {
        let resource = match self.applied_sgs.get_mut(key) {
            Some(sg) if sg.core.state == SgState::Init && !sg.core.delete_pending => {
                sg.core.state = SgState::Creating;
                sg.core.resource.clone()
            }
            _ => return,
        };

        let result = self.cloud_call(&resource.account_id, |cloud| {
            let resource = resource.clone();
            async move { cloud.create_security_group(&resource, false).await }
        })
        .await;

        match result {
            Ok(cloud_id) => {
                debug!(sg = %key, %cloud_id, "created appliedTo security group");
                if let Some(sg) = self.applied_sgs.get_mut(key) {
                    sg.core.state = SgState::Created;
                    sg.core.last_error = None;
                }
            }
            Err(error) => {
                warn!(sg = %key, %error, "failed to create appliedTo security group");
                if let Some(sg) = self.applied_sgs.get_mut(key) {
                    sg.core.state = SgState::Init;
                    sg.core.last_error = Some(error.to_string());
                }
            }
        }
    }

    /// Applies a new target member set to an appliedTo group, updating the
    /// per-resource trackers with attach/detach deltas. A no-change update
    /// returns without a cloud call.
    pub(crate) async fn applied_sg_update_members(&mut self, key: &str, members: Vec<CloudResource>) {
        let unchanged = match self.applied_sgs.get(key) {
            Some(sg) => {
                sg.core.state == SgState::Created && same_member_set(&sg.core.members, &members)
            }
            None => return,
        };
        if unchanged {
            return;
        }
        self.applied_sg_push_members(key, members, false).await;
    }

    /// Re-pushes the current member set unconditionally. Used by the sync
    /// engine to make the adapter shed foreign groups from a member's
    /// interfaces.
    pub(crate) async fn applied_sg_nudge(&mut self, key: &str) {
        let members = match self.applied_sgs.get(key) {
            Some(sg) => sg.core.members.clone(),
            None => return,
        };
        self.applied_sg_push_members(key, members, true).await;
    }

    async fn applied_sg_push_members(
        &mut self,
        key: &str,
        members: Vec<CloudResource>,
        force: bool,
    ) {
        // The cache holds the target member set: a failed push (or a group
        // that is not in the cloud yet) leaves the intent in place for the
        // sync pass to retry.
        let (resource, old_members, callable) = match self.applied_sgs.get_mut(key) {
            Some(sg) => {
                let callable =
                    force || matches!(sg.core.state, SgState::Created | SgState::Updating);
                if sg.core.state == SgState::Created {
                    sg.core.state = SgState::Updating;
                }
                let old = std::mem::replace(&mut sg.core.members, members.clone());
                sg.has_members = !sg.core.members.is_empty();
                (sg.core.resource.clone(), old, callable)
            }
            None => return,
        };

        let old_keys = old_members
            .iter()
            .map(|m| m.to_string())
            .collect::<HashSet<_>>();
        let new_keys = members
            .iter()
            .map(|m| m.to_string())
            .collect::<HashSet<_>>();
        for member in members.iter().filter(|m| !old_keys.contains(&m.to_string())) {
            let member = member.clone();
            self.tracker_update(&member, key, false);
        }
        for member in old_members
            .iter()
            .filter(|m| !new_keys.contains(&m.to_string()))
        {
            let member = member.clone();
            self.tracker_update(&member, key, true);
        }

        if !callable {
            self.mark_member_trackers_dirty(key);
            return;
        }

        let effective = self.nics_of_cloud_resources(&members);
        let result = self.cloud_call(&resource.account_id, |cloud| {
            let resource = resource.clone();
            async move {
                cloud
                    .update_security_group_members(&resource, &effective, false)
                    .await
            }
        })
        .await;

        match result {
            Ok(()) => {
                if let Some(sg) = self.applied_sgs.get_mut(key) {
                    if sg.core.state == SgState::Updating {
                        sg.core.state = SgState::Created;
                    }
                    sg.core.last_error = None;
                }
            }
            Err(error) => {
                warn!(sg = %key, %error, "failed to update appliedTo group members");
                if let Some(sg) = self.applied_sgs.get_mut(key) {
                    if sg.core.state == SgState::Updating {
                        sg.core.state = SgState::Created;
                    }
                    sg.core.last_error = Some(error.to_string());
                }
            }
        }
        self.mark_member_trackers_dirty(key);
    }

    /// Recomputes the full desired rule set for an appliedTo group from
    /// every policy targeting it, diffs against the cloud-rule store by
    /// hash, and pushes the delta.
    pub(crate) async fn applied_sg_update_all_rules(&mut self, key: &str) {
        let (resource, group_name, created) = match self.applied_sgs.get(key) {
            Some(sg) => (
                sg.core.resource.clone(),
                sg.core.resource.id.name.clone(),
                matches!(sg.core.state, SgState::Created | SgState::Updating),
            ),
            None => return,
        };
        if !created {
            return;
        }

        let policy_keys = self.policies.by_index(IDX_POLICY_BY_APPLIED_TO, &group_name);
        let mut desired: HashMap<String, CloudRule> = HashMap::default();
        let mut has_ready_policy = false;
        for policy_key in &policy_keys {
            if let Some(policy) = self.policies.get_mut(policy_key) {
                if !policy.rules_ready {
                    compute_rules(policy, &self.addr_sgs);
                }
            }
            let policy = match self.policies.get(policy_key) {
                Some(policy) if policy.rules_ready => policy,
                _ => continue,
            };
            has_ready_policy = true;
            match policy_cloud_rules(policy, key, &group_name) {
                Ok(rules) => {
                    for rule in rules {
                        desired.insert(rule.hash.clone(), rule);
                    }
                }
                Err(error) => {
                    warn!(policy = %policy_key, %error, "could not derive cloud rules");
                }
            }
        }

        let current_hashes = self.cloud_rules.by_index(IDX_RULE_BY_APPLIED_TO, key);
        let current: HashMap<String, CloudRule> = current_hashes
            .iter()
            .filter_map(|hash| self.cloud_rules.get(hash).cloned())
            .map(|rule| (rule.hash.clone(), rule))
            .collect();

        let add = desired
            .values()
            .filter(|rule| !current.contains_key(&rule.hash))
            .cloned()
            .collect::<Vec<_>>();
        let rm = current
            .values()
            .filter(|rule| !desired.contains_key(&rule.hash))
            .cloned()
            .collect::<Vec<_>>();

        if add.is_empty() && rm.is_empty() {
            self.applied_sg_set_rule_ready(key, has_ready_policy);
            return;
        }

        if let Some(sg) = self.applied_sgs.get_mut(key) {
            sg.core.state = SgState::Updating;
        }
        let result = self.push_rule_diff(&resource, &add, &rm).await;
        match result {
            Ok(()) => {
                for rule in &rm {
                    self.cloud_rules.remove(&rule.hash);
                }
                for rule in add {
                    self.cloud_rules.insert(rule);
                }
                if let Some(sg) = self.applied_sgs.get_mut(key) {
                    sg.core.state = SgState::Created;
                    sg.core.last_error = None;
                }
                self.applied_sg_set_rule_ready(key, has_ready_policy);
            }
            Err(error) => {
                warn!(sg = %key, %error, "failed to update appliedTo group rules");
                if let Some(sg) = self.applied_sgs.get_mut(key) {
                    sg.core.state = SgState::Created;
                    sg.core.last_error = Some(error.to_string());
                    sg.rule_ready = false;
                }
                self.mark_member_trackers_dirty(key);
            }
        }
    }

    pub(crate) fn applied_sg_set_rule_ready(&mut self, key: &str, ready: bool) {
        let changed = match self.applied_sgs.get_mut(key) {
            Some(sg) => {
                let changed = sg.rule_ready != ready;
                sg.rule_ready = ready;
                changed
            }
            None => false,
        };
        if changed {
            self.mark_member_trackers_dirty(key);
        }
    }

    pub(crate) fn mark_member_trackers_dirty(&mut self, key: &str) {
        for tracker_key in self.trackers.by_index(crate::IDX_TRACKER_BY_APPLIED_TO, key) {
            if let Some(tracker) = self.trackers.get_mut(&tracker_key) {
                tracker.dirty = true;
            }
        }
    }

    /// Executes a rule delta as four ordered batches: revoke ingress,
    /// authorize ingress, revoke egress, authorize egress. A failure at any
    /// step compensates the already-applied steps in reverse before
    /// returning the original error, leaving the cloud rule set unchanged.
    pub(crate) async fn push_rule_diff(
        &mut self,
        resource: &CloudResource,
        add: &[CloudRule],
        rm: &[CloudRule],
    ) -> Result<(), CloudError> {
        let split = |rules: &[CloudRule], ingress: bool| {
            rules
                .iter()
                .filter(|r| r.rule.is_ingress() == ingress)
                .cloned()
                .collect::<Vec<_>>()
        };
        let steps = [
            (split(rm, true), RuleOp::Revoke),
            (split(add, true), RuleOp::Authorize),
            (split(rm, false), RuleOp::Revoke),
            (split(add, false), RuleOp::Authorize),
        ];

        let lock = self.account_lock(&resource.account_id);
        let _guard = lock.lock().await;

        let mut applied: Vec<&(Vec<CloudRule>, RuleOp)> = Vec::new();
        for step in &steps {
            let (rules, op) = step;
            if rules.is_empty() {
                continue;
            }
            let result = match op {
                RuleOp::Authorize => {
                    self.cloud
                        .update_security_group_rules(resource, rules, &[])
                        .await
                }
                RuleOp::Revoke => {
                    self.cloud
                        .update_security_group_rules(resource, &[], rules)
                        .await
                }
            };
            if let Err(error) = result {
                for (rules, op) in applied.into_iter().rev() {
                    let rollback = match op {
                        // Inverse of an authorize is a revoke and vice versa.
                        RuleOp::Authorize => {
                            self.cloud
                                .update_security_group_rules(resource, &[], rules)
                                .await
                        }
                        RuleOp::Revoke => {
                            self.cloud
                                .update_security_group_rules(resource, rules, &[])
                                .await
                        }
                    };
                    if let Err(rollback_error) = rollback {
                        warn!(sg = %resource.id, %rollback_error, "rule rollback failed; cloud sync will repair");
                    }
                }
                return Err(error);
            }
            applied.push(step);
        }
        Ok(())
    }

    /// Detaches members, deletes the cloud group, and drops the group and
    /// its realized rules from the stores. Trackers keep the group in their
    /// previous set until status is drained.
    pub(crate) async fn applied_sg_delete(&mut self, key: &str) {
        let (resource, members, created) = match self.applied_sgs.get_mut(key) {
            Some(sg) => {
                sg.core.delete_pending = true;
                let created = !matches!(sg.core.state, SgState::Init | SgState::Creating);
                sg.core.state = SgState::Deleting;
                (sg.core.resource.clone(), sg.core.members.clone(), created)
            }
            None => return,
        };

        // The group moves into each member's previous set up front so its
        // teardown progress (and any failure) surfaces in status.
        for member in &members {
            self.tracker_update(member, key, true);
        }

        if created {
            let detach = self.cloud_call(&resource.account_id, |cloud| {
                let resource = resource.clone();
                async move {
                    cloud
                        .update_security_group_members(&resource, &[], false)
                        .await
                }
            })
            .await;
            if let Err(error) = detach {
                if !error.is_not_found() {
                    warn!(sg = %key, %error, "failed to detach appliedTo group members");
                    if let Some(sg) = self.applied_sgs.get_mut(key) {
                        sg.core.last_error = Some(error.to_string());
                    }
                    self.mark_member_trackers_dirty(key);
                    return;
                }
            }

            let result = self.cloud_call(&resource.account_id, |cloud| {
                let resource = resource.clone();
                async move { cloud.delete_security_group(&resource, false).await }
            })
            .await;
            match result {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {}
                Err(error) => {
                    warn!(sg = %key, %error, "failed to delete appliedTo security group");
                    if let Some(sg) = self.applied_sgs.get_mut(key) {
                        sg.core.last_error = Some(error.to_string());
                    }
                    self.mark_member_trackers_dirty(key);
                    return;
                }
            }
        }

        for hash in self.cloud_rules.by_index(IDX_RULE_BY_APPLIED_TO, key) {
            self.cloud_rules.remove(&hash);
        }
        if let Some(mut sg) = self.applied_sgs.remove(key) {
            sg.core.state = SgState::Terminal;
            info!(sg = %key, "appliedTo security group deleted");
        }
        self.mark_member_trackers_dirty(key);
    }
}
