//! The periodic cloud synchronization engine.
//!
//! `sync_with_cloud` reads a snapshot of every managed security group the
//! adapter can observe, repairs drift in both directions (orphaned cloud
//! groups are deleted; missing or diverged groups are re-driven through
//! their state machines), and refreshes the cloud-rule store to match
//! observation before any diff is emitted.

use crate::{
    network_policy::compute_rules,
    reconciler::Reconciler,
    security_group::{same_member_set, SgState},
    IDX_POLICY_BY_ADDR_GRP, IDX_POLICY_BY_APPLIED_TO, IDX_RULE_BY_APPLIED_TO,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use cloudnet_policy_controller_core::{
    CloudResource, CloudResourceType, CloudRule, EgressRule, IngressRule, Rule,
    SynchronizationContent,
};
use tracing::{debug, info, warn};

impl Reconciler {
    /// One blocking synchronization pass. Event consumption is paused for
    /// its duration; running it twice without intervening events makes no
    /// cloud mutations on the second pass.
    pub(crate) async fn sync_with_cloud(&mut self) {
        let mut rx = match self.cloud.enforced_security().await {
            Ok(rx) => rx,
            Err(error) => {
                warn!(%error, "could not read enforced security state");
                return;
            }
        };

        let mut cloud_addr_sgs: HashMap<String, SynchronizationContent> = HashMap::default();
        let mut cloud_applied_sgs: HashMap<String, SynchronizationContent> = HashMap::default();
        let mut with_foreign_sgs: HashSet<CloudResource> = HashSet::default();

        while let Some(content) = rx.recv().await {
            let key = content.resource.id.to_string();
            let known = if content.membership_only {
                self.addr_sgs.contains_key(&key)
            } else {
                self.applied_sgs.contains_key(&key)
            };
            if !known {
                info!(sg = %key, membership_only = content.membership_only, "deleting unknown managed security group");
                self.delete_orphan(&content).await;
                continue;
            }
            if content.membership_only {
                cloud_addr_sgs.insert(key, content);
            } else {
                for resource in &content.members_with_other_sg_attached {
                    with_foreign_sgs.insert(resource.clone());
                }
                cloud_applied_sgs.insert(key, content);
            }
        }
        self.synced_with_cloud = true;

        for key in self.addr_sgs.keys() {
            self.sync_address_sg(&key, cloud_addr_sgs.get(&key)).await;
        }
        for key in self.applied_sgs.keys() {
            self.sync_applied_sg(&key, cloud_applied_sgs.get(&key)).await;
        }

        // A member carrying groups this controller does not manage gets one
        // of its appliedTo groups re-pushed; the adapter sheds the foreign
        // attachment while reconciling membership.
        for resource in with_foreign_sgs {
            let Some(tracker) = self.trackers.get(&resource.to_string()) else {
                info!(%resource, "resource with foreign groups has no tracker");
                continue;
            };
            let Some(sg_key) = tracker.applied_to_sgs.iter().next().cloned() else {
                continue;
            };
            self.applied_sg_nudge(&sg_key).await;
        }

        // Deletes that failed earlier are never dropped; retry them here.
        for key in self.addr_sgs.keys() {
            let retry = matches!(
                self.addr_sgs.get(&key),
                Some(sg) if sg.core.delete_pending
            ) && self.policies.by_index(IDX_POLICY_BY_ADDR_GRP, &key).is_empty();
            if retry {
                self.address_sg_delete(&key).await;
            }
        }
        for key in self.applied_sgs.keys() {
            if matches!(self.applied_sgs.get(&key), Some(sg) if sg.core.delete_pending) {
                self.applied_sg_delete(&key).await;
            }
        }
    }

    async fn delete_orphan(&mut self, content: &SynchronizationContent) {
        let resource = content.resource.clone();
        let membership_only = content.membership_only;
        let result = self
            .cloud_call(&resource.account_id, |cloud| {
                let resource = resource.clone();
                async move {
                    cloud
                        .delete_security_group(&resource, membership_only)
                        .await
                }
            })
            .await;
        match result {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {}
            Err(error) => warn!(sg = %content.resource.id, %error, "failed to delete orphaned security group"),
        }
    }

    pub(crate) async fn sync_address_sg(
        &mut self,
        key: &str,
        content: Option<&SynchronizationContent>,
    ) {
        let (delete_pending, members) = match self.addr_sgs.get(key) {
            Some(sg) => (sg.core.delete_pending, sg.core.members.clone()),
            None => return,
        };
        if delete_pending {
            debug!(sg = %key, "address group pending delete; skipping sync");
            return;
        }

        match content {
            None => {
                // Gone from the cloud: back to Init so it is recreated.
                if let Some(sg) = self.addr_sgs.get_mut(key) {
                    sg.core.state = SgState::Init;
                }
                self.address_sg_create(key).await;
            }
            Some(content) => {
                if let Some(sg) = self.addr_sgs.get_mut(key) {
                    sg.core.state = SgState::Created;
                }
                let cached = self.effective_members_for_compare(&members, content);
                if !same_member_set(&cached, &content.members) {
                    debug!(sg = %key, "address group members out of sync with cloud");
                    self.address_sg_push_members(key).await;
                }
            }
        }
    }

    pub(crate) async fn sync_applied_sg(
        &mut self,
        key: &str,
        content: Option<&SynchronizationContent>,
    ) {
        let (delete_pending, members, group_name) = match self.applied_sgs.get(key) {
            Some(sg) => (
                sg.core.delete_pending,
                sg.core.members.clone(),
                sg.core.resource.id.name.clone(),
            ),
            None => return,
        };
        if delete_pending {
            debug!(sg = %key, "appliedTo group pending delete; skipping sync");
            return;
        }

        match content {
            None => {
                if let Some(sg) = self.applied_sgs.get_mut(key) {
                    sg.core.state = SgState::Init;
                }
                self.applied_sg_create(key).await;
            }
            Some(content) => {
                if let Some(sg) = self.applied_sgs.get_mut(key) {
                    sg.core.state = SgState::Created;
                    sg.has_members = !sg.core.members.is_empty();
                }
                let cached = self.effective_members_for_compare(&members, content);
                if !same_member_set(&cached, &content.members) {
                    debug!(sg = %key, "appliedTo group members out of sync with cloud");
                    self.applied_sg_nudge(key).await;
                }
            }
        }

        // Histogram of rule items across every ready policy targeting this
        // group: +1 per desired item, -1 per observed item. Any non-zero
        // bucket is drift. Policies with unrealized dependencies contribute
        // nothing observable, so they stay out of the histogram.
        let policy_keys = self.policies.by_index(IDX_POLICY_BY_APPLIED_TO, &group_name);
        let mut items: HashMap<String, i64> = HashMap::default();
        let mut has_ready_policy = false;
        for policy_key in &policy_keys {
            if let Some(policy) = self.policies.get_mut(policy_key) {
                if !policy.rules_ready && !compute_rules(policy, &self.addr_sgs) {
                    debug!(policy = %policy_key, "policy rules not ready during sync");
                }
            }
            let Some(policy) = self.policies.get(policy_key) else {
                continue;
            };
            if !policy.rules_ready {
                continue;
            }
            has_ready_policy = true;
            for rule in &policy.spec.ingress_rules {
                count_ingress_rule_items(rule, &mut items, false);
            }
            for rule in &policy.spec.egress_rules {
                count_egress_rule_items(rule, &mut items, false);
            }
        }

        let Some(content) = content else {
            // The group was recreated empty; forget the rules the old one
            // carried so the full set is re-pushed, then re-attach members.
            for hash in self.cloud_rules.by_index(IDX_RULE_BY_APPLIED_TO, key) {
                self.cloud_rules.remove(&hash);
            }
            self.applied_sg_update_all_rules(key).await;
            let has_members = matches!(
                self.applied_sgs.get(key),
                Some(sg) if !sg.core.members.is_empty()
            );
            if has_members {
                self.applied_sg_nudge(key).await;
            }
            return;
        };

        // Refresh the cloud-rule store to match observation before emitting
        // any diff.
        let mut unmatched: HashSet<String> = self
            .cloud_rules
            .by_index(IDX_RULE_BY_APPLIED_TO, key)
            .into_iter()
            .collect();
        let mut store_update = false;
        for rule in &content.ingress_rules {
            count_ingress_rule_items(rule, &mut items, true);
            let observed = CloudRule::new(Rule::Ingress(rule.clone()), key, "");
            if !unmatched.remove(&observed.hash) {
                store_update = true;
                self.cloud_rules.insert(observed);
            }
        }
        for rule in &content.egress_rules {
            count_egress_rule_items(rule, &mut items, true);
            let observed = CloudRule::new(Rule::Egress(rule.clone()), key, "");
            if !unmatched.remove(&observed.hash) {
                store_update = true;
                self.cloud_rules.insert(observed);
            }
        }
        for hash in unmatched {
            store_update = true;
            self.cloud_rules.remove(&hash);
        }

        if store_update {
            debug!(sg = %key, "cloud rules diverged from realized set");
            self.applied_sg_update_all_rules(key).await;
            return;
        }
        if items.values().any(|count| *count != 0) {
            info!(sg = %key, "appliedTo group rules out of sync with cloud");
            self.applied_sg_update_all_rules(key).await;
            return;
        }

        if has_ready_policy {
            self.applied_sg_set_rule_ready(key, true);
        }
    }

    /// The cached member set, NIC-expanded when the cloud reports NIC-typed
    /// members, so both sides compare at the same granularity.
    fn effective_members_for_compare(
        &self,
        cached: &[CloudResource],
        content: &SynchronizationContent,
    ) -> Vec<CloudResource> {
        let cloud_reports_nics = content
            .members
            .first()
            .map(|m| m.resource_type == CloudResourceType::NetworkInterface)
            .unwrap_or(false);
        if cloud_reports_nics {
            self.nics_of_cloud_resources(cached)
        } else {
            cached.to_vec()
        }
    }
}

fn count_ingress_rule_items(rule: &IngressRule, items: &mut HashMap<String, i64>, subtract: bool) {
    let delta = if subtract { -1 } else { 1 };
    let protocol = rule.protocol.unwrap_or(0);
    let port = rule.from_port.unwrap_or(0);
    if protocol > 0 || port > 0 {
        *items
            .entry(format!("protocol={protocol},port={port}"))
            .or_default() += delta;
    }
    for net in &rule.from_src_ip {
        *items.entry(net.to_string()).or_default() += delta;
    }
    for group in &rule.from_security_groups {
        *items.entry(group.to_string()).or_default() += delta;
    }
}

fn count_egress_rule_items(rule: &EgressRule, items: &mut HashMap<String, i64>, subtract: bool) {
    let delta = if subtract { -1 } else { 1 };
    let protocol = rule.protocol.unwrap_or(0);
    let port = rule.to_port.unwrap_or(0);
    if protocol > 0 || port > 0 {
        *items
            .entry(format!("protocol={protocol},port={port}"))
            .or_default() += delta;
    }
    for net in &rule.to_dst_ip {
        *items.entry(net.to_string()).or_default() += delta;
    }
    for group in &rule.to_security_groups {
        *items.entry(group.to_string()).or_default() += delta;
    }
}
