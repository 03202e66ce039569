//! The event-driven reconciler.
//!
//! A single task owns every store and consumes the four input streams;
//! handlers drive the security-group state machines and sweep dirty
//! trackers after each event. Cloud-adapter calls are serialized per
//! account, and the periodic cloud sync runs inline so event consumption
//! pauses for its duration.

use crate::{
    metrics::Sizes,
    network_policy::{policy_by_address_group, policy_by_applied_to, NetworkPolicy},
    security_group::{
        address_sg_by_group, applied_sg_by_group, same_member_set, AddressSecurityGroup,
        AppliedToSecurityGroup, SgState,
    },
    status,
    store::{Indexed, Store},
    tracker::{tracker_by_applied_to, vm_np_status_setter, CloudResourceNpTracker, StatusSetter},
    IDX_POLICY_BY_ADDR_GRP, IDX_RULE_BY_APPLIED_TO, IDX_SG_BY_GROUP, IDX_TRACKER_BY_APPLIED_TO,
};
use ahash::AHashMap as HashMap;
use anyhow::anyhow;
use cloudnet_policy_controller_core::{
    self as api, CloudError, CloudResource, CloudResourceId, CloudResourceType,
    CloudSecurityInterface, CloudRule, Event, Inventory,
};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch, Mutex},
    time,
};
use tracing::{debug, instrument};

impl Indexed for CloudRule {
    fn store_key(&self) -> String {
        self.hash.clone()
    }
}

pub(crate) fn rule_by_applied_to(rule: &CloudRule) -> Vec<String> {
    vec![rule.applied_to_group.clone()]
}

/// Reconciler tuning knobs.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Interval between periodic full cloud syncs.
    pub cloud_sync_interval: Duration,
    /// Bookmarks required on the declarative inputs before the first sync;
    /// guarantees the snapshot replay has drained.
    pub np_sync_ready_bookmark_cnt: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cloud_sync_interval: Duration::from_secs(300),
            np_sync_ready_bookmark_cnt: 3,
        }
    }
}

/// The declarative input streams consumed by [`Reconciler::run`].
pub struct InputWatches {
    pub network_policies: mpsc::Receiver<Event<api::NetworkPolicy>>,
    pub address_groups: mpsc::Receiver<Event<api::AddressGroup>>,
    pub applied_to_groups: mpsc::Receiver<Event<api::AppliedToGroup>>,
    pub virtual_machines: mpsc::Receiver<Event<api::VirtualMachine>>,
}

pub struct Reconciler {
    pub(crate) cloud: Arc<dyn CloudSecurityInterface>,
    pub(crate) inventory: Arc<dyn Inventory>,
    pub(crate) config: SyncConfig,

    pub(crate) policies: Store<NetworkPolicy>,
    pub(crate) addr_sgs: Store<AddressSecurityGroup>,
    pub(crate) applied_sgs: Store<AppliedToSecurityGroup>,
    pub(crate) trackers: Store<CloudResourceNpTracker>,
    pub(crate) cloud_rules: Store<CloudRule>,

    pub(crate) status: status::Writer,
    pub(crate) status_setters: HashMap<CloudResourceType, StatusSetter>,

    account_locks: HashMap<String, Arc<Mutex<()>>>,
    pub(crate) bookmark_count: usize,
    pub(crate) synced_with_cloud: bool,
    sizes: Sizes,
}

// === impl Reconciler ===

impl Reconciler {
    pub fn new(
        cloud: Arc<dyn CloudSecurityInterface>,
        inventory: Arc<dyn Inventory>,
        config: SyncConfig,
        status: status::Writer,
    ) -> Self {
        let mut status_setters: HashMap<CloudResourceType, StatusSetter> = HashMap::default();
        status_setters.insert(CloudResourceType::VirtualMachine, vm_np_status_setter);
        Self {
            cloud,
            inventory,
            config,
            policies: Store::new(vec![
                (crate::IDX_POLICY_BY_APPLIED_TO, policy_by_applied_to),
                (IDX_POLICY_BY_ADDR_GRP, policy_by_address_group),
            ]),
            addr_sgs: Store::new(vec![(IDX_SG_BY_GROUP, address_sg_by_group)]),
            applied_sgs: Store::new(vec![(IDX_SG_BY_GROUP, applied_sg_by_group)]),
            trackers: Store::new(vec![(IDX_TRACKER_BY_APPLIED_TO, tracker_by_applied_to)]),
            cloud_rules: Store::new(vec![(IDX_RULE_BY_APPLIED_TO, rule_by_applied_to)]),
            status,
            status_setters,
            account_locks: HashMap::default(),
            bookmark_count: 0,
            synced_with_cloud: false,
            sizes: Sizes::default(),
        }
    }

    /// A handle to the index-size gauges for metrics registration.
    pub fn sizes(&self) -> Sizes {
        self.sizes.clone()
    }

    /// Drives reconciliation for all input streams.
    ///
    /// All state is owned by this task, so handlers never contend for the
    /// stores. `ready` flips to true once the first cloud sync completes.
    #[instrument(skip_all, fields(result))]
    pub async fn run(mut self, watches: InputWatches, ready: watch::Sender<bool>) -> anyhow::Error {
        let InputWatches {
            mut network_policies,
            mut address_groups,
            mut applied_to_groups,
            mut virtual_machines,
        } = watches;

        let mut sync_timer = time::interval_at(
            time::Instant::now() + self.config.cloud_sync_interval,
            self.config.cloud_sync_interval,
        );
        sync_timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                ev = network_policies.recv() => match ev {
                    Some(ev) => self.handle_network_policy_event(ev).await,
                    None => return anyhow!("network-policy input stream closed"),
                },
                ev = address_groups.recv() => match ev {
                    Some(ev) => self.handle_address_group_event(ev).await,
                    None => return anyhow!("address-group input stream closed"),
                },
                ev = applied_to_groups.recv() => match ev {
                    Some(ev) => self.handle_applied_to_group_event(ev).await,
                    None => return anyhow!("appliedTo-group input stream closed"),
                },
                ev = virtual_machines.recv() => match ev {
                    Some(ev) => self.handle_virtual_machine_event(ev).await,
                    None => return anyhow!("virtual-machine input stream closed"),
                },
                _ = sync_timer.tick() => self.handle_sync_tick().await,
            };

            self.process_trackers();
            self.update_sizes();
            if self.synced_with_cloud && !*ready.borrow() {
                let _ = ready.send(true);
            }
        }
    }

    pub(crate) async fn handle_address_group_event(&mut self, event: Event<api::AddressGroup>) {
        match event {
            Event::Added(group) | Event::Modified(group) => self.apply_address_group(group).await,
            Event::Deleted(group) => self.delete_address_group(group).await,
            Event::Bookmark => self.process_bookmark().await,
        }
    }

    async fn apply_address_group(&mut self, group: api::AddressGroup) {
        debug!(group = %group.name, members = group.members.len(), "applying address group");
        let mut by_vpc: HashMap<String, Vec<CloudResource>> = HashMap::default();
        for member in group.members {
            by_vpc.entry(member.id.vpc.clone()).or_default().push(member);
        }
        // Groups that lost all members in a VPC drain to empty there.
        for key in self.addr_sgs.by_index(IDX_SG_BY_GROUP, &group.name) {
            if let Some(sg) = self.addr_sgs.get(&key) {
                by_vpc.entry(sg.core.resource.id.vpc.clone()).or_default();
            }
        }

        for (vpc, members) in by_vpc {
            let id = CloudResourceId::new(&group.name, &vpc);
            let key = id.to_string();
            if !self.addr_sgs.contains_key(&key) {
                let (account_id, provider) = members
                    .first()
                    .map(|m| (m.account_id.clone(), m.provider.clone()))
                    .unwrap_or_default();
                self.addr_sgs.insert(AddressSecurityGroup::new(CloudResource::new(
                    CloudResourceType::VirtualMachine,
                    id.clone(),
                    account_id,
                    provider,
                )));
            }

            let (state, changed) = match self.addr_sgs.get_mut(&key) {
                Some(sg) => {
                    if sg.core.resource.account_id.is_empty() {
                        if let Some(member) = members.first() {
                            sg.core.resource.account_id = member.account_id.clone();
                            sg.core.resource.provider = member.provider.clone();
                        }
                    }
                    let changed = !same_member_set(&sg.core.members, &members);
                    sg.core.members = members;
                    (sg.core.state, changed)
                }
                None => continue,
            };

            if state == SgState::Init {
                self.address_sg_create(&key).await;
            } else if changed {
                self.address_sg_push_members(&key).await;
            }
            self.requeue_policies_for_address_group(&key).await;
        }
    }

    async fn delete_address_group(&mut self, group: api::AddressGroup) {
        debug!(group = %group.name, "deleting address group");
        for key in self.addr_sgs.by_index(IDX_SG_BY_GROUP, &group.name) {
            if let Some(sg) = self.addr_sgs.get_mut(&key) {
                sg.core.delete_pending = true;
            }
            if self.policies.by_index(IDX_POLICY_BY_ADDR_GRP, &key).is_empty() {
                self.address_sg_delete(&key).await;
            } else {
                // Still referenced: retained until the last reference drops,
                // but dependent policies stop being ready.
                self.requeue_policies_for_address_group(&key).await;
            }
        }
    }

    pub(crate) async fn handle_applied_to_group_event(&mut self, event: Event<api::AppliedToGroup>) {
        match event {
            Event::Added(group) | Event::Modified(group) => {
                self.apply_applied_to_group(group).await
            }
            Event::Deleted(group) => self.delete_applied_to_group(group).await,
            Event::Bookmark => self.process_bookmark().await,
        }
    }

    async fn apply_applied_to_group(&mut self, group: api::AppliedToGroup) {
        debug!(group = %group.name, members = group.members.len(), "applying appliedTo group");
        let mut by_vpc: HashMap<String, Vec<CloudResource>> = HashMap::default();
        for member in group.members {
            by_vpc.entry(member.id.vpc.clone()).or_default().push(member);
        }
        for key in self.applied_sgs.by_index(IDX_SG_BY_GROUP, &group.name) {
            if let Some(sg) = self.applied_sgs.get(&key) {
                by_vpc.entry(sg.core.resource.id.vpc.clone()).or_default();
            }
        }

        for (vpc, members) in by_vpc {
            let id = CloudResourceId::new(&group.name, &vpc);
            let key = id.to_string();
            if !self.applied_sgs.contains_key(&key) {
                if members.is_empty() {
                    continue;
                }
                let (account_id, provider) = members
                    .first()
                    .map(|m| (m.account_id.clone(), m.provider.clone()))
                    .unwrap_or_default();
                self.applied_sgs
                    .insert(AppliedToSecurityGroup::new(CloudResource::new(
                        CloudResourceType::VirtualMachine,
                        id.clone(),
                        account_id,
                        provider,
                    )));
            }

            if matches!(
                self.applied_sgs.get(&key),
                Some(sg) if sg.core.state == SgState::Init
            ) {
                self.applied_sg_create(&key).await;
            }
            // Rules are pushed before members so a newly attached interface
            // is never governed by an empty group.
            self.applied_sg_update_all_rules(&key).await;
            self.applied_sg_update_members(&key, members).await;
        }
    }

    async fn delete_applied_to_group(&mut self, group: api::AppliedToGroup) {
        debug!(group = %group.name, "deleting appliedTo group");
        for key in self.applied_sgs.by_index(IDX_SG_BY_GROUP, &group.name) {
            self.applied_sg_delete(&key).await;
        }
    }

    pub(crate) async fn handle_virtual_machine_event(&mut self, event: Event<api::VirtualMachine>) {
        let vm = match event {
            Event::Added(vm) | Event::Modified(vm) | Event::Deleted(vm) => vm,
            // Inventory bookmarks do not gate the policy sync.
            Event::Bookmark => return,
        };
        debug!(vm = %vm.name, "handling virtual machine event");
        let keys = self
            .applied_sgs
            .iter()
            .filter(|(_, sg)| {
                sg.core
                    .members
                    .iter()
                    .any(|m| m.id.name == vm.cloud_id || m.id.name == vm.name)
            })
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in keys {
            // Re-resolve the member interfaces through the inventory.
            self.applied_sg_nudge(&key).await;
            self.mark_member_trackers_dirty(&key);
        }
    }

    /// Counts bookmarks across the declarative inputs; once the threshold is
    /// reached the first blocking cloud sync runs.
    pub(crate) async fn process_bookmark(&mut self) {
        if self.synced_with_cloud {
            return;
        }
        self.bookmark_count += 1;
        debug!(bookmarks = self.bookmark_count, "input bookmark received");
        if self.bookmark_count >= self.config.np_sync_ready_bookmark_cnt {
            self.sync_with_cloud().await;
        }
    }

    async fn handle_sync_tick(&mut self) {
        if self.synced_with_cloud {
            self.sync_with_cloud().await;
        }
    }

    pub(crate) fn account_lock(&mut self, account: &str) -> Arc<Mutex<()>> {
        self.account_locks
            .entry(account.to_string())
            .or_default()
            .clone()
    }

    /// Runs one adapter call under the account's mutex; the adapter is not
    /// reentrant for an account.
    pub(crate) async fn cloud_call<T, F, Fut>(&mut self, account: &str, f: F) -> Result<T, CloudError>
    where
        F: FnOnce(Arc<dyn CloudSecurityInterface>) -> Fut,
        Fut: Future<Output = Result<T, CloudError>>,
    {
        let lock = self.account_lock(account);
        let _guard = lock.lock().await;
        f(self.cloud.clone()).await
    }

    fn update_sizes(&self) {
        self.sizes.record(
            self.policies.len(),
            self.addr_sgs.len(),
            self.applied_sgs.len(),
            self.trackers.len(),
            self.cloud_rules.len(),
        );
    }
}
