//! Per-cloud-resource policy tracking and user-visible status.
//!
//! A tracker records which appliedTo security groups claim a cloud
//! resource, plus a shadow set of recently-detached groups still draining.
//! Dirty trackers are swept after every event; the per-resource-type status
//! setter publishes into the shared status surface.

use crate::{
    network_policy::{policy_status, NetworkPolicy},
    reconciler::Reconciler,
    security_group::{AddressSecurityGroup, AppliedToSecurityGroup},
    status::{NetworkPolicyStatus, Writer},
    store::{Indexed, Store},
    IDX_POLICY_BY_APPLIED_TO,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::Result;
use cloudnet_policy_controller_core::{
    CloudResource, CloudResourceType, Inventory, NamespacedName,
};
use tracing::{debug, warn};

pub(crate) const NETWORK_POLICY_STATUS_APPLIED: &str = "applied";

/// Tracks the appliedTo groups a cloud resource is (or was recently) a
/// member of. Groups are held by id; the stores are the source of truth.
#[derive(Clone, Debug)]
pub struct CloudResourceNpTracker {
    pub(crate) cloud_resource: CloudResource,
    pub(crate) dirty: bool,
    pub(crate) applied_to_sgs: HashSet<String>,
    pub(crate) prev_applied_to_sgs: HashSet<String>,
}

impl CloudResourceNpTracker {
    pub(crate) fn new(cloud_resource: CloudResource) -> Self {
        Self {
            cloud_resource,
            dirty: true,
            applied_to_sgs: HashSet::new(),
            prev_applied_to_sgs: HashSet::new(),
        }
    }

    pub fn cloud_resource(&self) -> &CloudResource {
        &self.cloud_resource
    }

    /// Forces a status recompute on the next dirty sweep.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl Indexed for CloudResourceNpTracker {
    fn store_key(&self) -> String {
        self.cloud_resource.to_string()
    }
}

pub(crate) fn tracker_by_applied_to(tracker: &CloudResourceNpTracker) -> Vec<String> {
    tracker
        .applied_to_sgs
        .iter()
        .chain(tracker.prev_applied_to_sgs.iter())
        .cloned()
        .collect()
}

/// Stores a dirty tracker's status for one resource type.
pub type StatusSetter =
    fn(&mut CloudResourceNpTracker, &mut TrackerDeps<'_>) -> Result<bool>;

/// What a status setter may read and write.
pub struct TrackerDeps<'a> {
    pub(crate) policies: &'a Store<NetworkPolicy>,
    pub(crate) addr_sgs: &'a Store<AddressSecurityGroup>,
    pub(crate) applied_sgs: &'a Store<AppliedToSecurityGroup>,
    pub(crate) inventory: &'a dyn Inventory,
    pub(crate) status: &'a mut Writer,
}

impl TrackerDeps<'_> {
    /// The tracker's realization map, keyed by namespace then policy name.
    pub fn compute_np_status(
        &self,
        tracker: &mut CloudResourceNpTracker,
    ) -> HashMap<String, HashMap<String, String>> {
        compute_np_status(tracker, self.policies, self.addr_sgs, self.applied_sgs)
    }

    pub fn inventory(&self) -> &dyn Inventory {
        self.inventory
    }

    pub fn status_writer(&mut self) -> &mut Writer {
        self.status
    }
}

/// Computes the policy realization map for a tracker, keyed by namespace
/// (a VM may be imported into several namespaces). The `""` namespace
/// collects dangling appliedTo groups with no policies left to name one.
///
/// The previous-group set is snapshotted, the status computed from the
/// snapshot, and the pruned set swapped in afterwards, so callers never
/// observe a half-updated tracker.
pub(crate) fn compute_np_status(
    tracker: &mut CloudResourceNpTracker,
    policies: &Store<NetworkPolicy>,
    addr_sgs: &Store<AddressSecurityGroup>,
    applied_sgs: &Store<AppliedToSecurityGroup>,
) -> HashMap<String, HashMap<String, String>> {
    // Policies attached through the current appliedTo groups. A resource in
    // several appliedTo groups of the same policy keeps one entry.
    let mut policy_to_sg: HashMap<String, String> = HashMap::default();
    for sg_key in &tracker.applied_to_sgs {
        let group_name = applied_group_name(applied_sgs, sg_key);
        for policy_key in policies.by_index(IDX_POLICY_BY_APPLIED_TO, &group_name) {
            policy_to_sg.insert(policy_key, sg_key.clone());
        }
    }

    let mut ret: HashMap<String, HashMap<String, String>> = HashMap::default();
    for (policy_key, sg_key) in &policy_to_sg {
        let Some(policy) = policies.get(policy_key) else {
            continue;
        };
        let entry = ret.entry(policy.spec.namespace.clone()).or_default();
        if let Some(error) = policy_status(policy, addr_sgs) {
            entry.insert(policy.spec.name.clone(), error);
            continue;
        }
        let status = match applied_sgs.get(sg_key) {
            None => format!("{sg_key}=Internal Error"),
            Some(sg) => match sg.realization_status() {
                Some(error) => format!("{sg_key}={error}"),
                None => format!("{sg_key}={NETWORK_POLICY_STATUS_APPLIED}"),
            },
        };
        entry.insert(policy.spec.name.clone(), status);
    }

    // Previously attached groups surface their teardown errors until the
    // delete resolves; resolved entries are pruned.
    let snapshot = tracker.prev_applied_to_sgs.clone();
    let mut new_prev = snapshot.clone();
    for sg_key in &snapshot {
        let error = applied_sgs
            .get(sg_key)
            .and_then(|sg| sg.core.last_error.clone());
        let Some(error) = error else {
            new_prev.remove(sg_key);
            continue;
        };
        let message = format!("Deleting/Detaching appliedTo sg {sg_key}: {error}");
        let group_name = applied_group_name(applied_sgs, sg_key);
        let policy_keys = policies.by_index(IDX_POLICY_BY_APPLIED_TO, &group_name);
        if policy_keys.is_empty() {
            ret.entry(String::new())
                .or_default()
                .insert(sg_key.clone(), message);
            continue;
        }
        for policy_key in policy_keys {
            let Some(policy) = policies.get(&policy_key) else {
                continue;
            };
            ret.entry(policy.spec.namespace.clone())
                .or_default()
                .insert(policy.spec.name.clone(), message.clone());
        }
    }
    tracker.prev_applied_to_sgs = new_prev;
    ret
}

/// Group name for an appliedTo SG key, from the store when present, else
/// parsed from the `name/vpc` key itself.
fn applied_group_name(applied_sgs: &Store<AppliedToSecurityGroup>, sg_key: &str) -> String {
    applied_sgs
        .get(sg_key)
        .map(|sg| sg.core.resource.id.name.clone())
        .unwrap_or_else(|| {
            sg_key
                .split_once('/')
                .map(|(name, _)| name.to_string())
                .unwrap_or_else(|| sg_key.to_string())
        })
}

/// Publishes a tracker's status for every VM sharing its cloud identifier.
/// Returns true when any row changed.
pub(crate) fn vm_np_status_setter(
    tracker: &mut CloudResourceNpTracker,
    deps: &mut TrackerDeps<'_>,
) -> Result<bool> {
    let status = compute_np_status(tracker, deps.policies, deps.addr_sgs, deps.applied_sgs);
    let mut updated = false;

    for vm in deps.inventory.vms_by_cloud_id(&tracker.cloud_resource.id.name) {
        let mut np_status = status.get(&vm.namespace).cloned().unwrap_or_default();
        if let Some(dangling) = status.get("") {
            np_status.extend(dangling.clone());
        }

        let key = NamespacedName::new(&vm.namespace, &vm.name);
        let existing = deps.status.get(&key);
        if np_status.is_empty() && existing.is_none() {
            continue;
        }
        if let Some(existing) = &existing {
            if existing.statuses == np_status {
                continue;
            }
        }

        if np_status.is_empty() {
            deps.status.remove(&key)?;
            debug!(resource = %key, "removed vm policy status");
        } else {
            deps.status
                .set(NetworkPolicyStatus::new(key.clone(), np_status))?;
            debug!(resource = %key, "updated vm policy status");
        }
        updated = true;
    }
    Ok(updated)
}

// === impl Reconciler: tracker maintenance ===

impl Reconciler {
    /// Records that a resource joined (`is_delete == false`) or left an
    /// appliedTo group. Idempotent per `(group, is_delete)`.
    pub(crate) fn tracker_update(&mut self, resource: &CloudResource, sg_key: &str, is_delete: bool) {
        let tracker_key = resource.to_string();
        if !self.trackers.contains_key(&tracker_key) {
            if is_delete {
                return;
            }
            self.trackers
                .insert(CloudResourceNpTracker::new(resource.clone()));
        }
        let Some(mut tracker) = self.trackers.remove(&tracker_key) else {
            return;
        };
        let attached = tracker.applied_to_sgs.contains(sg_key);
        if attached != is_delete {
            self.trackers.insert(tracker);
            return;
        }
        tracker.dirty = true;
        if is_delete {
            tracker.applied_to_sgs.remove(sg_key);
            tracker.prev_applied_to_sgs.insert(sg_key.to_string());
        } else {
            tracker.prev_applied_to_sgs.remove(sg_key);
            tracker.applied_to_sgs.insert(sg_key.to_string());
        }
        self.trackers.insert(tracker);
    }

    /// Sweeps dirty trackers, publishing status through the registered
    /// setter for each resource type. Trackers with nothing left to track
    /// are dropped; failed publishes stay dirty for the next sweep.
    pub(crate) fn process_trackers(&mut self) {
        for key in self.trackers.keys() {
            let Some(mut tracker) = self.trackers.remove(&key) else {
                continue;
            };
            if !tracker.dirty {
                self.trackers.insert(tracker);
                continue;
            }
            let Some(setter) = self
                .status_setters
                .get(&tracker.cloud_resource.resource_type)
                .copied()
            else {
                warn!(
                    resource = %tracker.cloud_resource,
                    "no status setter registered for resource type"
                );
                self.trackers.insert(tracker);
                continue;
            };
            let mut deps = TrackerDeps {
                policies: &self.policies,
                addr_sgs: &self.addr_sgs,
                applied_sgs: &self.applied_sgs,
                inventory: &*self.inventory,
                status: &mut self.status,
            };
            match setter(&mut tracker, &mut deps) {
                Ok(_) => {
                    if tracker.applied_to_sgs.is_empty() && tracker.prev_applied_to_sgs.is_empty() {
                        debug!(resource = %tracker.cloud_resource, "dropping empty tracker");
                        continue;
                    }
                    tracker.dirty = false;
                    self.trackers.insert(tracker);
                }
                Err(error) => {
                    warn!(resource = %tracker.cloud_resource, %error, "failed to publish policy status");
                    self.trackers.insert(tracker);
                }
            }
        }
    }

    /// Registers a status setter for a resource type. New cloud-resource
    /// kinds plug in without touching the event handlers.
    pub fn register_status_setter(&mut self, resource_type: CloudResourceType, setter: StatusSetter) {
        self.status_setters.insert(resource_type, setter);
    }
}
