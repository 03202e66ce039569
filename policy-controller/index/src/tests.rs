mod sync_drift;
mod tracker_status;

use crate::{status, Reconciler, SyncConfig};
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use cloudnet_policy_controller_core::{
    self as api, CloudError, CloudResource, CloudResourceId, CloudResourceType,
    CloudSecurityInterface, CloudRule, EgressRule, Event, IngressRule, NetworkInterface, Rule,
    SynchronizationContent, VirtualMachine,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A cloud-adapter call as the mock observed it. Rules are recorded by
/// their canonical encodings so expectations read naturally.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum CloudCall {
    Create {
        sg: String,
        membership_only: bool,
    },
    UpdateRules {
        sg: String,
        add: Vec<String>,
        rm: Vec<String>,
    },
    UpdateMembers {
        sg: String,
        members: Vec<String>,
        membership_only: bool,
    },
    Delete {
        sg: String,
        membership_only: bool,
    },
    GetEnforced,
}

#[derive(Debug, Default)]
struct GroupState {
    resource: CloudResource,
    membership_only: bool,
    members: Vec<CloudResource>,
    foreign_members: Vec<CloudResource>,
    ingress: Vec<IngressRule>,
    egress: Vec<EgressRule>,
}

#[derive(Debug, Default)]
struct FailPlan {
    /// Fail the Nth rule-update call from now (1-based), then clear.
    rule_update_call: Option<usize>,
    rule_calls_seen: usize,
    fail_creates: bool,
    fail_deletes: bool,
    fail_member_updates: bool,
}

/// A stateful in-memory cloud: calls mutate simulated security groups, and
/// `enforced_security` reflects the accumulated state back, so sync tests
/// observe honest fixpoint behavior.
#[derive(Debug, Default)]
pub(crate) struct MockCloud {
    groups: Mutex<HashMap<String, GroupState>>,
    calls: Mutex<Vec<CloudCall>>,
    fail: Mutex<FailPlan>,
}

impl MockCloud {
    pub(crate) fn calls(&self) -> Vec<CloudCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn take_calls(&self) -> Vec<CloudCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub(crate) fn fail_rule_update_call(&self, nth: usize) {
        let mut fail = self.fail.lock();
        fail.rule_update_call = Some(nth);
        fail.rule_calls_seen = 0;
    }

    pub(crate) fn fail_creates(&self, enabled: bool) {
        self.fail.lock().fail_creates = enabled;
    }

    pub(crate) fn fail_deletes(&self, enabled: bool) {
        self.fail.lock().fail_deletes = enabled;
    }

    pub(crate) fn fail_member_updates(&self, enabled: bool) {
        self.fail.lock().fail_member_updates = enabled;
    }

    /// Seeds a group directly into the simulated cloud, bypassing the
    /// adapter surface; used for orphan and drift scenarios.
    pub(crate) fn seed_group(
        &self,
        resource: CloudResource,
        membership_only: bool,
        ingress: Vec<IngressRule>,
        egress: Vec<EgressRule>,
    ) {
        self.groups.lock().insert(
            resource.id.to_string(),
            GroupState {
                resource,
                membership_only,
                members: Vec::new(),
                foreign_members: Vec::new(),
                ingress,
                egress,
            },
        );
    }

    /// Adds a drifted ingress rule to an existing simulated group.
    pub(crate) fn inject_ingress_rule(&self, sg: &str, rule: IngressRule) {
        if let Some(group) = self.groups.lock().get_mut(sg) {
            group.ingress.push(rule);
        }
    }

    pub(crate) fn mark_foreign_member(&self, sg: &str, member: CloudResource) {
        if let Some(group) = self.groups.lock().get_mut(sg) {
            group.foreign_members.push(member);
        }
    }

    pub(crate) fn group_rules(&self, sg: &str) -> (Vec<String>, Vec<String>) {
        let groups = self.groups.lock();
        let Some(group) = groups.get(sg) else {
            return (Vec::new(), Vec::new());
        };
        let mut ingress = group
            .ingress
            .iter()
            .map(|r| Rule::Ingress(r.clone()).canonical())
            .collect::<Vec<_>>();
        let mut egress = group
            .egress
            .iter()
            .map(|r| Rule::Egress(r.clone()).canonical())
            .collect::<Vec<_>>();
        ingress.sort();
        egress.sort();
        (ingress, egress)
    }

    pub(crate) fn has_group(&self, sg: &str) -> bool {
        self.groups.lock().contains_key(sg)
    }
}

fn rule_names(rules: &[CloudRule]) -> Vec<String> {
    rules.iter().map(|r| r.rule.canonical()).collect()
}

#[async_trait]
impl CloudSecurityInterface for MockCloud {
    async fn create_security_group(
        &self,
        sg: &CloudResource,
        membership_only: bool,
    ) -> Result<String, CloudError> {
        self.calls.lock().push(CloudCall::Create {
            sg: sg.id.to_string(),
            membership_only,
        });
        if self.fail.lock().fail_creates {
            return Err(CloudError::transient("injected create failure"));
        }
        let mut groups = self.groups.lock();
        groups
            .entry(sg.id.to_string())
            .or_insert_with(|| GroupState {
                resource: sg.clone(),
                membership_only,
                ..GroupState::default()
            });
        Ok(format!("sg-{}", sg.id.name))
    }

    async fn update_security_group_rules(
        &self,
        applied_to: &CloudResource,
        add: &[CloudRule],
        rm: &[CloudRule],
    ) -> Result<(), CloudError> {
        self.calls.lock().push(CloudCall::UpdateRules {
            sg: applied_to.id.to_string(),
            add: rule_names(add),
            rm: rule_names(rm),
        });
        {
            let mut fail = self.fail.lock();
            if let Some(nth) = fail.rule_update_call {
                fail.rule_calls_seen += 1;
                if fail.rule_calls_seen == nth {
                    fail.rule_update_call = None;
                    return Err(CloudError::transient("injected rule-update failure"));
                }
            }
        }
        let mut groups = self.groups.lock();
        let Some(group) = groups.get_mut(&applied_to.id.to_string()) else {
            return Err(CloudError::not_found(applied_to.id.to_string()));
        };
        for rule in rm {
            let canonical = rule.rule.canonical();
            group
                .ingress
                .retain(|r| Rule::Ingress(r.clone()).canonical() != canonical);
            group
                .egress
                .retain(|r| Rule::Egress(r.clone()).canonical() != canonical);
        }
        for rule in add {
            match &rule.rule {
                Rule::Ingress(r) => group.ingress.push(r.clone()),
                Rule::Egress(r) => group.egress.push(r.clone()),
            }
        }
        Ok(())
    }

    async fn update_security_group_members(
        &self,
        sg: &CloudResource,
        members: &[CloudResource],
        membership_only: bool,
    ) -> Result<(), CloudError> {
        self.calls.lock().push(CloudCall::UpdateMembers {
            sg: sg.id.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
            membership_only,
        });
        if self.fail.lock().fail_member_updates {
            return Err(CloudError::transient("injected member-update failure"));
        }
        let mut groups = self.groups.lock();
        let Some(group) = groups.get_mut(&sg.id.to_string()) else {
            return Err(CloudError::not_found(sg.id.to_string()));
        };
        group.members = members.to_vec();
        // Reconciling membership sheds any foreign attachments.
        group.foreign_members.clear();
        Ok(())
    }

    async fn delete_security_group(
        &self,
        sg: &CloudResource,
        membership_only: bool,
    ) -> Result<(), CloudError> {
        self.calls.lock().push(CloudCall::Delete {
            sg: sg.id.to_string(),
            membership_only,
        });
        if self.fail.lock().fail_deletes {
            return Err(CloudError::transient("injected delete failure"));
        }
        if self.groups.lock().remove(&sg.id.to_string()).is_none() {
            return Err(CloudError::not_found(sg.id.to_string()));
        }
        Ok(())
    }

    async fn enforced_security(
        &self,
    ) -> Result<mpsc::Receiver<SynchronizationContent>, CloudError> {
        self.calls.lock().push(CloudCall::GetEnforced);
        let groups = self.groups.lock();
        let (tx, rx) = mpsc::channel(groups.len().max(1));
        for group in groups.values() {
            let content = SynchronizationContent {
                resource: group.resource.clone(),
                membership_only: group.membership_only,
                members: group.members.clone(),
                members_with_other_sg_attached: group.foreign_members.clone(),
                ingress_rules: group.ingress.clone(),
                egress_rules: group.egress.clone(),
            };
            tx.try_send(content)
                .expect("sync channel sized to group count");
        }
        Ok(rx)
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockInventory {
    vms: Mutex<HashMap<String, Vec<VirtualMachine>>>,
}

impl MockInventory {
    pub(crate) fn add_vm(
        &self,
        namespace: &str,
        name: &str,
        cloud_id: &str,
        vpc: &str,
        nics: &[&str],
    ) {
        let vm = VirtualMachine {
            namespace: namespace.to_string(),
            name: name.to_string(),
            cloud_id: cloud_id.to_string(),
            vpc: vpc.to_string(),
            network_interfaces: nics
                .iter()
                .map(|n| NetworkInterface {
                    name: n.to_string(),
                })
                .collect(),
        };
        self.vms
            .lock()
            .entry(cloud_id.to_string())
            .or_default()
            .push(vm);
    }
}

impl api::Inventory for MockInventory {
    fn vms_by_cloud_id(&self, cloud_id: &str) -> Vec<VirtualMachine> {
        self.vms.lock().get(cloud_id).cloned().unwrap_or_default()
    }
}

pub(crate) struct TestHarness {
    pub(crate) r: Reconciler,
    pub(crate) cloud: Arc<MockCloud>,
    pub(crate) inventory: Arc<MockInventory>,
    pub(crate) status: status::Reader,
    _tracing: tracing::subscriber::DefaultGuard,
}

impl TestHarness {
    pub(crate) fn new() -> Self {
        let _tracing = tracing::subscriber::set_default(
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(tracing::Level::DEBUG)
                .finish(),
        );
        let cloud = Arc::new(MockCloud::default());
        let inventory = Arc::new(MockInventory::default());
        let (writer, reader) = status::pair();
        let r = Reconciler::new(
            cloud.clone(),
            inventory.clone(),
            SyncConfig::default(),
            writer,
        );
        Self {
            r,
            cloud,
            inventory,
            status: reader,
            _tracing,
        }
    }

    pub(crate) async fn np(&mut self, event: api::Event<api::NetworkPolicy>) {
        self.r.handle_network_policy_event(event).await;
        self.r.process_trackers();
    }

    pub(crate) async fn ag(&mut self, event: api::Event<api::AddressGroup>) {
        self.r.handle_address_group_event(event).await;
        self.r.process_trackers();
    }

    pub(crate) async fn atg(&mut self, event: api::Event<api::AppliedToGroup>) {
        self.r.handle_applied_to_group_event(event).await;
        self.r.process_trackers();
    }

    pub(crate) async fn vm(&mut self, event: api::Event<api::VirtualMachine>) {
        self.r.handle_virtual_machine_event(event).await;
        self.r.process_trackers();
    }

    pub(crate) async fn sync(&mut self) {
        self.r.sync_with_cloud().await;
        self.r.process_trackers();
    }
}

pub(crate) fn vm_member(name: &str, vpc: &str) -> CloudResource {
    CloudResource::new(
        CloudResourceType::VirtualMachine,
        CloudResourceId::new(name, vpc),
        "account-1",
        "aws",
    )
}

pub(crate) fn ingress_tcp(port: u16, cidr: &str) -> IngressRule {
    IngressRule {
        protocol: Some(6),
        from_port: Some(port),
        from_src_ip: vec![cidr.parse().unwrap()],
        from_security_groups: vec![],
    }
}

pub(crate) fn egress_tcp(port: u16, cidr: &str) -> EgressRule {
    EgressRule {
        protocol: Some(6),
        to_port: Some(port),
        to_dst_ip: vec![cidr.parse().unwrap()],
        to_security_groups: vec![],
    }
}

pub(crate) fn mk_policy(
    ns: &str,
    name: &str,
    applied_to: &[&str],
    ingress: Vec<IngressRule>,
    egress: Vec<EgressRule>,
) -> api::NetworkPolicy {
    api::NetworkPolicy {
        namespace: ns.to_string(),
        name: name.to_string(),
        applied_to_groups: applied_to.iter().map(|s| s.to_string()).collect(),
        ingress_rules: ingress,
        egress_rules: egress,
    }
}

pub(crate) fn mk_applied_to_group(name: &str, members: Vec<CloudResource>) -> api::AppliedToGroup {
    api::AppliedToGroup {
        name: name.to_string(),
        members,
    }
}

pub(crate) fn mk_address_group(name: &str, members: Vec<CloudResource>) -> api::AddressGroup {
    api::AddressGroup {
        name: name.to_string(),
        members,
    }
}

pub(crate) fn canonical_ingress(port: u16, cidr: &str) -> String {
    Rule::Ingress(ingress_tcp(port, cidr)).canonical()
}

pub(crate) fn canonical_egress(port: u16, cidr: &str) -> String {
    Rule::Egress(egress_tcp(port, cidr)).canonical()
}
