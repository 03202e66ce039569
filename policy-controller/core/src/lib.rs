//! Core types for the cloud-network policy controller.
//!
//! This crate defines the value types shared between the reconciliation
//! engine and its collaborators: the cloud resource model, rule and
//! rule-hash types, the adapter contract implemented by cloud-provider
//! plugins, and the inventory lookup seam used to resolve virtual machines
//! to their network interfaces.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod description;
mod error;
mod event;
mod inventory;
mod name;
mod rule;

pub use self::{
    description::RuleDescription,
    error::CloudError,
    event::Event,
    inventory::{Inventory, NetworkInterface, VirtualMachine},
    name::{cloud_name, parse_managed_name, ManagedGroupKind, DEFAULT_RESOURCE_PREFIX},
    rule::{CloudRule, EgressRule, IngressRule, Rule},
};
pub use ipnet::IpNet;

use std::fmt;
use tokio::sync::mpsc;

/// The kinds of cloud resources that can be members of a security group.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CloudResourceType {
    VirtualMachine,
    NetworkInterface,
}

impl fmt::Display for CloudResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VirtualMachine => "VirtualMachine".fmt(f),
            Self::NetworkInterface => "NetworkInterface".fmt(f),
        }
    }
}

/// Identifies a cloud resource within a VPC.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CloudResourceId {
    pub name: String,
    pub vpc: String,
}

impl CloudResourceId {
    pub fn new(name: impl ToString, vpc: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            vpc: vpc.to_string(),
        }
    }
}

impl fmt::Display for CloudResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.vpc)
    }
}

/// A cloud resource, qualified by the account and provider it was
/// discovered through.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CloudResource {
    pub resource_type: CloudResourceType,
    pub id: CloudResourceId,
    pub account_id: String,
    pub provider: String,
}

impl CloudResource {
    pub fn new(
        resource_type: CloudResourceType,
        id: CloudResourceId,
        account_id: impl ToString,
        provider: impl ToString,
    ) -> Self {
        Self {
            resource_type,
            id,
            account_id: account_id.to_string(),
            provider: provider.to_string(),
        }
    }
}

impl Default for CloudResource {
    fn default() -> Self {
        Self {
            resource_type: CloudResourceType::VirtualMachine,
            id: CloudResourceId::default(),
            account_id: String::new(),
            provider: String::new(),
        }
    }
}

impl fmt::Display for CloudResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// A namespace-qualified object name.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A network policy produced by the upstream policy authoring layer.
///
/// Rules reference address groups by name; the groups themselves arrive as
/// separate [`AddressGroup`] and [`AppliedToGroup`] events.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetworkPolicy {
    pub namespace: String,
    pub name: String,
    pub applied_to_groups: Vec<String>,
    pub ingress_rules: Vec<IngressRule>,
    pub egress_rules: Vec<EgressRule>,
}

impl NetworkPolicy {
    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(&self.namespace, &self.name)
    }
}

/// A named set of cloud resources referenced by policy rules as peers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AddressGroup {
    pub name: String,
    pub members: Vec<CloudResource>,
}

/// A named set of cloud resources that a policy's rules apply to.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppliedToGroup {
    pub name: String,
    pub members: Vec<CloudResource>,
}

/// One managed security group as observed in the cloud, produced by the
/// adapter during a synchronization pass.
#[derive(Clone, Debug, Default)]
pub struct SynchronizationContent {
    pub resource: CloudResource,
    pub membership_only: bool,
    pub members: Vec<CloudResource>,
    /// Observed members that also carry security groups not managed by this
    /// controller.
    pub members_with_other_sg_attached: Vec<CloudResource>,
    pub ingress_rules: Vec<IngressRule>,
    pub egress_rules: Vec<EgressRule>,
}

/// The contract implemented by cloud-provider security plugins.
///
/// Implementations are not reentrant per account; callers serialize calls
/// for a given account. A delete of a group that does not exist must be
/// reported as [`CloudError::NotFound`] so callers can treat it as success.
#[async_trait::async_trait]
pub trait CloudSecurityInterface: Send + Sync {
    /// Creates a security group in the cloud and returns its cloud identifier.
    async fn create_security_group(
        &self,
        sg: &CloudResource,
        membership_only: bool,
    ) -> Result<String, CloudError>;

    /// Authorizes `add` and revokes `rm` on an appliedTo group. The lists are
    /// disjoint; the adapter is free to batch within a call.
    async fn update_security_group_rules(
        &self,
        applied_to: &CloudResource,
        add: &[CloudRule],
        rm: &[CloudRule],
    ) -> Result<(), CloudError>;

    /// Drives the group's attached members to exactly `members`. Detaching
    /// the last managed group from an interface reattaches the VPC default
    /// group so the interface is never left bare.
    async fn update_security_group_members(
        &self,
        sg: &CloudResource,
        members: &[CloudResource],
        membership_only: bool,
    ) -> Result<(), CloudError>;

    /// Deletes a managed security group, detaching any remaining members.
    async fn delete_security_group(
        &self,
        sg: &CloudResource,
        membership_only: bool,
    ) -> Result<(), CloudError>;

    /// Returns a channel carrying one item per managed group observed in the
    /// cloud. The channel closes when the snapshot is complete.
    async fn enforced_security(
        &self,
    ) -> Result<mpsc::Receiver<SynchronizationContent>, CloudError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_display_round_trip_keys() {
        let rsc = CloudResource::new(
            CloudResourceType::NetworkInterface,
            CloudResourceId::new("eni-1", "vpc-1"),
            "acct",
            "aws",
        );
        assert_eq!(rsc.id.to_string(), "eni-1/vpc-1");
        assert_eq!(rsc.to_string(), "NetworkInterface/eni-1/vpc-1");
    }

    #[test]
    fn namespaced_name_display() {
        assert_eq!(NamespacedName::new("ns1", "p1").to_string(), "ns1/p1");
    }
}
