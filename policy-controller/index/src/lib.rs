//! Cloud NetworkPolicy reconciliation engine.
//!
//! The engine reconciles declared network-policy intent against live
//! security-group state in public-cloud accounts. It watches the following
//! declarative inputs:
//!
//! - Each `NetworkPolicy` names appliedTo groups and carries ingress/egress
//!   rules whose peers are CIDRs or address groups.
//! - Each `AddressGroup` enumerates the cloud resources policy rules may
//!   reference as peers.
//! - Each `AppliedToGroup` enumerates the cloud resources a policy's rules
//!   apply to.
//! - Virtual-machine inventory events re-resolve group membership to
//!   network interfaces.
//!
//! ```ignore
//! [NetworkPolicy] -> [ addressSecurityGroup ]
//!                 |-> [ appliedToSecurityGroup ] <- [ AppliedToGroup ]
//!                         |-> [ CloudRule ]
//!                         `-> [ tracker ] -> NetworkPolicyStatus
//! ```
//!
//! All state is owned by a single reconciler task; the status surface is
//! the only shared map, published through a reader/writer pair. A periodic
//! blocking sync reads the cloud's view of every managed group and repairs
//! drift in both directions.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
mod network_policy;
mod reconciler;
mod security_group;
pub mod status;
mod store;
mod sync;
#[cfg(test)]
mod tests;
mod tracker;

pub use self::{
    reconciler::{InputWatches, Reconciler, SyncConfig},
    status::{NetworkPolicyStatus, Reader, Writer},
    tracker::{CloudResourceNpTracker, StatusSetter, TrackerDeps},
};

/// Policies by the appliedTo-group names they target.
pub(crate) const IDX_POLICY_BY_APPLIED_TO: &str = "policy-by-applied-to-group";
/// Policies by the address-group ids their rules reference.
pub(crate) const IDX_POLICY_BY_ADDR_GRP: &str = "policy-by-address-group";
/// Security groups by their group name (one entry per VPC).
pub(crate) const IDX_SG_BY_GROUP: &str = "sg-by-group-name";
/// Trackers by the appliedTo-SG ids they currently or previously carry.
pub(crate) const IDX_TRACKER_BY_APPLIED_TO: &str = "tracker-by-applied-to-sg";
/// Cloud rules by the appliedTo-SG id that owns them.
pub(crate) const IDX_RULE_BY_APPLIED_TO: &str = "rule-by-applied-to-sg";
