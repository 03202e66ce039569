//! Derived cloud names for managed security groups.
//!
//! A managed group's external name carries the controller's configured
//! prefix; recognizing that prefix in a cloud listing is how drift
//! detection tells managed groups from foreign ones.

/// Default value for the configurable cloud resource prefix.
pub const DEFAULT_RESOURCE_PREFIX: &str = "nephe";

const ADDRESS_GROUP_INFIX: &str = "ag";
const APPLIED_TO_INFIX: &str = "at";

/// The two kinds of groups this controller creates in the cloud.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ManagedGroupKind {
    AddressGroup,
    AppliedToGroup,
}

/// Derives the external cloud name for a managed security group.
pub fn cloud_name(prefix: &str, name: &str, membership_only: bool) -> String {
    let infix = if membership_only {
        ADDRESS_GROUP_INFIX
    } else {
        APPLIED_TO_INFIX
    };
    format!("{prefix}-{infix}-{name}").to_lowercase()
}

/// Recognizes a controller-created group from its external cloud name,
/// returning the kind and the original group name.
pub fn parse_managed_name(prefix: &str, cloud_sg_name: &str) -> Option<(ManagedGroupKind, String)> {
    let ag = format!("{prefix}-{ADDRESS_GROUP_INFIX}-").to_lowercase();
    let at = format!("{prefix}-{APPLIED_TO_INFIX}-").to_lowercase();
    if let Some(suffix) = cloud_sg_name.strip_prefix(&ag) {
        if !suffix.is_empty() {
            return Some((ManagedGroupKind::AddressGroup, suffix.to_lowercase()));
        }
    }
    if let Some(suffix) = cloud_sg_name.strip_prefix(&at) {
        if !suffix.is_empty() {
            return Some((ManagedGroupKind::AppliedToGroup, suffix.to_lowercase()));
        }
    }
    None
}
