/// A network interface on a virtual machine; the ultimate attach point for
/// cloud security groups.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct NetworkInterface {
    pub name: String,
}

/// A virtual machine discovered in a managed VPC.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VirtualMachine {
    pub namespace: String,
    pub name: String,
    /// The provider-assigned identifier, e.g. an instance id.
    pub cloud_id: String,
    pub vpc: String,
    pub network_interfaces: Vec<NetworkInterface>,
}

/// Lookup into the per-account VM inventory cache.
///
/// The reconciliation engine resolves VM-typed security group members to
/// their network interfaces through this seam; the inventory itself is
/// maintained by the account pollers.
pub trait Inventory: Send + Sync {
    /// Returns the VMs known under a provider-assigned identifier. A VM
    /// imported into several namespaces yields one entry per namespace.
    fn vms_by_cloud_id(&self, cloud_id: &str) -> Vec<VirtualMachine>;
}
