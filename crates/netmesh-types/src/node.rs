use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// A single cluster node as tracked by the inventory.
///
/// Once a record exists its fields are mutated in place; the only way
/// to remove one is to delete the whole record. `machine_id`,
/// `system_uuid` and `boot_id` are carried only so the self-identification
/// predicate can match on them; they are not part of the observable
/// state `update_node` compares to decide whether anything changed.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub name: String,
    pub underlay_address: Option<Ipv4Addr>,
    pub pod_cidr: Option<Ipv4Network>,
    pub network_available: bool,
    pub machine_id: Option<String>,
    pub system_uuid: Option<String>,
    pub boot_id: Option<String>,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            underlay_address: None,
            pod_cidr: None,
            network_available: true,
            machine_id: None,
            system_uuid: None,
            boot_id: None,
        }
    }
}

impl PartialEq for NodeRecord {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.underlay_address == other.underlay_address
            && self.pod_cidr == other.pod_cidr
            && self.network_available == other.network_available
    }
}

impl Eq for NodeRecord {}
