pub mod derive;
pub mod gre;
pub mod ipsec;
pub mod layer2;
pub mod vxlan;

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use netmesh_inventory::Inventory;

/// A routing backend. `ensure` is called once per reconcile tick; it
/// must be idempotent and tolerate the kernel being in any prior
/// state, including one left behind by a previous process.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn ensure(&self, inventory: &Inventory) -> Result<()>;
}

/// Tracks the inventory version a provider last successfully applied,
/// so `ensure` can skip straight to `Ok(())` when nothing has changed
/// since (§4.3: "the one-second tick is essentially free when nothing
/// has changed").
pub(crate) struct VersionGate(Mutex<Option<u64>>);

impl VersionGate {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(None))
    }

    /// True when `inventory`'s current version matches the version
    /// this gate last recorded.
    pub(crate) fn matches(&self, inventory: &Inventory) -> bool {
        match *self.0.lock().unwrap() {
            Some(v) => inventory.is_version(v),
            None => false,
        }
    }

    pub(crate) fn record(&self, version: u64) {
        *self.0.lock().unwrap() = Some(version);
    }
}
