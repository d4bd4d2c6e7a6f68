mod client;
mod inventory;
mod selfid;
mod watcher;

pub use client::{K8sNodeSource, NodeEvent, NodeSource, PatchError, RawNode};
pub use inventory::{Inventory, Snapshot};
pub use selfid::resolve_self_predicate;
pub use watcher::watch;
