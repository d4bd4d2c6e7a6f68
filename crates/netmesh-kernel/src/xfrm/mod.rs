//! Hand-rolled NETLINK_XFRM transport.
//!
//! No crate in the dependency graph speaks the XFRM family, unlike
//! routes/links/neighbours which `rtnetlink` covers. This module opens
//! a raw `netlink-sys` socket against `NETLINK_XFRM` and encodes the
//! fixed-size `xfrm_usersa_info` / `xfrm_userpolicy_info` structures
//! plus their TLV attributes by hand, the same layering
//! `netlink-packet-route` uses for `NETLINK_ROUTE`.

mod consts;
mod policy;
mod socket;
mod state;

pub use policy::{diff_policies, XfrmDirection, XfrmPolicy, XfrmPolicyTable, XfrmSelector, XfrmTemplate};
pub use socket::XfrmSocket;
pub use state::{diff_states, XfrmAlgo, XfrmEncap, XfrmMode, XfrmProto, XfrmState, XfrmStateTable};
