// Host-network provisioning: netlink primitives, bridge/vlan setup with
// rollback, and DNAT port mappings. Host state is shared across every pod
// on the node and is always read fresh from the kernel, never cached.

pub mod error;
pub mod netlink;
pub mod portmap;
pub mod vlan;

pub use error::{NetworkError, NetworkResult};
pub use netlink::NetlinkHandle;
pub use vlan::VlanDriver;
