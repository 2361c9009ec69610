use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::net::error::{NetworkError, NetworkResult};
use crate::net::netlink::{Link, LinkAddr, LinkKind, NetlinkHandle, Route};

const DEFAULT_BRIDGE: &str = "docker";
const VLAN_PREFIX: &str = "vlan";
const BRIDGE_PREFIX: &str = "docker";

/// Compensating actions registered while SetupBridge mutates host state.
/// On any later failure they run in reverse registration order; rollback
/// steps must run only on the error path, which is why this is an explicit
/// stack and not a drop guard.
enum Compensate {
    RestoreAddr {
        link_index: u32,
        addr: Ipv4Addr,
        prefix_len: u8,
    },
    RestoreRoute {
        gateway: Option<Ipv4Addr>,
        link_index: u32,
    },
}

/// Provisions the default bridge and per-vlan bridges on the host.
///
/// The mutex serializes concurrent CNI invocations within this process;
/// there is no cross-process file lock yet, which is a known gap.
pub struct VlanDriver {
    nl: Arc<NetlinkHandle>,
    /// The uplink carrying the node address, e.g. eth1 or eth1.12.
    device: String,
    /// Parent ifindex for all vlan child devices, resolved by
    /// `setup_bridge`.
    vlan_parent_index: AtomicU32,
    lock: Mutex<()>,
}

impl VlanDriver {
    pub fn new(nl: Arc<NetlinkHandle>, device: String) -> Self {
        Self {
            nl,
            device,
            vlan_parent_index: AtomicU32::new(0),
            lock: Mutex::new(()),
        }
    }

    /// Move the uplink's addresses and default route onto the default
    /// bridge and enslave the uplink to it. Safe to repeat: once the
    /// uplink is enslaved and carries no address, the call accepts the
    /// existing state.
    pub async fn setup_bridge(&self) -> NetworkResult<()> {
        let uplink = self.nl.link_by_name(&self.device).await?;

        let parent = if uplink.kind == Some(LinkKind::Vlan) {
            uplink.parent_index
        } else {
            uplink.index
        };
        self.vlan_parent_index.store(parent, Ordering::Relaxed);

        let addrs: Vec<LinkAddr> = self
            .nl
            .list_v4_addrs(uplink.index)
            .await?
            .into_iter()
            .filter(|a| !a.addr.is_loopback())
            .collect();

        if addrs.is_empty() {
            // a previous run already migrated the address; accept only if
            // the uplink is enslaved to the default bridge
            let bridge = self.nl.link_by_name(DEFAULT_BRIDGE).await.map_err(|_| {
                NetworkError::NoAddress(format!("no usable address on device {}", self.device))
            })?;
            if bridge.index != uplink.master_index {
                return Err(NetworkError::NoAddress(format!(
                    "no usable address on device {}",
                    self.device
                )));
            }
            return Ok(());
        }

        let mac = if uplink.mac.is_empty() {
            None
        } else {
            Some(uplink.mac.as_slice())
        };
        let bridge = self.nl.create_bridge(DEFAULT_BRIDGE, mac).await?;
        self.nl.set_up(bridge.index).await?;

        let default_route = self.nl.default_route().await?;
        let route_via_uplink =
            default_route.filter(|r: &Route| r.link_index == uplink.index);

        let mut undo: Vec<Compensate> = Vec::new();
        if let Err(e) = self
            .migrate(&uplink, &bridge, addrs, route_via_uplink, &mut undo)
            .await
        {
            self.unwind(undo).await;
            return Err(e);
        }

        tracing::info!(
            "bridge {} took over device {} (vlan parent index {})",
            DEFAULT_BRIDGE,
            self.device,
            parent
        );
        Ok(())
    }

    async fn migrate(
        &self,
        uplink: &Link,
        bridge: &Link,
        addrs: Vec<LinkAddr>,
        route_via_uplink: Option<Route>,
        undo: &mut Vec<Compensate>,
    ) -> NetworkResult<()> {
        if let Some(route) = &route_via_uplink {
            self.nl.del_route(route.message.clone()).await?;
            undo.push(Compensate::RestoreRoute {
                gateway: route.gateway,
                link_index: uplink.index,
            });
        }

        for a in addrs {
            self.nl.del_addr(a.message.clone()).await?;
            undo.push(Compensate::RestoreAddr {
                link_index: uplink.index,
                addr: a.addr,
                prefix_len: a.prefix_len,
            });
            // re-adding by value drops the kernel's address label
            self.nl.add_addr(bridge.index, a.addr, a.prefix_len).await?;
        }

        self.nl.set_master(uplink.index, bridge.index).await?;

        if let Some(route) = &route_via_uplink {
            self.nl
                .add_default_route(route.gateway, bridge.index)
                .await?;
        }

        Ok(())
    }

    /// Best-effort unwind in reverse registration order. Failures are
    /// logged and never propagated; the original error wins.
    async fn unwind(&self, undo: Vec<Compensate>) {
        for action in undo.into_iter().rev() {
            match action {
                Compensate::RestoreAddr {
                    link_index,
                    addr,
                    prefix_len,
                } => {
                    if let Err(e) = self.nl.add_addr(link_index, addr, prefix_len).await {
                        tracing::warn!("failed to restore address {} on rollback: {}", addr, e);
                    }
                }
                Compensate::RestoreRoute {
                    gateway,
                    link_index,
                } => {
                    if let Err(e) = self.nl.add_default_route(gateway, link_index).await {
                        tracing::warn!("failed to restore default route on rollback: {}", e);
                    }
                }
            }
        }
    }

    /// Create the vlan child device and its bridge for `vlan_id`. Vlan 0
    /// is untagged traffic and uses the default bridge, so it is a no-op.
    /// Every step is get-or-create and the master attachment is
    /// conditional, so repeated calls converge on the same state.
    pub async fn create_vlan_device(&self, vlan_id: u16) -> NetworkResult<()> {
        if vlan_id == 0 {
            return Ok(());
        }

        let vlan_name = format!("{}{}", VLAN_PREFIX, vlan_id);
        let bridge_name = format!("{}{}", BRIDGE_PREFIX, vlan_id);

        let _guard = self.lock.lock().await;

        let parent = self.vlan_parent_index.load(Ordering::Relaxed);
        let vlan = self.nl.create_vlan(&vlan_name, parent, vlan_id).await?;
        let bridge = self.nl.create_bridge(&bridge_name, None).await?;

        if vlan.master_index != bridge.index {
            self.nl.set_master(vlan.index, bridge.index).await?;
        }
        self.nl.set_up(vlan.index).await?;
        self.nl.set_up(bridge.index).await?;

        tracing::debug!("vlan device {} ready on bridge {}", vlan_name, bridge_name);
        Ok(())
    }

    /// The bridge a pod with `vlan_id` attaches to.
    pub fn bridge_name_for_vlan(vlan_id: u16) -> String {
        if vlan_id == 0 {
            DEFAULT_BRIDGE.to_string()
        } else {
            format!("{}{}", BRIDGE_PREFIX, vlan_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vlan_zero_uses_default_bridge() {
        assert_eq!(VlanDriver::bridge_name_for_vlan(0), "docker");
    }

    #[test]
    fn vlan_bridge_names_are_deterministic() {
        assert_eq!(VlanDriver::bridge_name_for_vlan(100), "docker100");
        assert_eq!(VlanDriver::bridge_name_for_vlan(12), "docker12");
    }
}
