use crate::net::error::{NetworkError, NetworkResult};
use futures::TryStreamExt;
use netlink_packet_route::address::nlas::Nla as AddrNla;
use netlink_packet_route::link::nlas::{Info, InfoKind, Nla as LinkNla};
use netlink_packet_route::route::nlas::Nla as RouteNla;
use netlink_packet_route::{AddressMessage, RouteMessage};
use std::net::Ipv4Addr;

const AF_INET: u8 = 2;

/// Summary of one kernel link, extracted from the netlink attribute list.
#[derive(Debug, Clone)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub kind: Option<LinkKind>,
    /// IFLA_LINK: the parent device for vlan child links, 0 otherwise.
    pub parent_index: u32,
    /// Enslaving bridge, 0 when the link has no master.
    pub master_index: u32,
    pub mac: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Vlan,
    Other,
}

/// One IPv4 address on a link. The raw kernel message is kept so a delete
/// replays exactly what the kernel reported.
#[derive(Debug, Clone)]
pub struct LinkAddr {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
    pub message: AddressMessage,
}

/// The system default route as the kernel reports it.
#[derive(Debug, Clone)]
pub struct Route {
    pub gateway: Option<Ipv4Addr>,
    pub link_index: u32,
    pub message: RouteMessage,
}

/// Persistent netlink handle wrapping rtnetlink for all link/address/route
/// operations. One handle per process, reused across the whole request.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    // Keep the connection task alive
    _conn_task: tokio::task::JoinHandle<()>,
}

impl NetlinkHandle {
    pub fn new() -> NetworkResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    /// Look up a link by name. Returns NotFound if the link doesn't exist.
    pub async fn link_by_name(&self, name: &str) -> NetworkResult<Link> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(summarize_link(msg)),
            Ok(None) => Err(NetworkError::NotFound(format!("link {}", name))),
            Err(e) => {
                // rtnetlink reports "not found" as an error on some kernels
                if e.to_string().contains("No such device") {
                    Err(NetworkError::NotFound(format!("link {}", name)))
                } else {
                    Err(NetworkError::Netlink(e))
                }
            }
        }
    }

    /// Create a bridge, optionally seeding its MAC from the uplink.
    /// Idempotent - an existing bridge of that name is returned as is.
    pub async fn create_bridge(&self, name: &str, mac: Option<&[u8]>) -> NetworkResult<Link> {
        if let Ok(link) = self.link_by_name(name).await {
            return Ok(link);
        }

        self.handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await
            .or_else(tolerate_exists)?;

        let link = self.link_by_name(name).await?;
        tracing::debug!("created bridge {} (index {})", link.name, link.index);
        if let Some(mac) = mac {
            self.handle
                .link()
                .set(link.index)
                .address(mac.to_vec())
                .execute()
                .await
                .map_err(NetworkError::Netlink)?;
        }
        Ok(link)
    }

    /// Create a vlan child device rooted at `parent_index`. Idempotent.
    pub async fn create_vlan(
        &self,
        name: &str,
        parent_index: u32,
        vlan_id: u16,
    ) -> NetworkResult<Link> {
        if let Ok(link) = self.link_by_name(name).await {
            return Ok(link);
        }

        self.handle
            .link()
            .add()
            .vlan(name.to_string(), parent_index, vlan_id)
            .execute()
            .await
            .or_else(tolerate_exists)?;

        self.link_by_name(name).await
    }

    pub async fn set_up(&self, index: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Attach a link to a bridge
    pub async fn set_master(&self, index: u32, master_index: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .master(master_index)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// IPv4 addresses currently on a link, always read fresh from the
    /// kernel.
    pub async fn list_v4_addrs(&self, link_index: u32) -> NetworkResult<Vec<LinkAddr>> {
        let mut messages = self
            .handle
            .address()
            .get()
            .set_link_index_filter(link_index)
            .execute();

        let mut addrs = Vec::new();
        while let Some(msg) = messages.try_next().await.map_err(NetworkError::Netlink)? {
            if msg.header.family != AF_INET {
                continue;
            }
            let mut address = None;
            for nla in &msg.nlas {
                match nla {
                    AddrNla::Address(bytes) | AddrNla::Local(bytes) if bytes.len() == 4 => {
                        address = Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]));
                    }
                    _ => {}
                }
            }
            if let Some(addr) = address {
                addrs.push(LinkAddr {
                    addr,
                    prefix_len: msg.header.prefix_len,
                    message: msg,
                });
            }
        }

        Ok(addrs)
    }

    /// Add an IPv4 address. An address the link already carries is success.
    pub async fn add_addr(
        &self,
        link_index: u32,
        addr: Ipv4Addr,
        prefix_len: u8,
    ) -> NetworkResult<()> {
        let result = self
            .handle
            .address()
            .add(link_index, std::net::IpAddr::V4(addr), prefix_len)
            .execute()
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    pub async fn del_addr(&self, message: AddressMessage) -> NetworkResult<()> {
        self.handle
            .address()
            .del(message)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// The system default route, if one exists.
    pub async fn default_route(&self) -> NetworkResult<Option<Route>> {
        let mut routes = self
            .handle
            .route()
            .get(rtnetlink::IpVersion::V4)
            .execute();

        while let Some(msg) = routes.try_next().await.map_err(NetworkError::Netlink)? {
            if msg.header.destination_prefix_length != 0 {
                continue;
            }
            let mut gateway = None;
            let mut link_index = 0;
            for nla in &msg.nlas {
                match nla {
                    RouteNla::Gateway(bytes) if bytes.len() == 4 => {
                        gateway = Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]));
                    }
                    RouteNla::Oif(idx) => link_index = *idx,
                    _ => {}
                }
            }
            return Ok(Some(Route {
                gateway,
                link_index,
                message: msg,
            }));
        }

        Ok(None)
    }

    /// Delete a route by replaying the kernel's own message. A route that
    /// is already gone is success.
    pub async fn del_route(&self, message: RouteMessage) -> NetworkResult<()> {
        match self.handle.route().del(message).execute().await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such process") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    pub async fn add_default_route(
        &self,
        gateway: Option<Ipv4Addr>,
        link_index: u32,
    ) -> NetworkResult<()> {
        let mut request = self.handle.route().add().v4().output_interface(link_index);
        if let Some(gw) = gateway {
            request = request.gateway(gw);
        }
        match request.execute().await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }
}

fn tolerate_exists(e: rtnetlink::Error) -> Result<(), NetworkError> {
    // creation racing another process is fine, the get-or-create caller
    // re-reads the link afterwards
    if e.to_string().contains("File exists") {
        Ok(())
    } else {
        Err(NetworkError::Netlink(e))
    }
}

fn summarize_link(msg: netlink_packet_route::LinkMessage) -> Link {
    let mut link = Link {
        index: msg.header.index,
        name: String::new(),
        kind: None,
        parent_index: 0,
        master_index: 0,
        mac: Vec::new(),
    };

    for nla in msg.nlas {
        match nla {
            LinkNla::IfName(name) => link.name = name,
            LinkNla::Address(mac) => link.mac = mac,
            LinkNla::Master(idx) => link.master_index = idx,
            LinkNla::Link(idx) => link.parent_index = idx,
            LinkNla::Info(infos) => {
                for info in infos {
                    if let Info::Kind(kind) = info {
                        link.kind = Some(match kind {
                            InfoKind::Bridge => LinkKind::Bridge,
                            InfoKind::Vlan => LinkKind::Vlan,
                            _ => LinkKind::Other,
                        });
                    }
                }
            }
            _ => {}
        }
    }

    link
}
