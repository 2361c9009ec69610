use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cni::error::CniError;
use crate::cni::NetworkInfo;

pub const DEFAULT_STATE_DIR: &str = "/var/lib/cni/galaxy";

/// The net-config tree the runtime hands us on stdin. `network_type` maps
/// each delegate plugin type to its own nested JSON config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    #[serde(default)]
    pub name: String,

    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,

    #[serde(rename = "type", default)]
    pub plugin_type: String,

    #[serde(rename = "networkType", default)]
    pub network_type: BTreeMap<String, Value>,

    /// ipam service url; unused when the local pool is configured
    #[serde(default)]
    pub url: String,

    #[serde(rename = "network_uri", default)]
    pub network_uri: String,

    /// The uplink carrying the node address, e.g. eth1 or eth1.12.
    #[serde(default)]
    pub device: String,

    /// Path of the floating-ip pool database. Empty disables allocation.
    #[serde(default)]
    pub database: String,

    /// Subnets seeded into the pool on first use.
    #[serde(default)]
    pub subnets: Vec<String>,

    /// Release policy recorded with every binding.
    #[serde(default)]
    pub policy: u16,

    #[serde(rename = "vlanId", default)]
    pub vlan_id: u16,

    /// Explicit per-interface delegate order. When empty, one network info
    /// per configured plugin type is synthesized.
    #[serde(default)]
    pub networks: Vec<NetworkInfo>,

    #[serde(rename = "stateDir", default = "default_state_dir")]
    pub state_dir: String,
}

fn default_state_dir() -> String {
    DEFAULT_STATE_DIR.to_string()
}

impl NetConf {
    pub fn load(bytes: &[u8]) -> Result<Self, CniError> {
        serde_json::from_slice(bytes).map_err(|e| CniError::Config(e.to_string()))
    }

    /// The ordered network infos for this pod: the explicit list when the
    /// config carries one, otherwise one info per plugin type with the
    /// envelope's interface name.
    pub fn network_infos(&self, ifname: &str) -> Vec<NetworkInfo> {
        if !self.networks.is_empty() {
            return self.networks.clone();
        }

        self.network_type
            .keys()
            .map(|plugin_type| {
                let mut args = BTreeMap::new();
                args.insert("IfName".to_string(), ifname.to_string());
                let mut info = NetworkInfo::new();
                info.insert(plugin_type.clone(), args);
                info
            })
            .collect()
    }
}
