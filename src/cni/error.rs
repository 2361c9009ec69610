use serde::Serialize;
use thiserror::Error;

use crate::ipam::IpamError;
use crate::net::NetworkError;

#[derive(Debug, Error)]
pub enum CniError {
    #[error("invalid args {0}")]
    InvalidArgs(String),

    #[error("failed to load netconf: {0}")]
    Config(String),

    #[error("network {0} not configured")]
    UnknownNetwork(String),

    #[error("no network configured")]
    NoNetwork,

    #[error("CNI plugin reported no IPv4 address")]
    MissingIpv4,

    #[error("plugin {plugin} not found in CNI_PATH {path}")]
    PluginNotFound { plugin: String, path: String },

    #[error("delegate {plugin} failed: {stderr}")]
    DelegateFailed { plugin: String, stderr: String },

    /// Joined error strings from a best-effort DEL walk.
    #[error("{0}")]
    DelegateDel(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Ipam(#[from] IpamError),

    #[error(transparent)]
    HostNetwork(#[from] NetworkError),
}

/// The error JSON the CNI runtime expects on a non-zero exit.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    pub details: String,
}

impl CniError {
    /// Map onto the CNI well-known error codes; everything without a
    /// reserved code lands in the 100+ plugin-specific range.
    pub fn into_response(self, cni_version: &str) -> ErrorResponse {
        let (code, msg) = match &self {
            CniError::InvalidArgs(_) => (4, "Invalid Required Environment Variables"),
            CniError::Io(_) => (5, "I/O Error"),
            CniError::Json(_) => (6, "JSON Error"),
            CniError::Config(_) | CniError::UnknownNetwork(_) | CniError::NoNetwork => {
                (7, "Invalid Network Config")
            }
            CniError::MissingIpv4 => (7, "Invalid Network Config"),
            CniError::PluginNotFound { .. } => (100, "Plugin Not Found"),
            CniError::DelegateFailed { .. } | CniError::DelegateDel(_) => (101, "Delegate Failed"),
            CniError::Ipam(_) => (102, "Ipam Error"),
            CniError::HostNetwork(_) => (103, "Host Network Error"),
        };
        ErrorResponse {
            cni_version: cni_version.to_string(),
            code,
            msg: msg.to_string(),
            details: self.to_string(),
        }
    }
}
