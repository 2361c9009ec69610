use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::cni::error::CniError;
use crate::cni::CmdArgs;

pub const COMMAND_ADD: &str = "ADD";
pub const COMMAND_DEL: &str = "DEL";

/// The result a delegate prints on a successful ADD (CNI v0.2.0 shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniResult {
    #[serde(rename = "cniVersion", default, skip_serializing_if = "String::is_empty")]
    pub cni_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip4: Option<IpConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpConfig {
    pub ip: Ipv4Network,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<CniRoute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniRoute {
    pub dst: Ipv4Network,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<Ipv4Addr>,
}

impl CniResult {
    /// Synthesize a result from an allocator-reserved address: the address
    /// itself, its gateway and a default route with no explicit gw.
    pub fn from_reserved(ip: Ipv4Network, gateway: Option<Ipv4Addr>) -> Self {
        let default_dst = Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0)
            .expect("0.0.0.0/0 is a valid network");
        Self {
            cni_version: String::new(),
            ip4: Some(IpConfig {
                ip,
                gateway,
                routes: vec![CniRoute {
                    dst: default_dst,
                    gw: None,
                }],
            }),
        }
    }
}

/// Resolve a delegate binary against the `CNI_PATH` search list.
pub fn find_in_path(plugin: &str, cni_path: &str) -> Result<PathBuf, CniError> {
    for dir in cni_path.split(':').filter(|d| !d.is_empty()) {
        let candidate = PathBuf::from(dir).join(plugin);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(CniError::PluginNotFound {
        plugin: plugin.to_string(),
        path: cni_path.to_string(),
    })
}

pub async fn delegate_add(
    plugin_type: &str,
    netconf: &Value,
    args: &CmdArgs,
    ifname: &str,
    call_args: &str,
) -> Result<CniResult, CniError> {
    let stdout = exec_plugin(COMMAND_ADD, plugin_type, netconf, args, ifname, call_args).await?;
    Ok(serde_json::from_slice(&stdout)?)
}

pub async fn delegate_del(
    plugin_type: &str,
    netconf: &Value,
    args: &CmdArgs,
    ifname: &str,
    call_args: &str,
) -> Result<(), CniError> {
    exec_plugin(COMMAND_DEL, plugin_type, netconf, args, ifname, call_args).await?;
    Ok(())
}

async fn exec_plugin(
    command: &str,
    plugin_type: &str,
    netconf: &Value,
    args: &CmdArgs,
    ifname: &str,
    call_args: &str,
) -> Result<Vec<u8>, CniError> {
    let netconf_bytes = serde_json::to_vec(netconf)?;
    let plugin_path = find_in_path(plugin_type, &args.path)?;

    tracing::info!(
        "delegate {} {} args {} conf {}",
        command,
        args.container_id,
        call_args,
        String::from_utf8_lossy(&netconf_bytes)
    );

    let mut child = tokio::process::Command::new(&plugin_path)
        .env("CNI_COMMAND", command)
        .env("CNI_CONTAINERID", &args.container_id)
        .env("CNI_NETNS", &args.netns)
        .env("CNI_IFNAME", ifname)
        .env("CNI_ARGS", call_args)
        .env("CNI_PATH", &args.path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        // a delegate may exit without draining stdin; its exit status is
        // what decides success
        if let Err(e) = stdin.write_all(&netconf_bytes).await {
            tracing::debug!("delegate {} did not read its config: {}", plugin_type, e);
        }
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = if stderr.is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            stderr
        };
        return Err(CniError::DelegateFailed {
            plugin: plugin_type.to_string(),
            stderr: detail,
        });
    }

    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_round_trips_v020_shape() {
        let json = r#"{"ip4":{"ip":"10.0.0.5/24","gateway":"10.0.0.1","routes":[{"dst":"0.0.0.0/0"}]}}"#;
        let result: CniResult = serde_json::from_str(json).unwrap();
        let ip4 = result.ip4.as_ref().unwrap();
        assert_eq!(ip4.ip.to_string(), "10.0.0.5/24");
        assert_eq!(ip4.gateway, Some("10.0.0.1".parse().unwrap()));
        assert!(ip4.routes[0].gw.is_none());

        let back = serde_json::to_string(&result).unwrap();
        assert!(back.contains(r#""ip":"10.0.0.5/24""#));
        assert!(back.contains(r#""dst":"0.0.0.0/0""#));
    }

    #[test]
    fn reserved_result_carries_default_route() {
        let result =
            CniResult::from_reserved("10.0.0.5/24".parse().unwrap(), Some("10.0.0.1".parse().unwrap()));
        let ip4 = result.ip4.unwrap();
        assert_eq!(ip4.routes.len(), 1);
        assert_eq!(ip4.routes[0].dst.to_string(), "0.0.0.0/0");
    }

    #[test]
    fn find_in_path_walks_the_list() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = dir.path().join("bridge");
        std::fs::write(&plugin, b"#!/bin/sh\n").unwrap();

        let search = format!("/nonexistent:{}", dir.path().display());
        assert_eq!(find_in_path("bridge", &search).unwrap(), plugin);
        assert!(matches!(
            find_in_path("missing", &search),
            Err(CniError::PluginNotFound { .. })
        ));
    }
}
