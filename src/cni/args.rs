use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cni::error::CniError;

// Keys the kubelet passes through CNI_ARGS.
pub const K8S_POD_NAME: &str = "K8S_POD_NAME";
pub const K8S_POD_NAMESPACE: &str = "K8S_POD_NAMESPACE";
pub const K8S_POD_INFRA_CONTAINER_ID: &str = "K8S_POD_INFRA_CONTAINER_ID";
pub const K8S_PORTS: &str = "K8S_PORTS";

/// Serialize an argument map back to the `K1=V1;K2=V2` wire form.
pub fn build_args(args: &BTreeMap<String, String>) -> String {
    let entries: Vec<String> = args.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    entries.join(";")
}

/// Parse a `K1=V1;K2=V2` argument string. Pairs split on the first `=`,
/// keys and values are trimmed, and malformed pairs are skipped.
pub fn parse_args(args: &str) -> Result<BTreeMap<String, String>, CniError> {
    if args.is_empty() {
        return Err(CniError::InvalidArgs(args.to_string()));
    }

    let mut kv = BTreeMap::new();
    for pair in args.split(';') {
        if let Some((k, v)) = pair.split_once('=') {
            let k = k.trim();
            if k.is_empty() {
                continue;
            }
            kv.insert(k.to_string(), v.trim().to_string());
        }
    }
    Ok(kv)
}

/// One host-port exposure from `K8S_PORTS`. `pod_ip` is filled in by the
/// delegation engine once the pod's address is known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Port {
    #[serde(rename = "HostPort", default)]
    pub host_port: u16,
    #[serde(rename = "ContainerPort", default)]
    pub container_port: u16,
    #[serde(rename = "Protocol", default)]
    pub protocol: String,
    /// `<name>_<namespace>` of the owning pod.
    #[serde(rename = "PodName", default)]
    pub pod_name: String,
    #[serde(rename = "PodIP", default)]
    pub pod_ip: String,
}

/// Decode the `K8S_PORTS` JSON array. An absent or empty value means no
/// ports.
pub fn parse_ports(raw: &str) -> Result<Vec<Port>, CniError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(raw)?)
}

/// The owner key a pod's addresses are bound under:
/// `<namespace>_<name>`, or the infra container id with early runtimes
/// that don't pass pod metadata.
pub fn pod_key(kv: &BTreeMap<String, String>) -> String {
    match (kv.get(K8S_POD_NAMESPACE), kv.get(K8S_POD_NAME)) {
        (Some(ns), Some(name)) if !ns.is_empty() && !name.is_empty() => {
            format!("{}_{}", ns, name)
        }
        _ => kv
            .get(K8S_POD_INFRA_CONTAINER_ID)
            .cloned()
            .unwrap_or_default(),
    }
}

/// Port records identify their pod the other way round.
pub fn pod_full_name(kv: &BTreeMap<String, String>) -> String {
    format!(
        "{}_{}",
        kv.get(K8S_POD_NAME).map(String::as_str).unwrap_or(""),
        kv.get(K8S_POD_NAMESPACE).map(String::as_str).unwrap_or("")
    )
}
