// Multi-CNI delegation: compose a pod's network setup by invoking
// downstream CNI plugins in order, all-or-nothing. A failure at step k
// rolls back steps 0..k-1 in reverse; DEL is best-effort and collects
// errors instead of short-circuiting.

pub mod args;
pub mod config;
pub mod error;
pub mod invoke;
pub mod state;

use std::collections::BTreeMap;
use std::path::Path;

use ipnetwork::Ipv4Network;

pub use config::NetConf;
pub use error::CniError;
pub use invoke::CniResult;

use crate::ipam::{open_pool, FloatingIpAllocator, PoolSchema};
use crate::net::{portmap, NetlinkHandle, VlanDriver};

/// Per-interface delegate arguments: plugin type to its extra `K=V` args,
/// including the target `IfName`.
pub type NetworkInfo = BTreeMap<String, BTreeMap<String, String>>;

/// The CNI envelope, minus the stdin config.
#[derive(Debug, Clone)]
pub struct CmdArgs {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: String,
    pub path: String,
}

pub struct DelegationEngine<'a> {
    conf: &'a NetConf,
}

impl<'a> DelegationEngine<'a> {
    pub fn new(conf: &'a NetConf) -> Self {
        Self { conf }
    }

    /// Invoke every delegate in network-info order. The returned result is
    /// the last delegate's. On any failure every delegate invocation that
    /// already succeeded is deleted again, strictly in reverse, and the
    /// original error surfaces; rollback errors are only logged. An info
    /// may hold several plugin types for one interface, so the rollback
    /// unit is the single invocation, not the info index.
    pub async fn cmd_add(
        &self,
        cmd: &CmdArgs,
        infos: &[NetworkInfo],
    ) -> Result<CniResult, CniError> {
        if infos.is_empty() {
            return Err(CniError::NoNetwork);
        }

        let mut result = None;
        let mut established: Vec<(&str, &BTreeMap<String, String>)> = Vec::new();
        for info in infos {
            for (plugin_type, extra) in info {
                match self.add_one(cmd, plugin_type, extra).await {
                    Ok(r) => {
                        result = Some(r);
                        established.push((plugin_type, extra));
                    }
                    Err(e) => {
                        tracing::error!(
                            "failed to add network {} for {}: {}, rolling back",
                            plugin_type,
                            cmd.container_id,
                            e
                        );
                        self.rollback(cmd, &established).await;
                        return Err(e);
                    }
                }
            }
        }

        result.ok_or(CniError::NoNetwork)
    }

    /// Delete the already-established delegates in reverse invocation
    /// order. Failures only get a log line; the add error wins.
    async fn rollback(&self, cmd: &CmdArgs, established: &[(&str, &BTreeMap<String, String>)]) {
        for (plugin_type, extra) in established.iter().rev() {
            let Some(conf) = self.conf.network_type.get(*plugin_type) else {
                continue;
            };
            let call_args = append_args(&cmd.args, extra);
            let ifname = extra
                .get("IfName")
                .map(String::as_str)
                .unwrap_or(&cmd.ifname);
            if let Err(e) =
                invoke::delegate_del(plugin_type, conf, cmd, ifname, &call_args).await
            {
                tracing::warn!("rollback delete of {} failed: {}", plugin_type, e);
            }
        }
    }

    async fn add_one(
        &self,
        cmd: &CmdArgs,
        plugin_type: &str,
        extra: &BTreeMap<String, String>,
    ) -> Result<CniResult, CniError> {
        let conf = self
            .conf
            .network_type
            .get(plugin_type)
            .ok_or_else(|| CniError::UnknownNetwork(plugin_type.to_string()))?;
        let call_args = append_args(&cmd.args, extra);
        let ifname = extra
            .get("IfName")
            .map(String::as_str)
            .unwrap_or(&cmd.ifname);
        invoke::delegate_add(plugin_type, conf, cmd, ifname, &call_args).await
    }

    /// Delete delegates for indices `last_idx..=0` in reverse. Every
    /// delegate is attempted; failures are joined with " / ".
    pub async fn cmd_del(
        &self,
        cmd: &CmdArgs,
        infos: &[NetworkInfo],
        last_idx: usize,
    ) -> Result<(), CniError> {
        if infos.is_empty() {
            return Ok(());
        }
        let mut error_set = Vec::new();

        let last = last_idx.min(infos.len() - 1);
        for idx in (0..=last).rev() {
            for (plugin_type, extra) in &infos[idx] {
                let Some(conf) = self.conf.network_type.get(plugin_type) else {
                    error_set.push(format!("network {} not configured", plugin_type));
                    continue;
                };
                let call_args = append_args(&cmd.args, extra);
                let ifname = extra
                    .get("IfName")
                    .map(String::as_str)
                    .unwrap_or(&cmd.ifname);
                if let Err(e) =
                    invoke::delegate_del(plugin_type, conf, cmd, ifname, &call_args).await
                {
                    tracing::error!("failed to delete network {}: {}", plugin_type, e);
                    error_set.push(e.to_string());
                }
            }
        }

        if !error_set.is_empty() {
            return Err(CniError::DelegateDel(error_set.join(" / ")));
        }
        Ok(())
    }
}

fn append_args(base: &str, extra: &BTreeMap<String, String>) -> String {
    if extra.is_empty() {
        base.to_string()
    } else {
        format!("{};{}", base, args::build_args(extra))
    }
}

/// The full ADD flow: reserve a floating ip for the pod, make sure the
/// bridge and vlan devices exist, run the delegates and persist the
/// per-container state.
pub async fn add(cmd: &CmdArgs, stdin: &[u8]) -> Result<CniResult, CniError> {
    let conf = NetConf::load(stdin)?;
    let kv = args::parse_args(&cmd.args)?;
    let pod_key = args::pod_key(&kv);

    let mut allocator = None;
    let mut reserved: Option<(Ipv4Network, String)> = None;
    if !conf.database.is_empty() {
        let pool = open_pool(&conf.database).await?;
        PoolSchema::new(pool.clone()).initialize().await?;
        let fipa = FloatingIpAllocator::new(pool);
        for subnet in &conf.subnets {
            fipa.seed_subnet(subnet).await?;
        }

        let attr = pod_attr(&kv);
        let (ip, subnet) = fipa.allocate(&pod_key, None, conf.policy, &attr).await?;
        let prefix = subnet
            .parse::<Ipv4Network>()
            .map(|n| n.prefix())
            .unwrap_or(32);
        reserved = Some((
            Ipv4Network::new(ip, prefix).map_err(crate::ipam::IpamError::from)?,
            subnet,
        ));
        allocator = Some(fipa);
    }

    if !conf.device.is_empty() {
        let nl = std::sync::Arc::new(NetlinkHandle::new()?);
        let driver = VlanDriver::new(nl, conf.device.clone());
        driver.setup_bridge().await?;
        driver.create_vlan_device(conf.vlan_id).await?;
    }

    // hand the reserved address to the delegates through the args string
    let mut cmd = cmd.clone();
    if let Some((cidr, _)) = &reserved {
        cmd.args = format!("{};IP={}", cmd.args, cidr);
    }

    let infos = conf.network_infos(&cmd.ifname);
    let engine = DelegationEngine::new(&conf);
    let result = match engine.cmd_add(&cmd, &infos).await {
        Ok(result) => result,
        Err(e) => {
            // the binding from this call must not outlive the failed add
            if let (Some(fipa), Some((cidr, _))) = (&allocator, &reserved) {
                if let Err(release_err) = fipa.release(&pod_key, cidr.ip()).await {
                    tracing::warn!(
                        "failed to release {} after add failure: {}",
                        cidr.ip(),
                        release_err
                    );
                }
            }
            return Err(e);
        }
    };

    // an IPAM-less delegate reports no address of its own; the reserved
    // floating ip is the pod's address then
    let result = if result.ip4.is_some() {
        result
    } else if let Some((cidr, _)) = &reserved {
        CniResult::from_reserved(*cidr, None)
    } else {
        return Err(CniError::MissingIpv4);
    };

    let pod_ip = result
        .ip4
        .as_ref()
        .map(|ip4| ip4.ip.ip().to_string())
        .ok_or(CniError::MissingIpv4)?;

    let mut ports = args::parse_ports(
        kv.get(args::K8S_PORTS).map(String::as_str).unwrap_or(""),
    )?;
    let full_name = args::pod_full_name(&kv);
    for port in &mut ports {
        if port.pod_name == full_name {
            port.pod_ip = pod_ip.clone();
        }
    }

    let state_dir = Path::new(&conf.state_dir);
    state::save_ports(state_dir, &cmd.container_id, &ports)?;
    state::save_network_infos(state_dir, &cmd.container_id, &infos)?;

    if ports.iter().any(|p| p.host_port != 0) {
        let bridge = VlanDriver::bridge_name_for_vlan(conf.vlan_id);
        portmap::setup_port_mapping(&bridge, &ports).await?;
    }

    Ok(result)
}

/// The full DEL flow. An empty netns means the runtime is deleting a pod
/// it already deleted; answer success without touching anything.
pub async fn del(cmd: &CmdArgs, stdin: &[u8]) -> Result<(), CniError> {
    if cmd.netns.is_empty() {
        return Ok(());
    }

    let conf = NetConf::load(stdin)?;
    let kv = args::parse_args(&cmd.args)?;
    let pod_key = args::pod_key(&kv);
    let state_dir = Path::new(&conf.state_dir);

    let mut error_set = Vec::new();

    // prefer the delegate order recorded at add time; fall back to the
    // config when the state file is gone
    let mut infos = state::consume_network_infos(state_dir, &cmd.container_id)?;
    if infos.is_empty() {
        infos = conf.network_infos(&cmd.ifname);
    }

    if !infos.is_empty() {
        let engine = DelegationEngine::new(&conf);
        if let Err(e) = engine.cmd_del(cmd, &infos, infos.len() - 1).await {
            error_set.push(e.to_string());
        }
    }

    let ports = state::consume_ports(state_dir, &cmd.container_id)?;
    if ports.iter().any(|p| p.host_port != 0) {
        let bridge = VlanDriver::bridge_name_for_vlan(conf.vlan_id);
        if let Err(e) = portmap::clean_port_mapping(&bridge, &ports).await {
            error_set.push(e.to_string());
        }
    }

    if !conf.database.is_empty() {
        match open_pool(&conf.database).await {
            Ok(pool) => {
                let fipa = FloatingIpAllocator::new(pool);
                match fipa.release_all(&pod_key).await {
                    Ok(released) => {
                        for ip in released {
                            tracing::info!("released {} for {}", ip, pod_key);
                        }
                    }
                    Err(e) => error_set.push(e.to_string()),
                }
            }
            Err(e) => error_set.push(e.to_string()),
        }
    }

    if !error_set.is_empty() {
        return Err(CniError::DelegateDel(error_set.join(" / ")));
    }
    Ok(())
}

fn pod_attr(kv: &BTreeMap<String, String>) -> String {
    serde_json::json!({
        "name": kv.get(args::K8S_POD_NAME).map(String::as_str).unwrap_or(""),
        "namespace": kv.get(args::K8S_POD_NAMESPACE).map(String::as_str).unwrap_or(""),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    enum Behavior {
        Ok,
        FailAdd,
        FailDel,
    }

    fn write_plugin(dir: &Path, name: &str, log: &Path, behavior: Behavior) {
        let body = match behavior {
            Behavior::Ok => {
                "if [ \"$CNI_COMMAND\" = \"ADD\" ]; then\n  echo '{\"ip4\":{\"ip\":\"10.0.0.5/24\",\"gateway\":\"10.0.0.1\"}}'\nfi\nexit 0"
            }
            Behavior::FailAdd => {
                "if [ \"$CNI_COMMAND\" = \"ADD\" ]; then\n  echo 'boom' >&2\n  exit 1\nfi\nexit 0"
            }
            Behavior::FailDel => {
                "if [ \"$CNI_COMMAND\" = \"DEL\" ]; then\n  echo 'stuck' >&2\n  exit 1\nfi\nexit 0"
            }
        };
        let script = format!(
            "#!/bin/sh\necho \"$CNI_COMMAND {}\" >> \"{}\"\n{}\n",
            name,
            log.display(),
            body
        );
        let path = dir.join(name);
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn read_log(log: &Path) -> Vec<String> {
        match fs::read_to_string(log) {
            Ok(s) => s.lines().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn info_for(plugin_type: &str) -> NetworkInfo {
        let mut extra = BTreeMap::new();
        extra.insert("IfName".to_string(), "eth0".to_string());
        let mut info = NetworkInfo::new();
        info.insert(plugin_type.to_string(), extra);
        info
    }

    fn conf_for(types: &[&str], state_dir: &Path) -> NetConf {
        let network_type = types
            .iter()
            .map(|t| (t.to_string(), serde_json::json!({ "type": t })))
            .collect();
        NetConf {
            name: "test-net".to_string(),
            cni_version: "0.2.0".to_string(),
            plugin_type: "weft".to_string(),
            network_type,
            url: String::new(),
            network_uri: String::new(),
            device: String::new(),
            database: String::new(),
            subnets: Vec::new(),
            policy: 0,
            vlan_id: 0,
            networks: Vec::new(),
            state_dir: state_dir.display().to_string(),
        }
    }

    fn envelope(plugin_dir: &Path) -> CmdArgs {
        CmdArgs {
            container_id: "ctn1".to_string(),
            netns: "/var/run/netns/ctn1".to_string(),
            ifname: "eth0".to_string(),
            args: "K8S_POD_NAME=web-0;K8S_POD_NAMESPACE=default".to_string(),
            path: plugin_dir.display().to_string(),
        }
    }

    struct Fixture {
        plugins: TempDir,
        state: TempDir,
        log: PathBuf,
    }

    fn fixture() -> Fixture {
        let plugins = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let log = state.path().join("calls.log");
        Fixture {
            plugins,
            state,
            log,
        }
    }

    #[tokio::test]
    async fn add_invokes_delegates_in_order() {
        let fx = fixture();
        for name in ["alpha", "beta", "gamma"] {
            write_plugin(fx.plugins.path(), name, &fx.log, Behavior::Ok);
        }
        let conf = conf_for(&["alpha", "beta", "gamma"], fx.state.path());
        let infos = vec![info_for("alpha"), info_for("beta"), info_for("gamma")];

        let engine = DelegationEngine::new(&conf);
        let result = engine
            .cmd_add(&envelope(fx.plugins.path()), &infos)
            .await
            .unwrap();

        assert!(result.ip4.is_some());
        assert_eq!(read_log(&fx.log), vec!["ADD alpha", "ADD beta", "ADD gamma"]);
    }

    #[tokio::test]
    async fn failed_add_rolls_back_in_reverse() {
        let fx = fixture();
        write_plugin(fx.plugins.path(), "alpha", &fx.log, Behavior::Ok);
        write_plugin(fx.plugins.path(), "beta", &fx.log, Behavior::Ok);
        write_plugin(fx.plugins.path(), "gamma", &fx.log, Behavior::FailAdd);
        let conf = conf_for(&["alpha", "beta", "gamma"], fx.state.path());
        let infos = vec![info_for("alpha"), info_for("beta"), info_for("gamma")];

        let engine = DelegationEngine::new(&conf);
        let err = engine
            .cmd_add(&envelope(fx.plugins.path()), &infos)
            .await
            .unwrap_err();

        assert!(matches!(err, CniError::DelegateFailed { .. }));
        assert_eq!(
            read_log(&fx.log),
            vec!["ADD alpha", "ADD beta", "ADD gamma", "DEL beta", "DEL alpha"]
        );
    }

    #[tokio::test]
    async fn unknown_delegate_type_rolls_back() {
        let fx = fixture();
        write_plugin(fx.plugins.path(), "alpha", &fx.log, Behavior::Ok);
        // "ghost" has an info entry but no config
        let conf = conf_for(&["alpha"], fx.state.path());
        let infos = vec![info_for("alpha"), info_for("ghost")];

        let engine = DelegationEngine::new(&conf);
        let err = engine
            .cmd_add(&envelope(fx.plugins.path()), &infos)
            .await
            .unwrap_err();

        assert!(matches!(err, CniError::UnknownNetwork(_)));
        assert_eq!(read_log(&fx.log), vec!["ADD alpha", "DEL alpha"]);
    }

    #[tokio::test]
    async fn del_walks_in_reverse_and_collects_errors() {
        let fx = fixture();
        write_plugin(fx.plugins.path(), "alpha", &fx.log, Behavior::FailDel);
        write_plugin(fx.plugins.path(), "beta", &fx.log, Behavior::FailDel);
        write_plugin(fx.plugins.path(), "gamma", &fx.log, Behavior::Ok);
        let conf = conf_for(&["alpha", "beta", "gamma"], fx.state.path());
        let infos = vec![info_for("alpha"), info_for("beta"), info_for("gamma")];

        let engine = DelegationEngine::new(&conf);
        let err = engine
            .cmd_del(&envelope(fx.plugins.path()), &infos, infos.len() - 1)
            .await
            .unwrap_err();

        // every delegate was attempted despite the failures
        assert_eq!(
            read_log(&fx.log),
            vec!["DEL gamma", "DEL beta", "DEL alpha"]
        );
        let msg = err.to_string();
        assert!(msg.contains(" / "), "expected joined errors, got: {}", msg);
    }

    #[tokio::test]
    async fn del_with_empty_netns_is_a_no_op() {
        let fx = fixture();
        write_plugin(fx.plugins.path(), "alpha", &fx.log, Behavior::Ok);
        let conf = conf_for(&["alpha"], fx.state.path());
        let mut cmd = envelope(fx.plugins.path());
        cmd.netns = String::new();

        del(&cmd, serde_json::to_vec(&conf).unwrap().as_slice())
            .await
            .unwrap();

        assert!(read_log(&fx.log).is_empty());
    }

    #[tokio::test]
    async fn add_then_del_binds_and_releases_the_pod_key() {
        let fx = fixture();
        write_plugin(fx.plugins.path(), "alpha", &fx.log, Behavior::Ok);

        let mut conf = conf_for(&["alpha"], fx.state.path());
        let db = fx.state.path().join("pool.db");
        conf.database = db.display().to_string();
        conf.subnets = vec!["10.0.0.0/29".to_string()];
        let stdin = serde_json::to_vec(&conf).unwrap();

        let cmd = envelope(fx.plugins.path());
        let result = add(&cmd, &stdin).await.unwrap();
        assert!(result.ip4.is_some());

        // the pod key holds an address and the delegate order is persisted
        let pool = open_pool(&conf.database).await.unwrap();
        let fipa = FloatingIpAllocator::new(pool);
        let bound = fipa.find_bound("default_web-0", None).await.unwrap();
        assert!(bound.is_some());
        let saved = state::consume_network_infos(fx.state.path(), "ctn1").unwrap();
        assert_eq!(saved.len(), 1);
        // put the state back for the delete below
        state::save_network_infos(fx.state.path(), "ctn1", &saved).unwrap();

        del(&cmd, &stdin).await.unwrap();

        assert!(fipa
            .find_bound("default_web-0", None)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            read_log(&fx.log),
            vec!["ADD alpha", "DEL alpha"]
        );
    }

    #[tokio::test]
    async fn failed_add_releases_the_fresh_binding() {
        let fx = fixture();
        write_plugin(fx.plugins.path(), "alpha", &fx.log, Behavior::FailAdd);

        let mut conf = conf_for(&["alpha"], fx.state.path());
        conf.database = fx.state.path().join("pool.db").display().to_string();
        conf.subnets = vec!["10.0.0.0/29".to_string()];
        let stdin = serde_json::to_vec(&conf).unwrap();

        let cmd = envelope(fx.plugins.path());
        let err = add(&cmd, &stdin).await.unwrap_err();
        assert!(matches!(err, CniError::DelegateFailed { .. }));

        let pool = open_pool(&conf.database).await.unwrap();
        let fipa = FloatingIpAllocator::new(pool);
        assert!(fipa
            .find_bound("default_web-0", None)
            .await
            .unwrap()
            .is_none());
        // no port state may survive a failed add
        assert!(state::consume_ports(fx.state.path(), "ctn1")
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn failure_within_one_info_rolls_back_its_siblings() {
        let fx = fixture();
        write_plugin(fx.plugins.path(), "aaa", &fx.log, Behavior::Ok);
        write_plugin(fx.plugins.path(), "bbb", &fx.log, Behavior::FailAdd);
        let conf = conf_for(&["aaa", "bbb"], fx.state.path());
        // one info carrying both plugin types for the same interface
        let mut info = info_for("aaa");
        info.extend(info_for("bbb"));
        let infos = vec![info];

        let engine = DelegationEngine::new(&conf);
        let err = engine
            .cmd_add(&envelope(fx.plugins.path()), &infos)
            .await
            .unwrap_err();

        assert!(matches!(err, CniError::DelegateFailed { .. }));
        // the sibling that succeeded inside the failing info is deleted too
        assert_eq!(read_log(&fx.log), vec!["ADD aaa", "ADD bbb", "DEL aaa"]);
    }

    #[tokio::test]
    async fn ipamless_delegate_falls_back_to_the_reserved_ip() {
        let fx = fixture();
        // a delegate without its own ipam: succeeds but reports no ip4
        let script = format!(
            "#!/bin/sh\necho \"$CNI_COMMAND alpha\" >> \"{}\"\nif [ \"$CNI_COMMAND\" = \"ADD\" ]; then\n  echo '{{}}'\nfi\nexit 0\n",
            fx.log.display()
        );
        let path = fx.plugins.path().join("alpha");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        let mut conf = conf_for(&["alpha"], fx.state.path());
        conf.database = fx.state.path().join("pool.db").display().to_string();
        conf.subnets = vec!["10.0.0.0/29".to_string()];
        let stdin = serde_json::to_vec(&conf).unwrap();

        let result = add(&envelope(fx.plugins.path()), &stdin).await.unwrap();

        let ip4 = result.ip4.unwrap();
        assert_eq!(ip4.ip.to_string(), "10.0.0.1/29");
        assert_eq!(ip4.routes.len(), 1);
        assert_eq!(ip4.routes[0].dst.to_string(), "0.0.0.0/0");
        assert!(ip4.routes[0].gw.is_none());
    }

    #[tokio::test]
    async fn delegates_receive_the_reserved_ip_in_args() {
        let fx = fixture();
        // a plugin that records its CNI_ARGS
        let script = format!(
            "#!/bin/sh\necho \"$CNI_ARGS\" >> \"{}\"\nif [ \"$CNI_COMMAND\" = \"ADD\" ]; then\n  echo '{{\"ip4\":{{\"ip\":\"10.0.0.1/29\"}}}}'\nfi\nexit 0\n",
            fx.log.display()
        );
        let path = fx.plugins.path().join("alpha");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        let mut conf = conf_for(&["alpha"], fx.state.path());
        conf.database = fx.state.path().join("pool.db").display().to_string();
        conf.subnets = vec!["10.0.0.0/29".to_string()];
        let stdin = serde_json::to_vec(&conf).unwrap();

        add(&envelope(fx.plugins.path()), &stdin).await.unwrap();

        let lines = read_log(&fx.log);
        assert_eq!(lines.len(), 1);
        assert!(
            lines[0].contains("IP=10.0.0.1/29"),
            "args missing reserved ip: {}",
            lines[0]
        );
    }
}
