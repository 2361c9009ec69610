use crate::cni::args::Port;
use crate::net::error::{NetworkError, NetworkResult};

/// Install DNAT rules exposing a pod's host ports. Traffic already on the
/// pod bridge is excluded so bridge-local connections keep their source.
pub async fn setup_port_mapping(bridge: &str, ports: &[Port]) -> NetworkResult<()> {
    for port in ports {
        if port.host_port == 0 || port.pod_ip.is_empty() {
            continue;
        }
        let cmd = format!(
            "iptables -t nat -A PREROUTING ! -i {} -p {} --dport {} -j DNAT --to-destination {}:{}",
            bridge,
            protocol(port),
            port.host_port,
            port.pod_ip,
            port.container_port
        );
        run_rule(&cmd).await?;
        tracing::info!(
            "port mapped: host:{} -> {}:{} ({})",
            port.host_port,
            port.pod_ip,
            port.container_port,
            protocol(port)
        );
    }
    Ok(())
}

/// Remove the DNAT rules installed by `setup_port_mapping`. Best-effort: a
/// rule that is already gone only gets a log line.
pub async fn clean_port_mapping(bridge: &str, ports: &[Port]) -> NetworkResult<()> {
    for port in ports {
        if port.host_port == 0 || port.pod_ip.is_empty() {
            continue;
        }
        let cmd = format!(
            "iptables -t nat -D PREROUTING ! -i {} -p {} --dport {} -j DNAT --to-destination {}:{}",
            bridge,
            protocol(port),
            port.host_port,
            port.pod_ip,
            port.container_port
        );
        if let Err(e) = run_rule(&cmd).await {
            tracing::warn!("failed to remove port mapping for host:{}: {}", port.host_port, e);
        }
    }
    Ok(())
}

fn protocol(port: &Port) -> &str {
    if port.protocol.is_empty() {
        "tcp"
    } else {
        &port.protocol
    }
}

async fn run_rule(cmd: &str) -> NetworkResult<()> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .await
        .map_err(NetworkError::Io)?;

    if !output.status.success() {
        return Err(NetworkError::Command {
            cmd: cmd.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}
