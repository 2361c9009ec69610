use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::cni::args::Port;
use crate::cni::error::CniError;
use crate::cni::NetworkInfo;

// Port mappings and network infos are two different JSON shapes, so they
// get two files instead of sharing the container-id path.
const PORTS_SUFFIX: &str = "ports";
const NETS_SUFFIX: &str = "nets";

fn state_path(dir: &Path, container_id: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{}.{}", container_id, suffix))
}

fn write_state(path: &Path, data: &[u8]) -> Result<(), CniError> {
    if let Some(dir) = path.parent() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)?;
    }

    use std::io::Write;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    Ok(())
}

/// Read-then-delete. A missing file reads as "nothing persisted", so a
/// repeated DEL stays quiet.
fn consume_state(path: &Path) -> Result<Option<Vec<u8>>, CniError> {
    match fs::read(path) {
        Ok(data) => {
            let _ = fs::remove_file(path);
            Ok(Some(data))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn save_ports(dir: &Path, container_id: &str, ports: &[Port]) -> Result<(), CniError> {
    let data = serde_json::to_vec(ports)?;
    write_state(&state_path(dir, container_id, PORTS_SUFFIX), &data)
}

pub fn consume_ports(dir: &Path, container_id: &str) -> Result<Vec<Port>, CniError> {
    match consume_state(&state_path(dir, container_id, PORTS_SUFFIX))? {
        Some(data) if !data.is_empty() => Ok(serde_json::from_slice(&data)?),
        _ => Ok(Vec::new()),
    }
}

pub fn save_network_infos(
    dir: &Path,
    container_id: &str,
    infos: &[NetworkInfo],
) -> Result<(), CniError> {
    let data = serde_json::to_vec(infos)?;
    write_state(&state_path(dir, container_id, NETS_SUFFIX), &data)
}

pub fn consume_network_infos(
    dir: &Path,
    container_id: &str,
) -> Result<Vec<NetworkInfo>, CniError> {
    match consume_state(&state_path(dir, container_id, NETS_SUFFIX))? {
        Some(data) if !data.is_empty() => Ok(serde_json::from_slice(&data)?),
        _ => Ok(Vec::new()),
    }
}
