use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::{RuntimeError, RuntimeResult};

const INFO_ROOT: &str = "/root/ddocker-info";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Running,
    Stopped,
    Exited,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Exited => "exited",
        }
    }
}

/// Everything `ps`, `logs`, `stop`, `rm`, and `commit` need to know about a
/// container after its initial `run`, persisted as one JSON file per
/// container under `/root/ddocker-info/<id>/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub pid: i32,
    pub command: Vec<String>,
    pub created_time: String,
    pub status: Status,
    pub volume: String,
    pub port_mappings: Vec<(u16, u16)>,
    pub network: Option<String>,
    pub endpoint_ip: Option<Ipv4Addr>,
}

fn container_dir(root: &Path, container_id: &str) -> PathBuf {
    root.join(container_id)
}

fn config_path(root: &Path, container_id: &str) -> PathBuf {
    container_dir(root, container_id).join(CONFIG_FILE_NAME)
}

/// Writes a freshly-started container's info. Called right after the
/// parent observes the child's pid, before the caller returns control to
/// the user, so `ps` can see it immediately.
pub fn record(info: &ContainerInfo) -> RuntimeResult<()> {
    record_in(Path::new(INFO_ROOT), info)
}

fn record_in(root: &Path, info: &ContainerInfo) -> RuntimeResult<()> {
    fs::create_dir_all(container_dir(root, &info.id))?;
    fs::write(config_path(root, &info.id), serde_json::to_string(info).unwrap())?;
    Ok(())
}

pub fn load(container_id: &str) -> RuntimeResult<ContainerInfo> {
    load_in(Path::new(INFO_ROOT), container_id)
}

fn load_in(root: &Path, container_id: &str) -> RuntimeResult<ContainerInfo> {
    let content = fs::read_to_string(config_path(root, container_id)).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            RuntimeError::Configuration(format!("no such container: {}", container_id))
        } else {
            RuntimeError::from(err)
        }
    })?;
    serde_json::from_str(&content).map_err(|err| RuntimeError::BookkeepingDrift(format!("corrupt info for {}: {}", container_id, err)))
}

/// Resolves either a container id or a container name to its info,
/// scanning every recorded container when `reference` isn't a known id.
pub fn resolve(reference: &str) -> RuntimeResult<ContainerInfo> {
    if let Ok(info) = load(reference) {
        return Ok(info);
    }

    for info in list()? {
        if info.name == reference {
            return Ok(info);
        }
    }

    Err(RuntimeError::Configuration(format!("no such container: {}", reference)))
}

pub fn list() -> RuntimeResult<Vec<ContainerInfo>> {
    list_in(Path::new(INFO_ROOT))
}

fn list_in(root: &Path) -> RuntimeResult<Vec<ContainerInfo>> {
    let mut infos = Vec::new();

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(infos),
        Err(err) => return Err(RuntimeError::from(err)),
    };

    for entry in entries {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str() {
            if let Ok(info) = load_in(root, id) {
                infos.push(info);
            }
        }
    }

    infos.sort_by(|a, b| a.created_time.cmp(&b.created_time));
    Ok(infos)
}

pub fn update_status(container_id: &str, status: Status) -> RuntimeResult<()> {
    let mut info = load(container_id)?;
    info.status = status;
    record(&info)
}

/// Deletes a container's info directory. Refuses to remove a container
/// still recorded as running, matching the upstream `rm` guard -
/// callers must `stop` first.
pub fn remove(container_id: &str) -> RuntimeResult<()> {
    let info = load(container_id)?;
    if info.status == Status::Running {
        return Err(RuntimeError::Configuration(format!(
            "cannot remove running container {}, stop it first",
            container_id
        )));
    }

    fs::remove_dir_all(container_dir(Path::new(INFO_ROOT), container_id))?;
    Ok(())
}

pub fn log_path(container_id: &str) -> PathBuf {
    container_dir(Path::new(INFO_ROOT), container_id).join("std.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> ContainerInfo {
        ContainerInfo {
            id: id.to_owned(),
            name: format!("name-{}", id),
            pid: 1234,
            command: vec!["/bin/sh".to_owned()],
            created_time: "2024-01-01 00:00:00".to_owned(),
            status: Status::Running,
            volume: String::new(),
            port_mappings: vec![],
            network: None,
            endpoint_ip: None,
        }
    }

    #[test]
    fn record_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let info = sample("abc1234567");
        record_in(dir.path(), &info).unwrap();

        let loaded = load_in(dir.path(), "abc1234567").unwrap();
        assert_eq!(loaded.name, info.name);
        assert_eq!(loaded.status, Status::Running);
    }

    #[test]
    fn load_missing_container_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_in(dir.path(), "nope").unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration(_)));
    }

    #[test]
    fn list_is_sorted_by_created_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut newer = sample("bbbbbbbbbb");
        newer.created_time = "2024-02-01 00:00:00".to_owned();
        let mut older = sample("aaaaaaaaaa");
        older.created_time = "2024-01-01 00:00:00".to_owned();

        record_in(dir.path(), &newer).unwrap();
        record_in(dir.path(), &older).unwrap();

        let infos = list_in(dir.path()).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id, "aaaaaaaaaa");
        assert_eq!(infos[1].id, "bbbbbbbbbb");
    }

    #[test]
    fn list_of_empty_directory_is_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_in(&dir.path().join("does-not-exist")).unwrap().is_empty());
    }
}
