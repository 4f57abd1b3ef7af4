use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use log::trace;
use serde::{Deserialize, Serialize};

use crate::model::{RuntimeError, RuntimeResult};

/// Resource limits a container may carry. An empty field means "no limit"
/// for that controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub memory_limit: String,
    pub cpu_shares: String,
    pub cpuset: String,
}

impl ResourceConfig {
    pub fn is_empty(&self) -> bool {
        self.memory_limit.is_empty() && self.cpu_shares.is_empty() && self.cpuset.is_empty()
    }
}

/// One cgroup v1 controller, abstracted behind name/set/apply/remove so the
/// manager can drive an ordered list of them without caring which.
pub trait Subsystem {
    fn name(&self) -> &'static str;
    fn set(&self, relative_path: &str, res: &ResourceConfig) -> RuntimeResult<()>;
    fn apply(&self, relative_path: &str, pid: i32) -> RuntimeResult<()>;
    fn remove(&self, relative_path: &str) -> RuntimeResult<()>;
}

/// The registry, in the order Apply/Set/Remove walk it. Order is
/// observable: a Set failure aborts the sequence leaving earlier
/// controllers already configured, which only `Destroy` cleans up.
pub fn registry() -> Vec<Box<dyn Subsystem>> {
    vec![Box::new(MemorySubsystem), Box::new(CpuShareSubsystem), Box::new(CpusetSubsystem)]
}

pub struct MemorySubsystem;

impl Subsystem for MemorySubsystem {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn set(&self, relative_path: &str, res: &ResourceConfig) -> RuntimeResult<()> {
        if res.memory_limit.is_empty() {
            return Ok(());
        }
        let path = get_cgroup_path(self.name(), relative_path, true)?;
        fs::write(path.join("memory.limit_in_bytes"), &res.memory_limit)?;
        Ok(())
    }

    fn apply(&self, relative_path: &str, pid: i32) -> RuntimeResult<()> {
        apply_to_tasks(self.name(), relative_path, pid)
    }

    fn remove(&self, relative_path: &str) -> RuntimeResult<()> {
        remove_hierarchy(self.name(), relative_path)
    }
}

pub struct CpuShareSubsystem;

impl Subsystem for CpuShareSubsystem {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn set(&self, relative_path: &str, res: &ResourceConfig) -> RuntimeResult<()> {
        if res.cpu_shares.is_empty() {
            return Ok(());
        }
        let path = get_cgroup_path(self.name(), relative_path, true)?;
        fs::write(path.join("cpu.shares"), &res.cpu_shares)?;
        Ok(())
    }

    fn apply(&self, relative_path: &str, pid: i32) -> RuntimeResult<()> {
        apply_to_tasks(self.name(), relative_path, pid)
    }

    fn remove(&self, relative_path: &str) -> RuntimeResult<()> {
        remove_hierarchy(self.name(), relative_path)
    }
}

pub struct CpusetSubsystem;

impl Subsystem for CpusetSubsystem {
    fn name(&self) -> &'static str {
        "cpuset"
    }

    fn set(&self, relative_path: &str, res: &ResourceConfig) -> RuntimeResult<()> {
        if res.cpuset.is_empty() {
            return Ok(());
        }
        let path = get_cgroup_path(self.name(), relative_path, true)?;
        fs::write(path.join("cpuset.cpus"), &res.cpuset)?;
        Ok(())
    }

    fn apply(&self, relative_path: &str, pid: i32) -> RuntimeResult<()> {
        apply_to_tasks(self.name(), relative_path, pid)
    }

    fn remove(&self, relative_path: &str) -> RuntimeResult<()> {
        remove_hierarchy(self.name(), relative_path)
    }
}

fn apply_to_tasks(subsystem: &str, relative_path: &str, pid: i32) -> RuntimeResult<()> {
    let path = get_cgroup_path(subsystem, relative_path, true)?;
    fs::write(path.join("tasks"), pid.to_string())?;
    Ok(())
}

fn remove_hierarchy(subsystem: &str, relative_path: &str) -> RuntimeResult<()> {
    match get_cgroup_path(subsystem, relative_path, false) {
        Ok(path) => match fs::remove_dir(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(RuntimeError::from(err)),
        },
        Err(_) => Ok(()),
    }
}

/// Resolves the absolute, kernel-visible path for `relative_path` under the
/// hierarchy mounting `subsystem`. With `auto_create`, a missing directory
/// is created (mode 0755); without it, a missing directory is an error.
pub fn get_cgroup_path(subsystem: &str, relative_path: &str, auto_create: bool) -> RuntimeResult<PathBuf> {
    let mount_point = find_cgroup_mount_point(subsystem).ok_or_else(|| {
        RuntimeError::Environment(format!("no mounted cgroup hierarchy found for subsystem '{}'", subsystem))
    })?;

    let absolute_path = mount_point.join(relative_path);

    if absolute_path.exists() {
        return Ok(absolute_path);
    }

    if auto_create {
        fs::create_dir_all(&absolute_path).map_err(|err| {
            RuntimeError::Environment(format!("cgroup create error for '{}': {}", absolute_path.display(), err))
        })?;
        return Ok(absolute_path);
    }

    Err(RuntimeError::Environment(format!("cgroup path error: {} does not exist", absolute_path.display())))
}

/// Scans `/proc/self/mountinfo` for the hierarchy mounting `subsystem`,
/// e.g. `find_cgroup_mount_point("memory")` typically returns
/// `/sys/fs/cgroup/memory`. Mountinfo fields are space-separated; the
/// mount target is field 5 (0-indexed 4), and the subsystem names for a
/// v1 cgroup mount live in the comma-separated super options, the last
/// field on the line.
pub fn find_cgroup_mount_point(subsystem: &str) -> Option<PathBuf> {
    find_cgroup_mount_point_in(subsystem, "/proc/self/mountinfo")
}

fn find_cgroup_mount_point_in(subsystem: &str, mountinfo_path: &str) -> Option<PathBuf> {
    let file = fs::File::open(mountinfo_path).ok()?;
    let reader = BufReader::new(file);

    for line in reader.lines() {
        let line = line.ok()?;
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() < 5 {
            continue;
        }

        let last_field = fields[fields.len() - 1];
        if last_field.split(',').any(|opt| opt == subsystem) {
            trace!("resolved cgroup mount point for '{}': {}", subsystem, fields[4]);
            return Some(PathBuf::from(fields[4]));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn finds_mount_point_among_multiple_options() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mountinfo");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "41 25 0:33 / /sys/fs/cgroup/memory rw,relatime - cgroup cgroup rw,memory").unwrap();
        writeln!(file, "42 25 0:34 / /sys/fs/cgroup/cpu,cpuacct rw,relatime - cgroup cgroup rw,cpu,cpuacct").unwrap();

        assert_eq!(
            find_cgroup_mount_point_in("memory", path.to_str().unwrap()),
            Some(PathBuf::from("/sys/fs/cgroup/memory"))
        );
        assert_eq!(
            find_cgroup_mount_point_in("cpu", path.to_str().unwrap()),
            Some(PathBuf::from("/sys/fs/cgroup/cpu,cpuacct"))
        );
        assert_eq!(find_cgroup_mount_point_in("cpuset", path.to_str().unwrap()), None);
    }

    #[test]
    fn resource_config_empty_is_all_blank_fields() {
        assert!(ResourceConfig::default().is_empty());
        assert!(!ResourceConfig { memory_limit: "100m".into(), ..Default::default() }.is_empty());
    }

    #[test]
    fn registry_order_is_memory_then_cpu_share_then_cpuset() {
        let names: Vec<&str> = registry().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["memory", "cpu", "cpuset"]);
    }
}
