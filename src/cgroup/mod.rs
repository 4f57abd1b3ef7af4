pub mod subsystem;

use log::warn;

use crate::model::RuntimeResult;
use subsystem::{registry, ResourceConfig};

/// Aggregates the subsystem registry under one relative cgroup path. The
/// path is namespaced per container (`ddocker-cgroup/<id>`) so concurrent
/// `run` invocations don't collide, unlike the single fixed path this is
/// modeled on.
pub struct CgroupManager {
    relative_path: String,
}

impl CgroupManager {
    pub fn for_container(container_id: &str) -> CgroupManager {
        CgroupManager { relative_path: format!("ddocker-cgroup/{}", container_id) }
    }

    /// Writes every non-empty limit in `res` to its controller. The first
    /// failure short-circuits, leaving any earlier controllers already
    /// configured for `Destroy` to clean up.
    pub fn set(&self, res: &ResourceConfig) -> RuntimeResult<()> {
        for subsystem in registry() {
            subsystem.set(&self.relative_path, res)?;
        }
        Ok(())
    }

    /// Enrolls `pid` into every controller's `tasks` file.
    pub fn apply(&self, pid: i32) -> RuntimeResult<()> {
        for subsystem in registry() {
            subsystem.apply(&self.relative_path, pid)?;
        }
        Ok(())
    }

    /// Removes every controller's hierarchy directory. Individual failures
    /// are logged, not propagated - this runs on the `run` error path and
    /// on every container teardown, and must make a best effort even if
    /// one controller never got set up.
    pub fn destroy(&self) {
        for subsystem in registry() {
            if let Err(err) = subsystem.remove(&self.relative_path) {
                warn!("failed to remove {} cgroup for {}: {}", subsystem.name(), self.relative_path, err);
            }
        }
    }
}
