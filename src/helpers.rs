use std::path::PathBuf;

use chrono::Local;
use log::error;
use uuid::Uuid;

/// Removes a directory tree on drop unless `cancel()` was called first.
/// Used to roll back a partially created workspace/info directory when a
/// later step of `run` fails, without leaving a guard armed on the
/// success path.
pub struct RemoveDirGuard {
    dir: PathBuf,
    armed: bool,
}

impl RemoveDirGuard {
    pub fn new(dir: PathBuf) -> RemoveDirGuard {
        RemoveDirGuard { dir, armed: true }
    }

    pub fn cancel(&mut self) {
        self.armed = false;
    }
}

impl Drop for RemoveDirGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        if let Err(err) = std::fs::remove_dir_all(&self.dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                error!("failed to remove directory {}: {}", self.dir.display(), err);
            }
        }
    }
}

/// A short container id in the style of the upstream implementation: a
/// 10-character alphanumeric string, derived here from a v4 UUID rather
/// than a dedicated RNG since `uuid` is already part of the stack.
pub fn generate_container_id() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_owned()
}

/// RFC-like timestamp used for `ContainerInfo::created_time`.
pub fn now_string() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_ten_chars_and_unique() {
        let a = generate_container_id();
        let b = generate_container_id();
        assert_eq!(a.len(), 10);
        assert_eq!(b.len(), 10);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn remove_dir_guard_cleans_up_unless_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let leftover = dir.path().join("leftover");
        std::fs::create_dir(&leftover).unwrap();
        {
            let _guard = RemoveDirGuard::new(leftover.clone());
        }
        assert!(!leftover.exists());

        let kept = dir.path().join("kept");
        std::fs::create_dir(&kept).unwrap();
        {
            let mut guard = RemoveDirGuard::new(kept.clone());
            guard.cancel();
        }
        assert!(kept.exists());
    }
}
