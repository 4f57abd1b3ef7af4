use std::path::{Path, PathBuf};
use std::process::Command;

use log::{error, trace, warn};

use crate::linux::{mount, umount2};
use crate::model::RuntimeResult;

/// Base directory for images, per-container layers, and overlay mount
/// points - `/root/<image>[.tar]`, `/root/writeLayer/<id>/`,
/// `/root/work/`, `/root/mnt/<id>/`.
const IMAGE_ROOT: &str = "/root";

/// A parsed `HOST:CONTAINER` volume spec. Anything that doesn't split
/// into exactly two non-empty parts is treated as malformed and ignored,
/// per the upstream Create algorithm.
pub struct Volume {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
}

impl Volume {
    pub fn parse(raw: &str) -> Option<Volume> {
        if raw.is_empty() {
            return None;
        }

        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
            warn!("bad volume: {}", raw);
            return None;
        }

        Some(Volume { host_path: PathBuf::from(parts[0]), container_path: PathBuf::from(parts[1]) })
    }
}

pub fn mount_point(container_id: &str) -> PathBuf {
    Path::new(IMAGE_ROOT).join("mnt").join(container_id)
}

fn write_layer(container_id: &str) -> PathBuf {
    Path::new(IMAGE_ROOT).join("writeLayer").join(container_id)
}

fn work_dir() -> PathBuf {
    Path::new(IMAGE_ROOT).join("work")
}

fn image_root(image: &str) -> PathBuf {
    Path::new(IMAGE_ROOT).join(image)
}

fn image_tar(image: &str) -> PathBuf {
    Path::new(IMAGE_ROOT).join(format!("{}.tar", image))
}

/// Builds the overlay workspace for a container: read-only image layer +
/// per-container writable layer + shared workdir, mounted at
/// `/root/mnt/<id>/`, plus an optional bind volume mounted at
/// `<mnt>/<container_path>`. Returns the mount point. Partial failures
/// (missing image tar, malformed volume) are logged, not fatal - the
/// caller observes them later as an overlay-mount error.
pub fn new_workspace(container_id: &str, volume: &str, image: &str) -> RuntimeResult<PathBuf> {
    let ro_layer = create_read_only_layer(image)?;
    let w_layer = create_write_layer(container_id)?;
    let mnt = mount_point(container_id);

    std::fs::create_dir_all(&mnt)?;
    mount(
        Some("overlay"),
        &mnt,
        Some("overlay"),
        libc::MS_NODEV,
        Some(&format!("lowerdir={},upperdir={},workdir={}", ro_layer.display(), w_layer.display(), work_dir().display())),
    )?;

    if let Some(volume) = Volume::parse(volume) {
        mount_volume(&mnt, &volume)?;
    }

    Ok(mnt)
}

fn create_read_only_layer(image: &str) -> RuntimeResult<PathBuf> {
    let ro_layer = image_root(image);
    if ro_layer.exists() {
        return Ok(ro_layer);
    }

    let tar_path = image_tar(image);
    if tar_path.exists() {
        std::fs::create_dir_all(&ro_layer)?;
        let output = Command::new("tar").args(["-xf", tar_path.to_str().unwrap(), "-C", ro_layer.to_str().unwrap()]).output()?;
        if !output.status.success() {
            error!("untar {} error: {}", tar_path.display(), String::from_utf8_lossy(&output.stderr));
        }
    } else {
        error!("image tar {} does not exist, overlay mount will fail", tar_path.display());
    }

    Ok(ro_layer)
}

fn create_write_layer(container_id: &str) -> RuntimeResult<PathBuf> {
    let w_layer = write_layer(container_id);
    std::fs::create_dir_all(&w_layer)?;
    std::fs::create_dir_all(work_dir())?;
    Ok(w_layer)
}

fn mount_volume(mnt: &Path, volume: &Volume) -> RuntimeResult<()> {
    trace!("mount volume {} -> {}", volume.host_path.display(), volume.container_path.display());

    std::fs::create_dir_all(&volume.host_path)?;
    let container_path_in_mnt = mnt.join(volume.container_path.strip_prefix("/").unwrap_or(&volume.container_path));
    std::fs::create_dir_all(&container_path_in_mnt)?;

    mount(
        Some("overlay"),
        &container_path_in_mnt,
        Some("overlay"),
        0,
        Some(&format!(
            "lowerdir={},upperdir={},workdir={}",
            container_path_in_mnt.display(),
            volume.host_path.display(),
            work_dir().display()
        )),
    )
}

/// Tears down a workspace in strict reverse order: volume unmount, then
/// the main overlay unmount, then directory removal. Every step logs on
/// failure and proceeds - a leaked directory is preferable to a leaked
/// mount.
pub fn delete_workspace(container_id: &str, volume: &str) {
    let mnt = mount_point(container_id);
    let w_layer = write_layer(container_id);

    if let Some(volume) = Volume::parse(volume) {
        let container_path_in_mnt = mnt.join(volume.container_path.strip_prefix("/").unwrap_or(&volume.container_path));
        if let Err(err) = umount2(&container_path_in_mnt, 0) {
            warn!("unmount volume {} error: {}", container_path_in_mnt.display(), err);
        }
    }

    if let Err(err) = umount2(&mnt, 0) {
        warn!("unmount {} error: {}", mnt.display(), err);
    }

    if let Err(err) = std::fs::remove_dir_all(&mnt) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("remove dir {} error: {}", mnt.display(), err);
        }
    }

    if let Err(err) = std::fs::remove_dir_all(&w_layer) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("remove dir {} error: {}", w_layer.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_parse_rejects_malformed_specs() {
        assert!(Volume::parse("").is_none());
        assert!(Volume::parse("/only/one/part").is_none());
        assert!(Volume::parse(":missinghost").is_none());
        assert!(Volume::parse("missingcontainer:").is_none());
        assert!(Volume::parse("a:b:c").is_none());
    }

    #[test]
    fn volume_parse_accepts_host_container_pair() {
        let volume = Volume::parse("/tmp/h:/data").unwrap();
        assert_eq!(volume.host_path, PathBuf::from("/tmp/h"));
        assert_eq!(volume.container_path, PathBuf::from("/data"));
    }

    #[test]
    fn layout_paths_are_namespaced_by_container_id() {
        assert_eq!(mount_point("abc123"), PathBuf::from("/root/mnt/abc123"));
        assert_eq!(write_layer("abc123"), PathBuf::from("/root/writeLayer/abc123"));
    }
}
