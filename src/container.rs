use std::ffi::c_void;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};

use log::{error, info, trace};
use serde::{Deserialize, Serialize};

use crate::cgroup::subsystem::ResourceConfig;
use crate::cgroup::CgroupManager;
use crate::helpers::{generate_container_id, now_string, RemoveDirGuard};
use crate::info::{self, ContainerInfo, Status};
use crate::linux;
use crate::model::{RuntimeError, RuntimeResult};
use crate::network::{Endpoint, NetworkManager};
use crate::workspace;

/// Everything needed to start a container, collected from CLI flags
/// before any namespace is touched.
pub struct RunSpec {
    pub name: Option<String>,
    pub image: String,
    pub command: Vec<String>,
    pub volume: String,
    pub resource_config: ResourceConfig,
    pub network: Option<String>,
    pub port_mappings: Vec<(u16, u16)>,
    pub env: Vec<(String, String)>,
    pub tty: bool,
    pub detach: bool,
    pub user: Option<String>,
}

/// The pipe's two ends, handed to the clone callback as its `arg` pointer.
/// `clone` (unlike `fork`) does not trim the child's fd table down to one
/// end, so the callback must close the write end itself before reading -
/// otherwise the child's own copy of it keeps the pipe open and its read
/// of fd 3 never sees EOF.
struct ChildFds {
    read_fd: i32,
    write_fd: i32,
}

/// What crosses the pipe from parent to child: the child reads this once
/// as its very first action in `init`, before touching any namespace.
#[derive(Serialize, Deserialize)]
struct InitConfig {
    root: PathBuf,
    command: Vec<String>,
    hostname: String,
    user: Option<String>,
    env: Vec<(String, String)>,
    log_path: Option<PathBuf>,
}

/// Starts a container. The parent clones into a fresh PID/mount/UTS/IPC
/// (and, for bridged networking, NET) namespace; the clone callback
/// blocks on a pipe (fd 3) until the parent has finished cgroup and
/// network setup - which needs the child's pid - and written the
/// resolved root and command across it. Only then does the child pivot
/// into the workspace and `execvp` the user's command as PID 1.
pub fn run(spec: RunSpec) -> RuntimeResult<()> {
    let container_id = generate_container_id();
    let name = spec.name.clone().unwrap_or_else(|| container_id.clone());

    let mut root_guard = RemoveDirGuard::new(workspace::mount_point(&container_id));
    let root = workspace::new_workspace(&container_id, &spec.volume, &spec.image)?;

    let (read_fd, write_fd) = linux::pipe()?;

    let mut child_stack = vec![0u8; 1024 * 1024];
    let network_enabled = spec.network.is_some();

    let child_fds = ChildFds { read_fd, write_fd };

    let pid = unsafe {
        extern "C" fn clone_callback(arg: *mut c_void) -> i32 {
            let fds = unsafe { &*(arg as *const ChildFds) };
            if let Err(err) = run_init_child(fds.read_fd, fds.write_fd) {
                error!("container init failed: {}", err);
                return -1;
            }
            0
        }

        let network_flag = if network_enabled { libc::CLONE_NEWNET } else { 0 };

        linux::clone_process(
            libc::CLONE_NEWPID | libc::CLONE_NEWNS | libc::CLONE_NEWUTS | libc::CLONE_NEWIPC | network_flag | libc::SIGCHLD,
            clone_callback,
            &child_fds as *const ChildFds as *mut c_void,
            &mut child_stack,
        )
    }?;

    linux::close(read_fd);
    info!("started container {} as pid {}", container_id, pid);

    let cgroup = CgroupManager::for_container(&container_id);
    let log_path = (!spec.tty).then(|| info::log_path(&container_id));
    let setup_result = setup_parent_side(&spec, &container_id, pid, &root, write_fd, &cgroup, log_path);

    let endpoint_ip = match setup_result {
        Ok(endpoint_ip) => endpoint_ip,
        Err(err) => {
            error!("container setup failed, tearing down: {}", err);
            let _ = linux::kill(pid, libc::SIGKILL);
            let _ = linux::waitpid(pid);
            cgroup.destroy();
            return Err(RuntimeError::Environment(err.to_string()));
        }
    };

    root_guard.cancel();

    let info = ContainerInfo {
        id: container_id.clone(),
        name,
        pid,
        command: spec.command.clone(),
        created_time: now_string(),
        status: Status::Running,
        volume: spec.volume.clone(),
        port_mappings: spec.port_mappings.clone(),
        network: spec.network.clone(),
        endpoint_ip,
    };
    info::record(&info)?;

    if spec.detach {
        return Ok(());
    }

    let status = linux::waitpid(pid)?;
    info::update_status(&container_id, Status::Exited)?;
    cgroup.destroy();
    trace!("container {} exited with status {}", container_id, status);
    Ok(())
}

fn setup_parent_side(
    spec: &RunSpec,
    container_id: &str,
    pid: i32,
    root: &Path,
    write_fd: i32,
    cgroup: &CgroupManager,
    log_path: Option<PathBuf>,
) -> RuntimeResult<Option<std::net::Ipv4Addr>> {
    if !spec.resource_config.is_empty() {
        cgroup.set(&spec.resource_config)?;
    }
    cgroup.apply(pid)?;

    let endpoint_ip = if let Some(network_name) = &spec.network {
        let manager = NetworkManager::load()?;
        let endpoint = manager.connect(network_name, container_id, pid, &spec.port_mappings)?;
        Some(endpoint.ip_address)
    } else {
        None
    };

    let init_config = InitConfig {
        root: root.to_owned(),
        command: spec.command.clone(),
        hostname: container_id.to_owned(),
        user: spec.user.clone(),
        env: spec.env.clone(),
        log_path,
    };
    let payload = serde_json::to_vec(&init_config).unwrap();

    let mut write_file = unsafe { std::fs::File::from_raw_fd(write_fd) };
    write_file.write_all(&payload)?;
    drop(write_file);

    Ok(endpoint_ip)
}

/// The clone callback, running inside the freshly created namespaces.
/// Reads fd 3 (dup'd from the inherited read end of the pipe) to
/// completion, then pivots into the workspace and execs the container's
/// command - this call does not return on success.
fn run_init_child(read_fd: i32, write_fd: i32) -> RuntimeResult<()> {
    linux::dup2(read_fd, 3)?;
    if read_fd != 3 {
        linux::close(read_fd);
    }
    linux::close(write_fd);

    let mut payload = Vec::new();
    let mut pipe_file = unsafe { std::fs::File::from_raw_fd(3) };
    pipe_file.read_to_end(&mut payload)?;
    drop(pipe_file);

    let init_config: InitConfig = serde_json::from_slice(&payload)
        .map_err(|err| RuntimeError::Configuration(format!("malformed init payload: {}", err)))?;

    init_namespace(&init_config)
}

/// Runs the init-phase setup: mounts `/` private and recursive so later
/// mount events don't leak to the host, sets up the pseudo-filesystems
/// and device nodes inside the workspace, pivots into it, then execs the
/// user's command.
fn init_namespace(init_config: &InitConfig) -> RuntimeResult<()> {
    linux::mount(None, Path::new("/"), None, libc::MS_PRIVATE | libc::MS_REC, None)?;
    linux::sethostname(&init_config.hostname)?;

    setup_stdio(init_config.log_path.as_deref())?;
    setup_dns(&init_config.root)?;
    setup_container_root(&init_config.root)?;
    setup_user(init_config.user.as_deref())?;

    for (key, value) in &init_config.env {
        std::env::set_var(key, value);
    }

    linux::exec(&init_config.command)?;
    Ok(())
}

/// For a non-tty container, opens `<info_root>/<id>/std.log` and dup2s it
/// onto stdout and stderr. Must run before `pivot_root` - `log_path` is a
/// host path and won't resolve once the container's own root is in place.
/// A `--it` container keeps the stdio it inherited from the runtime.
fn setup_stdio(log_path: Option<&Path>) -> RuntimeResult<()> {
    let Some(log_path) = log_path else { return Ok(()) };

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new().create(true).append(true).open(log_path)?;
    linux::dup2(file.as_raw_fd(), 1)?;
    linux::dup2(file.as_raw_fd(), 2)?;
    Ok(())
}

/// Resolves `requested` against `/etc/passwd` (now the container's own,
/// post-pivot) and drops to that uid/gid. A container run with no `--user`
/// stays root, matching the upstream default.
fn setup_user(requested: Option<&str>) -> RuntimeResult<()> {
    let Some(requested) = requested else { return Ok(()) };

    let users = crate::model::User::from_passwd_file(Path::new("/etc/passwd"))?;
    let user = users
        .values()
        .find(|u| u.username == requested)
        .ok_or_else(|| RuntimeError::Configuration(format!("no such user in image: {}", requested)))?;

    trace!("dropping to user {:?}", user);
    std::env::set_var("HOME", &user.home_folder);

    unsafe {
        if let Some(group_id) = user.group_id {
            linux::wrap_libc_error(libc::setgid(group_id as libc::gid_t))?;
        }
        linux::wrap_libc_error(libc::setuid(user.id as libc::uid_t))?;
    }

    Ok(())
}

fn setup_dns(new_root: &Path) -> RuntimeResult<()> {
    let resolv_content = std::fs::read_to_string("/etc/resolv.conf").unwrap_or_default();
    let etc_dir = new_root.join("etc");
    std::fs::create_dir_all(&etc_dir)?;
    std::fs::write(etc_dir.join("resolv.conf"), resolv_content)?;
    Ok(())
}

fn setup_container_root(new_root: &Path) -> RuntimeResult<()> {
    setup_mounts(new_root)?;
    setup_devices(new_root)?;

    let old_root = new_root.join("old_root");
    std::fs::create_dir_all(&old_root)?;

    linux::pivot_root(new_root, &old_root)?;
    linux::chdir(Path::new("/"))?;
    linux::umount2(Path::new("/old_root"), libc::MNT_DETACH)?;
    std::fs::remove_dir("/old_root")?;

    Ok(())
}

fn setup_mounts(new_root: &Path) -> RuntimeResult<()> {
    linux::mount(Some("proc"), &new_root.join("proc"), Some("proc"), 0, None)?;
    linux::mount(Some("sysfs"), &new_root.join("sys"), Some("sysfs"), 0, None)?;
    linux::mount(
        Some("tmpfs"),
        &new_root.join("dev"),
        Some("tmpfs"),
        libc::MS_NOSUID | libc::MS_STRICTATIME,
        Some("mode=755"),
    )?;

    let devpts_path = new_root.join("dev").join("pts");
    std::fs::create_dir_all(&devpts_path)?;
    linux::mount(Some("devpts"), &devpts_path, Some("devpts"), 0, None)?;

    Ok(())
}

fn setup_devices(new_root: &Path) -> RuntimeResult<()> {
    let dev_path = new_root.join("dev");

    for (i, dev) in ["stdin", "stdout", "stderr"].iter().enumerate() {
        let _ = std::os::unix::fs::symlink(format!("/proc/self/fd/{}", i), dev_path.join(dev));
    }

    let devices: [(&str, (libc::mode_t, u32, u32)); 7] = [
        ("null", (libc::S_IFCHR, 1, 3)),
        ("zero", (libc::S_IFCHR, 1, 5)),
        ("random", (libc::S_IFCHR, 1, 8)),
        ("urandom", (libc::S_IFCHR, 1, 9)),
        ("console", (libc::S_IFCHR, 136, 1)),
        ("tty", (libc::S_IFCHR, 5, 0)),
        ("full", (libc::S_IFCHR, 1, 7)),
    ];

    for (device, (device_type, major, minor)) in devices {
        linux::mknod(&dev_path.join(device), 0o666 | device_type, libc::makedev(major, minor))?;
    }

    Ok(())
}

/// Sends `SIGTERM` to a running container's pid, per the `stop` command.
/// The upstream runtime doesn't escalate to `SIGKILL` on a timeout, so
/// neither does this - a container that ignores `SIGTERM` stays running
/// until something else reaps it.
pub fn stop(container_id: &str) -> RuntimeResult<()> {
    let info = info::load(container_id)?;
    linux::kill(info.pid, libc::SIGTERM)?;
    info::update_status(container_id, Status::Stopped)
}

/// Enters a running container's ipc/uts/net/pid/mnt namespaces and runs
/// `command` inside them, the way the `exec` subcommand re-attaches to an
/// already-running container. The upstream implementation does this via a
/// pre-main C constructor that reads `ddocker_pid`/`ddocker_cmd` from the
/// environment before the Go runtime has spawned any other OS thread -
/// `setns` on a multi-threaded caller only affects the calling thread, so
/// it has to run before anything else creates one. This binary has no
/// thread-creating runtime ahead of the CLI dispatch, so the same ordering
/// holds as long as this is the first thing the `exec` handler does.
pub fn exec_in(container_id: &str, command: &[String]) -> RuntimeResult<()> {
    let info = info::load(container_id)?;

    for ns in ["ipc", "uts", "net", "pid", "mnt"] {
        let ns_path = format!("/proc/{}/ns/{}", info.pid, ns);
        let ns_file = std::fs::File::open(&ns_path)?;
        linux::setns(ns_file.as_raw_fd(), 0)?;
    }

    match linux::fork()? {
        0 => {
            if let Err(err) = linux::exec(command) {
                error!("exec into container {} failed: {}", container_id, err);
                std::process::exit(127);
            }
            unreachable!("execvp only returns on error");
        }
        child_pid => {
            linux::waitpid(child_pid)?;
            Ok(())
        }
    }
}

pub fn remove(container_id: &str) -> RuntimeResult<()> {
    let info = info::load(container_id)?;

    if let (Some(network_name), Some(ip_address)) = (&info.network, info.endpoint_ip) {
        let manager = NetworkManager::load()?;
        let endpoint = Endpoint {
            id: format!("{}-{}", info.id, network_name),
            device: String::new(),
            ip_address,
            network: network_name.clone(),
            port_mappings: info.port_mappings.clone(),
        };
        if let Err(err) = manager.disconnect(&endpoint) {
            log::warn!("failed to release network resources for {}: {}", container_id, err);
        }
    }

    info::remove(container_id)?;
    workspace::delete_workspace(container_id, &info.volume);
    CgroupManager::for_container(container_id).destroy();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_config_roundtrips_through_json() {
        let config = InitConfig {
            root: PathBuf::from("/root/mnt/abc"),
            command: vec!["/bin/sh".into()],
            hostname: "abc".into(),
            user: Some("nobody".into()),
            env: vec![("FOO".into(), "bar".into())],
            log_path: Some(PathBuf::from("/root/ddocker-info/abc/std.log")),
        };
        let bytes = serde_json::to_vec(&config).unwrap();
        let restored: InitConfig = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(restored.root, config.root);
        assert_eq!(restored.command, config.command);
        assert_eq!(restored.hostname, config.hostname);
        assert_eq!(restored.user, config.user);
        assert_eq!(restored.env, config.env);
        assert_eq!(restored.log_path, config.log_path);
    }
}
