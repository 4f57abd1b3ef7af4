use std::ffi::{c_int, c_ulong, c_void, CStr, CString};
use std::path::Path;

use crate::model::{RuntimeError, RuntimeResult};

/// Thin wrappers around the handful of raw syscalls the lifecycle engine
/// needs (mount, pivot_root, clone, setns, ...). Every wrapper turns a
/// negative libc return value into a `RuntimeError::Libc` carrying
/// `strerror`, so call sites read like plain Rust and never touch `errno`.
pub fn mount(
    src: Option<&str>,
    target: &Path,
    fstype: Option<&str>,
    flags: c_ulong,
    data: Option<&str>,
) -> RuntimeResult<()> {
    let src = src.map(|x| CString::new(x).unwrap());
    let target = CString::new(target.to_str().unwrap()).unwrap();
    let fstype = fstype.map(|x| CString::new(x).unwrap());
    let data = data.map(|x| CString::new(x).unwrap());

    unsafe {
        let result = libc::mount(
            src.as_ref().map(|x| x.as_ptr() as *const _).unwrap_or(std::ptr::null()),
            target.as_ptr() as *const _,
            fstype.as_ref().map(|x| x.as_ptr() as *const _).unwrap_or(std::ptr::null()),
            flags,
            data.as_ref().map(|x| x.as_ptr() as *const _).unwrap_or(std::ptr::null()),
        );

        if result == 0 {
            Ok(())
        } else {
            Err(RuntimeError::KernelRefusal(format!("mount failed: {}", extract_libc_error_message())))
        }
    }
}

pub fn umount2(target: &Path, flags: c_int) -> RuntimeResult<()> {
    let target = CString::new(target.to_str().unwrap()).unwrap();
    unsafe {
        wrap_libc_error(libc::umount2(target.as_ptr(), flags))?;
    }
    Ok(())
}

/// Atomically swaps the calling process's root filesystem. `new_root` must
/// already be a mount point and must not share a mount with `put_old`.
pub fn pivot_root(new_root: &Path, put_old: &Path) -> RuntimeResult<()> {
    let new_root = CString::new(new_root.to_str().unwrap()).unwrap();
    let put_old = CString::new(put_old.to_str().unwrap()).unwrap();
    unsafe {
        wrap_libc_error(libc::syscall(libc::SYS_pivot_root, new_root.as_ptr(), put_old.as_ptr()) as i32)?;
    }
    Ok(())
}

pub fn chdir(path: &Path) -> RuntimeResult<()> {
    let path = CString::new(path.to_str().unwrap()).unwrap();
    unsafe {
        wrap_libc_error(libc::chdir(path.as_ptr()))?;
    }
    Ok(())
}

pub fn sethostname(name: &str) -> RuntimeResult<()> {
    let name = CString::new(name).unwrap();
    unsafe {
        wrap_libc_error(libc::sethostname(name.as_ptr(), name.as_bytes().len()))?;
    }
    Ok(())
}

/// Replaces the calling process's image with `command`, PATH-resolving
/// `command[0]` and inheriting the current environment. Never returns on
/// success.
pub fn exec(command: &[String]) -> RuntimeResult<()> {
    if command.is_empty() {
        return Err(RuntimeError::Configuration("missing container command".to_owned()));
    }

    let command = command.iter().map(|part| CString::new(part.as_str()).unwrap()).collect::<Vec<_>>();
    let mut command_ptrs = command.iter().map(|part| part.as_ptr()).collect::<Vec<_>>();
    command_ptrs.push(std::ptr::null());

    unsafe {
        if libc::execvp(command_ptrs[0], command_ptrs.as_ptr()) == 0 {
            Ok(())
        } else {
            Err(RuntimeError::KernelRefusal(format!("execve failed: {}", extract_libc_error_message())))
        }
    }
}

pub fn waitpid(pid: i32) -> RuntimeResult<i32> {
    unsafe {
        let mut status: c_int = 0;
        wrap_libc_error(libc::waitpid(pid, &mut status as *mut c_int, 0))?;
        Ok(status)
    }
}

pub fn kill(pid: i32, signal: c_int) -> RuntimeResult<()> {
    unsafe {
        wrap_libc_error(libc::kill(pid, signal))?;
    }
    Ok(())
}

pub fn setns(fd: c_int, nstype: c_int) -> RuntimeResult<()> {
    unsafe {
        wrap_libc_error(libc::setns(fd, nstype))?;
    }
    Ok(())
}

/// Forks the calling process. Returns `0` in the child, the child's pid in
/// the parent.
pub fn fork() -> RuntimeResult<i32> {
    unsafe { wrap_libc_error(libc::fork()) }
}

/// Opens a pipe, returning `(read_fd, write_fd)`.
pub fn pipe() -> RuntimeResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        wrap_libc_error(libc::pipe(fds.as_mut_ptr()))?;
    }
    Ok((fds[0], fds[1]))
}

pub fn dup2(old_fd: c_int, new_fd: c_int) -> RuntimeResult<()> {
    unsafe {
        wrap_libc_error(libc::dup2(old_fd, new_fd))?;
    }
    Ok(())
}

pub fn close(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

pub fn mknod(path: &Path, mode: libc::mode_t, dev: libc::dev_t) -> RuntimeResult<()> {
    let path = CString::new(path.to_str().unwrap()).unwrap();
    unsafe {
        wrap_libc_error(libc::mknod(path.as_ptr(), mode, dev))?;
    }
    Ok(())
}

/// Clones a new process, running `callback(arg)` in the child on its own
/// stack. `flags` carries the `CLONE_NEW*` namespace bits plus `SIGCHLD`
/// so the child can be reaped with a plain `waitpid`.
pub fn clone_process(
    flags: c_int,
    callback: extern "C" fn(*mut c_void) -> c_int,
    arg: *mut c_void,
    stack: &mut [u8],
) -> RuntimeResult<i32> {
    unsafe {
        wrap_libc_error(libc::clone(
            callback,
            stack.as_mut_ptr().add(stack.len()) as *mut c_void,
            flags,
            arg,
        ))
    }
}

pub fn wrap_libc_error(result: i32) -> RuntimeResult<i32> {
    if result >= 0 {
        Ok(result)
    } else {
        Err(RuntimeError::Libc(extract_libc_error_message()))
    }
}

pub fn extract_libc_error_message() -> String {
    unsafe {
        let error_message = CStr::from_ptr(libc::strerror(*libc::__errno_location()));
        error_message.to_str().unwrap().to_owned()
    }
}
