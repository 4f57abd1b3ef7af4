use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

/// The runtime's single error type, grouped by the failure categories the
/// core needs to tell apart: configuration mistakes, missing host
/// environment, id/name collisions, resource exhaustion, kernel refusals,
/// and bookkeeping drift between the info store and the live process set.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("{0}")]
    Configuration(String),
    #[error("{0}")]
    Environment(String),
    #[error("{0}")]
    Collision(String),
    #[error("{0}")]
    ResourceExhaustion(String),
    #[error("{0}")]
    KernelRefusal(String),
    #[error("{0}")]
    BookkeepingDrift(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("libc error: {0}")]
    Libc(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    pub id: i32,
    pub group_id: Option<i32>,
    pub home_folder: PathBuf,
}

impl User {
    /// Parses `/etc/passwd`-style lines (`name:x:uid:gid:gecos:home:shell`).
    /// A missing file is not an error - containers without a passwd entry
    /// for the requested user simply run as root.
    pub fn from_passwd_file(passwd_path: &Path) -> RuntimeResult<HashMap<i32, User>> {
        let mut users = HashMap::new();

        if let Ok(mut file) = File::open(passwd_path) {
            let mut content = String::new();
            file.read_to_string(&mut content)?;

            for line in content.lines() {
                let parts = line.split(':').collect::<Vec<_>>();

                if parts.len() >= 6 {
                    let username = parts[0].to_owned();
                    let user_id = match i32::from_str(parts[2]) {
                        Ok(id) => id,
                        Err(_) => continue,
                    };
                    let group_id = i32::from_str(parts[3]).ok();
                    let home_folder = Path::new(parts[5]).to_owned();

                    users.insert(
                        user_id,
                        User {
                            username,
                            id: user_id,
                            group_id,
                            home_folder,
                        },
                    );
                }
            }
        }

        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_passwd_entries_and_skips_short_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "root:x:0:0:root:/root:/bin/bash").unwrap();
        writeln!(file, "ubuntu:x:1000:1000:Ubuntu:/home/ubuntu:/bin/sh").unwrap();
        writeln!(file, "malformed:line").unwrap();

        let users = User::from_passwd_file(&path).unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[&1000].username, "ubuntu");
        assert_eq!(users[&1000].home_folder, Path::new("/home/ubuntu"));
    }

    #[test]
    fn missing_passwd_file_is_not_an_error() {
        let users = User::from_passwd_file(Path::new("/does/not/exist")).unwrap();
        assert!(users.is_empty());
    }
}
