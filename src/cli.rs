use std::io::Read;

use log::info;
use structopt::StructOpt;

use crate::cgroup::subsystem::ResourceConfig;
use crate::container::{self, RunSpec};
use crate::info;
use crate::model::{RuntimeError, RuntimeResult};
use crate::network::NetworkManager;

#[derive(StructOpt)]
#[structopt(name = "ddocker", about = "a minimal Linux container runtime")]
pub enum Opt {
    /// Create and run a new container.
    Run {
        /// Keep this container's own stdio instead of logging to a file.
        #[structopt(long = "it")]
        tty: bool,

        #[structopt(short, long)]
        detach: bool,

        #[structopt(long)]
        name: Option<String>,

        #[structopt(short = "v", long)]
        volume: Option<String>,

        #[structopt(long = "mm")]
        memory: Option<String>,

        #[structopt(long = "cpushare")]
        cpu_shares: Option<String>,

        #[structopt(long)]
        cpuset: Option<String>,

        #[structopt(long)]
        net: Option<String>,

        #[structopt(short = "p", long = "port")]
        port_mappings: Vec<String>,

        #[structopt(short = "e", long = "env")]
        env: Vec<String>,

        #[structopt(short, long)]
        user: Option<String>,

        image: String,

        command: Vec<String>,
    },

    /// List known containers and their status.
    Ps,

    /// Print a container's captured stdout/stderr.
    Logs { container: String },

    /// Run a command inside an already-running container's namespaces.
    Exec { container: String, command: Vec<String> },

    /// Send SIGTERM to a running container.
    Stop { container: String },

    /// Delete a stopped or exited container's bookkeeping and workspace.
    Rm { container: String },

    /// Repackage a container's current filesystem as a new image tar.
    Commit { container: String, image_name: String },

    /// Manage bridge networks.
    Network(NetworkCommand),
}

#[derive(StructOpt)]
pub enum NetworkCommand {
    Create {
        #[structopt(long, default_value = "bridge")]
        driver: String,
        #[structopt(long)]
        subnet: String,
        name: String,
    },
    List,
    Remove {
        name: String,
    },
}

pub fn dispatch(opt: Opt) -> RuntimeResult<()> {
    match opt {
        Opt::Run { tty, detach, name, volume, memory, cpu_shares, cpuset, net, port_mappings, env, user, image, command } => {
            if command.is_empty() {
                return Err(RuntimeError::Configuration("no command given to run".to_owned()));
            }
            if tty && detach {
                return Err(RuntimeError::Configuration("-it and -d cannot both be given".to_owned()));
            }

            let resource_config =
                ResourceConfig { memory_limit: memory.unwrap_or_default(), cpu_shares: cpu_shares.unwrap_or_default(), cpuset: cpuset.unwrap_or_default() };

            let port_mappings = port_mappings
                .iter()
                .map(|raw| parse_port_mapping(raw))
                .collect::<RuntimeResult<Vec<_>>>()?;

            let env = env.iter().map(|raw| parse_env_var(raw)).collect::<RuntimeResult<Vec<_>>>()?;

            container::run(RunSpec {
                name,
                image,
                command,
                volume: volume.unwrap_or_default(),
                resource_config,
                network: net,
                port_mappings,
                env,
                tty,
                detach,
                user,
            })
        }

        Opt::Ps => {
            let infos = info::list()?;
            println!("{:<12}{:<8}{:<16}{:<10}{:<24}{:<22}{}", "ID", "PID", "NAME", "STATUS", "COMMAND", "CREATE", "NETWORK");
            for info in infos {
                let pid = if info.status == info::Status::Running { info.pid.to_string() } else { String::new() };
                println!(
                    "{:<12}{:<8}{:<16}{:<10}{:<24}{:<22}{}",
                    info.id,
                    pid,
                    info.name,
                    info.status.as_str(),
                    info.command.join(" "),
                    info.created_time,
                    info.network.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }

        Opt::Logs { container } => {
            let info = info::resolve(&container)?;
            let mut content = String::new();
            std::fs::File::open(info::log_path(&info.id))?.read_to_string(&mut content)?;
            print!("{}", content);
            Ok(())
        }

        Opt::Exec { container, command } => {
            if command.is_empty() {
                return Err(RuntimeError::Configuration("no command given to exec".to_owned()));
            }
            let info = info::resolve(&container)?;
            container::exec_in(&info.id, &command)
        }

        Opt::Stop { container } => {
            let info = info::resolve(&container)?;
            container::stop(&info.id)
        }

        Opt::Rm { container } => {
            let info = info::resolve(&container)?;
            container::remove(&info.id)
        }

        Opt::Commit { container, image_name } => {
            let info = info::resolve(&container)?;
            commit(&info.id, &image_name)
        }

        Opt::Network(cmd) => dispatch_network(cmd),
    }
}

fn dispatch_network(cmd: NetworkCommand) -> RuntimeResult<()> {
    match cmd {
        NetworkCommand::Create { driver, subnet, name } => {
            let mut manager = NetworkManager::load()?;
            manager.create(&driver, &subnet, &name)
        }
        NetworkCommand::List => {
            let manager = NetworkManager::load()?;
            println!("{:<16}{:<20}{}", "NAME", "SUBNET", "DRIVER");
            for network in manager.list() {
                println!("{:<16}{:<20}{}", network.name, network.subnet, network.driver);
            }
            Ok(())
        }
        NetworkCommand::Remove { name } => {
            let mut manager = NetworkManager::load()?;
            manager.delete(&name)
        }
    }
}

/// Packages a container's current overlay mount point as `<image_name>.tar`
/// under the image root, via the external `tar` binary - the runtime
/// never implements tar encoding itself.
fn commit(container_id: &str, image_name: &str) -> RuntimeResult<()> {
    let mount_point = crate::workspace::mount_point(container_id);
    let tar_path = format!("/root/{}.tar", image_name);

    info!("committing {} to {}", container_id, tar_path);
    let output = std::process::Command::new("tar")
        .args(["-czf", &tar_path, "-C", mount_point.to_str().unwrap(), "."])
        .output()?;

    if !output.status.success() {
        return Err(RuntimeError::Environment(format!("tar commit failed: {}", String::from_utf8_lossy(&output.stderr))));
    }

    Ok(())
}

fn parse_env_var(raw: &str) -> RuntimeResult<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| RuntimeError::Configuration(format!("bad env var: {}", raw)))?;
    Ok((key.to_owned(), value.to_owned()))
}

fn parse_port_mapping(raw: &str) -> RuntimeResult<(u16, u16)> {
    let (host, container) = raw
        .split_once(':')
        .ok_or_else(|| RuntimeError::Configuration(format!("bad port mapping: {}", raw)))?;

    let host: u16 = host.parse().map_err(|_| RuntimeError::Configuration(format!("bad host port: {}", raw)))?;
    let container: u16 = container.parse().map_err(|_| RuntimeError::Configuration(format!("bad container port: {}", raw)))?;

    Ok((host, container))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_port_mapping() {
        assert_eq!(parse_port_mapping("8080:80").unwrap(), (8080, 80));
    }

    #[test]
    fn rejects_malformed_port_mappings() {
        assert!(parse_port_mapping("8080").is_err());
        assert!(parse_port_mapping("abc:80").is_err());
        assert!(parse_port_mapping("8080:xyz").is_err());
    }

    #[test]
    fn parses_well_formed_env_var() {
        assert_eq!(parse_env_var("FOO=bar").unwrap(), ("FOO".to_owned(), "bar".to_owned()));
        assert_eq!(parse_env_var("FOO=bar=baz").unwrap(), ("FOO".to_owned(), "bar=baz".to_owned()));
    }

    #[test]
    fn rejects_env_var_without_equals_sign() {
        assert!(parse_env_var("FOO").is_err());
    }
}
