mod cgroup;
mod cli;
mod container;
mod helpers;
mod info;
mod linux;
mod model;
mod network;
mod workspace;

use structopt::StructOpt;

fn main() {
    init_logger(log::LevelFilter::Info);

    let opt = cli::Opt::from_args();
    if let Err(err) = cli::dispatch(opt) {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

/// Structured stderr logging in the style the rest of the stack expects:
/// a timestamp, the level, the module path, and the message. Containers'
/// own stdout/stderr are captured separately to their log files, so this
/// is purely the runtime's own diagnostic trail.
fn init_logger(level: log::LevelFilter) {
    let result = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply();

    if let Err(err) = result {
        eprintln!("failed to initialize logger: {}", err);
    }
}
