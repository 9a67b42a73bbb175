use rustsible_local::cli::{self, LocalArgs};
use rustsible_local::executor::PlayRecap;

use env_logger::Builder;
use log::{warn, LevelFilter};
use std::io::Write;
use std::process;

fn main() {
    let matches = cli::build_cli().get_matches();

    let log_level = match matches.get_count("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    // Custom log format
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .filter_level(log_level)
        .init();

    let code = match LocalArgs::from_matches(&matches).and_then(|args| rustsible_local::run(&args)) {
        Ok(recaps) => exit_code(&recaps),
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            1
        }
    };
    process::exit(code);
}

/// 0 when every play ran cleanly, 2 when a play had failed hosts.
fn exit_code(recaps: &[PlayRecap]) -> i32 {
    let failed: Vec<&str> = recaps
        .iter()
        .filter(|r| r.has_failures())
        .map(|r| r.play.as_str())
        .collect();
    if failed.is_empty() {
        0
    } else {
        warn!("Plays with failed hosts: {}", failed.join(", "));
        2
    }
}
