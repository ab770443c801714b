#![allow(clippy::print_stdout, clippy::print_stderr)]
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::sync::mpsc::sync_channel;

use argh::FromArgs;
use eyre::{eyre, Context, Result};
use log::{info, LevelFilter};
use stderrlog::LogLevelNum;

use crate::config::Config;
use crate::edgelogd::{run, CONTROL_CHANNEL_SIZE};
use crate::metrics::LogSink;

#[derive(FromArgs)]
/// Edge log collection daemon.
struct EdgelogdArgs {
    /// use configuration file
    #[argh(option, short = 'c')]
    config_file: Option<String>,

    /// restart mode: sync every log event to disk
    #[argh(switch, short = 'r')]
    restart: bool,

    /// verbose output
    #[argh(switch, short = 'V')]
    verbose: bool,

    /// quiet - no output
    #[argh(switch, short = 'q')]
    quiet: bool,
}

fn init_logger(level: LevelFilter) {
    stderrlog::new()
        .module("edgelogd")
        .verbosity(LogLevelNum::from(level))
        .init()
        .unwrap();
}

pub fn main() {
    let args: EdgelogdArgs = argh::from_env();

    init_logger(match (args.quiet, args.verbose) {
        (true, _) => LevelFilter::Off,
        (false, true) => LevelFilter::Trace,
        _ => LevelFilter::Info,
    });

    match run_daemon(&args) {
        Ok(_) => (),
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(-1);
        }
    }
}

fn run_daemon(args: &EdgelogdArgs) -> Result<()> {
    let config_path = args.config_file.as_ref().map(Path::new);
    let config = Config::read_from_system(config_path, args.restart)
        .wrap_err(eyre!("Unable to load configuration"))?;

    info!("edgelogd starting... restarted {}", args.restart);

    // The external message bus owns the sender half; without a bus attached
    // the control plane simply stays quiet.
    let (_control_tx, control_rx) = sync_channel(CONTROL_CHANNEL_SIZE);

    run(&config, control_rx, Box::new(LogSink))
}
