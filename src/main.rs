#![allow(
    clippy::collapsible_else_if,
    clippy::collapsible_if,
    clippy::module_inception,
    clippy::needless_range_loop,
    clippy::result_map_unit_fn,
    clippy::useless_format
)]
#![deny(
    clippy::get_unwrap,
    clippy::panic,
    clippy::print_stdout,
    clippy::unwrap_used,
    clippy::use_debug,
    clippy::used_underscore_binding,
    clippy::used_underscore_items
)]

mod config;
mod control;
mod display;
mod init;
mod logger;
mod net;
mod process;
mod rootfs;
mod types;
mod util;

use clap::Parser;
use config::cli;
use log::{Log, error};

pub fn main() {
    let logger = match logger::InitLogger::new(log::LevelFilter::Trace).init() {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("E Failed to initialize logger: {}", e);
            std::process::exit(1);
        }
    };
    let cli: cli::Args = cli::Args::parse();
    logger.set_level(cli.log_level);

    // Before any thread exists, so every thread inherits the mask
    let result = process::block_signals().and_then(|_| init::run(logger));
    if let Err(e) = result {
        error!("{:#}", e);
        logger.flush();
        std::process::exit(1);
    }
    logger.flush();
}
