use super::impls::parse_log_level;
use clap::Parser;

/// Init process for a namespaced sandbox. Reads the sandbox descriptor as
/// JSON from stdin and must be started as root, as PID 1 of a fresh PID
/// namespace.
#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Set the log level to one of trace, debug, info, warn, or error.
    /// `-v` is shorthand for enabling verbose (trace) logging.
    #[arg(short = 'v',
        long,
        env = "SANDBOX_INIT_LOG_LEVEL",
        default_value = "debug",
        default_missing_value = "trace",
        num_args = 0..=1,
        require_equals = true,
        value_parser = parse_log_level
    )]
    pub log_level: log::LevelFilter,
}
