//! Entry point for reanalysis-fetch.
//! Parses the command line, sets up logging and maps the command's outcome to an exit code.

use clap::Parser;
use reanalysis_fetch::cli::{error_exit_code, execute, Args};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let code = match execute(&args) {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            error!(fatal = e.is_fatal(), "{e}");
            eprintln!("Error: {e}");
            error_exit_code(&e)
        }
    };
    std::process::exit(code);
}
