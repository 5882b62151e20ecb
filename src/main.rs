use anyhow::Context;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Exit code for contract violations and storage errors.
const EXIT_ERROR: u8 = 2;

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("GROUNDTRUTH_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    match groundtruth::run().context("groundtruth failed") {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(EXIT_ERROR)
        }
    }
}
