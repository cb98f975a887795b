//! CLI for the tether offloading frontend.
//!
//! Resets the target with a serial break, opens the port, forwards the
//! downstream argv, then serves offloaded calls until the target exits
//! or the channel dies. Set `FRONTEND_DEBUG` for verbose traces.

#![allow(clippy::print_stderr, clippy::missing_docs_in_private_items)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tether::{send_break, Frontend, SerialPort, Status};

#[derive(Parser)]
#[command(
    name = "tether",
    version,
    about = "Host frontend for serialized function offloading"
)]
struct Cli {
    /// Serial device connected to the target (e.g. /dev/ttyACM0).
    #[arg(long, short = 'p')]
    port: PathBuf,

    /// Arguments forwarded to the target program (after --).
    #[arg(last = true)]
    target_args: Vec<String>,
}

fn main() {
    match run(&Cli::parse()) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("tether: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    // Reset the target. A failed break is reported but not fatal; the
    // port may still carry a target that never went away.
    if let Err(e) = send_break(&cli.port) {
        eprintln!("tether: reset on {} failed: {e}", cli.port.display());
    }

    let port = SerialPort::open(&cli.port)
        .with_context(|| format!("failed to open {}", cli.port.display()))?;

    let mut frontend = Frontend::new(port);
    frontend
        .hello(&cli.target_args)
        .context("handshake failed")?;

    let status = frontend.run();
    #[allow(clippy::cast_possible_wrap)]
    let code = match status {
        Status::Exited => frontend.exit_code() as i32,
        other => other.code(),
    };
    Ok(code)
}
