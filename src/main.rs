//! Entry point: `resolverd <address> [<config-path>]`.
//!
//! Grounded on `main()` in `examples/original_source/src/main.c` for the
//! overall startup sequence (bind control listener, load config, activate
//! configured services, run the reactor loop) and on
//! `systemd-rs/crates/resolved/src/main.rs` in this codebase for the
//! `clap`/logging scaffolding shape.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use resolverd::error;
use resolverd::supervisor::Manager;
use resolverd::{config, logging};

/// Resolve an interface to a service address, activating the owning
/// service's child process on first contact.
#[derive(Parser, Debug)]
#[command(name = "resolverd", version, about)]
struct Cli {
    /// Listenable address for this daemon's own control IPC, `unix:<path>`.
    address: String,

    /// Optional JSON file describing services to register at startup.
    config_path: Option<PathBuf>,

    /// Increase logging verbosity; may be repeated.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::setup_logging(cli.verbose as i8);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), error::Error> {
    let mut manager = Manager::new(&cli.address)?;

    if let Some(path) = &cli.config_path {
        let config = config::load(path)?;
        manager.add_services(config.services)?;
    }

    manager.activate_configured_services();

    log::info!("resolverd listening on {}", cli.address);
    while manager.step()? {}
    log::info!("resolverd shutting down");
    Ok(())
}
