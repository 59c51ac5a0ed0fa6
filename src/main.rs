use std::{
    process::ExitCode,
    sync::{Arc, atomic::AtomicBool},
};

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::error;

use chanbridge::{bootstrap, config::Args, logging, transaction::TransactionLoop};

fn main() -> ExitCode {
    logging::init();
    let args = Args::parse();

    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&shutdown)) {
        error!(error = %e, "failed to register SIGINT handler");
        return ExitCode::FAILURE;
    }
    if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown)) {
        error!(error = %e, "failed to register SIGTERM handler");
        return ExitCode::FAILURE;
    }

    let bootstrapped = match bootstrap::run(&args) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "bootstrap failed");
            return ExitCode::FAILURE;
        }
    };

    let mut bridge = TransactionLoop::new(
        bootstrapped.spi,
        bootstrapped.irq,
        bootstrapped.sync,
        bootstrapped.channels,
    );

    match bridge.run(&shutdown) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "bridge exited");
            ExitCode::FAILURE
        }
    }
}
