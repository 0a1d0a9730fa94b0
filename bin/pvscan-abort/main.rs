use clap::Parser;
use log::{info, warn};
use pvscan::app::{self, CommonArgs};
use pvscan::AbortController;
use std::process::ExitCode;

/// Abort a running scan
#[derive(Parser, Debug)]
#[command(name = "pvscan-abort")]
#[command(about = "Kill a running scan and drive its hardware to a safe state", long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> ExitCode {
    let args: Args = app::parse_args("PV_PREFIX");
    let ctx = match app::setup(&args.common) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let report = AbortController::new(&ctx).abort();
    if report.is_clean() {
        info!("Abort completed cleanly");
    } else {
        for failure in &report.failures {
            warn!("Not completed: {}", failure);
        }
    }
    ExitCode::SUCCESS
}
