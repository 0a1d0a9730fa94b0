use clap::Parser;
use log::info;
use pvscan::app::{self, CommonArgs};
use pvscan::Experiment;
use std::process::ExitCode;

/// Run one configured scan
#[derive(Parser, Debug)]
#[command(name = "pvscan")]
#[command(about = "Step devices, drive shutters and grab images for one scan", long_about = None)]
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

    let shutdown_flag = match app::setup_shutdown_handler() {
        Ok(flag) => flag,
        Err(e) => return app::finish::<()>(&ctx, Err(e)),
    };

    info!("=== pvscan ===");
    let result =
        Experiment::from_config(&ctx).and_then(|experiment| experiment.run(shutdown_flag));
    app::finish(&ctx, result)
}
