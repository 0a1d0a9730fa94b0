use clap::Parser;
use log::info;
use pvscan::app::{self, CommonArgs};
use pvscan::{MultiRunner, RunPlan};
use std::process::ExitCode;

/// Repeat a scan script
#[derive(Parser, Debug)]
#[command(name = "pvscan-multi")]
#[command(about = "Run the configured scan script one or more times", long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Number of scans; defaults to the N_SCANS PV
    #[arg(value_name = "N_SCANS")]
    n_scans: Option<u32>,
}

fn main() -> ExitCode {
    let args: Args = app::parse_args("PV_PREFIX [N_SCANS]");
    let ctx = match app::setup(&args.common) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = RunPlan::from_config(&ctx, args.n_scans).and_then(|plan| {
        info!("Run {}: {} scan(s) of {}", plan.run_id(), plan.n_scans, plan.script);
        MultiRunner::new(&ctx, plan).run()
    });
    if let Ok(report) = &result {
        info!("{} scan(s) started", report.scans_started);
    }
    app::finish(&ctx, result)
}
