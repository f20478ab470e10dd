use std::{error::Error, path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use liver_volumetry::{
    Config, InferenceService, OnnxModel, ScanReport, SharedModel, enums::Device,
};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Segment liver and tumor in CT/MRI volumes and report their volumes.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// ONNX model, overrides the configured path
    #[arg(short, long)]
    model: Option<PathBuf>,

    #[arg(long, value_enum)]
    device: Option<Device>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long)]
    verbose: bool,

    /// NIfTI files or DICOM series directories
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "liver-volumetry failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(model) = args.model {
        config.model_path = model;
    }
    if let Some(device) = args.device {
        config.device = device;
    }
    config.validate()?;

    let model: SharedModel =
        match OnnxModel::load(&config.model_path, config.device, config.precision) {
            Ok(model) => Arc::new(model),
            Err(err) => {
                warn!(%err, "no model available, scans are not processed");
                for input in &args.inputs {
                    print_report(&ScanReport::no_model(input))?;
                }
                return Ok(());
            }
        };

    let service = InferenceService::start(model, config)?;
    for input in args.inputs {
        let report = service.process(input).await?;
        print_report(&report)?;
    }
    service.shutdown()?;
    Ok(())
}

fn print_report(report: &ScanReport) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string(report)?);
    Ok(())
}
