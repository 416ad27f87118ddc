use clap::Parser;
use color_eyre::eyre::WrapErr;
use imgsink::{RawCopyProcessorFactory, RunReport, UploadServer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Accept a single disk image upload and write it to its destination volume.
///
/// The server exits as soon as one upload has been written successfully, or with a non-zero
/// status if anything goes wrong along the way.
#[derive(Parser, Debug)]
#[clap(author, version, long_version = long_version(), about, long_about = None)]
struct Args {
    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet")]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose")]
    quiet: bool,

    /// Write a JSON summary of the upload to this file on success.
    ///
    /// Intended for the termination message file of a container, so the orchestrator can learn
    /// whether preallocation was applied.
    #[clap(long, env = "IMGSINK_TERMINATION_MESSAGE_PATH", value_name = "PATH")]
    termination_message_path: Option<PathBuf>,

    #[clap(flatten)]
    config: imgsink::Config,
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (",
        env!("VERGEN_CARGO_TARGET_TRIPLE"),
        ")"
    )
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    init_logging(&args)?;

    let report = match run(args.config).await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Upload server failed");
            return Err(e);
        }
    };

    info!(
        preallocation_applied = report.preallocation_applied,
        "Upload complete"
    );

    if let Some(path) = args.termination_message_path {
        write_termination_message(&path, &report)?;
    }

    Ok(())
}

async fn run(config: imgsink::Config) -> color_eyre::Result<RunReport> {
    let server = UploadServer::new(config, Arc::new(RawCopyProcessorFactory))
        .wrap_err("Invalid upload server configuration")?;

    server.run().await.wrap_err("Upload failed")
}

fn init_logging(args: &Args) -> color_eyre::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default_level = if args.verbose {
        "debug"
    } else if args.quiet {
        "error"
    } else {
        "info"
    };

    // RUST_LOG always wins over the command line
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("hyper=info,rustls=info,{default_level}")))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(args.verbose))
        .try_init()?;

    Ok(())
}

fn write_termination_message(path: &Path, report: &RunReport) -> color_eyre::Result<()> {
    let message = serde_json::json!({
        "preallocationApplied": report.preallocation_applied,
    });

    std::fs::write(path, message.to_string())
        .wrap_err_with(|| format!("Error writing termination message to {}", path.display()))
}
