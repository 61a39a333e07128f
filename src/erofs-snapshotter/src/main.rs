use clap::Parser;
use containerd_snapshots as snapshots;
use log::{error, info, LevelFilter};
use snapshots::tonic::transport::Server;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;

use erofs_snapshotter::config::SnapshotterConfig;
use erofs_snapshotter::snapshotter::ErofsSnapshotter;

#[derive(Parser, Debug)]
#[command(about = "EROFS snapshotter for containerd")]
struct Args {
    /// Listen socket for the snapshot service.
    #[arg(long)]
    address: PathBuf,

    /// State directory.
    #[arg(long)]
    root: PathBuf,

    /// containerd's own socket, recorded for tooling.
    #[arg(long)]
    containerd_address: Option<String>,

    /// Log level: off, error, warn, info, debug, trace.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.log_level.parse::<LevelFilter>() {
        Ok(level) => level,
        Err(_) => {
            eprintln!("invalid log level: {}", args.log_level);
            return ExitCode::from(2);
        }
    };
    env_logger::Builder::new().filter_level(level).init();

    let mut config = match SnapshotterConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err}");
            return ExitCode::from(2);
        }
    };
    config.root = args.root.clone();
    if args.containerd_address.is_some() {
        config.containerd_address = args.containerd_address.clone();
    }

    let snapshotter = match ErofsSnapshotter::new(config) {
        Ok(snapshotter) => Arc::new(snapshotter),
        Err(err) => {
            error!("failed to initialise snapshotter at {}: {err}", args.root.display());
            return ExitCode::FAILURE;
        }
    };

    // A stale socket from a previous run would make the bind fail.
    if args.address.exists() {
        if let Err(err) = std::fs::remove_file(&args.address) {
            error!("cannot remove stale socket {}: {err}", args.address.display());
            return ExitCode::FAILURE;
        }
    }
    let listener = match UnixListener::bind(&args.address) {
        Ok(listener) => listener,
        Err(err) => {
            error!("cannot bind {}: {err}", args.address.display());
            return ExitCode::FAILURE;
        }
    };
    info!("listening on {}", args.address.display());

    let served = Arc::clone(&snapshotter);
    let result = Server::builder()
        .add_service(snapshots::server(served))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await;

    snapshotter.shutdown().await;
    let _ = std::fs::remove_file(&args.address);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("serve failed: {err}");
            ExitCode::FAILURE
        }
    }
}
