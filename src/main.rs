mod core;
mod utils;
mod workers;

use crate::utils::log_file::FileLogLayer;
use crate::utils::sos::SignalOfStop;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use workers::args::{Args, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();

    // Initialize the global data directory (must happen before any persistence access)
    let data_dir = crate::utils::data_dir::init(args.conf.as_deref())?;

    // webrtc_ice reports late STUN responses as warnings; they are harmless.
    let filter = match args.verbose {
        0 => "warn,roomdrop=info,webrtc_ice=error",
        1 => "info,webrtc_ice=error",
        2 => "debug,webrtc_ice=error",
        _ => "trace",
    };

    // Peers also keep a log file; the relay logs to stderr only.
    let file_layer = match &args.command {
        Command::Peer(_) => {
            Some(FileLogLayer::new(&data_dir.join("logs").join("roomdrop.log"))?)
        }
        Command::Relay { .. } => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    match args.command {
        Command::Relay { host, port } => workers::relay::run(&host, port, sos).await,
        Command::Peer(peer) => workers::peer::run(peer, sos).await,
    }
}
