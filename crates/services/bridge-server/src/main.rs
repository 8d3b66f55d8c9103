//! Bridge binary entry point
//!
//! Runs the WebRTC bridge as sender or receiver against the in-process bus.
//!
//! # Usage
//!
//! ```bash
//! # Sender: listen for a receiver on the configured address
//! cargo run -p wrb-server -- --config ./config.json
//!
//! # Receiver: override mode and sender address from the command line
//! cargo run -p wrb-server -- --config ./config.json --mode receiver --addr 192.168.1.20:8080
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wrb_webrtc::bus::DEFAULT_TOPIC_CAPACITY;
use wrb_webrtc::{Bridge, BridgeConfig, DoneSignal, LocalBus, Mode, UnavailableCodec};

/// WebRTC bridge for robot messaging buses
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bridge configuration file (JSON); defaults are used when missing
    #[arg(short, long, default_value = "config.json", env = "WRB_CONFIG")]
    config: PathBuf,

    /// Override the configured mode
    #[arg(short, long)]
    mode: Option<CliMode>,

    /// Override the configured address (`host:port`)
    #[arg(short, long)]
    addr: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliMode {
    /// Publish local topics to a receiver
    Sender,
    /// Receive topics from a sender
    Receiver,
}

impl From<CliMode> for Mode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Sender => Mode::Sender,
            CliMode::Receiver => Mode::Receiver,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        eprintln!("\nCtrl+C received, shutting down...");
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(0);
        }
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("wrb-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    init_tracing();

    let mut config = BridgeConfig::load(&args.config)?;
    if let Some(mode) = args.mode {
        config = config.with_mode(mode.into());
    }
    if let Some(addr) = args.addr {
        config = config.with_addr(addr);
    }
    config.validate()?;

    info!(
        version = wrb_webrtc::version(),
        mode = %config.mode,
        addr = %config.addr,
        topics = config.topics.len(),
        "WebRTC bridge starting"
    );

    let shutdown = DoneSignal::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            while !shutdown_flag.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            info!("Shutdown signal received");
            shutdown.close();
        });
    }

    let bus = Arc::new(LocalBus::new(DEFAULT_TOPIC_CAPACITY));
    let bridge = Bridge::new(config, bus, Arc::new(UnavailableCodec));

    if let Err(e) = bridge.run(shutdown).await {
        error!("Bridge stopped with error: {}", e);
        return Err(e.into());
    }
    info!("Bridge shut down gracefully");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
