use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_relay::config::{self, AppConfig};
use live_relay::ingest::{IngestAdapter, RtmpIngest, RtpIngest};
use live_relay::state::AppState;
use live_relay::web;
use live_relay::webrtc::RtcTransportFactory;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// live-relay command line arguments
#[derive(Parser, Debug)]
#[command(name = "live-relay")]
#[command(version, about = "Relay RTMP/RTP live streams to WebRTC viewers", long_about = None)]
struct CliArgs {
    /// Path to a TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address for the HTTP server (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    bind: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// RTMP ingest port (overrides config)
    #[arg(long, value_name = "PORT")]
    rtmp_port: Option<u16>,

    /// Disable the RTMP ingest listener
    #[arg(long)]
    no_rtmp: bool,

    /// Disable the RTP/UDP ingest listener
    #[arg(long)]
    no_rtp: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting live-relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(args.config.as_deref()).await?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    let transports = Arc::new(RtcTransportFactory::new(config.webrtc.clone()));
    let state = AppState::new(config.clone(), transports);

    // Ingest listeners: a bind failure is fatal, a later transport failure is not
    let mut adapters: Vec<Arc<dyn IngestAdapter>> = Vec::new();
    if config.ingest.rtmp.enabled {
        let rtmp = RtmpIngest::bind(config.ingest.rtmp.clone(), state.registry.clone()).await?;
        adapters.push(Arc::new(rtmp));
    } else {
        tracing::info!("RTMP ingest disabled");
    }
    if config.ingest.rtp.enabled {
        let rtp = RtpIngest::bind(config.ingest.rtp.clone(), state.registry.clone()).await?;
        adapters.push(Arc::new(rtp));
    } else {
        tracing::info!("RTP ingest disabled");
    }

    for adapter in adapters {
        let kind = adapter.kind();
        let shutdown = state.shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = adapter.run(shutdown).await {
                tracing::error!("{} ingest stopped: {}", kind, e);
            }
        });
    }

    state.sessions.start_reaper(state.shutdown.child_token());

    let app = web::create_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.web.bind_address, config.web.http_port)
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", config.web.bind_address))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    let shutdown = state.shutdown.clone();
    let shutdown_signal = async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for CTRL+C: {}", e);
                }
                tracing::info!("Shutdown signal received");
            }
            _ = shutdown.cancelled() => {}
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
    {
        tracing::error!("HTTP server error: {}", e);
    }

    cleanup(&state).await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Apply command-line overrides on top of the loaded configuration
fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(bind) = &args.bind {
        config.web.bind_address = bind.clone();
    }
    if let Some(port) = args.http_port {
        config.web.http_port = port;
    }
    if let Some(port) = args.rtmp_port {
        config.ingest.rtmp.port = port;
    }
    if args.no_rtmp {
        config.ingest.rtmp.enabled = false;
    }
    if args.no_rtp {
        config.ingest.rtp.enabled = false;
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "live_relay=error,tower_http=error",
        LogLevel::Warn => "live_relay=warn,tower_http=warn",
        LogLevel::Info => "live_relay=info,tower_http=info",
        LogLevel::Verbose => "live_relay=debug,tower_http=info",
        LogLevel::Debug => "live_relay=debug,tower_http=debug,webrtc=info",
        LogLevel::Trace => "live_relay=trace,tower_http=debug,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Tear down sessions, then channels
async fn cleanup(state: &Arc<AppState>) {
    tracing::info!(
        "Closing {} sessions and {} channels",
        state.sessions.session_count().await,
        state.registry.len()
    );
    state.shutdown().await;
}
