use anyhow::{Context, Result};
use boardvoice_relay::config::BackendKind;
use boardvoice_relay::session::VadHook;
use boardvoice_relay::vad::NatsVadScorer;
use boardvoice_relay::{
    create_router, AppState, Config, ConnectionRegistry, EventRouter, MockBackend, NatsBackend,
    SessionManager, TranscriptionBackend,
};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "boardvoice-relay")]
#[command(about = "Real-time audio transcription relay for the board game voice assistant")]
struct Args {
    /// Config file path (extension optional)
    #[arg(short, long, default_value = "config/boardvoice-relay")]
    config: String,

    /// Override the bind address
    #[arg(long)]
    bind: Option<String>,

    /// Override the HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the transcription backend
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;
    if let Some(bind) = args.bind {
        cfg.service.http.bind = bind;
    }
    if let Some(port) = args.port {
        cfg.service.http.port = port;
    }
    if let Some(kind) = args.backend {
        cfg.backend.kind = kind;
    }

    let filter = EnvFilter::try_new(&cfg.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    if cfg.logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));

    let sample_rate = cfg.relay.sample_rate;
    let mut nats_client = None;
    let backend: Arc<dyn TranscriptionBackend> = match cfg.backend.kind {
        BackendKind::Mock => {
            info!("Using mock transcription backend");
            Arc::new(MockBackend::new())
        }
        BackendKind::Nats => {
            let nats = NatsBackend::connect(&cfg.backend, sample_rate).await?;
            nats_client = Some(nats.client().clone());
            Arc::new(nats)
        }
    };

    let vad = if cfg.vad.enabled {
        let client = match nats_client {
            Some(client) => client,
            None => async_nats::connect(cfg.backend.nats_url.as_str())
                .await
                .with_context(|| format!("Failed to connect to NATS at {}", cfg.backend.nats_url))?,
        };
        info!("Voice activity scoring enabled on {}", cfg.vad.subject);
        Some(VadHook {
            scorer: Arc::new(NatsVadScorer::new(client, cfg.vad.subject.clone(), sample_rate)),
            timeout: Duration::from_millis(cfg.vad.timeout_ms),
        })
    } else {
        None
    };

    let router = EventRouter::new(ConnectionRegistry::new(), cfg.relay.event_feed_capacity);
    let manager = SessionManager::new(backend, router, cfg.relay.clone(), vad);
    let app = create_router(AppState::new(manager.clone()));

    let addr: SocketAddr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port)
        .parse()
        .context("Invalid bind address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("🚀 Relay listening on http://{}", addr);
    info!("   WebSocket: ws://{}/ws", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down, stopping live sessions");
    manager.stop_all().await;
    info!("Relay shut down");

    Ok(())
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}
