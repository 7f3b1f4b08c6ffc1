mod config;
mod protocol;
mod relay;
mod session;
mod telephony;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use config::Config;
use relay::{ConnectionManager, RelaySettings};
use session::SessionStore;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// Correlation records written by provider webhooks, read by relays.
    pub sessions: SessionStore,
    /// Voice-service connector shared by every call.
    pub voice: Arc<ConnectionManager>,
    /// Buffer policy copied into each relay.
    pub relay: RelaySettings,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("--version") => println!("media-bridge {VERSION}"),
        Some("--help") | Some("-h") => print_usage(),
        Some(other) => {
            eprintln!("Unknown option: {other}");
            print_usage();
            std::process::exit(1);
        }
        None => {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("Failed to create tokio runtime: {e}");
                    std::process::exit(1);
                }
            };
            rt.block_on(server());
        }
    }
}

fn print_usage() {
    println!("media-bridge {VERSION}");
    println!("Relays telephony call audio to a remote voice service");
    println!();
    println!("Usage: media-bridge [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --version   Print version");
    println!("  --help, -h  Print this help message");
    println!();
    println!("Without options, starts the bridge server.");
    println!("Config: $MEDIA_BRIDGE_CONFIG or ~/.media-bridge/config.toml");
}

async fn server() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "media_bridge=info,tower_http=info".into()),
        )
        .init();

    // wss:// voice endpoints need a process-wide TLS provider.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("TLS crypto provider already installed");
    }

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let voice = match ConnectionManager::from_config(&config.voice) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            eprintln!("Invalid voice service settings: {e}");
            std::process::exit(1);
        }
    };

    if config.server.domain.is_empty() {
        tracing::warn!("server.domain is not set, stream flow URLs will have no host");
    }

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        voice_url = %config.voice.ws_url,
        flush_threshold = config.relay.flush_threshold,
        "Starting media-bridge"
    );

    let state = AppState {
        relay: RelaySettings::from(&config.relay),
        sessions: SessionStore::new(),
        voice,
        config: config.clone(),
    };

    let app = Router::new()
        // Telephony media stream (WebSocket)
        .route(
            "/api/v1/calls/media-stream",
            get(telephony::media::handle_media_upgrade),
        )
        // Call flow: points the provider at the media stream
        .route("/api/v1/calls/flow", post(telephony::flow::handle_flow))
        // Call lifecycle notifications
        .route(
            "/api/v1/webhooks/receiver",
            post(telephony::webhook::handle_receiver),
        )
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = match format!("{}:{}", config.server.host, config.server.port).parse() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Invalid server address: {e}");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(%addr, "Listening");

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {e}");
        std::process::exit(1);
    }
}

async fn health() -> &'static str {
    "ok"
}
