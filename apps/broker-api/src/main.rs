use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use broker_api::broker::MessageBroker;
use broker_api::config::Config;
use broker_api::settings::BrokerSettings;
use broker_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let settings = match &config.settings_path {
        Some(path) => BrokerSettings::from_file(path),
        None => {
            tracing::info!("BROKER_CONFIG not set; using standalone settings");
            Ok(BrokerSettings::standalone())
        }
    };
    let broker = match settings
        .and_then(|s| MessageBroker::from_settings(&s))
        .and_then(|broker| broker.start().map(|_| broker))
    {
        Ok(broker) => broker,
        Err(err) => {
            tracing::error!(code = err.code(), error = %err.chain(), "broker failed to start");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let timeouts = broker.timeouts().spawn(shutdown.clone());
    let sweeper = spawn_disconnect_sweeper(Arc::clone(&broker), &config, shutdown.clone());

    let state = AppState {
        broker: Arc::clone(&broker),
        config: Arc::new(config),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(broker_api::transport::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, endpoints = ?broker.endpoint_ids(), "broker-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .expect("server error");

    shutdown.cancel();
    let _ = tokio::join!(timeouts, sweeper);
    broker.stop();
}

/// Invalidate streaming sessions whose socket has been gone longer than the
/// configured grace period.
fn spawn_disconnect_sweeper(
    broker: Arc<MessageBroker>,
    config: &Config,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let grace = config.disconnect_grace;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(grace.max(std::time::Duration::from_secs(1)) / 2);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    broker.sessions().sweep_disconnected(grace);
                }
            }
        }
    })
}
