//! Event Router - Main Entry Point
//!
//! Runs the `Event -> ProcessedEvent` pipeline with a synthetic producer and
//! an HTTP ingress.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use event_router::api::{self, AppState};
use event_router::broker::{BrokerClient, InMemoryBroker};
use event_router::pipeline::build_router;
use event_router::router::SignalsHandler;
use event_router::types::{BrokerBackend, PipelineConfig};
use event_router::SyntheticProducer;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "event_router=info,tower_http=debug".into()),
        ))
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();

    // Load configuration
    let config_path = std::env::var("PIPELINE_CONFIG").ok().map(PathBuf::from);
    let config = PipelineConfig::load(config_path.as_deref()).context("failed to load configuration")?;

    info!("Starting Event Router v{}", env!("CARGO_PKG_VERSION"));
    info!(
        input = %config.topics.input,
        output = %config.topics.output,
        poison = %config.topics.poison,
        "Pipeline topics"
    );

    // Initialize components
    let broker = connect_broker(&config)?;
    let mut router = build_router(&config, Arc::clone(&broker))?;
    router.add_plugin(SignalsHandler);
    let router_state = router.state_watch();

    let shutdown = CancellationToken::new();
    let mut background = Vec::new();

    if config.producer.enabled {
        let producer = SyntheticProducer::from_config(Arc::clone(&broker), &config);
        let token = shutdown.clone();
        background.push(tokio::spawn(async move {
            producer.run(token).await;
        }));
    }

    if config.http.enabled {
        let state = Arc::new(AppState {
            broker: Arc::clone(&broker),
            config: config.clone(),
            router_state,
        });
        let app = api::build_app(state);
        let addr = SocketAddr::from(([0, 0, 0, 0], config.http.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!("Listening on http://{}", addr);

        let token = shutdown.clone();
        background.push(tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = server.await {
                error!(error = %e, "HTTP server failed");
            }
        }));
    }

    // Run until a signal or a fatal startup error
    let result = router.run(shutdown.clone()).await;
    shutdown.cancel();
    for task in background {
        if let Err(e) = task.await {
            if e.is_panic() {
                error!(error = %e, "Background task panicked");
            }
        }
    }
    result?;

    info!("Event Router stopped");
    Ok(())
}

/// Connect the configured broker client. Failure here is fatal.
fn connect_broker(config: &PipelineConfig) -> Result<Arc<dyn BrokerClient>> {
    match config.broker.backend {
        BrokerBackend::Memory => {
            info!(partitions = config.broker.partitions, "Using in-memory broker");
            Ok(Arc::new(InMemoryBroker::from_config(&config.broker)))
        }
        #[cfg(feature = "kafka")]
        BrokerBackend::Kafka => {
            let broker = event_router::broker::KafkaBroker::connect(&config.broker)
                .context("failed to connect to Kafka")?;
            Ok(Arc::new(broker))
        }
        #[cfg(not(feature = "kafka"))]
        BrokerBackend::Kafka => {
            anyhow::bail!("broker.backend = \"kafka\" requires building with the `kafka` feature")
        }
    }
}
