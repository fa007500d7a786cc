use std::future::ready;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::Result;
use health::HealthRegistry;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use persistence_kafka::{KafkaService, MessageHandler};
use rdkafka::message::{Message, OwnedMessage};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

mod config;

/// Acknowledges records without acting on them. Keys that need processing
/// get their own handler through `KafkaService::start_consumer`.
struct RecordLogger;

#[async_trait]
impl MessageHandler for RecordLogger {
    async fn handle_message(&self, message: &OwnedMessage) -> anyhow::Result<()> {
        info!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            "received record"
        );
        Ok(())
    }
}

fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    const BUCKETS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    Ok(PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()?)
}

fn app(liveness: HealthRegistry, recorder: PrometheusHandle) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/metrics", get(move || ready(recorder.render())))
}

async fn index() -> &'static str {
    "persistence service"
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(fmt::layer().json())
        .init();

    let config = Config::init_from_env()?;
    let liveness = HealthRegistry::new("liveness");
    let recorder = setup_metrics_recorder()?;

    let service = KafkaService::new(&config.kafka, &liveness)
        .await
        .map_err(|e| {
            error!("failed to create kafka service: {}", e);
            e
        })?;

    let shutdown = CancellationToken::new();
    for key in &config.kafka.consumer_keys.0 {
        let started = service.start_consumer(
            shutdown.clone(),
            key,
            vec![key.clone()],
            Arc::new(RecordLogger),
            config.kafka.consumer_workers_count,
        );
        if started.is_none() {
            warn!("consumer {} was not started", key);
        }
    }

    let listener = tokio::net::TcpListener::bind(config.bind()).await?;
    info!("listening on {}", listener.local_addr()?);
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app(liveness, recorder))
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    shutdown_signal().await;
    info!("shutdown signal received, stopping consumers");
    shutdown.cancel();

    if service
        .wait_for_consumers(config.shutdown_timeout.0)
        .await
        .is_err()
    {
        warn!("consumers did not stop in time, closing connections anyway");
    }
    let failures = service.close_consumers();
    if !failures.is_empty() {
        warn!("{} consumer groups failed to close cleanly", failures.len());
    }
    if let Err(e) = service.close_producer() {
        error!("failed to close kafka producer: {}", e);
    }

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("http server failed with: {}", e),
        Err(e) => error!("http server task failed with: {}", e),
    }

    info!("exiting");
    Ok(())
}
