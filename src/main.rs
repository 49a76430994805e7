mod append_log;
mod batched_engine;
mod config;
mod engine;
mod error;
mod feedback;
mod history;
mod policy;
mod routes;
mod sequence_model;
mod service;
mod tokenizer;
mod types;

#[cfg(test)]
mod testing;

use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use batched_engine::BatchedEngineWrapper;
use config::{BatchConfig, Config};
use error::ServiceError;
use feedback::FeedbackLog;
use history::{HistoryConfig, HistoryStore};
use policy::ClassificationPolicy;
use routes::AppState;
use sequence_model::{SequenceModelConfig, SequenceModelEngine};
use service::PredictionService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(config.log_json);
    tracing::info!("Starting mindmate with config: {:?}", config);

    if config.model_id.is_none() && config.model_path.is_none() {
        anyhow::bail!("Either --model-id or --model-path must be provided");
    }

    let batch_config = BatchConfig::from(&config);
    let policy = ClassificationPolicy::new(config.threshold)?;

    tracing::info!("Loading model and tokenizer...");
    let (model_engine, encoder) =
        SequenceModelEngine::load(SequenceModelConfig::from(&config), config.max_sequence_length)
            .await
            .map_err(|e| {
                tracing::error!(error = %format!("{e:#}"), "Refusing to start without a model");
                ServiceError::ModelLoad(e)
            })?;
    tracing::info!(
        max_length = encoder.max_length(),
        threshold = policy.threshold(),
        "Model loaded successfully"
    );

    let (engine, processor) = BatchedEngineWrapper::new(batch_config.clone(), model_engine);

    // Spawn background task to process batches
    let processor_handle = tokio::spawn(async move {
        tracing::info!("Starting batch processor");
        if let Err(e) = processor.run_forever().await {
            tracing::error!("Batch processor error: {}", e);
        }
    });

    let history = HistoryStore::open(HistoryConfig::from(&config))?;
    let feedback = FeedbackLog::open(&config.feedback_log)?;
    let service = PredictionService::new(encoder, Arc::new(engine), policy, history);

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let app = routes::create_router(AppState::new(Arc::new(service), Arc::new(feedback)))
        .route("/metrics", get(|| async move { metric_handle.render() }))
        .layer(prometheus_layer)
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.server_address()).await?;
    tracing::info!("Server running on http://{}", config.server_address());
    tracing::info!(
        "Batch size: {}, Tick duration: {:?}",
        batch_config.batch_size,
        batch_config.tick_duration
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    // The router held the last engine handle; the processor drains and exits.
    processor_handle.await?;
    tracing::info!("Shut down cleanly");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,mindmate=debug".into());

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
