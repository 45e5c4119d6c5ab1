use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use clearwell::app_state::AppState;
use clearwell::config::AppConfig;
use clearwell::routes;
use clearwell::services::{gemini::GeminiClient, queue::QueueCoordinator};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing clearwell server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");

    metrics::describe_counter!("clearwell_jobs_submitted_total", "Jobs accepted into the queue");
    metrics::describe_counter!(
        "clearwell_uploads_rejected_total",
        "Uploaded files rejected by validation"
    );
    metrics::describe_counter!("clearwell_jobs_completed_total", "Jobs completed");
    metrics::describe_counter!("clearwell_jobs_failed_total", "Jobs that failed");
    metrics::describe_counter!(
        "clearwell_jobs_discarded_total",
        "Call outcomes dropped because the job was removed"
    );
    metrics::describe_gauge!("clearwell_queue_depth", "Jobs currently waiting in the queue");
    metrics::describe_histogram!(
        "clearwell_transform_seconds",
        "Latency of calls to the transformation service"
    );

    // Initialize the transformation client and the queue in front of it
    tracing::info!(model = %config.gemini_model, "Initializing Gemini client");
    let client = GeminiClient::new(
        &config.gemini_base_url,
        &config.gemini_model,
        &config.gemini_api_key,
    );
    let queue = QueueCoordinator::new(Arc::new(client), config.queue_settings());
    queue.start();

    let state = AppState::from_config(queue.clone(), &config);

    let app = routes::router(state, config.max_request_bytes)
        .merge(routes::metrics::router(prometheus_handle));

    tracing::info!("Starting clearwell on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .expect("Server error");

    queue.shutdown();
}
