//! services/api/src/bin/api.rs

use std::sync::Arc;
use std::time::Duration;

use api_lib::{
    adapters::{DbAdapter, HttpBlobStore, OpenAiLanguageModel, OpenAiOcrAdapter, PdftotextAdapter},
    config::Config,
    error::ApiError,
    web::{build_router, AppState},
};
use async_openai::{config::OpenAIConfig, Client};
use sqlx::postgres::PgPoolOptions;
use study_core::extraction::ExtractionStrategy;
use study_core::generation::{GenerationPorts, GenerationService};
use study_core::ingestion::IngestionService;
use study_core::worker::IngestionWorker;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PDF_TEXT_TIMEOUT: Duration = Duration::from_secs(30);
const BLOB_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    let db = Arc::new(DbAdapter::new(db_pool));
    info!("Running database migrations...");
    db.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize Service Adapters ---
    // A missing key is reported per request as OPENAI_KEY_MISSING rather than at startup.
    let openai_client = match &config.openai_api_key {
        Some(key) => Some(Client::with_config(OpenAIConfig::new().with_api_key(key))),
        None => {
            warn!("OPENAI_API_KEY is not set; generation and OCR requests will fail");
            None
        }
    };
    let model = Arc::new(OpenAiLanguageModel::new(
        openai_client.clone(),
        config.generation_model.clone(),
    ));
    let ocr = Arc::new(OpenAiOcrAdapter::new(openai_client, config.ocr_model.clone()));
    let pdf = Arc::new(PdftotextAdapter::new(PDF_TEXT_TIMEOUT));

    let http = reqwest::Client::builder()
        .timeout(BLOB_TIMEOUT)
        .build()
        .map_err(|e| ApiError::Internal(format!("Failed to build HTTP client: {}", e)))?;
    let blobs = Arc::new(HttpBlobStore::new(
        http,
        &config.blob_base_url,
        &config.blob_bucket,
        config.blob_service_key.clone(),
    ));

    // --- 4. Build the Orchestrators ---
    let extractor = Arc::new(ExtractionStrategy::new(
        blobs.clone(),
        pdf,
        ocr,
        config.extraction(),
    ));
    let ingestion = Arc::new(IngestionService::new(db.clone(), extractor, config.ingestion()));
    let generation = Arc::new(GenerationService::new(
        GenerationPorts {
            generations: db.clone(),
            materials: db.clone(),
            ledger: db.clone(),
            journal: db.clone(),
            pointer: db.clone(),
            model,
        },
        config.generation(),
    ));

    let app_state = Arc::new(AppState {
        config: config.clone(),
        ingestion: ingestion.clone(),
        generation,
        blobs,
    });

    // --- 5. Start the Background Ingestion Worker ---
    let shutdown = CancellationToken::new();
    let worker = IngestionWorker::new(db.clone(), ingestion, config.worker()).spawn(shutdown.clone());

    // --- 6. Start the Server ---
    let app = build_router(app_state);
    info!("Starting server on {}", config.bind_address);
    info!("Swagger UI available at http://{}/swagger-ui", config.bind_address);
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for the shutdown signal");
        }
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let server_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await?;

    shutdown.cancel();
    if let Err(e) = worker.await {
        warn!(error = %e, "Ingestion worker ended abnormally");
    }
    info!("Server stopped.");
    Ok(())
}
