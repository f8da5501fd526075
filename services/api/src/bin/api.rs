//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{DbAdapter, HttpBlobStore, HttpWorkerAdapter, OpenAiSpeechAdapter},
    config::Config,
    error::ApiError,
    web::{
        billing_webhook_handler, completed_callback_handler, failed_callback_handler,
        get_job_handler, get_latest_job_handler, get_position_handler, get_usage_handler,
        list_pages_handler, list_sentences_handler, page_callback_handler,
        progress_callback_handler, rest::ApiDoc, sentence_audio_handler, state::AppState,
        submit_job_handler, update_position_handler, upload_document_handler, wait_job_handler,
    },
};
use async_openai::{
    config::OpenAIConfig,
    types::audio::{SpeechModel, Voice},
    Client,
};
use axum::{
    extract::DefaultBodyLimit,
    http::{
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

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
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let db_adapter = Arc::new(DbAdapter::new(db_pool.clone()));
    info!("Running database migrations...");
    db_adapter.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize Service Adapters ---
    let http_client = reqwest::Client::new();
    let worker_adapter = Arc::new(HttpWorkerAdapter::new(
        http_client.clone(),
        config.worker_base_url.clone(),
    ));
    let blob_adapter = Arc::new(HttpBlobStore::new(
        http_client,
        config.storage_base_url.clone(),
        config.storage_service_key.clone(),
    ));

    let openai_config = OpenAIConfig::new().with_api_key(
        config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| ApiError::Internal("OPENAI_API_KEY is required".to_string()))?,
    );
    let openai_client = Client::with_config(openai_config);

    let tts_voice = match config.tts_voice.to_lowercase().as_str() {
        "alloy" => Voice::Alloy,
        "echo" => Voice::Echo,
        "fable" => Voice::Fable,
        "onyx" => Voice::Onyx,
        "nova" => Voice::Nova,
        "shimmer" => Voice::Shimmer,
        _ => {
            return Err(ApiError::Internal(format!(
                "Invalid TTS voice specified in config: '{}'",
                config.tts_voice
            )))
        }
    };
    let speech_adapter = Arc::new(OpenAiSpeechAdapter::new(
        openai_client,
        SpeechModel::Tts1Hd,
        tts_voice,
    ));

    // --- 4. Build the Shared AppState ---
    let app_state = Arc::new(AppState::new(
        db_adapter,
        config.clone(),
        worker_adapter,
        speech_adapter,
        blob_adapter,
    ));

    let cors = CorsLayer::new()
        .allow_origin("http://localhost:3000".parse::<HeaderValue>().unwrap())
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, ACCEPT]);

    // --- 5. Create the Web Router ---
    // Client-facing routes.
    let client_routes = Router::new()
        .route("/documents", post(upload_document_handler))
        .route("/jobs", post(submit_job_handler))
        .route("/jobs/{job_id}", get(get_job_handler))
        .route("/jobs/{job_id}/wait", get(wait_job_handler))
        .route("/usage", get(get_usage_handler))
        .route("/documents/{document_id}/jobs/latest", get(get_latest_job_handler))
        .route("/documents/{document_id}/pages", get(list_pages_handler))
        .route("/documents/{document_id}/sentences", get(list_sentences_handler))
        .route(
            "/documents/{document_id}/sentences/{sequence}/audio",
            get(sentence_audio_handler),
        )
        .route(
            "/documents/{document_id}/position",
            get(get_position_handler).put(update_position_handler),
        );

    // Worker callbacks and the billing-provider webhook. These are reached
    // only from inside the deployment perimeter.
    let intake_routes = Router::new()
        .route("/internal/jobs/{job_id}/pages", post(page_callback_handler))
        .route("/internal/jobs/{job_id}/progress", post(progress_callback_handler))
        .route("/internal/jobs/{job_id}/complete", post(completed_callback_handler))
        .route("/internal/jobs/{job_id}/fail", post(failed_callback_handler))
        .route("/billing/events", post(billing_webhook_handler));

    // Combine API routes
    let api_router = Router::new()
        .merge(client_routes)
        .merge(intake_routes)
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024))
        .layer(cors)
        .with_state(app_state);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 6. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
