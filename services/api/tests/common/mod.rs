//! Router wiring for the HTTP tests: the real `build_router` over in-memory ports.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use api_lib::config::Config;
use api_lib::web::{build_router, AppState};
use axum::body::{to_bytes, Body};
use axum::http::{header::CONTENT_TYPE, Method, Request};
use axum::response::Response;
use axum::Router;
use serde_json::{json, Value};
use study_core::extraction::{ExtractionConfig, ExtractionStrategy};
use study_core::generation::{GenerationPorts, GenerationService};
use study_core::ingestion::IngestionService;
use study_core::memory::{
    MemoryBlobStore, MemoryChargeJournal, MemoryCreditLedger, MemoryGenerationPointer,
    MemoryGenerationStore, MemoryMaterialStore, PassthroughPdfText, ScriptedModel, ScriptedOcr,
};
use tower::ServiceExt;
use uuid::Uuid;

pub const FULFILLMENT_SECRET: &str = "test-fulfillment-secret";

pub struct TestApp {
    pub router: Router,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub blobs: Arc<MemoryBlobStore>,
    pub ledger: Arc<MemoryCreditLedger>,
    pub model: Arc<ScriptedModel>,
}

/// Builds a `Config` from literal settings instead of the process environment.
pub fn test_config(fulfillment: bool) -> Config {
    Config::from_lookup(|key| match key {
        "DATABASE_URL" => Some("postgres://localhost/unused".to_string()),
        "BLOB_BASE_URL" => Some("http://localhost/storage/v1".to_string()),
        "FULFILLMENT_SECRET" if fulfillment => Some(FULFILLMENT_SECRET.to_string()),
        _ => None,
    })
    .expect("test config should load")
}

pub fn build_test_app(model: ScriptedModel, balance: i64) -> TestApp {
    build_test_app_with(model, balance, true)
}

pub fn build_test_app_with(model: ScriptedModel, balance: i64, fulfillment: bool) -> TestApp {
    let config = Arc::new(test_config(fulfillment));
    let user_id = Uuid::new_v4();
    let plan_id = Uuid::new_v4();

    let materials = Arc::new(MemoryMaterialStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let ledger = Arc::new(MemoryCreditLedger::with_balance(user_id, balance));
    let model = Arc::new(model);

    let extractor = Arc::new(ExtractionStrategy::new(
        blobs.clone(),
        Arc::new(PassthroughPdfText),
        Arc::new(ScriptedOcr::new().then(Ok("Text read from the image".to_string()))),
        ExtractionConfig::default().with_retry_backoff(Duration::from_millis(1)),
    ));
    let ingestion = Arc::new(IngestionService::new(materials.clone(), extractor, config.ingestion()));
    let generation = Arc::new(GenerationService::new(
        GenerationPorts {
            generations: Arc::new(MemoryGenerationStore::new()),
            materials,
            ledger: ledger.clone(),
            journal: Arc::new(MemoryChargeJournal::new()),
            pointer: Arc::new(MemoryGenerationPointer::new()),
            model: model.clone(),
        },
        config.generation(),
    ));

    let state = Arc::new(AppState {
        config,
        ingestion,
        generation,
        blobs: blobs.clone(),
    });

    TestApp {
        router: build_router(state),
        user_id,
        plan_id,
        blobs,
        ledger,
        model,
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond")
    }

    pub async fn get(&self, uri: &str) -> Response {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("x-user-id", self.user_id.to_string())
            .body(Body::empty())
            .expect("request should build");
        self.send(request).await
    }

    pub async fn post_json(&self, uri: &str, body: Value) -> Response {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("x-user-id", self.user_id.to_string())
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build");
        self.send(request).await
    }

    /// Puts bytes in blob storage under the user's prefix and registers them.
    pub async fn register(&self, name: &str, mime_type: &str, data: &[u8]) -> Response {
        let path = format!("{}/{}/{}", self.user_id, self.plan_id, name);
        self.blobs.put(&path, data.to_vec());
        self.post_json(
            &format!("/plans/{}/materials", self.plan_id),
            json!({ "file_path": path, "mime_type": mime_type }),
        )
        .await
    }
}

pub async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should be readable");
    serde_json::from_slice(&bytes).expect("body should be JSON")
}

/// A model answer that passes the structural check.
pub fn valid_document_json() -> String {
    json!({
        "title": "Photosynthesis review",
        "summary": "Light reactions, the Calvin cycle and limiting factors.",
        "blocks": [
            { "title": "Light reactions", "description": "Photosystems and ATP.", "duration_minutes": 30 },
            { "title": "Calvin cycle", "description": "Carbon fixation.", "duration_minutes": 30 },
            { "title": "Limiting factors", "description": "Light, CO2, temperature.", "duration_minutes": 30 },
            { "title": "Review", "description": "Mixed recall.", "duration_minutes": 30 }
        ],
        "notes": [
            { "heading": "Chloroplasts", "bullets": ["Thylakoids hold chlorophyll"] },
            { "heading": "Light reactions", "bullets": ["Water is split, oxygen released"] },
            { "heading": "Calvin cycle", "bullets": ["RuBisCO fixes CO2"] },
            { "heading": "Products", "bullets": ["Glucose is built from G3P"] },
            { "heading": "Limits", "bullets": ["The scarcest factor sets the rate"] }
        ],
        "practice_questions": [
            { "question": "Where do light reactions happen?", "answer": "In the thylakoid membranes." },
            { "question": "Which enzyme fixes CO2?", "answer": "RuBisCO." },
            { "question": "What gas is released?", "answer": "Oxygen." },
            { "question": "What does the Calvin cycle produce?", "answer": "G3P." },
            { "question": "Name a limiting factor.", "answer": "Light intensity." }
        ]
    })
    .to_string()
}
