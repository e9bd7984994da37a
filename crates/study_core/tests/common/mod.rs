//! Shared wiring for the orchestrator integration tests: every port backed by the
//! in-memory implementations, with handles kept so tests can inspect and fault them.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use study_core::extraction::{ExtractionConfig, ExtractionStrategy};
use study_core::generation::{GenerateRequest, GenerationConfig, GenerationPorts, GenerationService};
use study_core::ingestion::{IngestionConfig, IngestionService};
use study_core::memory::{
    MemoryBlobStore, MemoryChargeJournal, MemoryCreditLedger, MemoryGenerationPointer,
    MemoryGenerationStore, MemoryMaterialStore, PassthroughPdfText, ScriptedModel, ScriptedOcr,
};
use uuid::Uuid;

pub struct Harness {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub materials: Arc<MemoryMaterialStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub ocr: Arc<ScriptedOcr>,
    pub generations: Arc<MemoryGenerationStore>,
    pub ledger: Arc<MemoryCreditLedger>,
    pub journal: Arc<MemoryChargeJournal>,
    pub pointer: Arc<MemoryGenerationPointer>,
    pub model: Arc<ScriptedModel>,
    pub ingestion: Arc<IngestionService>,
    pub generation: GenerationService,
}

pub struct HarnessBuilder {
    model: ScriptedModel,
    ocr: ScriptedOcr,
    balance: i64,
    ingestion: IngestionConfig,
    generation: GenerationConfig,
}

impl HarnessBuilder {
    pub fn model(mut self, model: ScriptedModel) -> Self {
        self.model = model;
        self
    }

    pub fn ocr(mut self, ocr: ScriptedOcr) -> Self {
        self.ocr = ocr;
        self
    }

    pub fn balance(mut self, balance: i64) -> Self {
        self.balance = balance;
        self
    }

    pub fn ingestion(mut self, config: IngestionConfig) -> Self {
        self.ingestion = config;
        self
    }

    pub fn generation(mut self, config: GenerationConfig) -> Self {
        self.generation = config;
        self
    }

    pub fn build(self) -> Harness {
        let user_id = Uuid::new_v4();
        let plan_id = Uuid::new_v4();

        let materials = Arc::new(MemoryMaterialStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let ocr = Arc::new(self.ocr);
        let generations = Arc::new(MemoryGenerationStore::new());
        let ledger = Arc::new(MemoryCreditLedger::with_balance(user_id, self.balance));
        let journal = Arc::new(MemoryChargeJournal::new());
        let pointer = Arc::new(MemoryGenerationPointer::new());
        let model = Arc::new(self.model);

        let extractor = Arc::new(ExtractionStrategy::new(
            blobs.clone(),
            Arc::new(PassthroughPdfText),
            ocr.clone(),
            ExtractionConfig::default().with_retry_backoff(Duration::from_millis(1)),
        ));
        let ingestion = Arc::new(IngestionService::new(materials.clone(), extractor, self.ingestion));
        let generation = GenerationService::new(
            GenerationPorts {
                generations: generations.clone(),
                materials: materials.clone(),
                ledger: ledger.clone(),
                journal: journal.clone(),
                pointer: pointer.clone(),
                model: model.clone(),
            },
            self.generation,
        );

        Harness {
            user_id,
            plan_id,
            materials,
            blobs,
            ocr,
            generations,
            ledger,
            journal,
            pointer,
            model,
            ingestion,
            generation,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            model: ScriptedModel::new(Ok(valid_document_json())),
            ocr: ScriptedOcr::new(),
            balance: 10,
            ingestion: IngestionConfig::default(),
            generation: GenerationConfig::default(),
        }
    }

    /// Stores bytes under the user's prefix and registers them on the plan.
    pub async fn upload(&self, name: &str, mime_type: &str, data: &[u8]) -> Uuid {
        let path = format!("{}/{}/{}", self.user_id, self.plan_id, name);
        self.blobs.put(&path, data.to_vec());
        self.ingestion
            .register(self.user_id, self.plan_id, &path, mime_type)
            .await
            .expect("register should succeed")
            .id
    }

    /// Registers a path that has no bytes behind it, so every download fails.
    pub async fn register_missing(&self, name: &str, mime_type: &str) -> Uuid {
        let path = format!("{}/{}/{}", self.user_id, self.plan_id, name);
        self.ingestion
            .register(self.user_id, self.plan_id, &path, mime_type)
            .await
            .expect("register should succeed")
            .id
    }

    pub fn request(&self, prompt: &str) -> GenerateRequest {
        GenerateRequest {
            user_id: self.user_id,
            generation_id: None,
            prompt: prompt.to_string(),
            language: None,
            plan_id: None,
            images: Vec::new(),
        }
    }
}

/// A model answer that passes the structural check.
pub fn valid_document_json() -> String {
    json!({
        "title": "Cell biology exam prep",
        "summary": "Membranes, organelles and cell division in four focused blocks.",
        "blocks": [
            { "title": "Membranes", "description": "Lipid bilayer and transport.", "duration_minutes": 30 },
            { "title": "Organelles", "description": "Structure and function.", "duration_minutes": 30 },
            { "title": "Mitosis", "description": "Phases and checkpoints.", "duration_minutes": 30 },
            { "title": "Review", "description": "Mixed recall.", "duration_minutes": 30 }
        ],
        "notes": [
            { "heading": "Membranes", "bullets": ["Phospholipids form a bilayer"] },
            { "heading": "Transport", "bullets": ["Diffusion needs no energy"] },
            { "heading": "Organelles", "bullets": ["Mitochondria make ATP"] },
            { "heading": "Mitosis", "bullets": ["Prophase, metaphase, anaphase, telophase"] },
            { "heading": "Checkpoints", "bullets": ["G1/S checks DNA damage"] }
        ],
        "practice_questions": [
            { "question": "What forms the membrane?", "answer": "A phospholipid bilayer." },
            { "question": "Where is ATP made?", "answer": "In mitochondria." },
            { "question": "Name the phases of mitosis.", "answer": "Prophase, metaphase, anaphase, telophase." },
            { "question": "What does active transport need?", "answer": "Energy, usually ATP." },
            { "question": "What does the G1/S checkpoint check?", "answer": "DNA damage and cell size." }
        ]
    })
    .to_string()
}
