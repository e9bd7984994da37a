pub mod document;
pub mod domain;
pub mod error;
pub mod extraction;
pub mod generation;
pub mod ingestion;
pub mod language;
pub mod memory;
pub mod normalize;
pub mod ports;
pub mod schedule;
pub mod worker;

pub use document::StudyDocument;
pub use domain::{ChargeState, Generation, GenerationStatus, LedgerOutcome, Material, MaterialStatus};
pub use error::ServiceError;
pub use extraction::{ExtractionConfig, ExtractionStrategy, Extractor};
pub use generation::{GenerateRequest, GenerationConfig, GenerationOutcome, GenerationPorts, GenerationService};
pub use ingestion::{IngestionConfig, IngestionService, IngestionStatus, KickReport};
pub use language::Language;
pub use ports::{
    BlobStore, ChargeJournal, CreditLedger, CurrentGenerationPointer, GenerationStore, LanguageModel,
    MaterialStore, OcrService, PdfTextExtractor, PortError, PortResult,
};
pub use worker::{IngestionWorker, WorkerConfig};
