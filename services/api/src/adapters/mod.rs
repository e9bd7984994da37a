pub mod blob;
pub mod db;
pub mod llm;
pub mod ocr;
pub mod pdf_text;

pub use blob::HttpBlobStore;
pub use db::DbAdapter;
pub use llm::OpenAiLanguageModel;
pub use ocr::OpenAiOcrAdapter;
pub use pdf_text::PdftotextAdapter;
