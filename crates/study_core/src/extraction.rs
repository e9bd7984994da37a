//! crates/study_core/src/extraction.rs
//!
//! Turns a stored file into text: direct UTF-8 decode, PDF text layer, or OCR for images.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::domain::Material;
use crate::ports::{BlobStore, OcrService, PdfTextExtractor, PortError};

/// Fixed instruction sent along with every image.
pub const OCR_INSTRUCTION: &str = "Extract all readable text from this image. Preserve the structure \
(headings, lists, tables) and write formulas in plain text or LaTeX. Return only the extracted text.";

/// How a file is read, decided from its declared MIME type with the extension as fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialKind {
    Pdf,
    Image,
    Text,
}

impl MaterialKind {
    pub fn infer(mime_type: &str, path: &str) -> Self {
        let mime = mime_type.trim().to_lowercase();
        if mime == "application/pdf" {
            return MaterialKind::Pdf;
        }
        if mime.starts_with("image/") {
            return MaterialKind::Image;
        }
        if !mime.is_empty() && mime != "application/octet-stream" {
            return MaterialKind::Text;
        }

        let extension = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "pdf" => MaterialKind::Pdf,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "heic" | "bmp" | "tif" | "tiff" => MaterialKind::Image,
            _ => MaterialKind::Text,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Download failed: {0}")]
    Download(PortError),
    #[error("Could not decode text: {0}")]
    Decode(String),
    #[error("PDF text extraction failed: {0}")]
    Pdf(PortError),
    #[error("OCR failed: {0}")]
    Ocr(PortError),
}

/// Anything that can turn a registered material into text.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, material: &Material) -> Result<String, ExtractionError>;
}

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub ocr_timeout: Duration,
    /// Total OCR attempts, including the first.
    pub ocr_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            ocr_timeout: Duration::from_secs(45),
            ocr_attempts: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl ExtractionConfig {
    pub fn with_ocr_timeout(mut self, timeout: Duration) -> Self {
        self.ocr_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// Dispatches each material to the right reader.
pub struct ExtractionStrategy {
    blobs: Arc<dyn BlobStore>,
    pdf: Arc<dyn PdfTextExtractor>,
    ocr: Arc<dyn OcrService>,
    config: ExtractionConfig,
}

impl ExtractionStrategy {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        pdf: Arc<dyn PdfTextExtractor>,
        ocr: Arc<dyn OcrService>,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            blobs,
            pdf,
            ocr,
            config,
        }
    }

    /// Extracts text from bytes that are already in memory.
    pub async fn extract_bytes(
        &self,
        data: &[u8],
        mime_type: &str,
        path: &str,
    ) -> Result<String, ExtractionError> {
        match MaterialKind::infer(mime_type, path) {
            // Scanned PDFs without a text layer come back empty; there is no OCR fallback.
            MaterialKind::Pdf => self.pdf.extract_text(data).await.map_err(ExtractionError::Pdf),
            MaterialKind::Image => self.recognize_with_retry(data, mime_type).await,
            MaterialKind::Text => decode_text(data),
        }
    }

    async fn recognize_with_retry(&self, data: &[u8], mime_type: &str) -> Result<String, ExtractionError> {
        let attempts = self.config.ocr_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = tokio::time::timeout(
                self.config.ocr_timeout,
                self.ocr
                    .recognize(data, mime_type, OCR_INSTRUCTION, self.config.ocr_timeout),
            )
            .await
            .unwrap_or(Err(PortError::Timeout(self.config.ocr_timeout)));

            match result {
                Ok(text) => return Ok(text.trim().to_string()),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(attempt, error = %e, "OCR attempt failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(ExtractionError::Ocr(e)),
            }
        }
    }
}

#[async_trait]
impl Extractor for ExtractionStrategy {
    async fn extract(&self, material: &Material) -> Result<String, ExtractionError> {
        let data = self
            .blobs
            .download(&material.file_path)
            .await
            .map_err(ExtractionError::Download)?;
        debug!(material_id = %material.id, bytes = data.len(), "Downloaded material");
        self.extract_bytes(&data, &material.mime_type, &material.file_path).await
    }
}

fn decode_text(data: &[u8]) -> Result<String, ExtractionError> {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    String::from_utf8(data.to_vec()).map_err(|e| ExtractionError::Decode(e.to_string()))
}
