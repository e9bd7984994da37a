//! services/api/src/adapters/pdf_text.rs
//!
//! PDF text-layer extraction with `pdftotext` (poppler-utils). Scanned PDFs without a
//! text layer come back as an empty string.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use study_core::ports::{PdfTextExtractor, PortError, PortResult};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

pub struct PdftotextAdapter {
    binary: String,
    timeout: Duration,
}

impl PdftotextAdapter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            binary: "pdftotext".to_string(),
            timeout,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }
}

/// Runs a command with a timeout, returning stdout as a string.
async fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> PortResult<String> {
    let output = tokio::time::timeout(timeout, cmd.kill_on_drop(true).output())
        .await
        .map_err(|_| PortError::Timeout(timeout))?
        .map_err(|e| PortError::Unexpected(format!("Failed to execute command: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PortError::Unexpected(format!(
            "Command failed ({}): {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl PdfTextExtractor for PdftotextAdapter {
    async fn extract_text(&self, pdf: &[u8]) -> PortResult<String> {
        if pdf.len() < 4 || &pdf[0..4] != b"%PDF" {
            return Err(PortError::Unexpected("File is not a valid PDF (missing %PDF header)".to_string()));
        }

        // pdftotext reads from a path.
        let mut tmpfile =
            NamedTempFile::new().map_err(|e| PortError::Unexpected(format!("Failed to create temp file: {}", e)))?;
        tmpfile
            .write_all(pdf)
            .map_err(|e| PortError::Unexpected(format!("Failed to write temp file: {}", e)))?;

        let text = run_with_timeout(
            Command::new(&self.binary)
                .arg("-enc")
                .arg("UTF-8")
                .arg(tmpfile.path())
                .arg("-"),
            self.timeout,
        )
        .await?;

        debug!(chars = text.len(), "Extracted PDF text layer");
        Ok(text.trim().to_string())
    }
}
