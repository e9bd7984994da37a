//! crates/study_core/src/ingestion.rs
//!
//! The material ingestion orchestrator. The `materials` rows act as a job queue:
//! `kick` is one drain step that claims every eligible row of a plan and pushes it
//! through extraction in small concurrent batches.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{ClaimWindow, Material, MaterialStatus};
use crate::error::ServiceError;
use crate::extraction::{Extractor, MaterialKind};
use crate::ports::MaterialStore;

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Maximum materials per plan.
    pub max_files: usize,
    /// Maximum image materials per plan.
    pub max_images: usize,
    /// Materials processed concurrently within one batch.
    pub batch_width: usize,
    /// Extracted text is clipped to this many characters.
    pub text_cap: usize,
    /// A `processing` row older than this is considered abandoned.
    pub processing_lease: Duration,
    /// A `failed` row becomes eligible again after this long.
    pub failed_cooldown: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_files: 10,
            max_images: 6,
            batch_width: 2,
            text_cap: 60_000,
            processing_lease: Duration::from_secs(600),
            failed_cooldown: Duration::from_secs(60),
        }
    }
}

impl IngestionConfig {
    pub fn with_limits(mut self, max_files: usize, max_images: usize) -> Self {
        self.max_files = max_files;
        self.max_images = max_images;
        self
    }

    pub fn with_text_cap(mut self, text_cap: usize) -> Self {
        self.text_cap = text_cap;
        self
    }

    pub fn with_processing_lease(mut self, lease: Duration) -> Self {
        self.processing_lease = lease;
        self
    }

    pub fn with_failed_cooldown(mut self, cooldown: Duration) -> Self {
        self.failed_cooldown = cooldown;
        self
    }

    /// The claim window as of now.
    pub fn claim_window(&self) -> ClaimWindow {
        ClaimWindow::at(
            Utc::now(),
            chrono::Duration::from_std(self.failed_cooldown).unwrap_or(chrono::Duration::zero()),
            chrono::Duration::from_std(self.processing_lease).unwrap_or(chrono::Duration::zero()),
        )
    }
}

/// What happened to one material during a drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterialOutcome {
    pub material_id: Uuid,
    pub status: MaterialStatus,
    pub error: Option<String>,
    pub attempts: u32,
}

/// Result of one `kick`. The call itself always succeeds once it starts mutating;
/// partial failure shows up per item.
#[derive(Debug, Clone, Serialize)]
pub struct KickReport {
    pub ok: bool,
    pub processed_count: usize,
    pub failed_count: usize,
    pub items: Vec<MaterialOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterialStatusItem {
    pub id: Uuid,
    pub status: MaterialStatus,
    pub error: Option<String>,
}

/// Polling view of a plan's materials.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionStatus {
    pub items: Vec<MaterialStatusItem>,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
}

impl IngestionStatus {
    /// True once every material reached a terminal state.
    pub fn settled(&self) -> bool {
        self.processed + self.failed == self.total
    }
}

pub struct IngestionService {
    store: Arc<dyn MaterialStore>,
    extractor: Arc<dyn Extractor>,
    config: IngestionConfig,
}

impl IngestionService {
    pub fn new(store: Arc<dyn MaterialStore>, extractor: Arc<dyn Extractor>, config: IngestionConfig) -> Self {
        Self {
            store,
            extractor,
            config,
        }
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    /// Registers a file the client already put into blob storage under its own prefix.
    pub async fn register(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        file_path: &str,
        mime_type: &str,
    ) -> Result<Material, ServiceError> {
        let prefix = format!("{}/", user_id);
        if !file_path.starts_with(&prefix) || file_path.contains("..") {
            return Err(ServiceError::InvalidInput(format!(
                "file path must live under '{}'",
                prefix
            )));
        }
        if file_path.len() <= prefix.len() {
            return Err(ServiceError::InvalidInput("file path is empty".to_string()));
        }

        self.ensure_capacity(user_id, plan_id, file_path, mime_type).await?;

        let material = Material::new_uploaded(user_id, plan_id, file_path, mime_type.trim());
        let stored = self
            .store
            .insert_material(material)
            .await
            .map_err(ServiceError::from_storage)?;
        info!(material_id = %stored.id, %plan_id, "Registered material");
        Ok(stored)
    }

    /// Fails with `TooManyFiles` when one more file of this kind would push the plan past
    /// its file or image limit.
    pub async fn ensure_capacity(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        file_path: &str,
        mime_type: &str,
    ) -> Result<(), ServiceError> {
        let existing = self
            .store
            .list_materials(user_id, plan_id)
            .await
            .map_err(ServiceError::from_storage)?;
        if existing.len() >= self.config.max_files {
            return Err(ServiceError::TooManyFiles {
                count: existing.len() + 1,
                max: self.config.max_files,
            });
        }
        if MaterialKind::infer(mime_type, file_path) == MaterialKind::Image {
            let images = existing.iter().filter(|m| m.is_image()).count();
            if images >= self.config.max_images {
                return Err(ServiceError::TooManyFiles {
                    count: images + 1,
                    max: self.config.max_images,
                });
            }
        }
        Ok(())
    }

    pub async fn status(&self, user_id: Uuid, plan_id: Uuid) -> Result<IngestionStatus, ServiceError> {
        let materials = self
            .store
            .list_materials(user_id, plan_id)
            .await
            .map_err(ServiceError::from_storage)?;

        let items: Vec<MaterialStatusItem> = materials
            .into_iter()
            .map(|m| MaterialStatusItem {
                id: m.id,
                status: m.status,
                error: m.last_error,
            })
            .collect();
        let processed = items.iter().filter(|i| i.status == MaterialStatus::Processed).count();
        let failed = items.iter().filter(|i| i.status == MaterialStatus::Failed).count();

        Ok(IngestionStatus {
            total: items.len(),
            processed,
            failed,
            items,
        })
    }

    /// Drains every claimable material of a plan. Safe to call repeatedly.
    #[instrument(skip(self), fields(%user_id, %plan_id))]
    pub async fn kick(&self, user_id: Uuid, plan_id: Uuid) -> Result<KickReport, ServiceError> {
        let materials = self
            .store
            .list_materials(user_id, plan_id)
            .await
            .map_err(ServiceError::from_storage)?;

        let images = materials.iter().filter(|m| m.is_image()).count();
        if materials.len() > self.config.max_files {
            return Err(ServiceError::TooManyFiles {
                count: materials.len(),
                max: self.config.max_files,
            });
        }
        if images > self.config.max_images {
            return Err(ServiceError::TooManyFiles {
                count: images,
                max: self.config.max_images,
            });
        }

        let window = self.config.claim_window();
        let mut candidates: Vec<Material> = materials
            .into_iter()
            .filter(|m| m.is_claimable(&window))
            .collect();
        candidates.sort_by_key(|m| m.created_at);

        if candidates.is_empty() {
            return Ok(KickReport {
                ok: true,
                processed_count: 0,
                failed_count: 0,
                items: Vec::new(),
            });
        }
        info!(candidates = candidates.len(), "Starting material drain");

        let mut items = Vec::with_capacity(candidates.len());
        for batch in candidates.chunks(self.config.batch_width.max(1)) {
            let results = join_all(batch.iter().map(|m| self.process_one(m, window))).await;
            items.extend(results.into_iter().flatten());
        }

        let processed_count = items.iter().filter(|i| i.status == MaterialStatus::Processed).count();
        let failed_count = items.iter().filter(|i| i.status == MaterialStatus::Failed).count();
        info!(processed_count, failed_count, "Material drain finished");

        Ok(KickReport {
            ok: true,
            processed_count,
            failed_count,
            items,
        })
    }

    /// Claims, extracts (retrying once), and records the terminal state of one material.
    /// Returns `None` if another drain claimed it first.
    async fn process_one(&self, material: &Material, window: ClaimWindow) -> Option<MaterialOutcome> {
        let user_id = material.user_id;
        let id = material.id;

        match self.store.claim_material(user_id, id, window).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                error!(material_id = %id, error = %e, "Failed to claim material");
                return Some(MaterialOutcome {
                    material_id: id,
                    status: material.status,
                    error: Some(e.to_string()),
                    attempts: 0,
                });
            }
        }

        let mut attempts = 1;
        let mut result = self.extractor.extract(material).await;
        if let Err(e) = &result {
            warn!(material_id = %id, error = %e, "Extraction failed, retrying once");
            attempts += 1;
            result = self.extractor.extract(material).await;
        }

        match result {
            Ok(text) => {
                let clipped: String = text.chars().take(self.config.text_cap).collect();
                let stored = (!clipped.trim().is_empty()).then_some(clipped);
                match self.store.mark_processed(user_id, id, stored).await {
                    Ok(()) => Some(MaterialOutcome {
                        material_id: id,
                        status: MaterialStatus::Processed,
                        error: None,
                        attempts,
                    }),
                    Err(e) => {
                        error!(material_id = %id, error = %e, "Failed to store extracted text");
                        Some(MaterialOutcome {
                            material_id: id,
                            status: MaterialStatus::Processing,
                            error: Some(e.to_string()),
                            attempts,
                        })
                    }
                }
            }
            Err(e) => {
                let message = e.to_string();
                warn!(material_id = %id, error = %message, "Extraction failed twice");
                if let Err(store_err) = self.store.mark_failed(user_id, id, &message).await {
                    error!(material_id = %id, error = %store_err, "Failed to record extraction failure");
                    return Some(MaterialOutcome {
                        material_id: id,
                        status: MaterialStatus::Processing,
                        error: Some(message),
                        attempts,
                    });
                }
                Some(MaterialOutcome {
                    material_id: id,
                    status: MaterialStatus::Failed,
                    error: Some(message),
                    attempts,
                })
            }
        }
    }
}
