//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use std::sync::Arc;

use study_core::generation::GenerationService;
use study_core::ingestion::IngestionService;
use study_core::ports::BlobStore;
use uuid::Uuid;

use crate::config::Config;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ingestion: Arc<IngestionService>,
    pub generation: Arc<GenerationService>,
    pub blobs: Arc<dyn BlobStore>,
}

/// The caller asserted by the upstream auth gateway, inserted by `require_auth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser(pub Uuid);
