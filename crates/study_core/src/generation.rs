//! crates/study_core/src/generation.rs
//!
//! The generation orchestrator: validate, price, check balance, call the model (with one
//! repair attempt), normalize, persist, and only then charge. The charge runs as a small
//! saga recorded in the charge journal so a failure after charging is always compensated.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::document::StudyDocument;
use crate::domain::{ChargeState, Generation, LedgerOutcome, MaterialStatus};
use crate::error::ServiceError;
use crate::language::Language;
use crate::normalize::{check_shape, normalize, parse_model_json};
use crate::ports::{
    ChargeJournal, CompletionRequest, CreditLedger, CurrentGenerationPointer, GenerationStore,
    InlineImage, LanguageModel, MaterialStore, PortError,
};

const SYSTEM_PROMPT: &str = "You are a study planning assistant. Build a study plan for the learner's request \
and any attached material. Respond with a single JSON object that matches the provided schema: a title, a short \
summary, 4 to 12 study blocks with durations in minutes, 5 to 10 note sections with bullet points, an optional \
day-by-day schedule with HH:MM session times, and 5 to 20 practice questions with answers.";

const REPAIR_INSTRUCTION: &str = "Your previous answer could not be used. Return JSON only: one object that \
strictly follows the schema, with no Markdown, no code fences and no commentary.";

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_prompt_chars: usize,
    /// Inline images plus plan materials.
    pub max_files: usize,
    pub base_cost: i64,
    /// One extra credit per this many images. Zero disables image pricing.
    pub images_per_extra_credit: usize,
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Budget for extracted material text appended to the model input.
    pub max_material_chars: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_prompt_chars: 4000,
            max_files: 10,
            base_cost: 1,
            images_per_extra_credit: 3,
            timeout: Duration::from_secs(60),
            max_tokens: 4096,
            temperature: 0.4,
            max_material_chars: 60_000,
        }
    }
}

impl GenerationConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_pricing(mut self, base_cost: i64, images_per_extra_credit: usize) -> Self {
        self.base_cost = base_cost;
        self.images_per_extra_credit = images_per_extra_credit;
        self
    }

    pub fn with_limits(mut self, max_prompt_chars: usize, max_files: usize) -> Self {
        self.max_prompt_chars = max_prompt_chars;
        self.max_files = max_files;
        self
    }

    /// Credits charged for a generation with `image_count` inline images.
    pub fn cost_for(&self, image_count: usize) -> i64 {
        if self.images_per_extra_credit == 0 || image_count == 0 {
            return self.base_cost;
        }
        let extra = image_count.div_ceil(self.images_per_extra_credit);
        self.base_cost + extra as i64
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub user_id: Uuid,
    /// Client-chosen id; replaying it never charges twice.
    pub generation_id: Option<Uuid>,
    pub prompt: String,
    pub language: Option<String>,
    /// Processed materials of this plan are appended to the model input.
    pub plan_id: Option<Uuid>,
    pub images: Vec<InlineImage>,
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub generation_id: Uuid,
    pub document: StudyDocument,
    pub credits_charged: i64,
    /// True when this id had already been paid for and only the content was regenerated.
    pub already_charged: bool,
}

/// Every port the orchestrator talks to.
#[derive(Clone)]
pub struct GenerationPorts {
    pub generations: Arc<dyn GenerationStore>,
    pub materials: Arc<dyn MaterialStore>,
    pub ledger: Arc<dyn CreditLedger>,
    pub journal: Arc<dyn ChargeJournal>,
    pub pointer: Arc<dyn CurrentGenerationPointer>,
    pub model: Arc<dyn LanguageModel>,
}

/// Why a single model attempt could not be used.
#[derive(Debug)]
enum AttemptFailure {
    Port(PortError),
    Invalid(String),
}

impl AttemptFailure {
    fn is_fatal(&self) -> bool {
        matches!(
            self,
            AttemptFailure::Port(PortError::NotConfigured(_)) | AttemptFailure::Port(PortError::Unauthorized)
        )
    }

    fn into_service_error(self) -> ServiceError {
        match self {
            AttemptFailure::Port(e) => ServiceError::from_model(e),
            AttemptFailure::Invalid(reason) => ServiceError::InvalidStructuredOutput(reason),
        }
    }
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptFailure::Port(e) => write!(f, "{}", e),
            AttemptFailure::Invalid(reason) => write!(f, "{}", reason),
        }
    }
}

pub struct GenerationService {
    ports: GenerationPorts,
    config: GenerationConfig,
}

impl GenerationService {
    pub fn new(ports: GenerationPorts, config: GenerationConfig) -> Self {
        Self { ports, config }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    #[instrument(skip(self, request), fields(user_id = %request.user_id, generation_id = tracing::field::Empty))]
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerationOutcome, ServiceError> {
        let user_id = request.user_id;

        // 1. Validate input. Nothing is written before this passes.
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(ServiceError::InvalidInput("prompt must not be empty".to_string()));
        }
        let prompt_len = prompt.chars().count();
        if prompt_len > self.config.max_prompt_chars {
            return Err(ServiceError::PromptTooLong {
                len: prompt_len,
                max: self.config.max_prompt_chars,
            });
        }
        let language = match request.language.as_deref() {
            Some(code) => Language::from_code(code)
                .ok_or_else(|| ServiceError::InvalidInput(format!("unsupported language '{}'", code)))?,
            None => Language::detect(prompt),
        };
        let material_text = self.collect_material_text(&request).await?;

        // 2. Price.
        let cost = self.config.cost_for(request.images.len());
        let generation_id = request.generation_id.unwrap_or_else(Uuid::new_v4);
        tracing::Span::current().record("generation_id", tracing::field::display(generation_id));

        // Idempotency: a charged id only gets its content regenerated.
        let existing_charge = self
            .ports
            .journal
            .find_charge(user_id, generation_id)
            .await
            .map_err(ServiceError::from_storage)?;
        let already_charged = matches!(
            existing_charge.as_ref().map(|c| c.state),
            Some(ChargeState::Charged)
        );

        // 3. Advisory balance check.
        if !already_charged {
            let balance = self.ports.ledger.get_balance(user_id).await.map_err(|e| {
                error!(error = %e, "Credit ledger unreadable");
                ServiceError::Misconfigured("credit ledger is unreadable".to_string())
            })?;
            if balance < cost {
                info!(balance, cost, "Insufficient credits");
                return Err(ServiceError::InsufficientCredits { balance, cost });
            }
        }

        // 4. Audit anchor.
        if !already_charged {
            self.ports
                .generations
                .begin_generation(user_id, generation_id, prompt, language.code())
                .await
                .map_err(ServiceError::from_storage)?;
        }
        info!(%generation_id, cost, already_charged, language = language.code(), "Generation started");

        // 5. Model call with one repair attempt.
        let raw = match self
            .call_model(prompt, language, material_text.as_deref(), &request.images)
            .await
        {
            Ok(raw) => raw,
            Err(failure) => {
                let err = failure.into_service_error();
                warn!(%generation_id, code = err.code(), "Generation failed at the model step");
                if !already_charged {
                    self.fail_row(user_id, generation_id, err.code()).await;
                }
                return Err(err);
            }
        };

        // 6. Normalize. Cannot fail.
        let document = normalize(&raw, language, prompt);

        // 7. Persist.
        if let Err(e) = self
            .ports
            .generations
            .complete_generation(user_id, generation_id, &document)
            .await
        {
            let err = ServiceError::from_storage(e);
            error!(%generation_id, error = %err, "Failed to persist generated document");
            if !already_charged {
                self.fail_row(user_id, generation_id, err.code()).await;
            }
            return Err(err);
        }

        // 8. Charge.
        let credits_charged = if already_charged {
            existing_charge.map(|c| c.amount).unwrap_or(cost)
        } else {
            self.charge(user_id, generation_id, cost).await?;
            cost
        };

        // 9. Best-effort pointer.
        if let Err(e) = self
            .ports
            .pointer
            .set_current_generation(user_id, generation_id)
            .await
        {
            warn!(%generation_id, error = %e, "Failed to update current generation pointer");
        }

        info!(%generation_id, credits_charged, "Generation done");
        Ok(GenerationOutcome {
            generation_id,
            document,
            credits_charged,
            already_charged,
        })
    }

    pub async fn get_generation(&self, user_id: Uuid, generation_id: Uuid) -> Result<Generation, ServiceError> {
        self.ports
            .generations
            .get_generation(user_id, generation_id)
            .await
            .map_err(ServiceError::from_storage)
    }

    /// The generation the user saw last, if any.
    pub async fn current_generation(&self, user_id: Uuid) -> Result<Option<Generation>, ServiceError> {
        let pointer = self
            .ports
            .pointer
            .get_current_generation(user_id)
            .await
            .map_err(ServiceError::from_storage)?;
        match pointer {
            Some(id) => self.get_generation(user_id, id).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<i64, ServiceError> {
        self.ports.ledger.get_balance(user_id).await.map_err(|e| {
            error!(error = %e, "Credit ledger unreadable");
            ServiceError::Misconfigured("credit ledger is unreadable".to_string())
        })
    }

    /// Grants purchased credits once per checkout id.
    pub async fn fulfill_purchase(
        &self,
        user_id: Uuid,
        credits: i64,
        checkout_id: &str,
    ) -> Result<LedgerOutcome, ServiceError> {
        if credits <= 0 {
            return Err(ServiceError::InvalidInput("credits must be positive".to_string()));
        }
        if checkout_id.trim().is_empty() {
            return Err(ServiceError::InvalidInput("checkout id must not be empty".to_string()));
        }
        let key = format!("checkout:{}", checkout_id.trim());
        let outcome = self
            .ports
            .ledger
            .grant(user_id, credits, &key)
            .await
            .map_err(|e| ServiceError::Persistence(e.to_string()))?;
        info!(%user_id, credits, ?outcome, "Fulfilled credit purchase");
        Ok(outcome)
    }

    //=========================================================================================
    // Steps
    //=========================================================================================

    /// Loads processed material text for the plan, enforcing the combined file limit.
    async fn collect_material_text(&self, request: &GenerateRequest) -> Result<Option<String>, ServiceError> {
        let materials = match request.plan_id {
            Some(plan_id) => self
                .ports
                .materials
                .list_materials(request.user_id, plan_id)
                .await
                .map_err(ServiceError::from_storage)?,
            None => Vec::new(),
        };

        let file_count = request.images.len() + materials.len();
        if file_count > self.config.max_files {
            return Err(ServiceError::TooManyFiles {
                count: file_count,
                max: self.config.max_files,
            });
        }

        let mut remaining = self.config.max_material_chars;
        let mut sections = Vec::new();
        for (index, material) in materials.iter().enumerate() {
            if material.status != MaterialStatus::Processed || remaining == 0 {
                continue;
            }
            let Some(text) = material.extracted_text.as_deref() else {
                continue;
            };
            let clipped: String = text.chars().take(remaining).collect();
            remaining -= clipped.chars().count();
            sections.push(format!("### Material {}\n{}", index + 1, clipped));
        }

        if sections.is_empty() {
            Ok(None)
        } else {
            debug!(sections = sections.len(), "Attached material text");
            Ok(Some(sections.join("\n\n")))
        }
    }

    async fn call_model(
        &self,
        prompt: &str,
        language: Language,
        material_text: Option<&str>,
        images: &[InlineImage],
    ) -> Result<Value, AttemptFailure> {
        let mut user = format!("{}\n\n{}", prompt, language.instruction());
        if let Some(text) = material_text {
            user.push_str("\n\nStudy material:\n");
            user.push_str(text);
        }

        let first = CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            user,
            images: images.to_vec(),
            response_schema: Some(StudyDocument::json_schema()),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            timeout: self.config.timeout,
        };
        let repair = CompletionRequest {
            system: format!("{}\n\n{}", SYSTEM_PROMPT, REPAIR_INSTRUCTION),
            temperature: 0.0,
            ..first.clone()
        };

        let failure = match self.attempt(first).await {
            Ok(value) => return Ok(value),
            Err(failure) if failure.is_fatal() => return Err(failure),
            Err(failure) => failure,
        };
        warn!(error = %failure, "Model attempt failed, sending repair request");

        self.attempt(repair).await
    }

    async fn attempt(&self, request: CompletionRequest) -> Result<Value, AttemptFailure> {
        let timeout = request.timeout;
        let raw = tokio::time::timeout(timeout, self.ports.model.complete(request))
            .await
            .unwrap_or(Err(PortError::Timeout(timeout)))
            .map_err(AttemptFailure::Port)?;

        let value = parse_model_json(&raw).map_err(AttemptFailure::Invalid)?;
        check_shape(&value).map_err(AttemptFailure::Invalid)?;
        Ok(value)
    }

    /// intent -> charge -> record, compensating with a refund on any failure after the intent.
    async fn charge(&self, user_id: Uuid, generation_id: Uuid, cost: i64) -> Result<(), ServiceError> {
        let attempt = match self
            .ports
            .journal
            .record_intent(user_id, generation_id, cost)
            .await
        {
            Ok(attempt) => attempt,
            Err(e) => {
                error!(%generation_id, error = %e, "Failed to record charge intent");
                self.fail_row(user_id, generation_id, "CHARGE_FAILED").await;
                return Err(ServiceError::ChargeFailed(e.to_string()));
            }
        };
        let key = charge_key(generation_id, attempt);

        let failure = match self.ports.ledger.charge(user_id, cost, &key).await {
            Ok(outcome) => {
                debug!(%generation_id, attempt, ?outcome, "Ledger charge applied");
                if let Err(e) = self
                    .ports
                    .journal
                    .transition(user_id, generation_id, ChargeState::Charged)
                    .await
                {
                    // The keyed ledger makes a replay safe even if the journal lags.
                    warn!(%generation_id, error = %e, "Failed to mark charge as committed");
                }
                match self
                    .ports
                    .generations
                    .record_charge(user_id, generation_id, cost)
                    .await
                {
                    Ok(()) => {
                        info!(%generation_id, cost, "Credits charged");
                        return Ok(());
                    }
                    Err(e) => {
                        error!(%generation_id, error = %e, "Failed to record charge on generation");
                        ServiceError::ChargeFailed(e.to_string())
                    }
                }
            }
            Err(PortError::InsufficientBalance) => {
                let balance = self.ports.ledger.get_balance(user_id).await.unwrap_or(0);
                warn!(%generation_id, balance, cost, "Balance changed before charge");
                ServiceError::InsufficientCredits { balance, cost }
            }
            Err(e) => {
                error!(%generation_id, error = %e, "Ledger charge failed");
                ServiceError::ChargeFailed(e.to_string())
            }
        };

        self.compensate(user_id, generation_id, cost, &key).await;
        self.fail_row(user_id, generation_id, failure.code()).await;
        Err(failure)
    }

    async fn compensate(&self, user_id: Uuid, generation_id: Uuid, cost: i64, key: &str) {
        let state = match self.ports.ledger.refund(user_id, cost, key).await {
            Ok(outcome) => {
                info!(%generation_id, ?outcome, "Charge compensated");
                ChargeState::Refunded
            }
            Err(e) => {
                error!(%generation_id, cost, error = %e, "Refund failed after charge failure, manual reconciliation needed");
                ChargeState::RefundFailed
            }
        };
        if let Err(e) = self
            .ports
            .journal
            .transition(user_id, generation_id, state)
            .await
        {
            error!(%generation_id, state = state.as_str(), error = %e, "Failed to journal compensation");
        }
    }

    async fn fail_row(&self, user_id: Uuid, generation_id: Uuid, code: &str) {
        if let Err(e) = self
            .ports
            .generations
            .fail_generation(user_id, generation_id, code)
            .await
        {
            error!(%generation_id, code, error = %e, "Failed to mark generation as failed");
        }
    }
}

/// Ledger key shared by one charge attempt and its refund.
pub fn charge_key(generation_id: Uuid, attempt: u32) -> String {
    format!("generation:{}:{}", generation_id, attempt)
}
