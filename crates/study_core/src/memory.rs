//! crates/study_core/src/memory.rs
//!
//! In-memory implementations of every port. They back the integration tests and let the
//! service run locally without Postgres, object storage, or a model key. Each store has a
//! few switches to inject the failures the orchestrators must survive.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::document::StudyDocument;
use crate::domain::{
    ChargeEntry, ChargeState, ClaimWindow, Generation, GenerationStatus, LedgerOutcome, Material,
    MaterialStatus,
};
use crate::ports::{
    BlobStore, ChargeJournal, CompletionRequest, CreditLedger, CurrentGenerationPointer,
    GenerationStore, LanguageModel, MaterialStore, OcrService, PdfTextExtractor, PortError,
    PortResult,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

//=========================================================================================
// Materials
//=========================================================================================

#[derive(Default)]
pub struct MemoryMaterialStore {
    materials: Mutex<Vec<Material>>,
}

impl MemoryMaterialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, material_id: Uuid) -> Option<Material> {
        lock(&self.materials).iter().find(|m| m.id == material_id).cloned()
    }

    /// Backdates a row, e.g. to simulate a crashed drain holding an old lease.
    pub fn set_state(&self, material_id: Uuid, status: MaterialStatus, updated_at: DateTime<Utc>) {
        if let Some(m) = lock(&self.materials).iter_mut().find(|m| m.id == material_id) {
            m.status = status;
            m.updated_at = updated_at;
        }
    }
}

#[async_trait]
impl MaterialStore for MemoryMaterialStore {
    async fn insert_material(&self, material: Material) -> PortResult<Material> {
        lock(&self.materials).push(material.clone());
        Ok(material)
    }

    async fn list_materials(&self, user_id: Uuid, plan_id: Uuid) -> PortResult<Vec<Material>> {
        let mut items: Vec<Material> = lock(&self.materials)
            .iter()
            .filter(|m| m.user_id == user_id && m.plan_id == plan_id)
            .cloned()
            .collect();
        items.sort_by_key(|m| m.created_at);
        Ok(items)
    }

    async fn claim_material(&self, user_id: Uuid, material_id: Uuid, window: ClaimWindow) -> PortResult<bool> {
        let mut materials = lock(&self.materials);
        let Some(material) = materials
            .iter_mut()
            .find(|m| m.id == material_id && m.user_id == user_id)
        else {
            return Err(PortError::NotFound(format!("material {}", material_id)));
        };
        if !material.is_claimable(&window) {
            return Ok(false);
        }
        material.status = MaterialStatus::Processing;
        material.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_processed(&self, user_id: Uuid, material_id: Uuid, extracted_text: Option<String>) -> PortResult<()> {
        let mut materials = lock(&self.materials);
        let material = materials
            .iter_mut()
            .find(|m| m.id == material_id && m.user_id == user_id)
            .ok_or_else(|| PortError::NotFound(format!("material {}", material_id)))?;
        material.status = MaterialStatus::Processed;
        material.extracted_text = extracted_text;
        material.last_error = None;
        material.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, user_id: Uuid, material_id: Uuid, error: &str) -> PortResult<()> {
        let mut materials = lock(&self.materials);
        let material = materials
            .iter_mut()
            .find(|m| m.id == material_id && m.user_id == user_id)
            .ok_or_else(|| PortError::NotFound(format!("material {}", material_id)))?;
        material.status = MaterialStatus::Failed;
        material.extracted_text = None;
        material.last_error = Some(error.to_string());
        material.updated_at = Utc::now();
        Ok(())
    }

    async fn list_pending_plans(&self, window: ClaimWindow, offset: usize, limit: usize) -> PortResult<Vec<(Uuid, Uuid)>> {
        let mut pending: Vec<Material> = lock(&self.materials)
            .iter()
            .filter(|m| m.is_claimable(&window))
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.created_at);

        let mut plans = Vec::new();
        for m in pending {
            let key = (m.user_id, m.plan_id);
            if !plans.contains(&key) {
                plans.push(key);
            }
        }
        Ok(plans.into_iter().skip(offset).take(limit).collect())
    }
}

//=========================================================================================
// Generations
//=========================================================================================

#[derive(Default)]
pub struct MemoryGenerationStore {
    rows: Mutex<HashMap<(Uuid, Uuid), Generation>>,
    fail_complete: AtomicBool,
    fail_record_charge: AtomicBool,
}

impl MemoryGenerationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: Uuid, generation_id: Uuid) -> Option<Generation> {
        lock(&self.rows).get(&(user_id, generation_id)).cloned()
    }

    pub fn fail_complete(&self, fail: bool) {
        self.fail_complete.store(fail, Ordering::SeqCst);
    }

    pub fn fail_record_charge(&self, fail: bool) {
        self.fail_record_charge.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl GenerationStore for MemoryGenerationStore {
    async fn begin_generation(&self, user_id: Uuid, generation_id: Uuid, prompt: &str, language: &str) -> PortResult<Generation> {
        let mut rows = lock(&self.rows);
        let row = rows.entry((user_id, generation_id)).or_insert_with(|| Generation {
            id: generation_id,
            user_id,
            prompt: prompt.to_string(),
            language: language.to_string(),
            document: None,
            status: GenerationStatus::Processing,
            credits_charged: 0,
            error_code: None,
            created_at: Utc::now(),
        });
        if row.credits_charged == 0 {
            row.prompt = prompt.to_string();
            row.language = language.to_string();
            row.status = GenerationStatus::Processing;
            row.error_code = None;
        }
        Ok(row.clone())
    }

    async fn get_generation(&self, user_id: Uuid, generation_id: Uuid) -> PortResult<Generation> {
        self.get(user_id, generation_id)
            .ok_or_else(|| PortError::NotFound(format!("generation {}", generation_id)))
    }

    async fn complete_generation(&self, user_id: Uuid, generation_id: Uuid, document: &StudyDocument) -> PortResult<()> {
        if self.fail_complete.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("write rejected".to_string()));
        }
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(&(user_id, generation_id))
            .ok_or_else(|| PortError::NotFound(format!("generation {}", generation_id)))?;
        row.document = Some(document.clone());
        row.status = GenerationStatus::Done;
        row.error_code = None;
        Ok(())
    }

    async fn record_charge(&self, user_id: Uuid, generation_id: Uuid, credits: i64) -> PortResult<()> {
        if self.fail_record_charge.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("write rejected".to_string()));
        }
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(&(user_id, generation_id))
            .ok_or_else(|| PortError::NotFound(format!("generation {}", generation_id)))?;
        row.credits_charged = credits;
        Ok(())
    }

    async fn fail_generation(&self, user_id: Uuid, generation_id: Uuid, error_code: &str) -> PortResult<()> {
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(&(user_id, generation_id))
            .ok_or_else(|| PortError::NotFound(format!("generation {}", generation_id)))?;
        row.status = GenerationStatus::Failed;
        row.error_code = Some(error_code.to_string());
        row.credits_charged = 0;
        row.document = None;
        Ok(())
    }
}

//=========================================================================================
// Credits
//=========================================================================================

/// Where an injected charge failure happens relative to the balance update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChargeFault {
    #[default]
    None,
    /// The call fails and nothing is debited.
    BeforeApply,
    /// The debit lands but the caller sees an error.
    AfterApply,
    /// The balance dropped between the pre-check and the charge.
    Insufficient,
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<Uuid, i64>,
    charges: HashMap<String, (Uuid, i64)>,
    refunds: HashSet<String>,
    grants: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryCreditLedger {
    state: Mutex<LedgerState>,
    charge_fault: Mutex<ChargeFault>,
    fail_reads: AtomicBool,
    fail_refunds: AtomicBool,
    charge_calls: AtomicUsize,
}

impl MemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(user_id: Uuid, balance: i64) -> Self {
        let ledger = Self::default();
        ledger.set_balance(user_id, balance);
        ledger
    }

    pub fn set_balance(&self, user_id: Uuid, balance: i64) {
        lock(&self.state).balances.insert(user_id, balance);
    }

    pub fn balance_of(&self, user_id: Uuid) -> i64 {
        lock(&self.state).balances.get(&user_id).copied().unwrap_or(0)
    }

    pub fn set_charge_fault(&self, fault: ChargeFault) {
        *lock(&self.charge_fault) = fault;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_refunds(&self, fail: bool) {
        self.fail_refunds.store(fail, Ordering::SeqCst);
    }

    /// Charge calls that reached the ledger, including replays and failures.
    pub fn charge_calls(&self) -> usize {
        self.charge_calls.load(Ordering::SeqCst)
    }

    /// Distinct charges that actually debited a balance.
    pub fn applied_charges(&self) -> usize {
        lock(&self.state).charges.len()
    }
}

#[async_trait]
impl CreditLedger for MemoryCreditLedger {
    async fn get_balance(&self, user_id: Uuid) -> PortResult<i64> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("balance function missing".to_string()));
        }
        Ok(self.balance_of(user_id))
    }

    async fn charge(&self, user_id: Uuid, amount: i64, key: &str) -> PortResult<LedgerOutcome> {
        self.charge_calls.fetch_add(1, Ordering::SeqCst);
        let fault = *lock(&self.charge_fault);
        match fault {
            ChargeFault::BeforeApply => return Err(PortError::Unexpected("ledger unavailable".to_string())),
            ChargeFault::Insufficient => return Err(PortError::InsufficientBalance),
            _ => {}
        }

        let mut state = lock(&self.state);
        if state.charges.contains_key(key) {
            return Ok(LedgerOutcome::AlreadyApplied);
        }
        let balance = state.balances.entry(user_id).or_insert(0);
        if *balance < amount {
            return Err(PortError::InsufficientBalance);
        }
        *balance -= amount;
        state.charges.insert(key.to_string(), (user_id, amount));

        if fault == ChargeFault::AfterApply {
            return Err(PortError::Unexpected("connection reset after commit".to_string()));
        }
        Ok(LedgerOutcome::Applied)
    }

    async fn refund(&self, user_id: Uuid, amount: i64, key: &str) -> PortResult<LedgerOutcome> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("ledger unavailable".to_string()));
        }
        let mut state = lock(&self.state);
        if state.refunds.contains(key) {
            return Ok(LedgerOutcome::AlreadyApplied);
        }
        if !state.charges.contains_key(key) {
            return Ok(LedgerOutcome::Skipped);
        }
        *state.balances.entry(user_id).or_insert(0) += amount;
        state.refunds.insert(key.to_string());
        Ok(LedgerOutcome::Applied)
    }

    async fn grant(&self, user_id: Uuid, amount: i64, key: &str) -> PortResult<LedgerOutcome> {
        let mut state = lock(&self.state);
        if !state.grants.insert(key.to_string()) {
            return Ok(LedgerOutcome::AlreadyApplied);
        }
        *state.balances.entry(user_id).or_insert(0) += amount;
        Ok(LedgerOutcome::Applied)
    }
}

#[derive(Default)]
pub struct MemoryChargeJournal {
    entries: Mutex<HashMap<(Uuid, Uuid), ChargeEntry>>,
}

impl MemoryChargeJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_of(&self, user_id: Uuid, generation_id: Uuid) -> Option<ChargeState> {
        lock(&self.entries).get(&(user_id, generation_id)).map(|e| e.state)
    }
}

#[async_trait]
impl ChargeJournal for MemoryChargeJournal {
    async fn find_charge(&self, user_id: Uuid, generation_id: Uuid) -> PortResult<Option<ChargeEntry>> {
        Ok(lock(&self.entries).get(&(user_id, generation_id)).cloned())
    }

    async fn record_intent(&self, user_id: Uuid, generation_id: Uuid, amount: i64) -> PortResult<u32> {
        let mut entries = lock(&self.entries);
        let attempt = match entries.get(&(user_id, generation_id)) {
            Some(entry) if entry.state == ChargeState::Intent => entry.attempt,
            Some(entry) => entry.attempt + 1,
            None => 1,
        };
        entries.insert(
            (user_id, generation_id),
            ChargeEntry {
                generation_id,
                user_id,
                amount,
                state: ChargeState::Intent,
                attempt,
                updated_at: Utc::now(),
            },
        );
        Ok(attempt)
    }

    async fn transition(&self, user_id: Uuid, generation_id: Uuid, state: ChargeState) -> PortResult<()> {
        let mut entries = lock(&self.entries);
        let entry = entries
            .get_mut(&(user_id, generation_id))
            .ok_or_else(|| PortError::NotFound(format!("charge for generation {}", generation_id)))?;
        entry.state = state;
        entry.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryGenerationPointer {
    pointers: Mutex<HashMap<Uuid, Uuid>>,
    fail_writes: AtomicBool,
}

impl MemoryGenerationPointer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CurrentGenerationPointer for MemoryGenerationPointer {
    async fn set_current_generation(&self, user_id: Uuid, generation_id: Uuid) -> PortResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("pointer table unavailable".to_string()));
        }
        lock(&self.pointers).insert(user_id, generation_id);
        Ok(())
    }

    async fn get_current_generation(&self, user_id: Uuid) -> PortResult<Option<Uuid>> {
        Ok(lock(&self.pointers).get(&user_id).copied())
    }
}

//=========================================================================================
// Blobs and model capabilities
//=========================================================================================

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, data: impl Into<Bytes>) {
        lock(&self.blobs).insert(path.to_string(), data.into());
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, path: &str, data: Bytes, _content_type: &str) -> PortResult<String> {
        lock(&self.blobs).insert(path.to_string(), data);
        Ok(path.to_string())
    }

    async fn download(&self, path: &str) -> PortResult<Bytes> {
        lock(&self.blobs)
            .get(path)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("blob {}", path)))
    }
}

/// A model that replays queued responses, then falls back to a fixed one.
pub struct ScriptedModel {
    script: Mutex<VecDeque<PortResult<String>>>,
    fallback: PortResult<String>,
    requests: Mutex<Vec<CompletionRequest>>,
    delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn new(fallback: PortResult<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// A model for deployments without an API key.
    pub fn unconfigured() -> Self {
        Self::new(Err(PortError::NotConfigured("OPENAI_API_KEY".to_string())))
    }

    pub fn then(self, response: PortResult<String>) -> Self {
        lock(&self.script).push_back(response);
        self
    }

    /// Sleeps before answering the first scripted response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: CompletionRequest) -> PortResult<String> {
        let first_call = {
            let mut requests = lock(&self.requests);
            requests.push(request);
            requests.len() == 1
        };
        if let (true, Some(delay)) = (first_call, self.delay) {
            tokio::time::sleep(delay).await;
        }
        let next = lock(&self.script).pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// OCR that replays queued responses and otherwise reads nothing.
#[derive(Default)]
pub struct ScriptedOcr {
    script: Mutex<VecDeque<PortResult<String>>>,
    calls: AtomicUsize,
}

impl ScriptedOcr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, response: PortResult<String>) -> Self {
        lock(&self.script).push_back(response);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrService for ScriptedOcr {
    async fn recognize(&self, _image: &[u8], _mime_type: &str, _instruction: &str, _timeout: Duration) -> PortResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.script).pop_front();
        next.unwrap_or_else(|| Ok(String::new()))
    }
}

/// Treats the PDF bytes as their own text layer.
#[derive(Default)]
pub struct PassthroughPdfText;

#[async_trait]
impl PdfTextExtractor for PassthroughPdfText {
    async fn extract_text(&self, pdf: &[u8]) -> PortResult<String> {
        Ok(String::from_utf8_lossy(pdf).trim().to_string())
    }
}
