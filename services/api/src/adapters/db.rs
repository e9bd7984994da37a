//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, the concrete implementation of the
//! storage and ledger ports from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use study_core::document::StudyDocument;
use study_core::domain::{
    ChargeEntry, ChargeState, ClaimWindow, Generation, GenerationStatus, LedgerOutcome, Material,
    MaterialStatus,
};
use study_core::ports::{
    ChargeJournal, CreditLedger, CurrentGenerationPointer, GenerationStore, MaterialStore,
    PortError, PortResult,
};
use tracing::warn;
use uuid::Uuid;

/// SQLSTATE codes that mean the schema is behind the code.
const UNDEFINED_TABLE: &str = "42P01";
const UNDEFINED_COLUMN: &str = "42703";

/// Eligibility predicate shared by the claim and the pending-plan scan, given the
/// placeholder numbers of the failed cut-off and the stale-lease cut-off.
fn claimable(failed_before: u8, stale_before: u8) -> String {
    format!(
        "(status = 'uploaded' \
         OR (status = 'failed' AND updated_at <= ${}) \
         OR (status = 'processing' AND updated_at <= ${}))",
        failed_before, stale_before
    )
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements every storage port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn begin(&self) -> PortResult<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(db_error)
    }
}

/// Maps a `sqlx` error, keeping schema drift distinct from runtime failures.
fn db_error(e: sqlx::Error) -> PortError {
    if let sqlx::Error::Database(db) = &e {
        if let Some(code) = db.code() {
            if code == UNDEFINED_TABLE || code == UNDEFINED_COLUMN {
                return PortError::SchemaMismatch(db.message().to_string());
            }
        }
    }
    PortError::Unexpected(e.to_string())
}

fn not_found_or(what: String) -> impl FnOnce(sqlx::Error) -> PortError {
    move |e| match e {
        sqlx::Error::RowNotFound => PortError::NotFound(what),
        other => db_error(other),
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct MaterialRecord {
    id: Uuid,
    user_id: Uuid,
    plan_id: Uuid,
    file_path: String,
    mime_type: String,
    status: String,
    extracted_text: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl MaterialRecord {
    fn to_domain(self) -> Material {
        Material {
            id: self.id,
            user_id: self.user_id,
            plan_id: self.plan_id,
            file_path: self.file_path,
            mime_type: self.mime_type,
            status: MaterialStatus::parse(&self.status),
            extracted_text: self.extracted_text,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

const MATERIAL_COLUMNS: &str =
    "id, user_id, plan_id, file_path, mime_type, status, extracted_text, last_error, created_at, updated_at";

#[derive(FromRow)]
struct GenerationRecord {
    id: Uuid,
    user_id: Uuid,
    prompt: String,
    language: String,
    document: Option<serde_json::Value>,
    status: String,
    credits_charged: i64,
    error_code: Option<String>,
    created_at: DateTime<Utc>,
}
impl GenerationRecord {
    fn to_domain(self) -> Generation {
        let document = self.document.and_then(|value| {
            serde_json::from_value::<StudyDocument>(value)
                .map_err(|e| warn!(generation_id = %self.id, error = %e, "Stored document does not parse"))
                .ok()
        });
        Generation {
            id: self.id,
            user_id: self.user_id,
            prompt: self.prompt,
            language: self.language,
            document,
            status: GenerationStatus::parse(&self.status),
            credits_charged: self.credits_charged,
            error_code: self.error_code,
            created_at: self.created_at,
        }
    }
}

const GENERATION_COLUMNS: &str =
    "id, user_id, prompt, language, document, status, credits_charged, error_code, created_at";

#[derive(FromRow)]
struct ChargeRecord {
    generation_id: Uuid,
    user_id: Uuid,
    amount: i64,
    state: String,
    attempt: i32,
    updated_at: DateTime<Utc>,
}
impl ChargeRecord {
    fn to_domain(self) -> ChargeEntry {
        ChargeEntry {
            generation_id: self.generation_id,
            user_id: self.user_id,
            amount: self.amount,
            state: ChargeState::parse(&self.state),
            attempt: u32::try_from(self.attempt).unwrap_or(1),
            updated_at: self.updated_at,
        }
    }
}

//=========================================================================================
// `MaterialStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl MaterialStore for DbAdapter {
    async fn insert_material(&self, material: Material) -> PortResult<Material> {
        let sql = format!(
            "INSERT INTO materials (id, user_id, plan_id, file_path, mime_type, status) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
            MATERIAL_COLUMNS
        );
        let record = sqlx::query_as::<_, MaterialRecord>(&sql)
            .bind(material.id)
            .bind(material.user_id)
            .bind(material.plan_id)
            .bind(&material.file_path)
            .bind(&material.mime_type)
            .bind(material.status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(record.to_domain())
    }

    async fn list_materials(&self, user_id: Uuid, plan_id: Uuid) -> PortResult<Vec<Material>> {
        let sql = format!(
            "SELECT {} FROM materials WHERE user_id = $1 AND plan_id = $2 ORDER BY created_at ASC, id ASC",
            MATERIAL_COLUMNS
        );
        let records = sqlx::query_as::<_, MaterialRecord>(&sql)
            .bind(user_id)
            .bind(plan_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn claim_material(&self, user_id: Uuid, material_id: Uuid, window: ClaimWindow) -> PortResult<bool> {
        let sql = format!(
            "UPDATE materials SET status = 'processing', updated_at = NOW() \
             WHERE id = $1 AND user_id = $2 AND {}",
            claimable(3, 4)
        );
        let result = sqlx::query(&sql)
            .bind(material_id)
            .bind(user_id)
            .bind(window.failed_before)
            .bind(window.stale_before)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_processed(&self, user_id: Uuid, material_id: Uuid, extracted_text: Option<String>) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE materials SET status = 'processed', extracted_text = $3, last_error = NULL, updated_at = NOW() \
             WHERE id = $1 AND user_id = $2",
        )
        .bind(material_id)
        .bind(user_id)
        .bind(extracted_text)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Material {} not found", material_id)));
        }
        Ok(())
    }

    async fn mark_failed(&self, user_id: Uuid, material_id: Uuid, error: &str) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE materials SET status = 'failed', extracted_text = NULL, last_error = $3, updated_at = NOW() \
             WHERE id = $1 AND user_id = $2",
        )
        .bind(material_id)
        .bind(user_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Material {} not found", material_id)));
        }
        Ok(())
    }

    async fn list_pending_plans(&self, window: ClaimWindow, offset: usize, limit: usize) -> PortResult<Vec<(Uuid, Uuid)>> {
        let sql = format!(
            "SELECT user_id, plan_id FROM materials WHERE {} \
             GROUP BY user_id, plan_id ORDER BY MIN(created_at) ASC, user_id, plan_id \
             LIMIT $3 OFFSET $4",
            claimable(1, 2)
        );
        sqlx::query_as::<_, (Uuid, Uuid)>(&sql)
            .bind(window.failed_before)
            .bind(window.stale_before)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)
    }
}

//=========================================================================================
// `GenerationStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl GenerationStore for DbAdapter {
    async fn begin_generation(&self, user_id: Uuid, generation_id: Uuid, prompt: &str, language: &str) -> PortResult<Generation> {
        // A charged row is never reset; the conflict update is skipped and the row read back as is.
        let sql = format!(
            "INSERT INTO generations (id, user_id, prompt, language, status, credits_charged) \
             VALUES ($1, $2, $3, $4, 'processing', 0) \
             ON CONFLICT (user_id, id) DO UPDATE SET \
                prompt = EXCLUDED.prompt, language = EXCLUDED.language, status = 'processing', \
                error_code = NULL, updated_at = NOW() \
             WHERE generations.credits_charged = 0 \
             RETURNING {}",
            GENERATION_COLUMNS
        );
        let record = sqlx::query_as::<_, GenerationRecord>(&sql)
            .bind(generation_id)
            .bind(user_id)
            .bind(prompt)
            .bind(language)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        match record {
            Some(record) => Ok(record.to_domain()),
            None => self.get_generation(user_id, generation_id).await,
        }
    }

    async fn get_generation(&self, user_id: Uuid, generation_id: Uuid) -> PortResult<Generation> {
        let sql = format!(
            "SELECT {} FROM generations WHERE user_id = $1 AND id = $2",
            GENERATION_COLUMNS
        );
        let record = sqlx::query_as::<_, GenerationRecord>(&sql)
            .bind(user_id)
            .bind(generation_id)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found_or(format!("Generation {} not found", generation_id)))?;
        Ok(record.to_domain())
    }

    async fn complete_generation(&self, user_id: Uuid, generation_id: Uuid, document: &StudyDocument) -> PortResult<()> {
        let payload = serde_json::to_value(document).map_err(|e| PortError::Unexpected(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE generations SET document = $3, status = 'done', error_code = NULL, updated_at = NOW() \
             WHERE user_id = $1 AND id = $2",
        )
        .bind(user_id)
        .bind(generation_id)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Generation {} not found", generation_id)));
        }
        Ok(())
    }

    async fn record_charge(&self, user_id: Uuid, generation_id: Uuid, credits: i64) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE generations SET credits_charged = $3, updated_at = NOW() \
             WHERE user_id = $1 AND id = $2 AND status = 'done'",
        )
        .bind(user_id)
        .bind(generation_id)
        .bind(credits)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Done generation {} not found", generation_id)));
        }
        Ok(())
    }

    async fn fail_generation(&self, user_id: Uuid, generation_id: Uuid, error_code: &str) -> PortResult<()> {
        sqlx::query(
            "UPDATE generations SET status = 'failed', error_code = $3, credits_charged = 0, document = NULL, \
             updated_at = NOW() \
             WHERE user_id = $1 AND id = $2",
        )
        .bind(user_id)
        .bind(generation_id)
        .bind(error_code)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}

//=========================================================================================
// `CreditLedger` Trait Implementation
//=========================================================================================

impl DbAdapter {
    /// Records a keyed ledger entry inside `tx`. Returns `false` if the key was already used.
    async fn insert_entry(
        tx: &mut Transaction<'static, Postgres>,
        kind: &str,
        key: &str,
        user_id: Uuid,
        amount: i64,
    ) -> PortResult<bool> {
        let result = sqlx::query(
            "INSERT INTO credit_ledger_entries (kind, key, user_id, amount) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (kind, key) DO NOTHING",
        )
        .bind(kind)
        .bind(key)
        .bind(user_id)
        .bind(amount)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn add_to_balance(tx: &mut Transaction<'static, Postgres>, user_id: Uuid, amount: i64) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO credit_balances (user_id, balance) VALUES ($1, $2) \
             ON CONFLICT (user_id) DO UPDATE SET balance = credit_balances.balance + EXCLUDED.balance, updated_at = NOW()",
        )
        .bind(user_id)
        .bind(amount)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}

#[async_trait]
impl CreditLedger for DbAdapter {
    async fn get_balance(&self, user_id: Uuid) -> PortResult<i64> {
        let balance: Option<i64> = sqlx::query_scalar("SELECT balance FROM credit_balances WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(balance.unwrap_or(0))
    }

    async fn charge(&self, user_id: Uuid, amount: i64, key: &str) -> PortResult<LedgerOutcome> {
        let mut tx = self.begin().await?;
        if !Self::insert_entry(&mut tx, "charge", key, user_id, amount).await? {
            return Ok(LedgerOutcome::AlreadyApplied);
        }

        let debited = sqlx::query(
            "UPDATE credit_balances SET balance = balance - $2, updated_at = NOW() \
             WHERE user_id = $1 AND balance >= $2",
        )
        .bind(user_id)
        .bind(amount)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;
        if debited.rows_affected() == 0 {
            // Dropping the transaction rolls back the ledger entry as well.
            return Err(PortError::InsufficientBalance);
        }

        tx.commit().await.map_err(db_error)?;
        Ok(LedgerOutcome::Applied)
    }

    async fn refund(&self, user_id: Uuid, amount: i64, key: &str) -> PortResult<LedgerOutcome> {
        let mut tx = self.begin().await?;
        let charged: Option<i64> = sqlx::query_scalar(
            "SELECT amount FROM credit_ledger_entries WHERE kind = 'charge' AND key = $1 AND user_id = $2",
        )
        .bind(key)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;
        if charged.is_none() {
            return Ok(LedgerOutcome::Skipped);
        }

        if !Self::insert_entry(&mut tx, "refund", key, user_id, amount).await? {
            return Ok(LedgerOutcome::AlreadyApplied);
        }
        Self::add_to_balance(&mut tx, user_id, amount).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(LedgerOutcome::Applied)
    }

    async fn grant(&self, user_id: Uuid, amount: i64, key: &str) -> PortResult<LedgerOutcome> {
        let mut tx = self.begin().await?;
        if !Self::insert_entry(&mut tx, "grant", key, user_id, amount).await? {
            return Ok(LedgerOutcome::AlreadyApplied);
        }
        Self::add_to_balance(&mut tx, user_id, amount).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(LedgerOutcome::Applied)
    }
}

//=========================================================================================
// `ChargeJournal` and `CurrentGenerationPointer` Trait Implementations
//=========================================================================================

#[async_trait]
impl ChargeJournal for DbAdapter {
    async fn find_charge(&self, user_id: Uuid, generation_id: Uuid) -> PortResult<Option<ChargeEntry>> {
        let record = sqlx::query_as::<_, ChargeRecord>(
            "SELECT generation_id, user_id, amount, state, attempt, updated_at FROM charge_journal \
             WHERE user_id = $1 AND generation_id = $2",
        )
        .bind(user_id)
        .bind(generation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(record.map(|r| r.to_domain()))
    }

    async fn record_intent(&self, user_id: Uuid, generation_id: Uuid, amount: i64) -> PortResult<u32> {
        let attempt: i32 = sqlx::query_scalar(
            "INSERT INTO charge_journal (user_id, generation_id, amount, state) VALUES ($1, $2, $3, 'intent') \
             ON CONFLICT (user_id, generation_id) DO UPDATE SET amount = EXCLUDED.amount, state = 'intent', \
             attempt = CASE WHEN charge_journal.state = 'intent' THEN charge_journal.attempt \
             ELSE charge_journal.attempt + 1 END, updated_at = NOW() \
             RETURNING attempt",
        )
        .bind(user_id)
        .bind(generation_id)
        .bind(amount)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;
        u32::try_from(attempt).map_err(|_| PortError::Unexpected(format!("invalid charge attempt {}", attempt)))
    }

    async fn transition(&self, user_id: Uuid, generation_id: Uuid, state: ChargeState) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE charge_journal SET state = $3, updated_at = NOW() WHERE user_id = $1 AND generation_id = $2",
        )
        .bind(user_id)
        .bind(generation_id)
        .bind(state.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Charge for generation {} not found", generation_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl CurrentGenerationPointer for DbAdapter {
    async fn set_current_generation(&self, user_id: Uuid, generation_id: Uuid) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO current_generations (user_id, generation_id) VALUES ($1, $2) \
             ON CONFLICT (user_id) DO UPDATE SET generation_id = EXCLUDED.generation_id, updated_at = NOW()",
        )
        .bind(user_id)
        .bind(generation_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_current_generation(&self, user_id: Uuid) -> PortResult<Option<Uuid>> {
        sqlx::query_scalar("SELECT generation_id FROM current_generations WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)
    }
}
