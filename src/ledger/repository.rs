use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Acquire, FromRow, PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use super::models::*;
use crate::error::{ReconcileError, ReconcileResult};

/// Persistence collaborator of the reconciliation engine
///
/// INVARIANTS:
/// - transaction records are unique on tx hash; a duplicate insert returns
///   `ReconcileError::Conflict` and leaves the existing row untouched
/// - `complete_refund` marks the deposit refunded and appends the refund record
///   as one unit
/// - the checkpoint is a single row
#[async_trait]
pub trait DepositStore: Send + Sync {
    async fn get_deposit(&self, source_address: &str) -> ReconcileResult<Option<Deposit>>;

    /// Insert a new deposit. Fails with `Conflict` if one exists for the address.
    async fn create_deposit(&self, deposit: &Deposit) -> ReconcileResult<Deposit>;

    /// Return the deposit for `source_address`, creating it if missing
    async fn ensure_deposit(
        &self,
        source_address: &str,
        required_amount: u64,
        now: DateTime<Utc>,
    ) -> ReconcileResult<Deposit>;

    /// Count a verification attempt; an accepted transfer marks the deposit verified
    async fn record_verification(
        &self,
        source_address: &str,
        at: DateTime<Utc>,
        accepted: Option<&Transfer>,
    ) -> ReconcileResult<Deposit>;

    /// Mark the deposit refunded and append the refund record.
    ///
    /// When the record collides on its tx hash the deposit update still lands
    /// and `Conflict` is returned.
    async fn complete_refund(
        &self,
        source_address: &str,
        record: &TransactionRecord,
    ) -> ReconcileResult<()>;

    async fn insert_transaction(&self, record: &TransactionRecord) -> ReconcileResult<()>;

    /// Idempotent
    async fn mark_processed(&self, tx_hash: &str, outcome: ProcessedOutcome) -> ReconcileResult<()>;

    /// Most recently processed hashes, newest first
    async fn load_processed(&self, limit: usize) -> ReconcileResult<Vec<String>>;

    async fn load_checkpoint(&self) -> ReconcileResult<Option<Checkpoint>>;

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> ReconcileResult<()>;
}

// ========== POSTGRES ==========

/// PostgreSQL-backed deposit store
pub struct PgDepositStore {
    pool: PgPool,
}

impl PgDepositStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const DEPOSIT_COLUMNS: &str = r#"
    source_address, owner_id, required_amount, tx_hash, verified, refunded,
    verification_attempts, last_verification_attempt, sender_address,
    refund_tx_hash, refund_timestamp, created_at, updated_at
"#;

struct DepositRow(Deposit);

impl<'r> FromRow<'r, PgRow> for DepositRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let required_amount: i64 = row.try_get("required_amount")?;
        let verification_attempts: i32 = row.try_get("verification_attempts")?;

        Ok(DepositRow(Deposit {
            source_address: row.try_get("source_address")?,
            owner_id: row.try_get::<Option<Uuid>, _>("owner_id")?,
            required_amount: required_amount.max(0) as u64,
            tx_hash: row.try_get("tx_hash")?,
            verified: row.try_get("verified")?,
            refunded: row.try_get("refunded")?,
            verification_attempts: verification_attempts.max(0) as u32,
            last_verification_attempt: row.try_get("last_verification_attempt")?,
            sender_address: row.try_get("sender_address")?,
            refund_tx_hash: row.try_get("refund_tx_hash")?,
            refund_timestamp: row.try_get("refund_timestamp")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }
}

fn to_db_amount(amount: u64) -> ReconcileResult<i64> {
    i64::try_from(amount)
        .map_err(|_| ReconcileError::Rejected(format!("Amount {} exceeds storable range", amount)))
}

#[async_trait]
impl DepositStore for PgDepositStore {
    async fn get_deposit(&self, source_address: &str) -> ReconcileResult<Option<Deposit>> {
        let row = sqlx::query_as::<_, DepositRow>(&format!(
            "SELECT {} FROM deposits WHERE source_address = $1",
            DEPOSIT_COLUMNS
        ))
        .bind(source_address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|DepositRow(deposit)| deposit))
    }

    async fn create_deposit(&self, deposit: &Deposit) -> ReconcileResult<Deposit> {
        let DepositRow(created) = sqlx::query_as::<_, DepositRow>(&format!(
            r#"
            INSERT INTO deposits (source_address, owner_id, required_amount, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            RETURNING {}
            "#,
            DEPOSIT_COLUMNS
        ))
        .bind(&deposit.source_address)
        .bind(deposit.owner_id)
        .bind(to_db_amount(deposit.required_amount)?)
        .bind(deposit.created_at)
        .fetch_one(&self.pool)
        .await?;

        info!("📝 Deposit registered for {}", created.source_address);
        Ok(created)
    }

    async fn ensure_deposit(
        &self,
        source_address: &str,
        required_amount: u64,
        now: DateTime<Utc>,
    ) -> ReconcileResult<Deposit> {
        sqlx::query(
            r#"
            INSERT INTO deposits (source_address, required_amount, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (source_address) DO NOTHING
            "#,
        )
        .bind(source_address)
        .bind(to_db_amount(required_amount)?)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_deposit(source_address).await?.ok_or_else(|| {
            ReconcileError::Fatal(format!("Deposit {} vanished after upsert", source_address))
        })
    }

    async fn record_verification(
        &self,
        source_address: &str,
        at: DateTime<Utc>,
        accepted: Option<&Transfer>,
    ) -> ReconcileResult<Deposit> {
        // SET expressions see the old row, so a verified deposit keeps its first transfer
        let row = sqlx::query_as::<_, DepositRow>(&format!(
            r#"
            UPDATE deposits
            SET verification_attempts = verification_attempts + 1,
                last_verification_attempt = $2,
                verified = verified OR $3,
                tx_hash = CASE WHEN verified THEN tx_hash ELSE COALESCE($4, tx_hash) END,
                sender_address = CASE WHEN verified THEN sender_address ELSE COALESCE($5, sender_address) END,
                updated_at = $2
            WHERE source_address = $1
            RETURNING {}
            "#,
            DEPOSIT_COLUMNS
        ))
        .bind(source_address)
        .bind(at)
        .bind(accepted.is_some())
        .bind(accepted.map(|t| t.tx_hash.clone()))
        .bind(accepted.map(|t| t.from_address.clone()))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|DepositRow(deposit)| deposit).ok_or_else(|| {
            ReconcileError::Rejected(format!("No deposit registered for {}", source_address))
        })
    }

    async fn complete_refund(
        &self,
        source_address: &str,
        record: &TransactionRecord,
    ) -> ReconcileResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE deposits
            SET refunded = TRUE,
                refund_tx_hash = $2,
                refund_timestamp = $3,
                updated_at = $3
            WHERE source_address = $1 AND refunded = FALSE
            "#,
        )
        .bind(source_address)
        .bind(&record.tx_hash)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            warn!("⚠️ Deposit {} was already marked refunded", source_address);
        }

        // Savepoint so a duplicate record does not roll back the deposit update
        let mut savepoint = tx.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO ledger_transactions (tx_hash, tx_type, source_address, amount, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&record.tx_hash)
        .bind(record.tx_type.as_str())
        .bind(&record.source_address)
        .bind(to_db_amount(record.amount)?)
        .bind(record.created_at)
        .execute(&mut *savepoint)
        .await;

        let outcome = match inserted {
            Ok(_) => {
                savepoint.commit().await?;
                Ok(())
            }
            Err(e) => match ReconcileError::from(e) {
                conflict @ ReconcileError::Conflict(_) => {
                    savepoint.rollback().await?;
                    Err(conflict)
                }
                other => return Err(other),
            },
        };

        tx.commit().await?;
        outcome
    }

    async fn insert_transaction(&self, record: &TransactionRecord) -> ReconcileResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_transactions (tx_hash, tx_type, source_address, amount, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&record.tx_hash)
        .bind(record.tx_type.as_str())
        .bind(&record.source_address)
        .bind(to_db_amount(record.amount)?)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_processed(&self, tx_hash: &str, outcome: ProcessedOutcome) -> ReconcileResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_transactions (tx_hash, outcome, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (tx_hash) DO NOTHING
            "#,
        )
        .bind(tx_hash)
        .bind(outcome.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_processed(&self, limit: usize) -> ReconcileResult<Vec<String>> {
        let hashes = sqlx::query_scalar::<_, String>(
            r#"
            SELECT tx_hash FROM processed_transactions
            ORDER BY processed_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(hashes)
    }

    async fn load_checkpoint(&self) -> ReconcileResult<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT last_seen_tx_hash, block_height, updated_at
            FROM monitor_checkpoint
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<Checkpoint, sqlx::Error> {
            let block_height: i64 = row.try_get("block_height")?;
            Ok(Checkpoint {
                last_seen_tx_hash: row.try_get("last_seen_tx_hash")?,
                block_height: block_height.max(0) as u64,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
        .map_err(ReconcileError::from)
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> ReconcileResult<()> {
        sqlx::query(
            r#"
            INSERT INTO monitor_checkpoint (id, last_seen_tx_hash, block_height, updated_at)
            VALUES (1, $1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                last_seen_tx_hash = EXCLUDED.last_seen_tx_hash,
                block_height = EXCLUDED.block_height,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&checkpoint.last_seen_tx_hash)
        .bind(to_db_amount(checkpoint.block_height)?)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
