use super::models::*;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::types::{BigDecimal, Json};
use sqlx::{PgPool, Postgres, Row};
use std::marker::PhantomData;
use std::str::FromStr;
use tracing::{error, info};

/// Typed persistence boundary for one settlement record family.
///
/// Every call is a single-row or single-query operation; the engine never
/// needs a multi-row transaction.
#[async_trait]
pub trait SettlementStore<R: SettlementRecord>: Send + Sync {
    /// Records whose `axis` currently holds any of `statuses`, oldest first
    async fn find_by_status(&self, axis: R::Axis, statuses: &[R::Status]) -> AppResult<Vec<R>>;

    /// Same as `find_by_status`, restricted to `updated_at <= threshold`
    async fn find_by_status_and_staleness(
        &self,
        axis: R::Axis,
        statuses: &[R::Status],
        threshold: DateTime<Utc>,
    ) -> AppResult<Vec<R>>;

    async fn save(&self, record: &R) -> AppResult<()>;

    async fn delete(&self, record: &R) -> AppResult<()>;
}

/// Side effect of a completed burial: flags the upload's genesis-hash group so
/// webnodes can discover the treasure.
#[async_trait]
pub trait TreasureMarker: Send + Sync {
    async fn mark_genesis_hash_buried(&self, genesis_hash: &str) -> AppResult<()>;
}

/// Treasure status stored on `stored_genesis_hashes`
pub const TREASURE_BURIED: i16 = 2;

// ========== POSTGRES ==========

/// Row mapping for a record family stored in Postgres
pub trait PgRecord: SettlementRecord {
    const TABLE: &'static str;
    const COLUMNS: &'static str;
    /// Insert-or-update keyed on `id`, with placeholders bound by `bind_upsert`
    const UPSERT: &'static str;

    fn status_column(axis: Self::Axis) -> &'static str;

    fn status_code(status: Self::Status) -> i16;

    fn from_row(row: &PgRow) -> AppResult<Self>;

    fn bind_upsert(
        &self,
        query: Query<'static, Postgres, PgArguments>,
    ) -> AppResult<Query<'static, Postgres, PgArguments>>;
}

/// Generic Postgres store; one instance per record family
pub struct PgSettlementStore<R> {
    pool: PgPool,
    _record: PhantomData<fn() -> R>,
}

impl<R: PgRecord> PgSettlementStore<R> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _record: PhantomData,
        }
    }

    fn codes(statuses: &[R::Status]) -> Vec<i16> {
        statuses.iter().map(|status| R::status_code(*status)).collect()
    }
}

/// A row that no longer maps is logged and left out so the rest of the
/// batch still settles
fn keep_mapped<T>(table: &str, mapped: impl IntoIterator<Item = AppResult<T>>) -> Vec<T> {
    mapped
        .into_iter()
        .filter_map(|result| match result {
            Ok(record) => Some(record),
            Err(e) => {
                error!("❌ Skipping unreadable {} row: {}", table, e);
                None
            }
        })
        .collect()
}

#[async_trait]
impl<R: PgRecord> SettlementStore<R> for PgSettlementStore<R> {
    async fn find_by_status(&self, axis: R::Axis, statuses: &[R::Status]) -> AppResult<Vec<R>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ANY($1) ORDER BY updated_at ASC",
            R::COLUMNS,
            R::TABLE,
            R::status_column(axis)
        );

        let rows = sqlx::query(&sql)
            .bind(Self::codes(statuses))
            .fetch_all(&self.pool)
            .await?;

        Ok(keep_mapped(R::TABLE, rows.iter().map(R::from_row)))
    }

    async fn find_by_status_and_staleness(
        &self,
        axis: R::Axis,
        statuses: &[R::Status],
        threshold: DateTime<Utc>,
    ) -> AppResult<Vec<R>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ANY($1) AND updated_at <= $2 ORDER BY updated_at ASC",
            R::COLUMNS,
            R::TABLE,
            R::status_column(axis)
        );

        let rows = sqlx::query(&sql)
            .bind(Self::codes(statuses))
            .bind(threshold)
            .fetch_all(&self.pool)
            .await?;

        Ok(keep_mapped(R::TABLE, rows.iter().map(R::from_row)))
    }

    async fn save(&self, record: &R) -> AppResult<()> {
        record
            .bind_upsert(sqlx::query(R::UPSERT))?
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete(&self, record: &R) -> AppResult<()> {
        let sql = format!("DELETE FROM {} WHERE id = $1", R::TABLE);

        sqlx::query(&sql)
            .bind(record.id())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Flags genesis hashes on the shared `stored_genesis_hashes` table
pub struct PgTreasureMarker {
    pool: PgPool,
}

impl PgTreasureMarker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TreasureMarker for PgTreasureMarker {
    async fn mark_genesis_hash_buried(&self, genesis_hash: &str) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE stored_genesis_hashes
            SET treasure_status = $2, updated_at = NOW()
            WHERE genesis_hash = $1
            "#,
        )
        .bind(genesis_hash)
        .bind(TREASURE_BURIED)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "stored genesis hash {}",
                genesis_hash
            )));
        }

        info!("Genesis hash {} marked as treasure buried", genesis_hash);
        Ok(())
    }
}

// ========== ROW MAPPING ==========

fn to_numeric(value: Decimal) -> AppResult<BigDecimal> {
    BigDecimal::from_str(&value.to_string())
        .map_err(|e| AppError::InvalidInput(format!("Amount {} is not numeric: {}", value, e)))
}

fn from_numeric(value: BigDecimal) -> AppResult<Decimal> {
    let raw = value.to_string();
    Ok(Decimal::from_str(&raw).or_else(|_| Decimal::from_scientific(&raw))?)
}

fn stage_status(row: &PgRow, column: &str) -> AppResult<StageStatus> {
    let code: i16 = row.try_get(column)?;
    StageStatus::from_code(code)
        .ok_or_else(|| AppError::Internal(format!("Unknown {} code: {}", column, code)))
}

fn tx_log(row: &PgRow) -> AppResult<TxLog> {
    let log: Json<TxLog> = row.try_get("transactions")?;
    Ok(log.0)
}

impl PgRecord for BrokerPayment {
    const TABLE: &'static str = "broker_payments";
    const COLUMNS: &'static str = "id, genesis_hash, broker_type, eth_addr_alpha, eth_addr_beta, \
        alpha_encrypted_key, total_cost, payment_status, transactions, created_at, updated_at";
    const UPSERT: &'static str = r#"
        INSERT INTO broker_payments (
            id, genesis_hash, broker_type, eth_addr_alpha, eth_addr_beta,
            alpha_encrypted_key, total_cost, payment_status, transactions, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (id) DO UPDATE SET
            payment_status = EXCLUDED.payment_status,
            transactions = EXCLUDED.transactions,
            updated_at = EXCLUDED.updated_at
    "#;

    fn status_column(_axis: PaymentAxis) -> &'static str {
        "payment_status"
    }

    fn status_code(status: PaymentStatus) -> i16 {
        status.code()
    }

    fn from_row(row: &PgRow) -> AppResult<Self> {
        let type_code: i16 = row.try_get("broker_type")?;
        let broker_type = BrokerType::from_code(type_code)
            .ok_or_else(|| AppError::Internal(format!("Unknown broker type: {}", type_code)))?;

        let status_code: i16 = row.try_get("payment_status")?;
        let status = PaymentStatus::from_code(status_code).ok_or_else(|| {
            AppError::Internal(format!("Unknown payment status: {}", status_code))
        })?;

        Ok(BrokerPayment {
            id: row.try_get("id")?,
            genesis_hash: row.try_get("genesis_hash")?,
            broker_type,
            eth_addr_alpha: row.try_get("eth_addr_alpha")?,
            eth_addr_beta: row.try_get("eth_addr_beta")?,
            alpha_encrypted_key: row.try_get("alpha_encrypted_key")?,
            total_cost: from_numeric(row.try_get("total_cost")?)?,
            status,
            transactions: tx_log(row)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn bind_upsert(
        &self,
        query: Query<'static, Postgres, PgArguments>,
    ) -> AppResult<Query<'static, Postgres, PgArguments>> {
        Ok(query
            .bind(self.id)
            .bind(self.genesis_hash.clone())
            .bind(self.broker_type.code())
            .bind(self.eth_addr_alpha.clone())
            .bind(self.eth_addr_beta.clone())
            .bind(self.alpha_encrypted_key.clone())
            .bind(to_numeric(self.total_cost)?)
            .bind(self.status.code())
            .bind(Json(self.transactions.clone()))
            .bind(self.created_at)
            .bind(self.updated_at))
    }
}

impl PgRecord for TreasuryBurial {
    const TABLE: &'static str = "treasury_burials";
    const COLUMNS: &'static str = "id, genesis_hash, eth_addr, encrypted_key, prl_amount, \
        prl_status, gas_status, bury_status, transactions, created_at, updated_at";
    const UPSERT: &'static str = r#"
        INSERT INTO treasury_burials (
            id, genesis_hash, eth_addr, encrypted_key, prl_amount,
            prl_status, gas_status, bury_status, transactions, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (id) DO UPDATE SET
            prl_status = EXCLUDED.prl_status,
            gas_status = EXCLUDED.gas_status,
            bury_status = EXCLUDED.bury_status,
            transactions = EXCLUDED.transactions,
            updated_at = EXCLUDED.updated_at
    "#;

    fn status_column(axis: BurialAxis) -> &'static str {
        match axis {
            BurialAxis::Prl => "prl_status",
            BurialAxis::Gas => "gas_status",
            BurialAxis::Bury => "bury_status",
        }
    }

    fn status_code(status: StageStatus) -> i16 {
        status.code()
    }

    fn from_row(row: &PgRow) -> AppResult<Self> {
        Ok(TreasuryBurial {
            id: row.try_get("id")?,
            genesis_hash: row.try_get("genesis_hash")?,
            eth_addr: row.try_get("eth_addr")?,
            encrypted_key: row.try_get("encrypted_key")?,
            prl_amount: from_numeric(row.try_get("prl_amount")?)?,
            prl_status: stage_status(row, "prl_status")?,
            gas_status: stage_status(row, "gas_status")?,
            bury_status: stage_status(row, "bury_status")?,
            transactions: tx_log(row)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn bind_upsert(
        &self,
        query: Query<'static, Postgres, PgArguments>,
    ) -> AppResult<Query<'static, Postgres, PgArguments>> {
        Ok(query
            .bind(self.id)
            .bind(self.genesis_hash.clone())
            .bind(self.eth_addr.clone())
            .bind(self.encrypted_key.clone())
            .bind(to_numeric(self.prl_amount)?)
            .bind(self.prl_status.code())
            .bind(self.gas_status.code())
            .bind(self.bury_status.code())
            .bind(Json(self.transactions.clone()))
            .bind(self.created_at)
            .bind(self.updated_at))
    }
}

fn claim_status_column(axis: ClaimAxis) -> &'static str {
    match axis {
        ClaimAxis::Gas => "gas_status",
        ClaimAxis::Claim => "claim_status",
        ClaimAxis::Reclaim => "reclaim_status",
    }
}

impl PgRecord for TreasuryClaim {
    const TABLE: &'static str = "treasury_claims";
    const COLUMNS: &'static str = "id, genesis_hash, sector_idx, treasure_eth_addr, \
        treasure_encrypted_key, receiver_eth_addr, starting_claim_clock, gas_status, \
        claim_status, reclaim_status, transactions, created_at, updated_at";
    const UPSERT: &'static str = r#"
        INSERT INTO treasury_claims (
            id, genesis_hash, sector_idx, treasure_eth_addr, treasure_encrypted_key,
            receiver_eth_addr, starting_claim_clock, gas_status, claim_status, reclaim_status,
            transactions, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (id) DO UPDATE SET
            starting_claim_clock = EXCLUDED.starting_claim_clock,
            gas_status = EXCLUDED.gas_status,
            claim_status = EXCLUDED.claim_status,
            reclaim_status = EXCLUDED.reclaim_status,
            transactions = EXCLUDED.transactions,
            updated_at = EXCLUDED.updated_at
    "#;

    fn status_column(axis: ClaimAxis) -> &'static str {
        claim_status_column(axis)
    }

    fn status_code(status: StageStatus) -> i16 {
        status.code()
    }

    fn from_row(row: &PgRow) -> AppResult<Self> {
        Ok(TreasuryClaim {
            id: row.try_get("id")?,
            genesis_hash: row.try_get("genesis_hash")?,
            sector_idx: row.try_get("sector_idx")?,
            treasure_eth_addr: row.try_get("treasure_eth_addr")?,
            treasure_encrypted_key: row.try_get("treasure_encrypted_key")?,
            receiver_eth_addr: row.try_get("receiver_eth_addr")?,
            starting_claim_clock: row.try_get("starting_claim_clock")?,
            gas_status: stage_status(row, "gas_status")?,
            claim_status: stage_status(row, "claim_status")?,
            reclaim_status: stage_status(row, "reclaim_status")?,
            transactions: tx_log(row)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn bind_upsert(
        &self,
        query: Query<'static, Postgres, PgArguments>,
    ) -> AppResult<Query<'static, Postgres, PgArguments>> {
        Ok(query
            .bind(self.id)
            .bind(self.genesis_hash.clone())
            .bind(self.sector_idx)
            .bind(self.treasure_eth_addr.clone())
            .bind(self.treasure_encrypted_key.clone())
            .bind(self.receiver_eth_addr.clone())
            .bind(self.starting_claim_clock)
            .bind(self.gas_status.code())
            .bind(self.claim_status.code())
            .bind(self.reclaim_status.code())
            .bind(Json(self.transactions.clone()))
            .bind(self.created_at)
            .bind(self.updated_at))
    }
}

impl PgRecord for LegacyReclaim {
    const TABLE: &'static str = "legacy_reclaims";
    const COLUMNS: &'static str = "id, genesis_hash, eth_addr, encrypted_key, \
        starting_claim_clock, gas_status, claim_status, reclaim_status, transactions, \
        created_at, updated_at";
    const UPSERT: &'static str = r#"
        INSERT INTO legacy_reclaims (
            id, genesis_hash, eth_addr, encrypted_key, starting_claim_clock,
            gas_status, claim_status, reclaim_status, transactions, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (id) DO UPDATE SET
            starting_claim_clock = EXCLUDED.starting_claim_clock,
            gas_status = EXCLUDED.gas_status,
            claim_status = EXCLUDED.claim_status,
            reclaim_status = EXCLUDED.reclaim_status,
            transactions = EXCLUDED.transactions,
            updated_at = EXCLUDED.updated_at
    "#;

    fn status_column(axis: ClaimAxis) -> &'static str {
        claim_status_column(axis)
    }

    fn status_code(status: StageStatus) -> i16 {
        status.code()
    }

    fn from_row(row: &PgRow) -> AppResult<Self> {
        Ok(LegacyReclaim {
            id: row.try_get("id")?,
            genesis_hash: row.try_get("genesis_hash")?,
            eth_addr: row.try_get("eth_addr")?,
            encrypted_key: row.try_get("encrypted_key")?,
            starting_claim_clock: row.try_get("starting_claim_clock")?,
            gas_status: stage_status(row, "gas_status")?,
            claim_status: stage_status(row, "claim_status")?,
            reclaim_status: stage_status(row, "reclaim_status")?,
            transactions: tx_log(row)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn bind_upsert(
        &self,
        query: Query<'static, Postgres, PgArguments>,
    ) -> AppResult<Query<'static, Postgres, PgArguments>> {
        Ok(query
            .bind(self.id)
            .bind(self.genesis_hash.clone())
            .bind(self.eth_addr.clone())
            .bind(self.encrypted_key.clone())
            .bind(self.starting_claim_clock)
            .bind(self.gas_status.code())
            .bind(self.claim_status.code())
            .bind(self.reclaim_status.code())
            .bind(Json(self.transactions.clone()))
            .bind(self.created_at)
            .bind(self.updated_at))
    }
}
