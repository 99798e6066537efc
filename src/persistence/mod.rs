//! SQLite persistence for backtest run history.
//!
//! Stores:
//! - One summary row per backtest run (`runs`)
//! - The full ledger of each run (`ledger_rows`)
//!
//! Decimals are stored as TEXT to keep them exact; undefined values are NULL.

use crate::backtest::{BacktestResult, GapPolicy, PnlRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Summary of a stored run.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub symbol: String,
    pub threshold: Decimal,
    pub gap_policy: GapPolicy,
    pub events: usize,
    pub cumulative_pnl: Option<Decimal>,
    pub total_funding_pnl: Decimal,
    pub total_basis_pnl: Decimal,
    pub max_drawdown: Decimal,
    pub sharpe_ratio: Decimal,
    pub first_undefined_index: Option<usize>,
}

/// A stored ledger line.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredLedgerRow {
    pub index: usize,
    pub funding_time: i64,
    pub funding_rate: Decimal,
    pub futures_position: i8,
    pub spot_position: i8,
    pub pnl: PnlRecord,
    pub failure: Option<String>,
}

/// SQLite-backed run history.
pub struct RunStore {
    conn: Connection,
}

impl RunStore {
    /// Open the store, initializing the database if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self { conn };
        store.init_schema()?;

        info!("Run store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                symbol TEXT NOT NULL,
                threshold TEXT NOT NULL,
                gap_policy TEXT NOT NULL,
                events INTEGER NOT NULL,
                start_time TEXT,
                end_time TEXT,
                cumulative_pnl TEXT,
                total_funding_pnl TEXT NOT NULL,
                total_basis_pnl TEXT NOT NULL,
                max_drawdown TEXT NOT NULL,
                sharpe_ratio TEXT NOT NULL,
                first_undefined_index INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_runs_symbol ON runs(symbol);

            CREATE TABLE IF NOT EXISTS ledger_rows (
                run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                idx INTEGER NOT NULL,
                funding_time INTEGER NOT NULL,
                funding_rate TEXT NOT NULL,
                mark_price TEXT,
                spot_price TEXT,
                spot_price_timestamp INTEGER,
                futures_price TEXT,
                futures_price_timestamp INTEGER,
                futures_position INTEGER NOT NULL,
                spot_position INTEGER NOT NULL,
                funding_rate_pnl TEXT,
                basis_pnl TEXT,
                total_pnl TEXT,
                cumulative_total_pnl TEXT,
                failure TEXT,
                PRIMARY KEY (run_id, idx)
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Save a run and its ledger. Returns the new run id.
    pub fn save_run(&self, result: &BacktestResult) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;
        let metrics = &result.metrics;

        tx.execute(
            r#"
            INSERT INTO runs (created_at, symbol, threshold, gap_policy, events, start_time, end_time,
                              cumulative_pnl, total_funding_pnl, total_basis_pnl, max_drawdown,
                              sharpe_ratio, first_undefined_index)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                Utc::now().to_rfc3339(),
                result.symbol,
                result.backtest_config.threshold.to_string(),
                result.backtest_config.gap_policy.to_string(),
                result.events_processed as i64,
                result.start_time.map(|t| t.to_rfc3339()),
                result.end_time.map(|t| t.to_rfc3339()),
                metrics.cumulative_pnl.map(|p| p.to_string()),
                metrics.total_funding_pnl.to_string(),
                metrics.total_basis_pnl.to_string(),
                metrics.max_drawdown.to_string(),
                metrics.sharpe_ratio.to_string(),
                metrics.first_undefined_index.map(|i| i as i64),
            ],
        )?;
        let run_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO ledger_rows (run_id, idx, funding_time, funding_rate, mark_price,
                                         spot_price, spot_price_timestamp, futures_price,
                                         futures_price_timestamp, futures_position, spot_position,
                                         funding_rate_pnl, basis_pnl, total_pnl,
                                         cumulative_total_pnl, failure)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                "#,
            )?;

            for (idx, row) in result.ledger.iter().enumerate() {
                let event = &row.enriched.event;
                stmt.execute(params![
                    run_id,
                    idx as i64,
                    event.funding_time,
                    event.funding_rate.to_string(),
                    event.mark_price.map(|p| p.to_string()),
                    row.enriched.spot_price().map(|p| p.to_string()),
                    row.enriched.spot_price_timestamp(),
                    row.enriched.futures_price().map(|p| p.to_string()),
                    row.enriched.futures_price_timestamp(),
                    row.position.futures(),
                    row.position.spot(),
                    row.pnl.funding_rate_pnl.map(|p| p.to_string()),
                    row.pnl.basis_pnl.map(|p| p.to_string()),
                    row.pnl.total_pnl.map(|p| p.to_string()),
                    row.pnl.cumulative_total_pnl.map(|p| p.to_string()),
                    row.failure,
                ])?;
            }
        }

        tx.commit()?;

        debug!(
            run_id,
            symbol = %result.symbol,
            rows = result.ledger.len(),
            "Run saved to database"
        );
        Ok(run_id)
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, created_at, symbol, threshold, gap_policy, events, cumulative_pnl,
                   total_funding_pnl, total_basis_pnl, max_drawdown, sharpe_ratio,
                   first_undefined_index
            FROM runs ORDER BY id DESC LIMIT ?1
            "#,
        )?;

        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(RawRun {
                    id: row.get(0)?,
                    created_at: row.get(1)?,
                    symbol: row.get(2)?,
                    threshold: row.get(3)?,
                    gap_policy: row.get(4)?,
                    events: row.get(5)?,
                    cumulative_pnl: row.get(6)?,
                    total_funding_pnl: row.get(7)?,
                    total_basis_pnl: row.get(8)?,
                    max_drawdown: row.get(9)?,
                    sharpe_ratio: row.get(10)?,
                    first_undefined_index: row.get(11)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(RawRun::into_record).collect()
    }

    /// Summary of one run.
    pub fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        let raw = self
            .conn
            .query_row(
                r#"
                SELECT id, created_at, symbol, threshold, gap_policy, events, cumulative_pnl,
                       total_funding_pnl, total_basis_pnl, max_drawdown, sharpe_ratio,
                       first_undefined_index
                FROM runs WHERE id = ?1
                "#,
                [run_id],
                |row| {
                    Ok(RawRun {
                        id: row.get(0)?,
                        created_at: row.get(1)?,
                        symbol: row.get(2)?,
                        threshold: row.get(3)?,
                        gap_policy: row.get(4)?,
                        events: row.get(5)?,
                        cumulative_pnl: row.get(6)?,
                        total_funding_pnl: row.get(7)?,
                        total_basis_pnl: row.get(8)?,
                        max_drawdown: row.get(9)?,
                        sharpe_ratio: row.get(10)?,
                        first_undefined_index: row.get(11)?,
                    })
                },
            )
            .optional()?;

        raw.map(RawRun::into_record).transpose()
    }

    /// Ledger of a run in event order.
    pub fn load_ledger(&self, run_id: i64) -> Result<Vec<StoredLedgerRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT idx, funding_time, funding_rate, futures_position, spot_position,
                   funding_rate_pnl, basis_pnl, total_pnl, cumulative_total_pnl, failure
            FROM ledger_rows WHERE run_id = ?1 ORDER BY idx
            "#,
        )?;

        let rows = stmt
            .query_map([run_id], |row| {
                Ok(RawLedgerRow {
                    idx: row.get(0)?,
                    funding_time: row.get(1)?,
                    funding_rate: row.get(2)?,
                    futures_position: row.get(3)?,
                    spot_position: row.get(4)?,
                    funding_rate_pnl: row.get(5)?,
                    basis_pnl: row.get(6)?,
                    total_pnl: row.get(7)?,
                    cumulative_total_pnl: row.get(8)?,
                    failure: row.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(RawLedgerRow::into_row).collect()
    }

    /// Delete a run and its ledger. Returns whether it existed.
    pub fn delete_run(&self, run_id: i64) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM ledger_rows WHERE run_id = ?1", [run_id])?;
        let deleted = tx.execute("DELETE FROM runs WHERE id = ?1", [run_id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    /// Clear all data (for testing or reset).
    pub fn clear_all(&self) -> Result<()> {
        warn!("Clearing all run history");
        self.conn.execute_batch(
            r#"
            DELETE FROM ledger_rows;
            DELETE FROM runs;
            "#,
        )?;
        Ok(())
    }
}

struct RawRun {
    id: i64,
    created_at: String,
    symbol: String,
    threshold: String,
    gap_policy: String,
    events: i64,
    cumulative_pnl: Option<String>,
    total_funding_pnl: String,
    total_basis_pnl: String,
    max_drawdown: String,
    sharpe_ratio: String,
    first_undefined_index: Option<i64>,
}

impl RawRun {
    fn into_record(self) -> Result<RunRecord> {
        Ok(RunRecord {
            id: self.id,
            created_at: DateTime::parse_from_rfc3339(&self.created_at)
                .with_context(|| format!("Invalid created_at for run {}", self.id))?
                .with_timezone(&Utc),
            symbol: self.symbol,
            threshold: parse_decimal(&self.threshold)?,
            gap_policy: GapPolicy::from_str(&self.gap_policy)?,
            events: self.events as usize,
            cumulative_pnl: parse_optional_decimal(self.cumulative_pnl)?,
            total_funding_pnl: parse_decimal(&self.total_funding_pnl)?,
            total_basis_pnl: parse_decimal(&self.total_basis_pnl)?,
            max_drawdown: parse_decimal(&self.max_drawdown)?,
            sharpe_ratio: parse_decimal(&self.sharpe_ratio)?,
            first_undefined_index: self.first_undefined_index.map(|i| i as usize),
        })
    }
}

struct RawLedgerRow {
    idx: i64,
    funding_time: i64,
    funding_rate: String,
    futures_position: i8,
    spot_position: i8,
    funding_rate_pnl: Option<String>,
    basis_pnl: Option<String>,
    total_pnl: Option<String>,
    cumulative_total_pnl: Option<String>,
    failure: Option<String>,
}

impl RawLedgerRow {
    fn into_row(self) -> Result<StoredLedgerRow> {
        Ok(StoredLedgerRow {
            index: self.idx as usize,
            funding_time: self.funding_time,
            funding_rate: parse_decimal(&self.funding_rate)?,
            futures_position: self.futures_position,
            spot_position: self.spot_position,
            pnl: PnlRecord {
                funding_rate_pnl: parse_optional_decimal(self.funding_rate_pnl)?,
                basis_pnl: parse_optional_decimal(self.basis_pnl)?,
                total_pnl: parse_optional_decimal(self.total_pnl)?,
                cumulative_total_pnl: parse_optional_decimal(self.cumulative_total_pnl)?,
            },
            failure: self.failure,
        })
    }
}

fn parse_decimal(value: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("Invalid decimal in database: '{}'", value))
}

fn parse_optional_decimal(value: Option<String>) -> Result<Option<Decimal>> {
    value.as_deref().map(parse_decimal).transpose()
}
