//! SQLite ledger for fills, submitted actions, heartbeats and bot state.
//!
//! Decimal amounts are stored as TEXT so they round-trip exactly.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::metrics::PortfolioMetrics;
use crate::models::{Fill, TradeAction};

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Bot state stored in database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BotState {
    pub id: i64,
    pub mode: String,
    pub is_running: bool,
    pub cycles: i64,
    pub last_cycle_at: Option<String>,
    pub started_at: String,
    pub updated_at: String,
}

/// Stored heartbeat.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Heartbeat {
    pub id: i64,
    pub timestamp: String,
    pub cash: String,
    pub equity: String,
    pub cost_basis: String,
    pub unrealized_pnl: String,
    pub open_count: i64,
    pub ticket_size: String,
}

/// Counts of submitted actions by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionStats {
    pub executed: i64,
    pub failed: i64,
    pub entries: i64,
    pub take_profits: i64,
    pub stop_losses: i64,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every connection to `sqlite::memory:` is a separate database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                mode TEXT NOT NULL DEFAULT 'live',
                is_running INTEGER NOT NULL DEFAULT 0,
                cycles INTEGER NOT NULL DEFAULT 0,
                last_cycle_at TEXT,
                started_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Account fills, keyed by exchange trade id
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fills (
                txid TEXT PRIMARY KEY,
                trade_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                instrument TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                cost TEXT NOT NULL,
                fee TEXT NOT NULL,
                recorded_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Every action we submitted, successful or not
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instrument TEXT NOT NULL,
                side TEXT NOT NULL,
                tag TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                stop_price TEXT,
                target_price TEXT,
                status TEXT NOT NULL,
                order_id TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS heartbeats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                cash TEXT NOT NULL,
                equity TEXT NOT NULL,
                cost_basis TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                open_count INTEGER NOT NULL,
                ticket_size TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_fills_instrument ON fills(instrument, trade_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trade_actions_status ON trade_actions(status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Bot State ====================

    /// Initialize or get bot state.
    pub async fn init_bot_state(&self, mode: &str) -> Result<BotState> {
        sqlx::query(
            r#"
            INSERT INTO bot_state (id, mode, is_running, started_at, updated_at)
            VALUES (1, ?, 1, datetime('now'), datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                mode = excluded.mode,
                is_running = 1,
                started_at = datetime('now'),
                updated_at = datetime('now')
            "#,
        )
        .bind(mode)
        .execute(&self.pool)
        .await?;

        self.get_bot_state().await
    }

    /// Get current bot state.
    pub async fn get_bot_state(&self) -> Result<BotState> {
        sqlx::query_as::<_, BotState>("SELECT * FROM bot_state WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .context("Bot state not initialized")
    }

    /// Record a completed cycle.
    pub async fn update_bot_state(&self) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE bot_state SET
                cycles = cycles + 1,
                last_cycle_at = datetime('now'),
                updated_at = datetime('now')
            WHERE id = 1
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark bot as stopped.
    pub async fn mark_bot_stopped(&self) -> Result<()> {
        sqlx::query("UPDATE bot_state SET is_running = 0, updated_at = datetime('now') WHERE id = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Fills ====================

    /// Append fills not yet recorded. Returns how many were new.
    pub async fn record_fills(&self, fills: &[Fill]) -> Result<u64> {
        let mut inserted = 0;
        for fill in fills {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO fills
                    (txid, trade_id, timestamp, instrument, side, quantity, price, cost, fee)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&fill.txid)
            .bind(fill.id as i64)
            .bind(fill.timestamp.to_rfc3339())
            .bind(&fill.instrument)
            .bind(fill.side.as_str())
            .bind(fill.quantity.to_string())
            .bind(fill.price.to_string())
            .bind(fill.cost.to_string())
            .bind(fill.fee.to_string())
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to record fill {}", fill.txid))?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    /// Number of fills in the ledger.
    pub async fn fill_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM fills")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ==================== Trade Actions ====================

    /// Record a submitted action. `result` is the order id or the error text.
    pub async fn record_action(
        &self,
        action: &TradeAction,
        result: std::result::Result<&str, &str>,
    ) -> Result<()> {
        let (status, order_id, error) = match result {
            Ok(id) => ("executed", Some(id), None),
            Err(e) => ("failed", None, Some(e)),
        };

        sqlx::query(
            r#"
            INSERT INTO trade_actions
                (instrument, side, tag, quantity, price, stop_price, target_price,
                 status, order_id, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&action.instrument)
        .bind(action.side.as_str())
        .bind(action.tag.as_str())
        .bind(action.quantity.to_string())
        .bind(action.price.to_string())
        .bind(action.stop_price.map(|d| d.to_string()))
        .bind(action.target_price.map(|d| d.to_string()))
        .bind(status)
        .bind(order_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Counts of recorded actions.
    pub async fn action_stats(&self) -> Result<ActionStats> {
        let (executed, failed, entries, take_profits, stop_losses): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COALESCE(SUM(CASE WHEN status = 'executed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'executed' AND tag = 'entry' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'executed' AND tag = 'TP' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'executed' AND tag = 'SL' THEN 1 ELSE 0 END), 0)
                FROM trade_actions
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

        Ok(ActionStats {
            executed,
            failed,
            entries,
            take_profits,
            stop_losses,
        })
    }

    // ==================== Heartbeats ====================

    pub async fn record_heartbeat(&self, metrics: &PortfolioMetrics) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO heartbeats (cash, equity, cost_basis, unrealized_pnl, open_count, ticket_size)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(metrics.cash.to_string())
        .bind(metrics.equity.to_string())
        .bind(metrics.cost_basis.to_string())
        .bind(metrics.unrealized_pnl.to_string())
        .bind(metrics.open_count as i64)
        .bind(metrics.entry_ticket_size.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn latest_heartbeat(&self) -> Result<Option<Heartbeat>> {
        sqlx::query_as::<_, Heartbeat>("SELECT * FROM heartbeats ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load heartbeat")
    }
}

impl Heartbeat {
    /// Parse a stored decimal column, zero if malformed.
    pub fn decimal(value: &str) -> Decimal {
        value.parse().unwrap_or_default()
    }
}
