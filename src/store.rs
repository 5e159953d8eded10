// =============================================================================
// TradingStore — orders, positions, account snapshots
// =============================================================================
//
// Backed by sqlx's Any driver so the same store runs on SQLite (local, tests)
// and PostgreSQL (production); `database.engine` in the config must agree
// with the URL scheme. Timestamps persist as fixed-width RFC 3339 TEXT so
// lexicographic order matches chronological order; JSON blobs persist as
// TEXT.
//
// Sessions are per-call: each operation acquires from the pool, and
// multi-statement updates run inside a transaction that rolls back on error.
// =============================================================================

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::models::{AccountState, Order, OrderSide, OrderStatus, OrderType, Position};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS orders (
        id TEXT PRIMARY KEY,
        client_order_id TEXT NOT NULL UNIQUE,
        external_order_id TEXT,
        strategy TEXT NOT NULL,
        symbol TEXT NOT NULL,
        exchange TEXT NOT NULL,
        side TEXT NOT NULL,
        order_type TEXT NOT NULL,
        status TEXT NOT NULL,
        quantity DOUBLE PRECISION NOT NULL,
        filled_quantity DOUBLE PRECISION NOT NULL,
        price DOUBLE PRECISION,
        stop_price DOUBLE PRECISION,
        reduce_only INTEGER NOT NULL,
        time_in_force TEXT,
        raw_request TEXT,
        raw_response TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS positions (
        id TEXT PRIMARY KEY,
        symbol TEXT NOT NULL,
        exchange TEXT NOT NULL,
        strategy TEXT NOT NULL,
        quantity DOUBLE PRECISION NOT NULL,
        entry_price DOUBLE PRECISION NOT NULL,
        stop_price DOUBLE PRECISION NOT NULL,
        take_profit_price DOUBLE PRECISION,
        reduce_only_stop_installed INTEGER NOT NULL,
        opened_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        closed_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS account_states (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        equity DOUBLE PRECISION NOT NULL,
        cash DOUBLE PRECISION NOT NULL,
        buying_power DOUBLE PRECISION NOT NULL,
        leverage DOUBLE PRECISION NOT NULL,
        timestamp TEXT NOT NULL
    )",
];

/// Fixed-width tz-aware timestamp text (sortable as TEXT).
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid stored timestamp '{raw}'"))
}

#[derive(Clone)]
pub struct TradingStore {
    pool: AnyPool,
}

impl TradingStore {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Connect per configuration and ensure the schema exists.
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self> {
        sqlx::any::install_default_drivers();

        // An in-memory SQLite database lives inside a single connection.
        let memory = cfg.url.contains(":memory:");
        let max_connections = if memory { 1 } else { cfg.pool_size.max(1) };

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(if memory { 1 } else { 0 })
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(&cfg.url)
            .await
            .with_context(|| format!("failed to connect to database at {}", cfg.url))?;

        for ddl in SCHEMA {
            sqlx::query(ddl)
                .execute(&pool)
                .await
                .context("failed to initialise database schema")?;
        }
        info!(engine = %cfg.engine, "trading store connected");
        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Insert a new order row. Fails on a duplicate `client_order_id`.
    pub async fn insert_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            "INSERT INTO orders (
                id, client_order_id, external_order_id, strategy, symbol, exchange,
                side, order_type, status, quantity, filled_quantity, price,
                stop_price, reduce_only, time_in_force, raw_request, raw_response,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                      $15, $16, $17, $18, $19)",
        )
        .bind(order.id.to_string())
        .bind(&order.client_order_id)
        .bind(order.external_order_id.as_deref())
        .bind(&order.strategy)
        .bind(&order.symbol)
        .bind(&order.exchange)
        .bind(order.side.as_str())
        .bind(order.order_type.as_str())
        .bind(order.status.as_str())
        .bind(order.quantity)
        .bind(order.filled_quantity)
        .bind(order.price)
        .bind(order.stop_price)
        .bind(order.reduce_only as i64)
        .bind(order.time_in_force.as_deref())
        .bind(order.raw_request.as_ref().map(|v| v.to_string()))
        .bind(order.raw_response.as_ref().map(|v| v.to_string()))
        .bind(fmt_ts(order.created_at))
        .bind(fmt_ts(order.updated_at))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert order {}", order.client_order_id))?;
        Ok(())
    }

    /// Whether an order with this idempotency key was already recorded.
    pub async fn order_exists(&self, client_order_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS present FROM orders WHERE client_order_id = $1")
            .bind(client_order_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to check order existence")?;
        Ok(row.is_some())
    }

    pub async fn get_order(&self, client_order_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE client_order_id = $1")
            .bind(client_order_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch order")?;
        row.map(|r| row_to_order(&r)).transpose()
    }

    pub async fn list_orders(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query("SELECT * FROM orders ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .context("failed to list orders")?;
        rows.iter().map(row_to_order).collect()
    }

    /// Advance an order's status. Non-monotone transitions are an invariant
    /// violation: the transaction rolls back and the error propagates.
    pub async fn update_order_status(
        &self,
        client_order_id: &str,
        next: OrderStatus,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT status FROM orders WHERE client_order_id = $1")
            .bind(client_order_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            bail!("order {client_order_id} not found");
        };
        let current_raw: String = row.try_get("status")?;
        let current = OrderStatus::parse(&current_raw)
            .with_context(|| format!("corrupt order status '{current_raw}'"))?;
        if !current.can_transition_to(next) {
            bail!("illegal order status transition {current} -> {next} for {client_order_id}");
        }
        sqlx::query("UPDATE orders SET status = $1, updated_at = $2 WHERE client_order_id = $3")
            .bind(next.as_str())
            .bind(fmt_ts(Utc::now()))
            .bind(client_order_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// Read-modify-write upsert of the open position for (symbol, exchange,
    /// strategy), applying a signed quantity delta and refreshing entry/stop.
    /// Marks the protective stop installed; at most one open row per key.
    pub async fn apply_position_fill(
        &self,
        symbol: &str,
        exchange: &str,
        strategy: &str,
        quantity_delta: f64,
        entry_price: f64,
        stop_price: f64,
    ) -> Result<()> {
        let now = fmt_ts(Utc::now());
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(
            "SELECT id, quantity FROM positions
             WHERE symbol = $1 AND exchange = $2 AND strategy = $3 AND closed_at IS NULL",
        )
        .bind(symbol)
        .bind(exchange)
        .bind(strategy)
        .fetch_optional(&mut *tx)
        .await?;

        match existing {
            Some(row) => {
                let id: String = row.try_get("id")?;
                let quantity: f64 = row.try_get("quantity")?;
                sqlx::query(
                    "UPDATE positions
                     SET quantity = $1, entry_price = $2, stop_price = $3,
                         reduce_only_stop_installed = $4, updated_at = $5
                     WHERE id = $6",
                )
                .bind(quantity + quantity_delta)
                .bind(entry_price)
                .bind(stop_price)
                .bind(1_i64)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO positions (
                        id, symbol, exchange, strategy, quantity, entry_price,
                        stop_price, take_profit_price, reduce_only_stop_installed,
                        opened_at, updated_at, closed_at
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NULL)",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(symbol)
                .bind(exchange)
                .bind(strategy)
                .bind(quantity_delta)
                .bind(entry_price)
                .bind(stop_price)
                .bind(Option::<f64>::None)
                .bind(1_i64)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Record that a reduce-only stop now rests on the venue for the open
    /// position, refreshing its stop price (repair path).
    pub async fn mark_stop_installed(
        &self,
        symbol: &str,
        exchange: &str,
        strategy: &str,
        stop_price: f64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE positions
             SET reduce_only_stop_installed = $1, stop_price = $2, updated_at = $3
             WHERE symbol = $4 AND exchange = $5 AND strategy = $6 AND closed_at IS NULL",
        )
        .bind(1_i64)
        .bind(stop_price)
        .bind(fmt_ts(Utc::now()))
        .bind(symbol)
        .bind(exchange)
        .bind(strategy)
        .execute(&self.pool)
        .await
        .context("failed to mark stop installed")?;
        Ok(())
    }

    pub async fn open_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT * FROM positions WHERE closed_at IS NULL AND quantity != 0
             ORDER BY opened_at",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list open positions")?;
        rows.iter().map(row_to_position).collect()
    }

    /// Total currency-at-risk across open positions (portfolio heat).
    pub async fn open_risk(&self) -> Result<f64> {
        Ok(self
            .open_positions()
            .await?
            .iter()
            .map(Position::open_risk)
            .sum())
    }

    // -------------------------------------------------------------------------
    // Account snapshots
    // -------------------------------------------------------------------------

    pub async fn insert_account_state(&self, state: &AccountState) -> Result<()> {
        sqlx::query(
            "INSERT INTO account_states (
                id, account_id, equity, cash, buying_power, leverage, timestamp
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(state.id.to_string())
        .bind(&state.account_id)
        .bind(state.equity)
        .bind(state.cash)
        .bind(state.buying_power)
        .bind(state.leverage)
        .bind(fmt_ts(state.timestamp))
        .execute(&self.pool)
        .await
        .context("failed to insert account state")?;
        Ok(())
    }

    /// Most recent snapshot across all accounts, if any exists.
    pub async fn latest_account_state(&self) -> Result<Option<AccountState>> {
        let row = sqlx::query("SELECT * FROM account_states ORDER BY timestamp DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch latest account state")?;
        row.map(|r| row_to_account_state(&r)).transpose()
    }
}

impl std::fmt::Debug for TradingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingStore").finish()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_json_col(raw: Option<String>) -> Result<Option<serde_json::Value>> {
    raw.map(|s| serde_json::from_str(&s).context("corrupt JSON column"))
        .transpose()
}

fn row_to_order(row: &AnyRow) -> Result<Order> {
    let id: String = row.try_get("id")?;
    let side: String = row.try_get("side")?;
    let order_type: String = row.try_get("order_type")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let reduce_only: i64 = row.try_get("reduce_only")?;
    Ok(Order {
        id: Uuid::parse_str(&id).context("corrupt order id")?,
        client_order_id: row.try_get("client_order_id")?,
        external_order_id: row.try_get("external_order_id")?,
        strategy: row.try_get("strategy")?,
        symbol: row.try_get("symbol")?,
        exchange: row.try_get("exchange")?,
        side: OrderSide::parse(&side).with_context(|| format!("corrupt order side '{side}'"))?,
        order_type: OrderType::parse(&order_type)
            .with_context(|| format!("corrupt order type '{order_type}'"))?,
        status: OrderStatus::parse(&status)
            .with_context(|| format!("corrupt order status '{status}'"))?,
        quantity: row.try_get("quantity")?,
        filled_quantity: row.try_get("filled_quantity")?,
        price: row.try_get("price")?,
        stop_price: row.try_get("stop_price")?,
        reduce_only: reduce_only != 0,
        time_in_force: row.try_get("time_in_force")?,
        raw_request: parse_json_col(row.try_get("raw_request")?)?,
        raw_response: parse_json_col(row.try_get("raw_response")?)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn row_to_position(row: &AnyRow) -> Result<Position> {
    let id: String = row.try_get("id")?;
    let opened_at: String = row.try_get("opened_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let closed_at: Option<String> = row.try_get("closed_at")?;
    let stop_installed: i64 = row.try_get("reduce_only_stop_installed")?;
    Ok(Position {
        id: Uuid::parse_str(&id).context("corrupt position id")?,
        symbol: row.try_get("symbol")?,
        exchange: row.try_get("exchange")?,
        strategy: row.try_get("strategy")?,
        quantity: row.try_get("quantity")?,
        entry_price: row.try_get("entry_price")?,
        stop_price: row.try_get("stop_price")?,
        take_profit_price: row.try_get("take_profit_price")?,
        reduce_only_stop_installed: stop_installed != 0,
        opened_at: parse_ts(&opened_at)?,
        updated_at: parse_ts(&updated_at)?,
        closed_at: closed_at.as_deref().map(parse_ts).transpose()?,
    })
}

fn row_to_account_state(row: &AnyRow) -> Result<AccountState> {
    let id: String = row.try_get("id")?;
    let timestamp: String = row.try_get("timestamp")?;
    Ok(AccountState {
        id: Uuid::parse_str(&id).context("corrupt account state id")?,
        account_id: row.try_get("account_id")?,
        equity: row.try_get("equity")?,
        cash: row.try_get("cash")?,
        buying_power: row.try_get("buying_power")?,
        leverage: row.try_get("leverage")?,
        timestamp: parse_ts(&timestamp)?,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;

    async fn memory_store() -> TradingStore {
        let cfg = DatabaseConfig {
            engine: "sqlite".into(),
            url: "sqlite::memory:".into(),
            echo: false,
            pool_size: 5,
            connect_args: Default::default(),
        };
        TradingStore::connect(&cfg).await.unwrap()
    }

    fn sample_order(client_order_id: &str) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            client_order_id: client_order_id.to_string(),
            external_order_id: None,
            strategy: "trend".into(),
            symbol: "BTC/USDT".into(),
            exchange: "binanceusdm".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            status: OrderStatus::New,
            quantity: 500.0,
            filled_quantity: 0.0,
            price: Some(105.0),
            stop_price: None,
            reduce_only: false,
            time_in_force: Some("GTC".into()),
            raw_request: Some(serde_json::json!({"symbol": "BTC/USDT"})),
            raw_response: Some(serde_json::json!({"status": "dry_run"})),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn order_round_trips_through_the_store() {
        let store = memory_store().await;
        let order = sample_order("aaaaaaaaaaaaaaaaaaaaaaaa");
        store.insert_order(&order).await.unwrap();

        let loaded = store
            .get_order("aaaaaaaaaaaaaaaaaaaaaaaa")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.client_order_id, order.client_order_id);
        assert_eq!(loaded.side, OrderSide::Buy);
        assert_eq!(loaded.order_type, OrderType::Limit);
        assert_eq!(loaded.status, OrderStatus::New);
        assert_eq!(loaded.raw_response, order.raw_response);
        assert_eq!(loaded.price, Some(105.0));
    }

    #[tokio::test]
    async fn duplicate_client_order_id_is_rejected() {
        let store = memory_store().await;
        store
            .insert_order(&sample_order("bbbbbbbbbbbbbbbbbbbbbbbb"))
            .await
            .unwrap();
        assert!(store
            .insert_order(&sample_order("bbbbbbbbbbbbbbbbbbbbbbbb"))
            .await
            .is_err());
        assert!(store.order_exists("bbbbbbbbbbbbbbbbbbbbbbbb").await.unwrap());
    }

    #[tokio::test]
    async fn status_updates_enforce_the_monotone_lifecycle() {
        let store = memory_store().await;
        store
            .insert_order(&sample_order("cccccccccccccccccccccccc"))
            .await
            .unwrap();

        store
            .update_order_status("cccccccccccccccccccccccc", OrderStatus::Pending)
            .await
            .unwrap();
        store
            .update_order_status("cccccccccccccccccccccccc", OrderStatus::Filled)
            .await
            .unwrap();
        // Terminal: any further transition is rejected and the row is intact.
        assert!(store
            .update_order_status("cccccccccccccccccccccccc", OrderStatus::Pending)
            .await
            .is_err());
        let order = store
            .get_order("cccccccccccccccccccccccc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn position_upsert_keeps_one_open_row_per_key() {
        let store = memory_store().await;
        store
            .apply_position_fill("BTC/USDT", "binanceusdm", "trend", 500.0, 105.0, 101.0)
            .await
            .unwrap();
        store
            .apply_position_fill("BTC/USDT", "binanceusdm", "trend", 250.0, 106.0, 102.0)
            .await
            .unwrap();

        let open = store.open_positions().await.unwrap();
        assert_eq!(open.len(), 1);
        assert!((open[0].quantity - 750.0).abs() < 1e-9);
        assert!((open[0].stop_price - 102.0).abs() < 1e-9);
        assert!(open[0].reduce_only_stop_installed);
    }

    #[tokio::test]
    async fn open_risk_sums_absolute_exposure() {
        let store = memory_store().await;
        store
            .apply_position_fill("BTC/USDT", "binanceusdm", "trend", 1000.0, 50.0, 44.0)
            .await
            .unwrap();
        store
            .apply_position_fill("ETH/USDT", "binanceusdm", "trend", -10.0, 2000.0, 2100.0)
            .await
            .unwrap();

        let risk = store.open_risk().await.unwrap();
        // 1000*6 + 10*100
        assert!((risk - 7000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn latest_account_state_wins_by_timestamp() {
        let store = memory_store().await;
        let older = AccountState {
            id: Uuid::new_v4(),
            account_id: "main".into(),
            equity: 90_000.0,
            cash: 90_000.0,
            buying_power: 90_000.0,
            leverage: 1.0,
            timestamp: Utc::now() - chrono::Duration::hours(1),
        };
        let newer = AccountState {
            id: Uuid::new_v4(),
            account_id: "main".into(),
            equity: 120_000.0,
            cash: 120_000.0,
            buying_power: 120_000.0,
            leverage: 1.0,
            timestamp: Utc::now(),
        };
        store.insert_account_state(&older).await.unwrap();
        store.insert_account_state(&newer).await.unwrap();

        let latest = store.latest_account_state().await.unwrap().unwrap();
        assert!((latest.equity - 120_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trader.db");
        let cfg = DatabaseConfig {
            engine: "sqlite".into(),
            url: format!("sqlite://{}?mode=rwc", path.display()),
            echo: false,
            pool_size: 2,
            connect_args: Default::default(),
        };

        {
            let store = TradingStore::connect(&cfg).await.unwrap();
            store
                .insert_order(&sample_order("dddddddddddddddddddddddd"))
                .await
                .unwrap();
        }
        let store = TradingStore::connect(&cfg).await.unwrap();
        assert!(store.order_exists("dddddddddddddddddddddddd").await.unwrap());
    }
}
