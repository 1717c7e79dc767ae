use anyhow::{Context, Result};
use async_trait::async_trait;
use portfolio_manager::{PortfolioState, Position, TradeRecord};
use risk_manager::CircuitBreakerState;

const PORTFOLIO_KEY: &str = "portfolio";
const BREAKER_KEY: &str = "circuit_breaker";
const METRICS_KEY: &str = "agent_metrics";

/// Persistence collaborator: positions, portfolio and breaker state survive
/// restarts; trades are appended and never rewritten.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_position(&self, position: &Position) -> Result<()>;
    async fn load_open_positions(&self) -> Result<Vec<Position>>;
    async fn save_portfolio(&self, state: &PortfolioState) -> Result<()>;
    async fn load_portfolio(&self) -> Result<Option<PortfolioState>>;
    async fn save_breaker(&self, state: &CircuitBreakerState) -> Result<()>;
    async fn load_breaker(&self) -> Result<Option<CircuitBreakerState>>;
    async fn append_trade(&self, trade: &TradeRecord) -> Result<()>;
    /// Most recent first.
    async fn trade_history(&self, limit: usize) -> Result<Vec<TradeRecord>>;
    async fn save_metrics(&self, metrics: &serde_json::Value) -> Result<()>;
    async fn load_metrics(&self) -> Result<Option<serde_json::Value>>;
}

/// `StateStore` over any sqlx-supported database (SQLite by default).
pub struct SqlStateStore {
    pub(crate) db_pool: sqlx::AnyPool,
}

impl SqlStateStore {
    pub fn new(db_pool: sqlx::AnyPool) -> Self {
        Self { db_pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let db_pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .with_context(|| format!("connecting to {}", database_url))?;
        let store = Self::new(db_pool);
        store.init_tables().await?;
        Ok(store)
    }

    pub async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.db_pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.db_pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trade_history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                position_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                action TEXT NOT NULL,
                price REAL NOT NULL,
                quantity REAL NOT NULL,
                data TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            )",
        )
        .execute(&self.db_pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)")
            .execute(&self.db_pool)
            .await
            .ok();
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trade_history_symbol ON trade_history(symbol)")
            .execute(&self.db_pool)
            .await
            .ok();

        Ok(())
    }

    pub async fn save_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_state (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    pub async fn load_state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM agent_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.db_pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn save_json<T: serde::Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.save_state(key, &json).await
    }

    async fn load_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.load_state(key).await? {
            Some(raw) => {
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("corrupt {} state", key))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StateStore for SqlStateStore {
    async fn save_position(&self, position: &Position) -> Result<()> {
        let data = serde_json::to_string(position)?;
        sqlx::query(
            "INSERT INTO positions (id, symbol, status, data, updated_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, data = excluded.data,
                 updated_at = excluded.updated_at",
        )
        .bind(position.id.to_string())
        .bind(&position.symbol)
        .bind(position.status.as_str())
        .bind(data)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn load_open_positions(&self) -> Result<Vec<Position>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT data FROM positions WHERE status = 'OPEN' ORDER BY symbol")
                .fetch_all(&self.db_pool)
                .await?;
        rows.into_iter()
            .map(|(data,)| serde_json::from_str(&data).context("corrupt position row"))
            .collect()
    }

    async fn save_portfolio(&self, state: &PortfolioState) -> Result<()> {
        self.save_json(PORTFOLIO_KEY, state).await
    }

    async fn load_portfolio(&self) -> Result<Option<PortfolioState>> {
        self.load_json(PORTFOLIO_KEY).await
    }

    async fn save_breaker(&self, state: &CircuitBreakerState) -> Result<()> {
        self.save_json(BREAKER_KEY, state).await
    }

    async fn load_breaker(&self) -> Result<Option<CircuitBreakerState>> {
        self.load_json(BREAKER_KEY).await
    }

    async fn append_trade(&self, trade: &TradeRecord) -> Result<()> {
        let data = serde_json::to_string(trade)?;
        let action = match trade.action {
            portfolio_manager::TradeAction::Open => "OPEN",
            portfolio_manager::TradeAction::Close => "CLOSE",
        };
        sqlx::query(
            "INSERT INTO trade_history
             (id, position_id, symbol, action, price, quantity, data, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(trade.id.to_string())
        .bind(trade.position_id.to_string())
        .bind(&trade.symbol)
        .bind(action)
        .bind(trade.price)
        .bind(trade.quantity)
        .bind(data)
        .bind(trade.timestamp.to_rfc3339())
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn trade_history(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT data FROM trade_history ORDER BY seq DESC LIMIT ?")
                .bind(limit as i64)
                .fetch_all(&self.db_pool)
                .await?;
        rows.into_iter()
            .map(|(data,)| serde_json::from_str(&data).context("corrupt trade row"))
            .collect()
    }

    async fn save_metrics(&self, metrics: &serde_json::Value) -> Result<()> {
        self.save_json(METRICS_KEY, metrics).await
    }

    async fn load_metrics(&self) -> Result<Option<serde_json::Value>> {
        self.load_json(METRICS_KEY).await
    }
}
