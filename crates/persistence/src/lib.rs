//! Transactional store for all durable inbox entities, on sqlx. One module
//! per entity family; multi-statement operations (create-with-event,
//! conditional assignment) run inside a single transaction so partial state
//! is never externally visible.

use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

mod channels;
mod contacts;
mod conversations;
mod messages;
mod orgs;
mod sessions;

pub use conversations::ConversationFilter;
pub use messages::{InsertOutcome, StatusAdvance};

#[derive(Clone)]
pub struct InboxStore {
    pool: SqlitePool,
}

impl InboxStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("invalid DATABASE_URL")?
            .create_if_missing(true)
            .foreign_keys(true);

        // A pooled :memory: database would give every connection its own
        // empty copy, so memory databases get a single connection.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("failed to connect to database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;

        info!("inbox store initialized");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn parse_json(raw: String) -> serde_json::Value {
    serde_json::from_str(&raw).unwrap_or_else(|_| serde_json::json!({}))
}
