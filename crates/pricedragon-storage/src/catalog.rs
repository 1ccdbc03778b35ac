//! Catalog store contract shared by the in-memory and Postgres backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricedragon_core::{CatalogEntry, IngestionSession, MatchEdge, Platform, PriceHistoryRecord};
use thiserror::Error;
use uuid::Uuid;

pub const STALE_SESSION_MESSAGE: &str = "stale session swept";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached. Fatal for the whole batch.
    #[error("catalog store unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("could not decode stored row: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db)
                if db.is_unique_violation()
                    || db.is_foreign_key_violation()
                    || db.is_check_violation() =>
            {
                StoreError::Constraint(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => StoreError::Unavailable(err.to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_) => StoreError::Decode(err.to_string()),
            _ => StoreError::Query(err.to_string()),
        }
    }
}

/// A scoped write transaction. Dropping it without `commit` discards every write.
#[async_trait]
pub trait CatalogTx: Send {
    async fn find_entry(
        &mut self,
        platform: Platform,
        platform_product_id: &str,
    ) -> Result<Option<CatalogEntry>, StoreError>;

    async fn insert_entry(&mut self, entry: &CatalogEntry) -> Result<(), StoreError>;

    async fn update_entry(&mut self, entry: &CatalogEntry) -> Result<(), StoreError>;

    async fn append_history(&mut self, record: &PriceHistoryRecord) -> Result<(), StoreError>;

    /// Checks `{a, b}` in both orderings.
    async fn active_edge_exists(&mut self, a: Uuid, b: Uuid) -> Result<bool, StoreError>;

    async fn insert_edge(&mut self, edge: &MatchEdge) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn CatalogTx>, StoreError>;

    async fn create_session(&self, session: &IngestionSession) -> Result<(), StoreError>;

    /// Persists the terminal state of a `running` session. Terminal sessions are immutable.
    async fn finalize_session(&self, session: &IngestionSession) -> Result<(), StoreError>;

    /// Marks `running` sessions started before `cutoff` as failed; returns how many.
    async fn sweep_stale_sessions(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn session(&self, session_id: &str) -> Result<Option<IngestionSession>, StoreError>;

    async fn entries(&self) -> Result<Vec<CatalogEntry>, StoreError>;

    async fn entries_by_ids(&self, ids: &[Uuid]) -> Result<Vec<CatalogEntry>, StoreError>;

    async fn history_for_entry(&self, entry_id: Uuid) -> Result<Vec<PriceHistoryRecord>, StoreError>;

    async fn history_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<PriceHistoryRecord>, StoreError>;

    async fn edges(&self) -> Result<Vec<MatchEdge>, StoreError>;
}
