//! Postgres catalog store. Uniqueness of `(platform, platform_product_id)` and of active
//! match pairs is also enforced by the schema in `migrations/`.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricedragon_core::{
    CatalogEntry, IngestionSession, MatchEdge, MatchType, Platform, PriceHistoryRecord,
    SessionStatus,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::catalog::{CatalogStore, CatalogTx, StoreError, STALE_SESSION_MESSAGE};

const ENTRY_COLUMNS: &str = r#"
    id, platform, platform_product_id, name, normalized_name, description, brand, model,
    category, url, image_url, current_price, original_price, discount_percentage, currency,
    is_available, stock_status, data_quality_score, last_scraped, scrape_count, created_at,
    updated_at, price_category, storage_gb
"#;

const HISTORY_COLUMNS: &str = r#"
    id, entry_id, platform, price, original_price, discount_percentage, currency,
    availability, stock_status, promotional_tag, scraped_at, session_id
"#;

const EDGE_COLUMNS: &str = r#"
    id, entry_a, entry_b, similarity_score, match_type, algorithm, is_verified, is_active,
    created_at
"#;

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running catalog migrations")
    }
}

pub struct PgCatalogTx {
    tx: Transaction<'static, Postgres>,
}

fn decode_platform(raw: String) -> Result<Platform, StoreError> {
    raw.parse()
        .map_err(|err: pricedragon_core::UnknownPlatform| StoreError::Decode(err.to_string()))
}

fn entry_from_row(row: &PgRow) -> Result<CatalogEntry, StoreError> {
    let scrape_count: Option<i32> = row.try_get("scrape_count")?;
    let storage_gb: Option<i32> = row.try_get("storage_gb")?;
    Ok(CatalogEntry {
        id: row.try_get("id")?,
        platform: decode_platform(row.try_get("platform")?)?,
        platform_product_id: row.try_get("platform_product_id")?,
        name: row.try_get("name")?,
        normalized_name: row.try_get("normalized_name")?,
        description: row.try_get("description")?,
        brand: row.try_get("brand")?,
        model: row.try_get("model")?,
        category: row.try_get("category")?,
        url: row.try_get("url")?,
        image_url: row.try_get("image_url")?,
        current_price: row.try_get("current_price")?,
        original_price: row.try_get("original_price")?,
        discount_percentage: row.try_get("discount_percentage")?,
        currency: row.try_get("currency")?,
        is_available: row.try_get("is_available")?,
        stock_status: row.try_get("stock_status")?,
        price_category: row.try_get("price_category")?,
        storage_gb: storage_gb
            .map(|gb| u32::try_from(gb).map_err(|err| StoreError::Decode(format!("storage_gb: {err}"))))
            .transpose()?,
        data_quality_score: row.try_get("data_quality_score")?,
        last_scraped: row.try_get("last_scraped")?,
        // a NULL count from older rows is treated as never scraped
        scrape_count: scrape_count.unwrap_or(0).max(0) as u32,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn history_from_row(row: &PgRow) -> Result<PriceHistoryRecord, StoreError> {
    Ok(PriceHistoryRecord {
        id: row.try_get("id")?,
        entry_id: row.try_get("entry_id")?,
        platform: decode_platform(row.try_get("platform")?)?,
        price: row.try_get("price")?,
        original_price: row.try_get("original_price")?,
        discount_percentage: row.try_get("discount_percentage")?,
        currency: row.try_get("currency")?,
        availability: row.try_get("availability")?,
        stock_status: row.try_get("stock_status")?,
        promotional_tag: row.try_get("promotional_tag")?,
        scraped_at: row.try_get("scraped_at")?,
        session_id: row.try_get("session_id")?,
    })
}

fn edge_from_row(row: &PgRow) -> Result<MatchEdge, StoreError> {
    let match_type: String = row.try_get("match_type")?;
    Ok(MatchEdge {
        id: row.try_get("id")?,
        entry_a: row.try_get("entry_a")?,
        entry_b: row.try_get("entry_b")?,
        similarity_score: row.try_get("similarity_score")?,
        match_type: match_type.parse::<MatchType>().map_err(StoreError::Decode)?,
        algorithm: row.try_get("algorithm")?,
        is_verified: row.try_get("is_verified")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn session_from_row(row: &PgRow) -> Result<IngestionSession, StoreError> {
    let status: String = row.try_get("status")?;
    let products_found: i32 = row.try_get("products_found")?;
    Ok(IngestionSession {
        session_id: row.try_get("session_id")?,
        query: row.try_get("query")?,
        platforms: row.try_get("platforms")?,
        products_found: u32::try_from(products_found)
            .map_err(|err| StoreError::Decode(format!("products_found: {err}")))?,
        success_rate: row.try_get("success_rate")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        status: status.parse::<SessionStatus>().map_err(StoreError::Decode)?,
        error_message: row.try_get("error_message")?,
    })
}

fn count_to_i32(value: u32, field: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|err| StoreError::Constraint(format!("{field}: {err}")))
}

fn storage_to_i32(value: Option<u32>) -> Result<Option<i32>, StoreError> {
    value.map(|gb| count_to_i32(gb, "storage_gb")).transpose()
}

#[async_trait]
impl CatalogTx for PgCatalogTx {
    async fn find_entry(
        &mut self,
        platform: Platform,
        platform_product_id: &str,
    ) -> Result<Option<CatalogEntry>, StoreError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM catalog_entries \
             WHERE platform = $1 AND platform_product_id = $2 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(platform.as_str())
            .bind(platform_product_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn insert_entry(&mut self, entry: &CatalogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO catalog_entries (
                id, platform, platform_product_id, name, normalized_name, description, brand,
                model, category, url, image_url, current_price, original_price,
                discount_percentage, currency, is_available, stock_status, data_quality_score,
                last_scraped, scrape_count, created_at, updated_at, price_category, storage_gb
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22, $23, $24)
            "#,
        )
        .bind(entry.id)
        .bind(entry.platform.as_str())
        .bind(&entry.platform_product_id)
        .bind(&entry.name)
        .bind(&entry.normalized_name)
        .bind(&entry.description)
        .bind(&entry.brand)
        .bind(&entry.model)
        .bind(&entry.category)
        .bind(&entry.url)
        .bind(&entry.image_url)
        .bind(entry.current_price)
        .bind(entry.original_price)
        .bind(entry.discount_percentage)
        .bind(&entry.currency)
        .bind(entry.is_available)
        .bind(&entry.stock_status)
        .bind(entry.data_quality_score)
        .bind(entry.last_scraped)
        .bind(count_to_i32(entry.scrape_count, "scrape_count")?)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .bind(&entry.price_category)
        .bind(storage_to_i32(entry.storage_gb)?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_entry(&mut self, entry: &CatalogEntry) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE catalog_entries
               SET name = $2,
                   normalized_name = $3,
                   description = $4,
                   brand = $5,
                   model = $6,
                   category = $7,
                   url = $8,
                   image_url = $9,
                   current_price = $10,
                   original_price = $11,
                   discount_percentage = $12,
                   is_available = $13,
                   stock_status = $14,
                   data_quality_score = $15,
                   last_scraped = $16,
                   scrape_count = $17,
                   updated_at = $18,
                   price_category = $19,
                   storage_gb = $20
             WHERE id = $1
            "#,
        )
        .bind(entry.id)
        .bind(&entry.name)
        .bind(&entry.normalized_name)
        .bind(&entry.description)
        .bind(&entry.brand)
        .bind(&entry.model)
        .bind(&entry.category)
        .bind(&entry.url)
        .bind(&entry.image_url)
        .bind(entry.current_price)
        .bind(entry.original_price)
        .bind(entry.discount_percentage)
        .bind(entry.is_available)
        .bind(&entry.stock_status)
        .bind(entry.data_quality_score)
        .bind(entry.last_scraped)
        .bind(count_to_i32(entry.scrape_count, "scrape_count")?)
        .bind(entry.updated_at)
        .bind(&entry.price_category)
        .bind(storage_to_i32(entry.storage_gb)?)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Constraint(format!(
                "update of unknown entry {}",
                entry.id
            )));
        }
        Ok(())
    }

    async fn append_history(&mut self, record: &PriceHistoryRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO price_history (
                id, entry_id, platform, price, original_price, discount_percentage, currency,
                availability, stock_status, promotional_tag, scraped_at, session_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.id)
        .bind(record.entry_id)
        .bind(record.platform.as_str())
        .bind(record.price)
        .bind(record.original_price)
        .bind(record.discount_percentage)
        .bind(&record.currency)
        .bind(record.availability)
        .bind(&record.stock_status)
        .bind(&record.promotional_tag)
        .bind(record.scraped_at)
        .bind(&record.session_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn active_edge_exists(&mut self, a: Uuid, b: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1
                  FROM match_edges
                 WHERE is_active
                   AND ((entry_a = $1 AND entry_b = $2) OR (entry_a = $2 AND entry_b = $1))
            ) AS present
            "#,
        )
        .bind(a)
        .bind(b)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.try_get("present")?)
    }

    async fn insert_edge(&mut self, edge: &MatchEdge) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO match_edges (
                id, entry_a, entry_b, similarity_score, match_type, algorithm, is_verified,
                is_active, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(edge.id)
        .bind(edge.entry_a)
        .bind(edge.entry_b)
        .bind(edge.similarity_score)
        .bind(edge.match_type.as_str())
        .bind(&edge.algorithm)
        .bind(edge.is_verified)
        .bind(edge.is_active)
        .bind(edge.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn begin(&self) -> Result<Box<dyn CatalogTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgCatalogTx { tx }))
    }

    async fn create_session(&self, session: &IngestionSession) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO ingestion_sessions (
                session_id, query, platforms, products_found, success_rate, started_at,
                completed_at, status, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.query)
        .bind(&session.platforms)
        .bind(count_to_i32(session.products_found, "products_found")?)
        .bind(session.success_rate)
        .bind(session.started_at)
        .bind(session.completed_at)
        .bind(session.status.as_str())
        .bind(&session.error_message)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Conflict(
                format!("session {} already exists", session.session_id),
            )),
            Err(err) => Err(err.into()),
        }
    }

    async fn finalize_session(&self, session: &IngestionSession) -> Result<(), StoreError> {
        if !session.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "session {} cannot be finalized as running",
                session.session_id
            )));
        }
        let result = sqlx::query(
            r#"
            UPDATE ingestion_sessions
               SET products_found = $2,
                   success_rate = $3,
                   completed_at = $4,
                   status = $5,
                   error_message = $6
             WHERE session_id = $1
               AND status = 'running'
            "#,
        )
        .bind(&session.session_id)
        .bind(count_to_i32(session.products_found, "products_found")?)
        .bind(session.success_rate)
        .bind(session.completed_at)
        .bind(session.status.as_str())
        .bind(&session.error_message)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "session {} is not running",
                session.session_id
            )));
        }
        Ok(())
    }

    async fn sweep_stale_sessions(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_sessions
               SET status = 'failed',
                   completed_at = $2,
                   error_message = $3
             WHERE status = 'running'
               AND started_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .bind(STALE_SESSION_MESSAGE)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn session(&self, session_id: &str) -> Result<Option<IngestionSession>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT session_id, query, platforms, products_found, success_rate, started_at,
                   completed_at, status, error_message
              FROM ingestion_sessions
             WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn entries(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM catalog_entries ORDER BY created_at, id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn entries_by_ids(&self, ids: &[Uuid]) -> Result<Vec<CatalogEntry>, StoreError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM catalog_entries WHERE id = ANY($1)");
        let rows = sqlx::query(&sql).bind(ids).fetch_all(&self.pool).await?;
        let mut entries = rows
            .iter()
            .map(entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // keep the caller's order so batch matching stays deterministic
        entries.sort_by_key(|e| ids.iter().position(|id| *id == e.id));
        Ok(entries)
    }

    async fn history_for_entry(&self, entry_id: Uuid) -> Result<Vec<PriceHistoryRecord>, StoreError> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM price_history WHERE entry_id = $1 ORDER BY scraped_at, id"
        );
        let rows = sqlx::query(&sql).bind(entry_id).fetch_all(&self.pool).await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn history_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<PriceHistoryRecord>, StoreError> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM price_history WHERE session_id = $1 ORDER BY scraped_at, id"
        );
        let rows = sqlx::query(&sql).bind(session_id).fetch_all(&self.pool).await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn edges(&self) -> Result<Vec<MatchEdge>, StoreError> {
        let sql = format!("SELECT {EDGE_COLUMNS} FROM match_edges ORDER BY created_at, id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(edge_from_row).collect()
    }
}
