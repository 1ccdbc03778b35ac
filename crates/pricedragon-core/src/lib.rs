//! Core catalog model for PriceDragon: raw scraped records, the unified catalog,
//! price history snapshots, cross-platform match edges and ingestion sessions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricedragon-core";

/// Similarity at or above which a match edge is classified `exact`.
pub const EXACT_MATCH_THRESHOLD: f64 = 0.9;

pub const DEFAULT_CURRENCY: &str = "TWD";

/// Supported e-commerce platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Pchome,
    Momo,
    Shopee,
    Yahoo,
    Ruten,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Pchome,
        Platform::Momo,
        Platform::Shopee,
        Platform::Yahoo,
        Platform::Ruten,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Pchome => "pchome",
            Platform::Momo => "momo",
            Platform::Shopee => "shopee",
            Platform::Yahoo => "yahoo",
            Platform::Ruten => "ruten",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported platform `{0}`")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    /// Case-insensitive; surrounding whitespace is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| UnknownPlatform(s.to_string()))
    }
}

/// One scraped listing as handed over by a record source. Nothing is guaranteed:
/// any field may be missing or malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawRecord {
    #[serde(default)]
    pub platform: String,
    #[serde(default, alias = "platform_product_id")]
    pub product_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Number or text such as `"$22,299"`; coerced by the field extractor.
    #[serde(default)]
    pub price: Option<JsonValue>,
    #[serde(default)]
    pub original_price: Option<JsonValue>,
    #[serde(default)]
    pub availability: Option<bool>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub stock_status: Option<String>,
    #[serde(default)]
    pub promotional_tag: Option<String>,
}

/// A cleaned, enriched and validated record, ready to be merged into the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductObservation {
    pub platform: Platform,
    pub product_id: String,
    pub name: String,
    pub normalized_name: String,
    pub description: Option<String>,
    pub brand: String,
    pub model: String,
    pub category: Option<String>,
    pub url: String,
    pub image_url: Option<String>,
    pub current_price: f64,
    pub original_price: f64,
    pub discount_percentage: f64,
    pub availability: bool,
    pub stock_status: Option<String>,
    pub promotional_tag: Option<String>,
    pub price_category: String,
    pub storage_gb: Option<u32>,
    pub quality_score: f64,
}

/// Discount in percent of the original price; always within `[0, 100]`.
pub fn discount_percentage(current: f64, original: f64) -> f64 {
    if !current.is_finite() || !original.is_finite() || original <= 0.0 || original <= current {
        return 0.0;
    }
    ((original - current) / original * 100.0).clamp(0.0, 100.0)
}

/// Unified product record, unique per `(platform, platform_product_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: Uuid,
    pub platform: Platform,
    pub platform_product_id: String,
    pub name: String,
    /// Matching key only; never displayed.
    pub normalized_name: String,
    pub description: Option<String>,
    pub brand: String,
    pub model: String,
    pub category: Option<String>,
    pub url: String,
    pub image_url: Option<String>,
    pub current_price: f64,
    pub original_price: f64,
    pub discount_percentage: f64,
    pub currency: String,
    pub is_available: bool,
    pub stock_status: Option<String>,
    /// Price tier label of the latest observation, e.g. `mid-range`.
    pub price_category: String,
    pub storage_gb: Option<u32>,
    pub data_quality_score: f64,
    pub last_scraped: DateTime<Utc>,
    pub scrape_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogEntry {
    /// First observation of a `(platform, product id)` pair.
    pub fn from_observation(obs: &ProductObservation, currency: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            platform: obs.platform,
            platform_product_id: obs.product_id.clone(),
            name: obs.name.clone(),
            normalized_name: obs.normalized_name.clone(),
            description: obs.description.clone(),
            brand: obs.brand.clone(),
            model: obs.model.clone(),
            category: obs.category.clone(),
            url: obs.url.clone(),
            image_url: obs.image_url.clone(),
            current_price: obs.current_price,
            original_price: obs.original_price,
            discount_percentage: obs.discount_percentage,
            currency: currency.to_string(),
            is_available: obs.availability,
            stock_status: obs.stock_status.clone(),
            price_category: obs.price_category.clone(),
            storage_gb: obs.storage_gb,
            data_quality_score: obs.quality_score,
            last_scraped: now,
            scrape_count: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Re-observation of an existing entry. `id` and `created_at` never change.
    ///
    /// Brand, model, category and description are only overwritten when the new
    /// observation carries a value, so a sparser scrape cannot erase enrichment.
    pub fn apply_observation(&mut self, obs: &ProductObservation, now: DateTime<Utc>) {
        self.name = obs.name.clone();
        self.normalized_name = obs.normalized_name.clone();
        self.current_price = obs.current_price;
        self.original_price = obs.original_price;
        self.discount_percentage = obs.discount_percentage;
        self.is_available = obs.availability;
        self.stock_status = obs.stock_status.clone();
        self.price_category = obs.price_category.clone();
        self.url = obs.url.clone();
        if obs.image_url.is_some() {
            self.image_url = obs.image_url.clone();
        }
        if !obs.brand.is_empty() {
            self.brand = obs.brand.clone();
        }
        if !obs.model.is_empty() {
            self.model = obs.model.clone();
        }
        if obs.category.is_some() {
            self.category = obs.category.clone();
        }
        if obs.description.is_some() {
            self.description = obs.description.clone();
        }
        if obs.storage_gb.is_some() {
            self.storage_gb = obs.storage_gb;
        }
        self.data_quality_score = obs.quality_score;
        self.scrape_count = self.scrape_count.saturating_add(1);
        self.last_scraped = now;
        self.updated_at = now;
    }

    pub fn key(&self) -> (Platform, &str) {
        (self.platform, self.platform_product_id.as_str())
    }
}

/// Append-only price snapshot taken on every observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryRecord {
    pub id: Uuid,
    pub entry_id: Uuid,
    pub platform: Platform,
    pub price: f64,
    pub original_price: f64,
    pub discount_percentage: f64,
    pub currency: String,
    pub availability: bool,
    pub stock_status: Option<String>,
    pub promotional_tag: Option<String>,
    pub scraped_at: DateTime<Utc>,
    pub session_id: String,
}

impl PriceHistoryRecord {
    pub fn snapshot(
        entry: &CatalogEntry,
        obs: &ProductObservation,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entry_id: entry.id,
            platform: entry.platform,
            price: obs.current_price,
            original_price: obs.original_price,
            discount_percentage: obs.discount_percentage,
            currency: entry.currency.clone(),
            availability: obs.availability,
            stock_status: obs.stock_status.clone(),
            promotional_tag: obs.promotional_tag.clone(),
            scraped_at: now,
            session_id: session_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Similar,
    Exact,
}

impl MatchType {
    pub fn for_score(score: f64) -> Self {
        if score >= EXACT_MATCH_THRESHOLD {
            MatchType::Exact
        } else {
            MatchType::Similar
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Similar => "similar",
            MatchType::Exact => "exact",
        }
    }
}

impl FromStr for MatchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "similar" => Ok(MatchType::Similar),
            "exact" => Ok(MatchType::Exact),
            other => Err(format!("unknown match type `{other}`")),
        }
    }
}

/// Undirected link between two catalog entries from different platforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEdge {
    pub id: Uuid,
    pub entry_a: Uuid,
    pub entry_b: Uuid,
    pub similarity_score: f64,
    pub match_type: MatchType,
    pub algorithm: String,
    pub is_verified: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl MatchEdge {
    pub fn new(
        entry_a: Uuid,
        entry_b: Uuid,
        similarity_score: f64,
        algorithm: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let similarity_score = similarity_score.clamp(0.0, 1.0);
        Self {
            id: Uuid::new_v4(),
            entry_a,
            entry_b,
            similarity_score,
            match_type: MatchType::for_score(similarity_score),
            algorithm: algorithm.into(),
            is_verified: false,
            is_active: true,
            created_at: now,
        }
    }

    /// True for `{a, b}` in either order.
    pub fn connects(&self, a: Uuid, b: Uuid) -> bool {
        (self.entry_a == a && self.entry_b == b) || (self.entry_a == b && self.entry_b == a)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(format!("unknown session status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("session {session_id} is already {status:?}")]
pub struct SessionTransitionError {
    pub session_id: String,
    pub status: SessionStatus,
}

/// Bookkeeping for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionSession {
    pub session_id: String,
    pub query: String,
    pub platforms: Vec<String>,
    pub products_found: u32,
    pub success_rate: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub error_message: Option<String>,
}

impl IngestionSession {
    pub fn start(query: impl Into<String>, platforms: impl IntoIterator<Item = String>) -> Self {
        let mut platforms: Vec<String> = platforms.into_iter().collect();
        platforms.sort();
        platforms.dedup();
        Self {
            session_id: Uuid::new_v4().to_string(),
            query: query.into(),
            platforms,
            products_found: 0,
            success_rate: 0.0,
            started_at: Utc::now(),
            completed_at: None,
            status: SessionStatus::Running,
            error_message: None,
        }
    }

    /// Starts a session under an id chosen beforehand, e.g. one raw batches were already
    /// archived under.
    pub fn start_with_id(
        session_id: impl Into<String>,
        query: impl Into<String>,
        platforms: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::start(query, platforms)
        }
    }

    pub fn complete(
        &mut self,
        products_found: u32,
        success_rate: f64,
        now: DateTime<Utc>,
    ) -> Result<(), SessionTransitionError> {
        self.ensure_running()?;
        self.products_found = products_found;
        self.success_rate = success_rate;
        self.completed_at = Some(now);
        self.status = SessionStatus::Completed;
        Ok(())
    }

    pub fn fail(
        &mut self,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), SessionTransitionError> {
        self.ensure_running()?;
        self.completed_at = Some(now);
        self.status = SessionStatus::Failed;
        self.error_message = Some(message.into());
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), SessionTransitionError> {
        if self.status.is_terminal() {
            return Err(SessionTransitionError {
                session_id: self.session_id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }
}

/// `accepted / total`, or 0 for an empty batch.
pub fn success_rate(accepted: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        accepted as f64 / total as f64
    }
}
