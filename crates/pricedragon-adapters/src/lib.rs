//! Record source contracts + config-driven sources standing in for the platform scrapers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricedragon_core::{Platform, RawRecord};
use pricedragon_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod html;
mod json;

pub use html::{HtmlListingSource, SelectorConfig};
pub use json::JsonFixtureSource;

pub const CRATE_NAME: &str = "pricedragon-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Json,
    Html,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Fixture,
    Live,
}

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub platform: Platform,
    pub display_name: String,
    pub enabled: bool,
    pub format: SourceFormat,
    pub mode: SourceMode,
    #[serde(default)]
    pub fixture_path: Option<String>,
    /// May contain a `{query}` placeholder, substituted url-encoded.
    #[serde(default)]
    pub listing_urls: Vec<String>,
    /// Prefix for relative product links found in listings.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub selectors: Option<SelectorConfig>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    pub fn listing_urls_for(&self, query: &str) -> Vec<String> {
        self.listing_urls
            .iter()
            .map(|template| expand_listing_url(template, query))
            .collect()
    }
}

pub fn expand_listing_url(template: &str, query: &str) -> String {
    template.replace("{query}", &urlencoding::encode(query))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl FetchContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }
}

impl Default for FetchContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Records handed over by one source. `decode_errors` holds values that could not even be
/// read as a raw record; they never abort the rest of the batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceBatch {
    pub records: Vec<RawRecord>,
    pub decode_errors: Vec<String>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed payload from {source_id}: {message}")]
    Malformed { source_id: String, message: String },
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("source {source_id} misconfigured: {message}")]
    Config { source_id: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;
    fn platform(&self) -> Platform;

    async fn fetch(&self, ctx: &FetchContext, query: &str) -> Result<SourceBatch, SourceError>;
}

pub(crate) fn read_fixture(path: &Path) -> Result<String, SourceError> {
    std::fs::read_to_string(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn fixture_path(config: &SourceConfig, workspace_root: &Path) -> Result<PathBuf, SourceError> {
    config
        .fixture_path
        .as_deref()
        .map(|rel| workspace_root.join(rel))
        .ok_or_else(|| SourceError::Config {
            source_id: config.source_id.clone(),
            message: "fixture mode requires fixture_path".to_string(),
        })
}

/// Builds the source described by one registry entry. Live sources need a fetcher.
pub fn source_from_config(
    config: &SourceConfig,
    workspace_root: &Path,
    fetcher: Option<Arc<HttpFetcher>>,
) -> Result<Arc<dyn RecordSource>, SourceError> {
    match (config.format, config.mode) {
        (SourceFormat::Json, SourceMode::Fixture) => Ok(Arc::new(JsonFixtureSource::new(
            config.source_id.clone(),
            config.platform,
            fixture_path(config, workspace_root)?,
        ))),
        (SourceFormat::Json, SourceMode::Live) => Err(SourceError::Config {
            source_id: config.source_id.clone(),
            message: "json sources only support fixture mode".to_string(),
        }),
        (SourceFormat::Html, mode) => {
            let selectors = config.selectors.clone().ok_or_else(|| SourceError::Config {
                source_id: config.source_id.clone(),
                message: "html sources require selectors".to_string(),
            })?;
            let source = match mode {
                SourceMode::Fixture => {
                    HtmlListingSource::from_fixture(config, selectors, fixture_path(config, workspace_root)?)
                }
                SourceMode::Live => {
                    let fetcher = fetcher.ok_or_else(|| SourceError::Config {
                        source_id: config.source_id.clone(),
                        message: "live mode requires an http fetcher".to_string(),
                    })?;
                    HtmlListingSource::live(config, selectors, fetcher)
                }
            };
            Ok(Arc::new(source?))
        }
    }
}

pub fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> SourceConfig {
        serde_json::from_str(json).expect("config")
    }

    #[test]
    fn listing_urls_encode_the_query() {
        let cfg = config(
            r#"{"source_id":"momo-search","platform":"momo","display_name":"momo",
                "enabled":true,"format":"html","mode":"live",
                "listing_urls":["https://www.momoshop.com.tw/search/searchShop.jsp?keyword={query}"]}"#,
        );
        assert_eq!(
            cfg.listing_urls_for("iphone 15"),
            vec!["https://www.momoshop.com.tw/search/searchShop.jsp?keyword=iphone%2015".to_string()]
        );
    }

    #[test]
    fn misconfigured_sources_are_reported() {
        let root = workspace_root();
        let no_fixture = config(
            r#"{"source_id":"pchome-search","platform":"pchome","display_name":"PChome",
                "enabled":true,"format":"json","mode":"fixture"}"#,
        );
        assert!(matches!(
            source_from_config(&no_fixture, &root, None),
            Err(SourceError::Config { .. })
        ));

        let live_without_fetcher = config(
            r#"{"source_id":"momo-search","platform":"momo","display_name":"momo",
                "enabled":true,"format":"html","mode":"live",
                "selectors":{"item":".goods","name":".name","price":".price","link":"a"}}"#,
        );
        assert!(matches!(
            source_from_config(&live_without_fetcher, &root, None),
            Err(SourceError::Config { .. })
        ));
    }
}
