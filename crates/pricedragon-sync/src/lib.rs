//! PriceDragon ingestion: normalization and cross-platform matching over scraped product
//! records, plus the sync runner that feeds it from the configured sources.

pub mod clean;
pub mod config;
pub mod export;
pub mod extract;
pub mod matcher;
pub mod pipeline;
pub mod quality;
pub mod report;
pub mod rules;
pub mod runner;
pub mod upsert;
pub mod validate;

pub use config::{SourceRegistry, SyncConfig};
pub use matcher::{
    composite_similarity, matching_blocks_ratio, name_similarity, MatchOutcome, Matcher,
    MatcherConfig, NameAlgorithm,
};
pub use pipeline::{IngestionPipeline, IngestionReport, IngestionRequest, PipelineError};
pub use rules::{CatalogRules, LookupTables};
pub use runner::{open_store, run_sync_once_from_env, SyncRunSummary, SyncRunner};
pub use upsert::{UpsertEngine, UpsertOutcome};
pub use validate::{RejectReason, Rejection};

pub const CRATE_NAME: &str = "pricedragon-sync";
