//! Catalog persistence, raw batch archive and HTTP fetch utilities for PriceDragon.

pub mod archive;
pub mod catalog;
pub mod http;
pub mod memory;
pub mod postgres;

pub use archive::{sha256_hex, ArchivedBatch, ArchivedRecords, BatchOrigin, RawBatchArchive};
pub use catalog::{CatalogStore, CatalogTx, StoreError, STALE_SESSION_MESSAGE};
pub use http::{BackoffPolicy, FetchConfig, FetchError, FetchedPage, HttpFetcher};
pub use memory::MemoryCatalogStore;
pub use postgres::PgCatalogStore;

pub const CRATE_NAME: &str = "pricedragon-storage";
