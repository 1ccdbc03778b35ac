use std::sync::Arc;

use chrono::{DateTime, Utc};
use pricedragon_core::{CatalogEntry, PriceHistoryRecord, ProductObservation};
use pricedragon_storage::{CatalogStore, StoreError};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub entry_id: Uuid,
    pub inserted: bool,
    pub scrape_count: u32,
}

/// Sole writer of catalog entries and price history during a run.
#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn CatalogStore>,
    currency: String,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn CatalogStore>, currency: impl Into<String>) -> Self {
        Self {
            store,
            currency: currency.into(),
        }
    }

    /// Inserts or refreshes the entry for the observation's key and appends one history
    /// snapshot, both in a single transaction. Nothing is visible unless both succeed.
    pub async fn upsert(
        &self,
        obs: &ProductObservation,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.store.begin().await?;

        let (entry, inserted) = match tx.find_entry(obs.platform, &obs.product_id).await? {
            Some(mut entry) => {
                entry.apply_observation(obs, now);
                tx.update_entry(&entry).await?;
                (entry, false)
            }
            None => {
                let entry = CatalogEntry::from_observation(obs, &self.currency, now);
                tx.insert_entry(&entry).await?;
                (entry, true)
            }
        };

        let snapshot = PriceHistoryRecord::snapshot(&entry, obs, session_id, now);
        tx.append_history(&snapshot).await?;
        tx.commit().await?;

        debug!(
            entry_id = %entry.id,
            platform = %entry.platform,
            product_id = %entry.platform_product_id,
            inserted,
            scrape_count = entry.scrape_count,
            "upserted catalog entry"
        );
        Ok(UpsertOutcome {
            entry_id: entry.id,
            inserted,
            scrape_count: entry.scrape_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricedragon_core::{Platform, DEFAULT_CURRENCY};
    use pricedragon_storage::MemoryCatalogStore;

    fn observation(price: f64) -> ProductObservation {
        ProductObservation {
            platform: Platform::Pchome,
            product_id: "A1".into(),
            name: "iPhone 15 128GB".into(),
            normalized_name: "iphone 15 128gb".into(),
            description: None,
            brand: String::new(),
            model: "iPhone 15".into(),
            category: Some("Electronics".into()),
            url: "https://24h.pchome.com.tw/prod/A1".into(),
            image_url: None,
            current_price: price,
            original_price: 24900.0,
            discount_percentage: pricedragon_core::discount_percentage(price, 24900.0),
            availability: true,
            stock_status: None,
            promotional_tag: None,
            price_category: "premium".into(),
            storage_gb: Some(128),
            quality_score: 0.5,
        }
    }

    #[tokio::test]
    async fn repeated_observation_updates_in_place() {
        let store = Arc::new(MemoryCatalogStore::new());
        let engine = UpsertEngine::new(store.clone(), DEFAULT_CURRENCY);

        let first = engine
            .upsert(&observation(22299.0), "s1", Utc::now())
            .await
            .expect("first");
        let second = engine
            .upsert(&observation(21990.0), "s2", Utc::now())
            .await
            .expect("second");

        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(first.entry_id, second.entry_id);
        assert_eq!(second.scrape_count, first.scrape_count + 1);

        let entries = store.entries().await.expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].current_price, 21990.0);

        let history = store.history_for_entry(first.entry_id).await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].session_id, "s1");
        assert_eq!(history[1].session_id, "s2");
        assert_eq!(history[1].price, 21990.0);
    }
}
