use std::path::PathBuf;

use async_trait::async_trait;
use pricedragon_core::{Platform, RawRecord};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{read_fixture, FetchContext, RecordSource, SourceBatch, SourceError};

/// Replays a captured JSON listing: either a top-level array of records or an object
/// holding one under `products`.
#[derive(Debug, Clone)]
pub struct JsonFixtureSource {
    source_id: String,
    platform: Platform,
    path: PathBuf,
}

impl JsonFixtureSource {
    pub fn new(source_id: impl Into<String>, platform: Platform, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            platform,
            path: path.into(),
        }
    }

    fn decode(&self, text: &str) -> Result<SourceBatch, SourceError> {
        let malformed = |message: String| SourceError::Malformed {
            source_id: self.source_id.clone(),
            message,
        };
        let value: JsonValue =
            serde_json::from_str(text).map_err(|e| malformed(format!("invalid JSON: {e}")))?;
        let items = match value {
            JsonValue::Array(items) => items,
            JsonValue::Object(mut map) => match map.remove("products") {
                Some(JsonValue::Array(items)) => items,
                _ => return Err(malformed("expected a `products` array".to_string())),
            },
            _ => return Err(malformed("expected an array of records".to_string())),
        };

        let mut batch = SourceBatch::default();
        for (index, item) in items.into_iter().enumerate() {
            match serde_json::from_value::<RawRecord>(item) {
                Ok(mut record) => {
                    if record.platform.trim().is_empty() {
                        record.platform = self.platform.as_str().to_string();
                    }
                    batch.records.push(record);
                }
                Err(err) => batch
                    .decode_errors
                    .push(format!("{} record {index}: {err}", self.source_id)),
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl RecordSource for JsonFixtureSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn platform(&self) -> Platform {
        self.platform
    }

    async fn fetch(&self, ctx: &FetchContext, query: &str) -> Result<SourceBatch, SourceError> {
        // fixtures are captured for one query; the live query is only logged
        debug!(run_id = %ctx.run_id, source_id = %self.source_id, query, "replaying json fixture");
        let text = read_fixture(&self.path)?;
        self.decode(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace_root;

    #[tokio::test]
    async fn fixture_records_decode_one_value_at_a_time() {
        let source = JsonFixtureSource::new(
            "pchome-search",
            Platform::Pchome,
            workspace_root().join("fixtures/pchome-search/sample/products.json"),
        );
        let batch = source.fetch(&FetchContext::new(), "iphone").await.expect("batch");

        assert_eq!(batch.records.len(), 5);
        assert_eq!(batch.decode_errors.len(), 1);
        assert!(batch.decode_errors[0].contains("record 5"));
        assert!(batch.records.iter().all(|r| r.platform == "pchome"));
        assert_eq!(batch.records[0].product_id, "DYAJ-A900GK5FZ");
    }

    #[test]
    fn products_wrapper_and_platform_default() {
        let source = JsonFixtureSource::new("yahoo-search", Platform::Yahoo, "unused.json");
        let batch = source
            .decode(r#"{"products":[{"product_id":"Y1","name":"Sony WH-1000XM5 耳機","price":9990}]}"#)
            .expect("batch");
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].platform, "yahoo");

        assert!(matches!(
            source.decode(r#"{"items":[]}"#),
            Err(SourceError::Malformed { .. })
        ));
        assert!(matches!(source.decode("not json"), Err(SourceError::Malformed { .. })));
    }
}
