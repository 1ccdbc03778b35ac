//! Parquet snapshots of what one run touched, plus a checksummed manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use pricedragon_core::{CatalogEntry, MatchEdge, PriceHistoryRecord};
use pricedragon_storage::sha256_hex;
use serde::{Deserialize, Serialize};
use tokio::fs;

pub const SNAPSHOT_DIR: &str = "snapshots";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub session_id: String,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

fn utf8(name: &str, nullable: bool) -> ArrowField {
    ArrowField::new(name, DataType::Utf8, nullable)
}

fn strings<'a>(values: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
    Arc::new(StringArray::from(values.collect::<Vec<_>>()))
}

fn owned_strings(values: impl Iterator<Item = String>) -> ArrayRef {
    Arc::new(StringArray::from(values.map(Some).collect::<Vec<_>>()))
}

fn floats(values: impl Iterator<Item = f64>) -> ArrayRef {
    Arc::new(Float64Array::from(values.collect::<Vec<_>>()))
}

fn bools(values: impl Iterator<Item = bool>) -> ArrayRef {
    Arc::new(BooleanArray::from(values.collect::<Vec<_>>()))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_entries_parquet(path: &Path, entries: &[CatalogEntry]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        utf8("id", false),
        utf8("platform", false),
        utf8("platform_product_id", false),
        utf8("name", false),
        utf8("normalized_name", false),
        utf8("brand", false),
        utf8("model", false),
        utf8("category", true),
        utf8("url", false),
        ArrowField::new("current_price", DataType::Float64, false),
        ArrowField::new("original_price", DataType::Float64, false),
        ArrowField::new("discount_percentage", DataType::Float64, false),
        utf8("currency", false),
        ArrowField::new("is_available", DataType::Boolean, false),
        utf8("price_category", false),
        ArrowField::new("storage_gb", DataType::UInt32, true),
        ArrowField::new("data_quality_score", DataType::Float64, false),
        ArrowField::new("scrape_count", DataType::UInt32, false),
        utf8("last_scraped", false),
    ]));

    let columns: Vec<ArrayRef> = vec![
        owned_strings(entries.iter().map(|e| e.id.to_string())),
        strings(entries.iter().map(|e| Some(e.platform.as_str()))),
        strings(entries.iter().map(|e| Some(e.platform_product_id.as_str()))),
        strings(entries.iter().map(|e| Some(e.name.as_str()))),
        strings(entries.iter().map(|e| Some(e.normalized_name.as_str()))),
        strings(entries.iter().map(|e| Some(e.brand.as_str()))),
        strings(entries.iter().map(|e| Some(e.model.as_str()))),
        strings(entries.iter().map(|e| e.category.as_deref())),
        strings(entries.iter().map(|e| Some(e.url.as_str()))),
        floats(entries.iter().map(|e| e.current_price)),
        floats(entries.iter().map(|e| e.original_price)),
        floats(entries.iter().map(|e| e.discount_percentage)),
        strings(entries.iter().map(|e| Some(e.currency.as_str()))),
        bools(entries.iter().map(|e| e.is_available)),
        strings(entries.iter().map(|e| Some(e.price_category.as_str()))),
        Arc::new(UInt32Array::from(
            entries.iter().map(|e| e.storage_gb).collect::<Vec<_>>(),
        )),
        floats(entries.iter().map(|e| e.data_quality_score)),
        Arc::new(UInt32Array::from(
            entries.iter().map(|e| e.scrape_count).collect::<Vec<_>>(),
        )),
        owned_strings(entries.iter().map(|e| e.last_scraped.to_rfc3339())),
    ];
    let batch = RecordBatch::try_new(schema, columns).context("building catalog_entries record batch")?;
    write_parquet(path, batch)
}

fn write_history_parquet(path: &Path, history: &[PriceHistoryRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        utf8("id", false),
        utf8("entry_id", false),
        utf8("platform", false),
        ArrowField::new("price", DataType::Float64, false),
        ArrowField::new("original_price", DataType::Float64, false),
        ArrowField::new("discount_percentage", DataType::Float64, false),
        utf8("currency", false),
        ArrowField::new("availability", DataType::Boolean, false),
        utf8("promotional_tag", true),
        utf8("scraped_at", false),
        utf8("session_id", false),
    ]));

    let columns: Vec<ArrayRef> = vec![
        owned_strings(history.iter().map(|h| h.id.to_string())),
        owned_strings(history.iter().map(|h| h.entry_id.to_string())),
        strings(history.iter().map(|h| Some(h.platform.as_str()))),
        floats(history.iter().map(|h| h.price)),
        floats(history.iter().map(|h| h.original_price)),
        floats(history.iter().map(|h| h.discount_percentage)),
        strings(history.iter().map(|h| Some(h.currency.as_str()))),
        bools(history.iter().map(|h| h.availability)),
        strings(history.iter().map(|h| h.promotional_tag.as_deref())),
        owned_strings(history.iter().map(|h| h.scraped_at.to_rfc3339())),
        strings(history.iter().map(|h| Some(h.session_id.as_str()))),
    ];
    let batch = RecordBatch::try_new(schema, columns).context("building price_history record batch")?;
    write_parquet(path, batch)
}

fn write_edges_parquet(path: &Path, edges: &[MatchEdge]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        utf8("id", false),
        utf8("entry_a", false),
        utf8("entry_b", false),
        ArrowField::new("similarity_score", DataType::Float64, false),
        utf8("match_type", false),
        utf8("algorithm", false),
        ArrowField::new("is_verified", DataType::Boolean, false),
        ArrowField::new("is_active", DataType::Boolean, false),
        utf8("created_at", false),
    ]));

    let columns: Vec<ArrayRef> = vec![
        owned_strings(edges.iter().map(|e| e.id.to_string())),
        owned_strings(edges.iter().map(|e| e.entry_a.to_string())),
        owned_strings(edges.iter().map(|e| e.entry_b.to_string())),
        floats(edges.iter().map(|e| e.similarity_score)),
        strings(edges.iter().map(|e| Some(e.match_type.as_str()))),
        strings(edges.iter().map(|e| Some(e.algorithm.as_str()))),
        bools(edges.iter().map(|e| e.is_verified)),
        bools(edges.iter().map(|e| e.is_active)),
        owned_strings(edges.iter().map(|e| e.created_at.to_rfc3339())),
    ];
    let batch = RecordBatch::try_new(schema, columns).context("building match_edges record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, rows: usize, base: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

/// Writes the three snapshots under `<run_dir>/snapshots/` and returns the manifest path.
pub async fn export_snapshots(
    run_dir: &Path,
    session_id: &str,
    entries: &[CatalogEntry],
    history: &[PriceHistoryRecord],
    edges: &[MatchEdge],
) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join(SNAPSHOT_DIR);
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let entries_path = snapshot_dir.join("catalog_entries.parquet");
    let history_path = snapshot_dir.join("price_history.parquet");
    let edges_path = snapshot_dir.join("match_edges.parquet");

    write_entries_parquet(&entries_path, entries)?;
    write_history_parquet(&history_path, history)?;
    write_edges_parquet(&edges_path, edges)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        session_id: session_id.to_string(),
        files: vec![
            manifest_entry("catalog_entries", entries.len(), run_dir, &entries_path)?,
            manifest_entry("price_history", history.len(), run_dir, &history_path)?,
            manifest_entry("match_edges", edges.len(), run_dir, &edges_path)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use pricedragon_core::{Platform, ProductObservation, DEFAULT_CURRENCY};

    fn parquet_rows(path: &Path) -> usize {
        let file = File::open(path).expect("open parquet");
        ParquetRecordBatchReaderBuilder::try_new(file)
            .expect("reader")
            .build()
            .expect("batches")
            .map(|batch| batch.expect("batch").num_rows())
            .sum()
    }

    #[tokio::test]
    async fn snapshots_and_manifest_agree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        let obs = ProductObservation {
            platform: Platform::Momo,
            product_id: "10023456".into(),
            name: "iPhone15 128GB".into(),
            normalized_name: "iphone15 128gb".into(),
            description: None,
            brand: String::new(),
            model: "iPhone 15".into(),
            category: None,
            url: "https://www.momoshop.com.tw/goods/10023456".into(),
            image_url: None,
            current_price: 22990.0,
            original_price: 24900.0,
            discount_percentage: 7.67,
            availability: true,
            stock_status: None,
            promotional_tag: Some("限時搶購".into()),
            price_category: "premium".into(),
            storage_gb: Some(128),
            quality_score: 0.5,
        };
        let a = CatalogEntry::from_observation(&obs, DEFAULT_CURRENCY, now);
        let b = CatalogEntry::from_observation(
            &ProductObservation {
                platform: Platform::Pchome,
                product_id: "A1".into(),
                ..obs.clone()
            },
            DEFAULT_CURRENCY,
            now,
        );
        let history = vec![PriceHistoryRecord::snapshot(&a, &obs, "s1", now)];
        let edges = vec![MatchEdge::new(a.id, b.id, 0.95, "name_similarity", now)];

        let manifest_path = export_snapshots(dir.path(), "s1", &[a, b], &history, &edges)
            .await
            .expect("export");

        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).expect("manifest")).expect("json");
        assert_eq!(manifest.session_id, "s1");
        let names: Vec<&str> = manifest.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["catalog_entries", "price_history", "match_edges"]);

        for file in &manifest.files {
            let path = dir.path().join(&file.path);
            let bytes = std::fs::read(&path).expect("snapshot");
            assert_eq!(file.sha256, sha256_hex(&bytes));
            assert_eq!(file.bytes, bytes.len() as u64);
            assert_eq!(parquet_rows(&path), file.rows);
        }
        assert_eq!(manifest.files[0].rows, 2);
        assert!(manifest.files[0].path.starts_with("snapshots"));
    }

    #[tokio::test]
    async fn empty_run_still_writes_every_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manifest_path = export_snapshots(dir.path(), "s2", &[], &[], &[])
            .await
            .expect("export");
        assert!(manifest_path.exists());
        assert_eq!(parquet_rows(&dir.path().join("snapshots/match_edges.parquet")), 0);
    }
}
