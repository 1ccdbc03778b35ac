use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pricedragon_storage::ArchivedBatch;
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::pipeline::IngestionReport;

pub const REPORT_FILE: &str = "ingestion_report.json";
pub const SUMMARY_FILE: &str = "summary.md";

/// What one source contributed to a run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRunStatus {
    pub source_id: String,
    pub platform: String,
    pub records: usize,
    pub decode_errors: usize,
    pub archived: Option<ArchivedBatch>,
    pub error: Option<String>,
}

fn summary_markdown(run_id: Uuid, report: &IngestionReport, sources: &[SourceRunStatus]) -> String {
    let source_lines = sources
        .iter()
        .map(|s| match &s.error {
            Some(err) => format!("- {} ({}): failed, {}", s.source_id, s.platform, err),
            None => format!(
                "- {} ({}): {} records, {} undecodable{}",
                s.source_id,
                s.platform,
                s.records,
                s.decode_errors,
                s.archived
                    .as_ref()
                    .map(|a| format!(", archived at `{}`", a.relative_path))
                    .unwrap_or_default()
            ),
        })
        .collect::<Vec<_>>()
        .join("\n");

    let rejection_lines = if report.rejections.is_empty() {
        "- none".to_string()
    } else {
        report
            .rejections
            .iter()
            .map(|r| format!("- record {}: {} ({})", r.index, r.code, r.reason))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# PriceDragon Ingestion Summary\n\n- Session: `{}`\n- Run ID: `{}`\n- Query: {}\n- Status: {}\n- Started: {}\n- Records: {}\n- Inserted: {}\n- Updated: {}\n- Duplicates in batch: {}\n- Failed: {}\n- Matches created: {}\n- Success rate: {:.2}\n- Processing time: {} ms\n\n## Sources\n{}\n\n## Rejections\n{}\n",
        report.session_id,
        run_id,
        report.query,
        report.status.as_str(),
        report.started_at,
        report.total_records,
        report.inserted,
        report.updated,
        report.duplicates,
        report.failed,
        report.matches_created,
        report.success_rate,
        report.processing_time_ms,
        source_lines,
        rejection_lines,
    )
}

/// Writes `ingestion_report.json` and `summary.md` into `run_dir`.
pub async fn write_run_reports(
    run_dir: &Path,
    run_id: Uuid,
    report: &IngestionReport,
    sources: &[SourceRunStatus],
) -> Result<PathBuf> {
    fs::create_dir_all(run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(&serde_json::json!({
        "run_id": run_id,
        "sources": sources,
        "report": report,
    }))
    .context("serializing ingestion report")?;
    let report_path = run_dir.join(REPORT_FILE);
    fs::write(&report_path, json)
        .await
        .with_context(|| format!("writing {}", report_path.display()))?;

    fs::write(run_dir.join(SUMMARY_FILE), summary_markdown(run_id, report, sources))
        .await
        .context("writing summary.md")?;
    Ok(report_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::pipeline::{IngestionPipeline, IngestionRequest};
    use pricedragon_core::RawRecord;
    use pricedragon_storage::MemoryCatalogStore;

    #[tokio::test]
    async fn reports_land_in_the_run_directory() {
        let pipeline = IngestionPipeline::with_defaults(Arc::new(MemoryCatalogStore::new()));
        let report = pipeline
            .run(IngestionRequest {
                query: "switch".into(),
                records: vec![RawRecord {
                    platform: "momo".into(),
                    product_id: "B1".into(),
                    name: "AB".into(),
                    url: Some("https://www.momoshop.com.tw/goods/B1".into()),
                    ..RawRecord::default()
                }],
                ..IngestionRequest::default()
            })
            .await
            .expect("run");
        let sources = vec![
            SourceRunStatus {
                source_id: "momo-search".into(),
                platform: "momo".into(),
                records: 1,
                decode_errors: 0,
                archived: Some(ArchivedBatch {
                    session_id: report.session_id.clone(),
                    platform: "momo".into(),
                    source_id: "momo-search".into(),
                    record_count: 1,
                    content_hash: "ab".repeat(32),
                    relative_path: format!("{}/momo/momo-search.json", report.session_id),
                    byte_size: 120,
                    unchanged: false,
                }),
                error: None,
            },
            SourceRunStatus {
                source_id: "shopee-search".into(),
                platform: "shopee".into(),
                records: 0,
                decode_errors: 0,
                archived: None,
                error: Some("http 503".into()),
            },
        ];

        let dir = tempfile::tempdir().expect("tempdir");
        let run_dir = dir.path().join(&report.session_id);
        let path = write_run_reports(&run_dir, Uuid::new_v4(), &report, &sources)
            .await
            .expect("write");

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path).expect("report")).expect("json");
        assert_eq!(value["report"]["session_id"], report.session_id.as_str());
        assert_eq!(value["report"]["rejections"][0]["code"], "NameTooShort");
        assert_eq!(value["sources"].as_array().map(Vec::len), Some(2));

        let summary = std::fs::read_to_string(run_dir.join(SUMMARY_FILE)).expect("summary");
        assert!(summary.contains("- Query: switch"));
        assert!(summary.contains("record 0: NameTooShort"));
        assert!(summary.contains("shopee-search (shopee): failed, http 503"));
        assert!(summary.contains(&format!(
            "momo-search (momo): 1 records, 0 undecodable, archived at `{}/momo/momo-search.json`",
            report.session_id
        )));
        assert_eq!(value["sources"][0]["archived"]["record_count"], 1);
    }
}
