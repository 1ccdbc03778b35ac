//! Sync runs: source fan-out, archive, pipeline, reports and parquet snapshots.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pricedragon_adapters::{source_from_config, FetchContext, RecordSource, SourceBatch, SourceError};
use pricedragon_storage::{
    ArchivedBatch, BatchOrigin, CatalogStore, HttpFetcher, MemoryCatalogStore, PgCatalogStore,
    RawBatchArchive,
};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{SourceRegistry, SyncConfig};
use crate::export::export_snapshots;
use crate::pipeline::{IngestionPipeline, IngestionRequest};
use crate::report::{write_run_reports, SourceRunStatus};
use crate::rules::CatalogRules;

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub session_id: String,
    pub query: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub failed_sources: Vec<String>,
    pub archived_batches: Vec<ArchivedBatch>,
    pub total_records: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    pub matches_created: usize,
    pub success_rate: f64,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

/// Postgres when `DATABASE_URL` is set (migrations applied), otherwise a process-local store.
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn CatalogStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgCatalogStore::connect(url)
                .await
                .context("connecting to catalog database")?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory catalog store, nothing will persist");
            Ok(Arc::new(MemoryCatalogStore::new()))
        }
    }
}

pub struct SyncRunner {
    config: SyncConfig,
    store: Arc<dyn CatalogStore>,
    rules: Arc<CatalogRules>,
    archive: RawBatchArchive,
    fetcher: Arc<HttpFetcher>,
}

impl SyncRunner {
    pub fn new(config: SyncConfig, store: Arc<dyn CatalogStore>) -> Result<Self> {
        let rules = CatalogRules::from_workspace_root(&config.workspace_root)?;
        let fetcher = HttpFetcher::new(config.fetch_config()).context("building http fetcher")?;
        Ok(Self {
            archive: RawBatchArchive::new(config.artifacts_dir.clone()),
            fetcher: Arc::new(fetcher),
            rules: Arc::new(rules),
            config,
            store,
        })
    }

    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = open_store(&config).await?;
        Self::new(config, store)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    pub async fn sweep_stale_sessions(&self) -> Result<u64> {
        let now = Utc::now();
        let swept = self
            .store
            .sweep_stale_sessions(now - self.config.stale_session_age(), now)
            .await
            .context("sweeping stale sessions")?;
        if swept > 0 {
            warn!(swept, "marked stale running sessions as failed");
        }
        Ok(swept)
    }

    fn build_sources(
        &self,
        registry: &SourceRegistry,
        statuses: &mut Vec<SourceRunStatus>,
    ) -> Vec<Option<Arc<dyn RecordSource>>> {
        registry
            .enabled()
            .map(|config| {
                statuses.push(SourceRunStatus {
                    source_id: config.source_id.clone(),
                    platform: config.platform.to_string(),
                    records: 0,
                    decode_errors: 0,
                    archived: None,
                    error: None,
                });
                match source_from_config(config, &self.config.workspace_root, Some(self.fetcher.clone())) {
                    Ok(source) => Some(source),
                    Err(err) => {
                        warn!(source_id = %config.source_id, error = %err, "source skipped");
                        if let Some(status) = statuses.last_mut() {
                            status.error = Some(err.to_string());
                        }
                        None
                    }
                }
            })
            .collect()
    }

    /// Fetches every source concurrently; results come back indexed by registry position.
    async fn fan_out(
        &self,
        sources: &[Option<Arc<dyn RecordSource>>],
        ctx: &FetchContext,
        query: &str,
    ) -> Vec<Option<Result<SourceBatch, SourceError>>> {
        let mut tasks = JoinSet::new();
        for (index, source) in sources.iter().enumerate() {
            let Some(source) = source.clone() else {
                continue;
            };
            let ctx = ctx.clone();
            let query = query.to_string();
            tasks.spawn(async move { (index, source.fetch(&ctx, &query).await) });
        }

        let mut results: Vec<Option<Result<SourceBatch, SourceError>>> =
            (0..sources.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(err) => warn!(error = %err, "source task aborted"),
            }
        }
        results
    }

    pub async fn run_once(&self, query: &str) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        self.sweep_stale_sessions().await?;

        let registry = SourceRegistry::load(&self.config.workspace_root).await?;
        let ctx = FetchContext::new();
        let mut statuses = Vec::new();
        let sources = self.build_sources(&registry, &mut statuses);
        info!(run_id = %ctx.run_id, query, sources = sources.len(), "sync run started");

        let results = self.fan_out(&sources, &ctx, query).await;

        let session_id = Uuid::new_v4().to_string();
        let mut request = IngestionRequest {
            query: query.to_string(),
            platforms: statuses.iter().map(|s| s.platform.clone()).collect(),
            session_id: Some(session_id.clone()),
            ..IngestionRequest::default()
        };
        let mut archived_batches = Vec::new();
        for (status, result) in statuses.iter_mut().zip(results) {
            let batch = match result {
                Some(Ok(batch)) => batch,
                Some(Err(err)) => {
                    warn!(source_id = %status.source_id, error = %err, "source fetch failed");
                    status.error = Some(err.to_string());
                    continue;
                }
                None => {
                    if status.error.is_none() {
                        status.error = Some("source task did not finish".to_string());
                    }
                    continue;
                }
            };

            let origin = BatchOrigin {
                session_id: session_id.clone(),
                platform: status.platform.clone(),
                source_id: status.source_id.clone(),
                fetched_at: ctx.fetched_at,
            };
            let archived = self.archive.store_batch(&origin, &batch.records).await?;

            status.records = batch.records.len();
            status.decode_errors = batch.decode_errors.len();
            status.archived = Some(archived.clone());
            archived_batches.push(archived);
            request.records.extend(batch.records);
            request.decode_errors.extend(batch.decode_errors);
        }

        let pipeline = IngestionPipeline::new(
            self.store.clone(),
            self.rules.clone(),
            self.config.matcher_config(),
            self.config.currency.clone(),
        );
        let report = pipeline
            .run(request)
            .await
            .with_context(|| format!("ingesting query `{query}`"))?;

        let run_dir = self.config.reports_dir.join(&report.session_id);
        write_run_reports(&run_dir, ctx.run_id, &report, &statuses).await?;

        let entries = self
            .store
            .entries_by_ids(&report.touched_entry_ids)
            .await
            .context("loading touched entries")?;
        let history = self
            .store
            .history_for_session(&report.session_id)
            .await
            .context("loading session history")?;
        let edges: Vec<_> = self
            .store
            .edges()
            .await
            .context("loading match edges")?
            .into_iter()
            .filter(|e| report.created_edge_ids.contains(&e.id))
            .collect();
        let manifest = export_snapshots(&run_dir, &report.session_id, &entries, &history, &edges).await?;

        let summary = SyncRunSummary {
            run_id: ctx.run_id,
            session_id: report.session_id.clone(),
            query: query.to_string(),
            started_at,
            finished_at: Utc::now(),
            enabled_sources: statuses.len(),
            failed_sources: statuses
                .iter()
                .filter(|s| s.error.is_some())
                .map(|s| s.source_id.clone())
                .collect(),
            archived_batches,
            total_records: report.total_records,
            inserted: report.inserted,
            updated: report.updated,
            failed: report.failed,
            matches_created: report.matches_created,
            success_rate: report.success_rate,
            reports_dir: run_dir.display().to_string(),
            parquet_manifest: manifest.display().to_string(),
        };
        info!(
            run_id = %summary.run_id,
            session_id = %summary.session_id,
            failed_sources = summary.failed_sources.len(),
            "sync run finished"
        );
        Ok(summary)
    }

    /// One job per cron expression, each running every configured query in turn. Failed
    /// runs are logged and left for the next tick.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        if self.config.sync_queries.is_empty() {
            warn!("scheduler enabled but PRICEDRAGON_SYNC_QUERIES is empty; not scheduling");
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in &self.config.sync_crons {
            let runner = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let runner = Arc::clone(&runner);
                Box::pin(async move {
                    for query in runner.config.sync_queries.clone() {
                        match runner.run_once(&query).await {
                            Ok(summary) => info!(
                                session_id = %summary.session_id,
                                query = %summary.query,
                                "scheduled sync finished"
                            ),
                            Err(err) => warn!(query = %query, error = ?err, "scheduled sync failed"),
                        }
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env(query: &str) -> Result<SyncRunSummary> {
    let runner = SyncRunner::from_config(SyncConfig::from_env()).await?;
    runner.run_once(query).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::ParquetManifest;
    use pricedragon_adapters::workspace_root;
    use pricedragon_core::{MatchType, Platform, SessionStatus};

    fn runner(output: &std::path::Path) -> (SyncRunner, Arc<MemoryCatalogStore>) {
        let store = Arc::new(MemoryCatalogStore::new());
        let config = SyncConfig::for_workspace(workspace_root(), output);
        (SyncRunner::new(config, store.clone()).expect("runner"), store)
    }

    #[tokio::test]
    async fn fixture_run_builds_catalog_and_reports() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (runner, store) = runner(dir.path());

        let summary = runner.run_once("iphone 15").await.expect("sync");

        assert_eq!(summary.enabled_sources, 3);
        assert!(summary.failed_sources.is_empty());
        let archived: Vec<(&str, &str, usize)> = summary
            .archived_batches
            .iter()
            .map(|b| (b.platform.as_str(), b.source_id.as_str(), b.record_count))
            .collect();
        assert_eq!(
            archived,
            vec![
                ("pchome", "pchome-search", 5),
                ("momo", "momo-search", 4),
                ("yahoo", "yahoo-search", 4),
            ]
        );
        for batch in &summary.archived_batches {
            assert_eq!(batch.session_id, summary.session_id);
            assert!(batch.relative_path.starts_with(&summary.session_id));
            assert!(dir.path().join("artifacts").join(&batch.relative_path).exists());
        }
        assert_eq!(summary.total_records, 14);
        assert_eq!(summary.inserted, 9);
        assert_eq!(summary.failed, 4);
        assert_eq!(summary.matches_created, 4);

        let edges = store.edges().await.expect("edges");
        assert_eq!(edges.len(), 4);
        assert_eq!(edges.iter().filter(|e| e.match_type == MatchType::Exact).count(), 3);
        let entries = store.entries().await.expect("entries");
        for edge in &edges {
            let platforms: Vec<Platform> = entries
                .iter()
                .filter(|e| e.id == edge.entry_a || e.id == edge.entry_b)
                .map(|e| e.platform)
                .collect();
            assert_eq!(platforms.len(), 2);
            assert_ne!(platforms[0], platforms[1]);
        }

        let session = store
            .session(&summary.session_id)
            .await
            .expect("session")
            .expect("stored");
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.platforms, vec!["momo", "pchome", "yahoo"]);

        let run_dir = dir.path().join("reports").join(&summary.session_id);
        assert!(run_dir.join("ingestion_report.json").exists());
        assert!(run_dir.join("summary.md").exists());
        let manifest: ParquetManifest = serde_json::from_slice(
            &std::fs::read(&summary.parquet_manifest).expect("manifest"),
        )
        .expect("manifest json");
        let rows: Vec<usize> = manifest.files.iter().map(|f| f.rows).collect();
        assert_eq!(rows, vec![9, 9, 4]);
        assert!(dir.path().join("artifacts").exists());
    }

    #[tokio::test]
    async fn second_run_updates_without_new_edges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (runner, store) = runner(dir.path());

        runner.run_once("iphone 15").await.expect("first");
        let second = runner.run_once("iphone 15").await.expect("second");

        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 9);
        assert_eq!(second.matches_created, 0);
        assert_eq!(store.edges().await.expect("edges").len(), 4);
        assert!(store
            .entries()
            .await
            .expect("entries")
            .iter()
            .all(|e| e.scrape_count == 2));
    }

    #[tokio::test]
    async fn stale_sessions_are_swept_before_a_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (runner, store) = runner(dir.path());
        let mut stale = pricedragon_core::IngestionSession::start("old", vec!["momo".to_string()]);
        stale.started_at = Utc::now() - chrono::Duration::hours(3);
        store.create_session(&stale).await.expect("create");

        runner.run_once("iphone 15").await.expect("sync");

        let swept = store
            .session(&stale.session_id)
            .await
            .expect("session")
            .expect("stored");
        assert_eq!(swept.status, SessionStatus::Failed);
        assert_eq!(
            swept.error_message.as_deref(),
            Some(pricedragon_storage::STALE_SESSION_MESSAGE)
        );
    }

    #[tokio::test]
    async fn scheduler_is_off_by_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (runner, _store) = runner(dir.path());
        let runner = Arc::new(runner);
        assert!(runner.maybe_build_scheduler().await.expect("scheduler").is_none());
    }
}
