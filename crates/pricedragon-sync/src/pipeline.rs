//! Batch orchestration: session bookkeeping around clean, extract, validate, upsert and match.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use pricedragon_core::{success_rate, IngestionSession, RawRecord, SessionStatus, DEFAULT_CURRENCY};
use pricedragon_storage::{CatalogStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::extract::transform;
use crate::matcher::{Matcher, MatcherConfig};
use crate::rules::CatalogRules;
use crate::upsert::UpsertEngine;
use crate::validate::{validate_batch, RejectReason, Rejection};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not open ingestion session: {0}")]
    SessionStart(#[source] StoreError),
    #[error("ingestion session {session_id} failed: {source}")]
    Batch {
        session_id: String,
        #[source]
        source: StoreError,
    },
}

/// One merged batch of raw records ready for ingestion.
#[derive(Debug, Clone, Default)]
pub struct IngestionRequest {
    pub query: String,
    /// Platforms the batch was requested for. Derived from the records when empty.
    pub platforms: Vec<String>,
    pub records: Vec<RawRecord>,
    /// Source values that never decoded into a record.
    pub decode_errors: Vec<String>,
    /// Id for the session; a fresh one is generated when absent.
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub session_id: String,
    pub query: String,
    pub platforms: Vec<String>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_records: usize,
    pub inserted: usize,
    pub updated: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub matches_created: usize,
    pub success_rate: f64,
    pub rejections: Vec<Rejection>,
    pub transformation_errors: Vec<String>,
    pub validation_errors: Vec<String>,
    pub database_errors: Vec<String>,
    pub touched_entry_ids: Vec<Uuid>,
    pub created_edge_ids: Vec<Uuid>,
    pub processing_time_ms: u64,
}

impl IngestionReport {
    fn new(session: &IngestionSession, total_records: usize) -> Self {
        Self {
            session_id: session.session_id.clone(),
            query: session.query.clone(),
            platforms: session.platforms.clone(),
            status: session.status,
            started_at: session.started_at,
            completed_at: None,
            total_records,
            inserted: 0,
            updated: 0,
            duplicates: 0,
            failed: 0,
            matches_created: 0,
            success_rate: 0.0,
            rejections: Vec::new(),
            transformation_errors: Vec::new(),
            validation_errors: Vec::new(),
            database_errors: Vec::new(),
            touched_entry_ids: Vec::new(),
            created_edge_ids: Vec::new(),
            processing_time_ms: 0,
        }
    }

    pub fn upserted(&self) -> usize {
        self.inserted + self.updated
    }
}

pub struct IngestionPipeline {
    store: Arc<dyn CatalogStore>,
    rules: Arc<CatalogRules>,
    upsert: UpsertEngine,
    matcher: Matcher,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        rules: Arc<CatalogRules>,
        matcher: MatcherConfig,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            upsert: UpsertEngine::new(store.clone(), currency),
            matcher: Matcher::new(store.clone(), matcher),
            store,
            rules,
        }
    }

    /// In-memory defaults, mostly for tests and ad-hoc runs.
    pub fn with_defaults(store: Arc<dyn CatalogStore>) -> Self {
        Self::new(
            store,
            Arc::new(CatalogRules::default()),
            MatcherConfig::default(),
            DEFAULT_CURRENCY,
        )
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    /// Runs one batch end to end. Per-record problems are collected in the report. An
    /// unavailable store or a failed completion write fails the batch, and then the session
    /// is marked failed where the store still allows it.
    pub async fn run(&self, request: IngestionRequest) -> Result<IngestionReport, PipelineError> {
        let started = Instant::now();
        let platforms = if request.platforms.is_empty() {
            request
                .records
                .iter()
                .map(|r| r.platform.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect()
        } else {
            request.platforms.clone()
        };
        let mut session = match request.session_id.as_deref().filter(|id| !id.trim().is_empty()) {
            Some(id) => IngestionSession::start_with_id(id, request.query.clone(), platforms),
            None => IngestionSession::start(request.query.clone(), platforms),
        };
        self.store
            .create_session(&session)
            .await
            .map_err(PipelineError::SessionStart)?;

        let span = info_span!("ingest", session_id = %session.session_id, query = %session.query);
        let result = self
            .process(&session, request, started)
            .instrument(span)
            .await;

        match result {
            Ok(mut report) => {
                let now = Utc::now();
                let products_found = u32::try_from(report.upserted()).unwrap_or(u32::MAX);
                let running = session.clone();
                if let Err(err) = session.complete(products_found, report.success_rate, now) {
                    warn!(error = %err, "session already finalized");
                }
                if let Err(source) = self.store.finalize_session(&session).await {
                    self.mark_failed(running, format!("could not complete session: {source}"))
                        .await;
                    return Err(PipelineError::Batch {
                        session_id: session.session_id,
                        source,
                    });
                }
                report.status = session.status;
                report.completed_at = session.completed_at;
                report.processing_time_ms = elapsed_ms(started);
                info!(
                    session_id = %report.session_id,
                    total = report.total_records,
                    inserted = report.inserted,
                    updated = report.updated,
                    duplicates = report.duplicates,
                    failed = report.failed,
                    matches = report.matches_created,
                    success_rate = report.success_rate,
                    elapsed_ms = report.processing_time_ms,
                    "ingestion batch completed"
                );
                Ok(report)
            }
            Err(source) => {
                self.mark_failed(session.clone(), source.to_string()).await;
                warn!(session_id = %session.session_id, error = %source, "ingestion batch failed");
                Err(PipelineError::Batch {
                    session_id: session.session_id,
                    source,
                })
            }
        }
    }

    /// Best-effort move of a running session to failed.
    async fn mark_failed(&self, mut session: IngestionSession, message: String) {
        if session.fail(message, Utc::now()).is_err() {
            return;
        }
        if let Err(err) = self.store.finalize_session(&session).await {
            warn!(session_id = %session.session_id, error = %err, "could not mark session failed");
        }
    }

    async fn process(
        &self,
        session: &IngestionSession,
        request: IngestionRequest,
        started: Instant,
    ) -> Result<IngestionReport, StoreError> {
        let total = request.records.len() + request.decode_errors.len();
        let mut report = IngestionReport::new(session, total);

        for err in request.decode_errors {
            warn!(error = %err, "undecodable source record");
            report.transformation_errors.push(err);
            report.failed += 1;
        }

        let mut transformed = Vec::with_capacity(request.records.len());
        for (index, raw) in request.records.iter().enumerate() {
            match transform(raw, &self.rules) {
                Ok(record) => transformed.push((index, record)),
                Err(err) => {
                    warn!(index, product_id = %raw.product_id, error = %err, "record transformation failed");
                    report.transformation_errors.push(format!("record {index}: {err}"));
                    report.failed += 1;
                }
            }
        }

        let validation = validate_batch(transformed);
        for (index, reason) in &validation.rejections {
            warn!(index, code = reason.code(), reason = %reason, "record rejected");
            report.rejections.push(Rejection::new(*index, reason));
            if matches!(reason, RejectReason::DuplicateInBatch { .. }) {
                report.duplicates += 1;
            } else {
                report.validation_errors.push(format!("record {index}: {reason}"));
                report.failed += 1;
            }
        }

        for (index, observation) in &validation.accepted {
            match self
                .upsert
                .upsert(observation, &session.session_id, Utc::now())
                .await
            {
                Ok(outcome) => {
                    if outcome.inserted {
                        report.inserted += 1;
                    } else {
                        report.updated += 1;
                    }
                    report.touched_entry_ids.push(outcome.entry_id);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(index, product_id = %observation.product_id, error = %err, "record not stored");
                    report.database_errors.push(format!("record {index}: {err}"));
                    report.failed += 1;
                }
            }
        }

        let matches = self
            .matcher
            .match_entries(&report.touched_entry_ids, Utc::now())
            .await?;
        report.matches_created = matches.created.len();
        report.created_edge_ids = matches.created.iter().map(|e| e.id).collect();
        report.database_errors.extend(matches.errors);

        report.success_rate = success_rate(report.upserted(), report.total_records);
        report.processing_time_ms = elapsed_ms(started);
        Ok(report)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
