use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use pricedragon_adapters::SourceConfig;
use pricedragon_core::DEFAULT_CURRENCY;
use pricedragon_storage::FetchConfig;
use serde::Deserialize;
use tokio::fs;

use crate::matcher::{MatcherConfig, NameAlgorithm, DEFAULT_MATCH_THRESHOLD};

pub const SOURCES_FILE: &str = "sources.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(SOURCES_FILE);
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Absent means the run uses the in-memory store.
    pub database_url: Option<String>,
    pub artifacts_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_crons: Vec<String>,
    pub sync_queries: Vec<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub currency: String,
    pub match_threshold: f64,
    pub match_algorithm: NameAlgorithm,
    pub stale_session_minutes: i64,
}

fn csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .collect()
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("PRICEDRAGON_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            reports_dir: std::env::var("PRICEDRAGON_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("reports")),
            scheduler_enabled: std::env::var("PRICEDRAGON_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_crons: csv(
                &std::env::var("PRICEDRAGON_SYNC_CRON")
                    .unwrap_or_else(|_| "0 0 6 * * *,0 0 18 * * *".to_string()),
            ),
            sync_queries: csv(&std::env::var("PRICEDRAGON_SYNC_QUERIES").unwrap_or_default()),
            user_agent: std::env::var("PRICEDRAGON_USER_AGENT")
                .unwrap_or_else(|_| "pricedragon-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("PRICEDRAGON_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            currency: std::env::var("PRICEDRAGON_CURRENCY")
                .unwrap_or_else(|_| DEFAULT_CURRENCY.to_string()),
            match_threshold: std::env::var("PRICEDRAGON_MATCH_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &f64| (0.0..=1.0).contains(v))
                .unwrap_or(DEFAULT_MATCH_THRESHOLD),
            match_algorithm: std::env::var("PRICEDRAGON_MATCH_ALGORITHM")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            stale_session_minutes: std::env::var("PRICEDRAGON_STALE_SESSION_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            workspace_root,
        }
    }

    /// Defaults rooted at `workspace_root`, writing artifacts and reports below `output`.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>, output: &Path) -> Self {
        Self {
            database_url: None,
            artifacts_dir: output.join("artifacts"),
            workspace_root: workspace_root.into(),
            reports_dir: output.join("reports"),
            scheduler_enabled: false,
            sync_crons: Vec::new(),
            sync_queries: Vec::new(),
            user_agent: "pricedragon-bot/0.1".to_string(),
            http_timeout_secs: 20,
            currency: DEFAULT_CURRENCY.to_string(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            match_algorithm: NameAlgorithm::default(),
            stale_session_minutes: 60,
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..FetchConfig::default()
        }
    }

    pub fn matcher_config(&self) -> MatcherConfig {
        MatcherConfig {
            threshold: self.match_threshold,
            algorithm: self.match_algorithm,
            ..MatcherConfig::default()
        }
    }

    pub fn stale_session_age(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_session_minutes.max(0))
    }
}
