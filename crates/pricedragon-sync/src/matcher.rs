//! Cross-platform matching. Pairs of entries touched by a batch are scored and linked with
//! an edge when the composite score clears the threshold.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pricedragon_core::{CatalogEntry, MatchEdge};
use pricedragon_storage::{CatalogStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameAlgorithm {
    #[default]
    MatchingBlocks,
    JaroWinkler,
}

impl NameAlgorithm {
    /// Tag stored on every edge scored with this algorithm.
    pub fn tag(&self) -> &'static str {
        match self {
            NameAlgorithm::MatchingBlocks => "name_similarity",
            NameAlgorithm::JaroWinkler => "jaro_winkler",
        }
    }
}

impl FromStr for NameAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "matching_blocks" | "name_similarity" => Ok(NameAlgorithm::MatchingBlocks),
            "jaro_winkler" => Ok(NameAlgorithm::JaroWinkler),
            other => Err(format!("unknown name similarity algorithm `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatcherConfig {
    pub threshold: f64,
    pub brand_bonus: f64,
    pub price_bonus: f64,
    /// `min / max` of the two prices must exceed this for the price bonus.
    pub price_ratio: f64,
    pub algorithm: NameAlgorithm,
    /// When false, pairs whose normalized names are both empty are never scored.
    pub match_empty_names: bool,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            brand_bonus: 0.3,
            price_bonus: 0.1,
            price_ratio: 0.7,
            algorithm: NameAlgorithm::default(),
            match_empty_names: false,
        }
    }
}

fn find_longest_match(
    a: &[char],
    b2j: &HashMap<char, Vec<usize>>,
    (alo, ahi): (usize, usize),
    (blo, bhi): (usize, usize),
) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_size) = (alo, blo, 0);
    let mut j2len: HashMap<usize, usize> = HashMap::new();
    for (i, ch) in a.iter().enumerate().take(ahi).skip(alo) {
        let mut next_j2len = HashMap::new();
        if let Some(positions) = b2j.get(ch) {
            for &j in positions {
                if j < blo {
                    continue;
                }
                if j >= bhi {
                    break;
                }
                let k = j
                    .checked_sub(1)
                    .and_then(|prev| j2len.get(&prev))
                    .copied()
                    .unwrap_or(0)
                    + 1;
                next_j2len.insert(j, k);
                if k > best_size {
                    best_i = i + 1 - k;
                    best_j = j + 1 - k;
                    best_size = k;
                }
            }
        }
        j2len = next_j2len;
    }
    (best_i, best_j, best_size)
}

/// Ratcliff/Obershelp ratio `2M / (|a| + |b|)`, where `M` is the total size of the
/// recursively found longest matching blocks. Characters, not bytes, are compared and no
/// element is treated as junk. Two empty strings score 1.0.
pub fn matching_blocks_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    let mut b2j: HashMap<char, Vec<usize>> = HashMap::new();
    for (j, ch) in b.iter().enumerate() {
        b2j.entry(*ch).or_default().push(j);
    }

    let mut matched = 0usize;
    let mut queue = vec![((0, a.len()), (0, b.len()))];
    while let Some(((alo, ahi), (blo, bhi))) = queue.pop() {
        let (i, j, k) = find_longest_match(&a, &b2j, (alo, ahi), (blo, bhi));
        if k == 0 {
            continue;
        }
        matched += k;
        if alo < i && blo < j {
            queue.push(((alo, i), (blo, j)));
        }
        if i + k < ahi && j + k < bhi {
            queue.push(((i + k, ahi), (j + k, bhi)));
        }
    }
    2.0 * matched as f64 / total as f64
}

pub fn name_similarity(a: &str, b: &str, algorithm: NameAlgorithm) -> f64 {
    match algorithm {
        NameAlgorithm::MatchingBlocks => matching_blocks_ratio(a, b),
        NameAlgorithm::JaroWinkler => strsim::jaro_winkler(a, b),
    }
}

/// Name similarity plus the brand and price bonuses, clamped to `[0, 1]`.
pub fn composite_similarity(a: &CatalogEntry, b: &CatalogEntry, config: &MatcherConfig) -> f64 {
    let mut score = name_similarity(&a.normalized_name, &b.normalized_name, config.algorithm);

    if !a.brand.is_empty() && !b.brand.is_empty() && a.brand.to_lowercase() == b.brand.to_lowercase()
    {
        score += config.brand_bonus;
    }

    if a.current_price > 0.0 && b.current_price > 0.0 {
        let ratio = a.current_price.min(b.current_price) / a.current_price.max(b.current_price);
        if ratio > config.price_ratio {
            score += config.price_bonus;
        }
    }

    score.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub created: Vec<MatchEdge>,
    /// Pairs above the threshold that already had an active edge.
    pub existing: usize,
    pub pairs_scored: usize,
    /// Non-fatal per-edge storage failures.
    pub errors: Vec<String>,
}

/// Sole writer of match edges.
#[derive(Clone)]
pub struct Matcher {
    store: Arc<dyn CatalogStore>,
    config: MatcherConfig,
}

impl Matcher {
    pub fn new(store: Arc<dyn CatalogStore>, config: MatcherConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    fn should_score(&self, a: &CatalogEntry, b: &CatalogEntry) -> bool {
        if a.id == b.id || a.platform == b.platform {
            return false;
        }
        self.config.match_empty_names
            || !(a.normalized_name.is_empty() && b.normalized_name.is_empty())
    }

    /// Scores every cross-platform pair among `entry_ids` and inserts missing edges, one
    /// transaction per edge. Only an unavailable store aborts the pass.
    pub async fn match_entries(
        &self,
        entry_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<MatchOutcome, StoreError> {
        let entries = self.store.entries_by_ids(entry_ids).await?;
        let mut outcome = MatchOutcome::default();

        for (i, a) in entries.iter().enumerate() {
            for b in &entries[i + 1..] {
                if !self.should_score(a, b) {
                    continue;
                }
                outcome.pairs_scored += 1;
                let score = composite_similarity(a, b, &self.config);
                if score < self.config.threshold {
                    continue;
                }
                match self.link(a, b, score, now).await {
                    Ok(Some(edge)) => {
                        debug!(
                            entry_a = %edge.entry_a,
                            entry_b = %edge.entry_b,
                            score = edge.similarity_score,
                            match_type = edge.match_type.as_str(),
                            "created match edge"
                        );
                        outcome.created.push(edge);
                    }
                    Ok(None) => outcome.existing += 1,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        warn!(entry_a = %a.id, entry_b = %b.id, error = %err, "match edge not stored");
                        outcome.errors.push(format!("edge {} <-> {}: {err}", a.id, b.id));
                    }
                }
            }
        }

        info!(
            entries = entries.len(),
            pairs = outcome.pairs_scored,
            created = outcome.created.len(),
            existing = outcome.existing,
            "match pass finished"
        );
        Ok(outcome)
    }

    async fn link(
        &self,
        a: &CatalogEntry,
        b: &CatalogEntry,
        score: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<MatchEdge>, StoreError> {
        let mut tx = self.store.begin().await?;
        if tx.active_edge_exists(a.id, b.id).await? {
            return Ok(None);
        }
        let edge = MatchEdge::new(a.id, b.id, score, self.config.algorithm.tag(), now);
        tx.insert_edge(&edge).await?;
        tx.commit().await?;
        Ok(Some(edge))
    }
}
