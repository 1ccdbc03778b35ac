//! In-process catalog store. Writes are staged per transaction and applied under one
//! lock on commit, after every staged write has been checked against the committed state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricedragon_core::{
    CatalogEntry, IngestionSession, MatchEdge, Platform, PriceHistoryRecord, SessionStatus,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::catalog::{CatalogStore, CatalogTx, StoreError, STALE_SESSION_MESSAGE};

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<Uuid, CatalogEntry>,
    entry_order: Vec<Uuid>,
    by_key: HashMap<(Platform, String), Uuid>,
    history: Vec<PriceHistoryRecord>,
    edges: Vec<MatchEdge>,
    sessions: HashMap<String, IngestionSession>,
}

impl MemoryState {
    fn active_edge_exists(&self, a: Uuid, b: Uuid) -> bool {
        self.edges.iter().any(|e| e.is_active && e.connects(a, b))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCatalogStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
enum StagedWrite {
    InsertEntry(CatalogEntry),
    UpdateEntry(CatalogEntry),
    AppendHistory(PriceHistoryRecord),
    InsertEdge(MatchEdge),
}

pub struct MemoryCatalogTx {
    state: Arc<Mutex<MemoryState>>,
    staged: Vec<StagedWrite>,
}

impl MemoryCatalogTx {
    fn staged_entry(&self, platform: Platform, product_id: &str) -> Option<&CatalogEntry> {
        self.staged.iter().rev().find_map(|w| match w {
            StagedWrite::InsertEntry(e) | StagedWrite::UpdateEntry(e)
                if e.platform == platform && e.platform_product_id == product_id =>
            {
                Some(e)
            }
            _ => None,
        })
    }

    fn staged_edge_exists(&self, a: Uuid, b: Uuid) -> bool {
        self.staged.iter().any(|w| match w {
            StagedWrite::InsertEdge(e) => e.is_active && e.connects(a, b),
            _ => false,
        })
    }
}

fn check_staged(state: &MemoryState, staged: &[StagedWrite]) -> Result<(), StoreError> {
    let mut new_keys: HashMap<(Platform, String), Uuid> = HashMap::new();
    let mut new_ids: Vec<Uuid> = Vec::new();
    let mut new_edges: Vec<(Uuid, Uuid)> = Vec::new();
    let known = |id: &Uuid, new_ids: &[Uuid]| state.entries.contains_key(id) || new_ids.contains(id);

    for write in staged {
        match write {
            StagedWrite::InsertEntry(entry) => {
                let key = (entry.platform, entry.platform_product_id.clone());
                if state.by_key.contains_key(&key) || new_keys.contains_key(&key) {
                    return Err(StoreError::Constraint(format!(
                        "catalog entry {}:{} already exists",
                        entry.platform, entry.platform_product_id
                    )));
                }
                if known(&entry.id, &new_ids) {
                    return Err(StoreError::Constraint(format!("duplicate entry id {}", entry.id)));
                }
                new_keys.insert(key, entry.id);
                new_ids.push(entry.id);
            }
            StagedWrite::UpdateEntry(entry) => {
                let key = (entry.platform, entry.platform_product_id.clone());
                let owner = state.by_key.get(&key).or_else(|| new_keys.get(&key));
                if owner != Some(&entry.id) {
                    return Err(StoreError::Constraint(format!(
                        "update of unknown entry {} for {}:{}",
                        entry.id, entry.platform, entry.platform_product_id
                    )));
                }
            }
            StagedWrite::AppendHistory(record) => {
                if !known(&record.entry_id, &new_ids) {
                    return Err(StoreError::Constraint(format!(
                        "price history references unknown entry {}",
                        record.entry_id
                    )));
                }
            }
            StagedWrite::InsertEdge(edge) => {
                if !known(&edge.entry_a, &new_ids) || !known(&edge.entry_b, &new_ids) {
                    return Err(StoreError::Constraint(format!(
                        "match edge {} references an unknown entry",
                        edge.id
                    )));
                }
                let (a, b) = (edge.entry_a, edge.entry_b);
                let pending = new_edges.iter().any(|&(x, y)| (x == a && y == b) || (x == b && y == a));
                if edge.is_active && (state.active_edge_exists(a, b) || pending) {
                    return Err(StoreError::Constraint(format!(
                        "active match edge between {a} and {b} already exists"
                    )));
                }
                if edge.is_active {
                    new_edges.push((a, b));
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
impl CatalogTx for MemoryCatalogTx {
    async fn find_entry(
        &mut self,
        platform: Platform,
        platform_product_id: &str,
    ) -> Result<Option<CatalogEntry>, StoreError> {
        if let Some(entry) = self.staged_entry(platform, platform_product_id) {
            return Ok(Some(entry.clone()));
        }
        let state = self.state.lock().await;
        Ok(state
            .by_key
            .get(&(platform, platform_product_id.to_string()))
            .and_then(|id| state.entries.get(id))
            .cloned())
    }

    async fn insert_entry(&mut self, entry: &CatalogEntry) -> Result<(), StoreError> {
        self.staged.push(StagedWrite::InsertEntry(entry.clone()));
        Ok(())
    }

    async fn update_entry(&mut self, entry: &CatalogEntry) -> Result<(), StoreError> {
        self.staged.push(StagedWrite::UpdateEntry(entry.clone()));
        Ok(())
    }

    async fn append_history(&mut self, record: &PriceHistoryRecord) -> Result<(), StoreError> {
        self.staged.push(StagedWrite::AppendHistory(record.clone()));
        Ok(())
    }

    async fn active_edge_exists(&mut self, a: Uuid, b: Uuid) -> Result<bool, StoreError> {
        if self.staged_edge_exists(a, b) {
            return Ok(true);
        }
        Ok(self.state.lock().await.active_edge_exists(a, b))
    }

    async fn insert_edge(&mut self, edge: &MatchEdge) -> Result<(), StoreError> {
        self.staged.push(StagedWrite::InsertEdge(edge.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        check_staged(&state, &self.staged)?;
        for write in self.staged {
            match write {
                StagedWrite::InsertEntry(entry) => {
                    state
                        .by_key
                        .insert((entry.platform, entry.platform_product_id.clone()), entry.id);
                    state.entry_order.push(entry.id);
                    state.entries.insert(entry.id, entry);
                }
                StagedWrite::UpdateEntry(entry) => {
                    state.entries.insert(entry.id, entry);
                }
                StagedWrite::AppendHistory(record) => state.history.push(record),
                StagedWrite::InsertEdge(edge) => state.edges.push(edge),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn begin(&self) -> Result<Box<dyn CatalogTx>, StoreError> {
        Ok(Box::new(MemoryCatalogTx {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
        }))
    }

    async fn create_session(&self, session: &IngestionSession) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.sessions.contains_key(&session.session_id) {
            return Err(StoreError::Conflict(format!(
                "session {} already exists",
                session.session_id
            )));
        }
        state.sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn finalize_session(&self, session: &IngestionSession) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.sessions.get_mut(&session.session_id) else {
            return Err(StoreError::Conflict(format!(
                "session {} does not exist",
                session.session_id
            )));
        };
        if stored.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "session {} is already {}",
                session.session_id,
                stored.status.as_str()
            )));
        }
        if !session.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "session {} cannot be finalized as running",
                session.session_id
            )));
        }
        *stored = session.clone();
        Ok(())
    }

    async fn sweep_stale_sessions(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut swept = 0;
        for session in state.sessions.values_mut() {
            if session.status == SessionStatus::Running && session.started_at < cutoff {
                session.status = SessionStatus::Failed;
                session.completed_at = Some(now);
                session.error_message = Some(STALE_SESSION_MESSAGE.to_string());
                swept += 1;
            }
        }
        Ok(swept)
    }

    async fn session(&self, session_id: &str) -> Result<Option<IngestionSession>, StoreError> {
        Ok(self.state.lock().await.sessions.get(session_id).cloned())
    }

    async fn entries(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .entry_order
            .iter()
            .filter_map(|id| state.entries.get(id).cloned())
            .collect())
    }

    async fn entries_by_ids(&self, ids: &[Uuid]) -> Result<Vec<CatalogEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(ids.iter().filter_map(|id| state.entries.get(id).cloned()).collect())
    }

    async fn history_for_entry(&self, entry_id: Uuid) -> Result<Vec<PriceHistoryRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|h| h.entry_id == entry_id)
            .cloned()
            .collect())
    }

    async fn history_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<PriceHistoryRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|h| h.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn edges(&self) -> Result<Vec<MatchEdge>, StoreError> {
        Ok(self.state.lock().await.edges.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pricedragon_core::{ProductObservation, DEFAULT_CURRENCY};

    fn entry(platform: Platform, product_id: &str) -> CatalogEntry {
        let obs = ProductObservation {
            platform,
            product_id: product_id.into(),
            name: "Switch OLED".into(),
            normalized_name: "switch oled".into(),
            description: None,
            brand: String::new(),
            model: String::new(),
            category: Some("Gaming".into()),
            url: "https://example.com/p".into(),
            image_url: None,
            current_price: 9980.0,
            original_price: 10480.0,
            discount_percentage: 4.77,
            availability: true,
            stock_status: None,
            promotional_tag: None,
            price_category: "budget".into(),
            storage_gb: None,
            quality_score: 0.5,
        };
        CatalogEntry::from_observation(&obs, DEFAULT_CURRENCY, Utc::now())
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_no_trace() {
        let store = MemoryCatalogStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_entry(&entry(Platform::Momo, "M1")).await.unwrap();
            assert!(tx.find_entry(Platform::Momo, "M1").await.unwrap().is_some());
        }
        assert!(store.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_rejects_duplicate_keys_atomically() {
        let store = MemoryCatalogStore::new();
        let first = entry(Platform::Momo, "M1");
        let mut tx = store.begin().await.unwrap();
        tx.insert_entry(&first).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let dup = entry(Platform::Momo, "M1");
        let other = entry(Platform::Momo, "M2");
        tx.insert_entry(&other).await.unwrap();
        tx.insert_entry(&dup).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));

        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 1, "half of a failed commit must not be visible");
        assert_eq!(entries[0].id, first.id);
    }

    #[tokio::test]
    async fn edge_lookup_checks_both_orderings() {
        let store = MemoryCatalogStore::new();
        let a = entry(Platform::Pchome, "A1");
        let b = entry(Platform::Momo, "B1");
        let mut tx = store.begin().await.unwrap();
        tx.insert_entry(&a).await.unwrap();
        tx.insert_entry(&b).await.unwrap();
        tx.insert_edge(&MatchEdge::new(a.id, b.id, 0.8, "name_similarity", Utc::now()))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.active_edge_exists(b.id, a.id).await.unwrap());
        tx.insert_edge(&MatchEdge::new(b.id, a.id, 0.8, "name_similarity", Utc::now()))
            .await
            .unwrap();
        assert!(matches!(tx.commit().await, Err(StoreError::Constraint(_))));
        assert_eq!(store.edges().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminal_sessions_are_immutable_and_stale_ones_are_swept() {
        let store = MemoryCatalogStore::new();
        let mut done = IngestionSession::start("iphone", vec!["pchome".into()]);
        store.create_session(&done).await.unwrap();
        done.complete(1, 1.0, Utc::now()).unwrap();
        store.finalize_session(&done).await.unwrap();
        assert!(matches!(
            store.finalize_session(&done).await,
            Err(StoreError::Conflict(_))
        ));

        let mut stale = IngestionSession::start("switch", vec!["momo".into()]);
        stale.started_at = Utc::now() - Duration::hours(3);
        store.create_session(&stale).await.unwrap();
        let fresh = IngestionSession::start("ps5", vec!["momo".into()]);
        store.create_session(&fresh).await.unwrap();

        let swept = store
            .sweep_stale_sessions(Utc::now() - Duration::hours(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(swept, 1);
        let stale = store.session(&stale.session_id).await.unwrap().unwrap();
        assert_eq!(stale.status, SessionStatus::Failed);
        assert_eq!(stale.error_message.as_deref(), Some(STALE_SESSION_MESSAGE));
        let fresh = store.session(&fresh.session_id).await.unwrap().unwrap();
        assert_eq!(fresh.status, SessionStatus::Running);
        let done = store.session(&done.session_id).await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
    }
}
