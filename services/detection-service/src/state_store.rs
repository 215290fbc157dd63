//! Correlation state store contract (spec.md §4.6): per-entity recent-anomaly
//! history with TTL, shared across pipeline workers. `InMemoryStateStore` is
//! the reference implementation; a Redis- or similar-backed implementation
//! can be dropped in behind the same trait without touching the pipeline.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::StateStoreConfig;
use crate::types::{Anomaly, CorrelationStateEntry, HistoryEntry};

#[derive(Debug, Clone, Default)]
pub struct StateStoreStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub expired_removed: u64,
}

#[async_trait]
pub trait CorrelationStateStore: Send + Sync {
    async fn get_entity_state(&self, key: &str) -> anyhow::Result<Option<CorrelationStateEntry>>;

    async fn update_entity_state(
        &self,
        key: &str,
        anomaly: &Anomaly,
        context_delta: Option<serde_json::Value>,
    ) -> anyhow::Result<()>;

    async fn related_entities(
        &self,
        self_key: &str,
        window_secs: i64,
        kinds: Option<&[crate::types::AnomalyKind]>,
    ) -> anyhow::Result<Vec<CorrelationStateEntry>>;

    async fn cleanup(&self) -> anyhow::Result<usize>;

    async fn health_check(&self) -> anyhow::Result<bool>;

    fn stats(&self) -> StateStoreStats;
}

pub struct InMemoryStateStore {
    clock: Arc<dyn Clock>,
    config: StateStoreConfig,
    entries: DashMap<String, CorrelationStateEntry>,
    hits: AtomicI64,
    misses: AtomicI64,
    writes: AtomicI64,
    expired_removed: AtomicI64,
    last_cleanup: AtomicI64,
}

impl InMemoryStateStore {
    pub fn new(clock: Arc<dyn Clock>, config: StateStoreConfig) -> Self {
        Self {
            clock,
            config,
            entries: DashMap::new(),
            hits: AtomicI64::new(0),
            misses: AtomicI64::new(0),
            writes: AtomicI64::new(0),
            expired_removed: AtomicI64::new(0),
            last_cleanup: AtomicI64::new(0),
        }
    }

    fn is_expired(&self, entry: &CorrelationStateEntry) -> bool {
        entry.expires_at <= self.clock.now_unix()
    }
}

#[async_trait]
impl CorrelationStateStore for InMemoryStateStore {
    async fn get_entity_state(&self, key: &str) -> anyhow::Result<Option<CorrelationStateEntry>> {
        match self.entries.get(key) {
            Some(entry) if !self.is_expired(&entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.clone()))
            }
            Some(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn update_entity_state(
        &self,
        key: &str,
        anomaly: &Anomaly,
        context_delta: Option<serde_json::Value>,
    ) -> anyhow::Result<()> {
        let now = self.clock.now_unix();
        let history_item = HistoryEntry {
            timestamp: anomaly.detected_at,
            kind: anomaly.kind,
            confidence: anomaly.confidence,
            dest_addr: anomaly.dest_addr,
            dest_port: anomaly.dest_port,
        };
        self.entries
            .entry(key.to_string())
            .and_modify(|entry| {
                entry.history.push(history_item.clone());
                let max = self.config.max_history;
                if entry.history.len() > max {
                    let drop_count = entry.history.len() - max;
                    entry.history.drain(0..drop_count);
                }
                if let Some(delta) = context_delta.clone() {
                    merge_context(&mut entry.context, delta);
                }
                entry.updated_at = now;
                entry.expires_at = now + self.config.ttl_secs;
            })
            .or_insert_with(|| CorrelationStateEntry {
                schema_version: 1,
                entity_key: key.to_string(),
                history: vec![history_item],
                context: context_delta.unwrap_or_else(|| serde_json::json!({})),
                updated_at: now,
                expires_at: now + self.config.ttl_secs,
            });
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn related_entities(
        &self,
        self_key: &str,
        window_secs: i64,
        kinds: Option<&[crate::types::AnomalyKind]>,
    ) -> anyhow::Result<Vec<CorrelationStateEntry>> {
        let now = self.clock.now_unix();
        let mut results = Vec::new();
        for item in self.entries.iter() {
            if item.key() == self_key || self.is_expired(item.value()) {
                continue;
            }
            let matches = item.value().history.iter().any(|h| {
                let within_window = now - h.timestamp <= window_secs;
                let kind_matches = kinds.map(|ks| ks.contains(&h.kind)).unwrap_or(true);
                within_window && kind_matches
            });
            if matches {
                results.push(item.value().clone());
            }
        }
        Ok(results)
    }

    async fn cleanup(&self) -> anyhow::Result<usize> {
        let now = self.clock.now_unix();
        let last = self.last_cleanup.load(Ordering::Relaxed);
        if now - last < self.config.cleanup_interval_secs {
            return Ok(0);
        }
        self.last_cleanup.store(now, Ordering::Relaxed);
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| self.is_expired(e.value()))
            .map(|e| e.key().clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        self.expired_removed.fetch_add(expired.len() as i64, Ordering::Relaxed);
        Ok(expired.len())
    }

    async fn health_check(&self) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn stats(&self) -> StateStoreStats {
        StateStoreStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed) as u64,
            misses: self.misses.load(Ordering::Relaxed) as u64,
            writes: self.writes.load(Ordering::Relaxed) as u64,
            expired_removed: self.expired_removed.load(Ordering::Relaxed) as u64,
        }
    }
}

fn merge_context(base: &mut serde_json::Value, delta: serde_json::Value) {
    if let (Some(base_obj), Some(delta_obj)) = (base.as_object_mut(), delta.as_object()) {
        for (k, v) in delta_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    } else {
        *base = delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::types::{AnomalyEvidence, AnomalyKind};

    fn make_anomaly(detected_at: i64) -> Anomaly {
        Anomaly {
            id: uuid::Uuid::new_v4(),
            kind: AnomalyKind::PortScan,
            confidence: 0.9,
            detected_at,
            source_addr: None,
            dest_addr: None,
            dest_port: None,
            evidence: AnomalyEvidence::PortScan {
                unique_ports: 25,
                window_secs: 60,
                sequential_ratio: 0.5,
                success_rate: 0.1,
            },
        }
    }

    #[tokio::test]
    async fn update_then_get_round_trips() {
        let clock = Arc::new(FixedClock::new(1000));
        let store = InMemoryStateStore::new(clock, StateStoreConfig::default());
        let anomaly = make_anomaly(1000);
        store.update_entity_state("1.2.3.4", &anomaly, None).await.unwrap();
        let entry = store.get_entity_state("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(entry.history.last().unwrap().timestamp, 1000);
    }

    #[tokio::test]
    async fn history_truncated_at_max() {
        let clock = Arc::new(FixedClock::new(1000));
        let mut cfg = StateStoreConfig::default();
        cfg.max_history = 2;
        let store = InMemoryStateStore::new(clock, cfg);
        for i in 0..5 {
            store.update_entity_state("k", &make_anomaly(1000 + i), None).await.unwrap();
        }
        let entry = store.get_entity_state("k").await.unwrap().unwrap();
        assert_eq!(entry.history.len(), 2);
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned() {
        let clock = Arc::new(FixedClock::new(1000));
        let mut cfg = StateStoreConfig::default();
        cfg.ttl_secs = 10;
        let store = InMemoryStateStore::new(clock.clone(), cfg);
        store.update_entity_state("k", &make_anomaly(1000), None).await.unwrap();
        clock.advance(11);
        assert!(store.get_entity_state("k").await.unwrap().is_none());
    }
}
