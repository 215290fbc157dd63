//! Event publisher (spec.md §4.7): primary/fallback bus pair with batching
//! and best-effort delivery.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::metrics::METRICS;
use crate::types::Finding;

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: i64,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    fn name(&self) -> &str;
    async fn publish_finding(&self, finding: &Finding) -> anyhow::Result<()>;
    async fn publish_system_event(&self, event: &SystemEvent) -> anyhow::Result<()>;
}

/// Publishes via structured tracing events, matching the teacher's
/// logging-first operational surface.
pub struct LoggingBus {
    name: String,
}

impl LoggingBus {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl EventBus for LoggingBus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish_finding(&self, finding: &Finding) -> anyhow::Result<()> {
        tracing::info!(
            bus = %self.name,
            finding_id = %finding.finding_id,
            kind = finding.kind.name(),
            severity = ?finding.severity,
            priority = finding.priority,
            confidence = finding.confidence,
            "finding published"
        );
        Ok(())
    }

    async fn publish_system_event(&self, event: &SystemEvent) -> anyhow::Result<()> {
        tracing::info!(bus = %self.name, kind = %event.kind, "system event published");
        Ok(())
    }
}

/// On-disk outbox for findings that neither bus could deliver, backed by
/// `sled` the way the teacher's signature database is.
pub struct OutboxBus {
    tree: sled::Tree,
}

impl OutboxBus {
    pub fn open(db: &sled::Db) -> anyhow::Result<Self> {
        Ok(Self { tree: db.open_tree("publisher_outbox")? })
    }

    pub fn pending_count(&self) -> usize {
        self.tree.len()
    }
}

#[async_trait]
impl EventBus for OutboxBus {
    fn name(&self) -> &str {
        "outbox"
    }

    async fn publish_finding(&self, finding: &Finding) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(finding)?;
        self.tree.insert(finding.finding_id.as_bytes(), bytes)?;
        Ok(())
    }

    async fn publish_system_event(&self, event: &SystemEvent) -> anyhow::Result<()> {
        let key = format!("sys-{}", event.timestamp);
        let bytes = serde_json::to_vec(event)?;
        self.tree.insert(key.as_bytes(), bytes)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PublisherMetrics {
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub failovers: AtomicU64,
}

pub struct EventPublisher {
    primary: Arc<dyn EventBus>,
    fallback: Option<Arc<dyn EventBus>>,
    metrics: PublisherMetrics,
}

pub struct ChunkReport {
    pub succeeded: usize,
    pub failed: usize,
}

const CHUNK_SIZE: usize = 10;

impl EventPublisher {
    pub fn new(primary: Arc<dyn EventBus>, fallback: Option<Arc<dyn EventBus>>) -> Self {
        Self { primary, fallback, metrics: PublisherMetrics::default() }
    }

    pub async fn publish(&self, finding: &Finding) -> anyhow::Result<()> {
        match self.primary.publish_finding(finding).await {
            Ok(()) => {
                self.metrics.successes.fetch_add(1, Ordering::Relaxed);
                METRICS.publish_total.add(1, &[opentelemetry::KeyValue::new("bus", "primary"), opentelemetry::KeyValue::new("outcome", "success")]);
                Ok(())
            }
            Err(primary_err) => {
                tracing::warn!(bus = self.primary.name(), error = %primary_err, "primary bus publish failed");
                self.metrics.failovers.fetch_add(1, Ordering::Relaxed);
                match &self.fallback {
                    Some(fallback) => match fallback.publish_finding(finding).await {
                        Ok(()) => {
                            self.metrics.successes.fetch_add(1, Ordering::Relaxed);
                            Ok(())
                        }
                        Err(fallback_err) => {
                            self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                            Err(anyhow::anyhow!(
                                "both buses failed: primary={primary_err}, fallback={fallback_err}"
                            ))
                        }
                    },
                    None => {
                        self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                        Err(primary_err)
                    }
                }
            }
        }
    }

    pub async fn publish_batch(&self, findings: &[Finding]) -> Vec<ChunkReport> {
        let mut reports = Vec::new();
        for chunk in findings.chunks(CHUNK_SIZE) {
            let mut succeeded = 0;
            let mut failed = 0;
            for finding in chunk {
                match self.publish(finding).await {
                    Ok(()) => succeeded += 1,
                    Err(_) => failed += 1,
                }
            }
            reports.push(ChunkReport { succeeded, failed });
        }
        reports
    }

    pub async fn publish_system_event(&self, kind: &str, payload: serde_json::Value, now: i64) -> anyhow::Result<()> {
        let event = SystemEvent { kind: kind.to_string(), payload, timestamp: now };
        if self.primary.publish_system_event(&event).await.is_ok() {
            return Ok(());
        }
        if let Some(fallback) = &self.fallback {
            return fallback.publish_system_event(&event).await;
        }
        Err(anyhow::anyhow!("no bus available for system event"))
    }

    pub fn successes(&self) -> u64 {
        self.metrics.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.metrics.failures.load(Ordering::Relaxed)
    }

    pub fn failovers(&self) -> u64 {
        self.metrics.failovers.load(Ordering::Relaxed)
    }
}
