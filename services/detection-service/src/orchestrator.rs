//! Tier orchestrator (spec.md §4.1): drives a batch through all four tiers.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::ConfigHandle;
use crate::correlation::CorrelationEngine;
use crate::detectors::Detector;
use crate::metrics::METRICS;
use crate::model_client::ModelManager;
use crate::publisher::EventPublisher;
use crate::state_store::CorrelationStateStore;
use crate::types::{Anomaly, CorrelationGroup, Finding, FlowRecord, Severity, ValidationResult};
use crate::validation::Validator;

#[derive(Debug, Clone, Default)]
pub struct BatchMetadata {
    pub batch_size: usize,
    pub timestamp: i64,
    pub deadline_missed: bool,
    pub tier1_ms: f64,
    pub tier2_ms: f64,
    pub tier3_ms: f64,
    pub tier4_ms: f64,
}

pub struct BatchOutcome {
    pub batch_id: uuid::Uuid,
    pub findings: Vec<Finding>,
    pub metadata: BatchMetadata,
}

pub struct TierOrchestrator {
    detectors: Vec<Arc<dyn Detector>>,
    model_manager: ModelManager,
    correlation: CorrelationEngine,
    validator: Validator,
    state_store: Arc<dyn CorrelationStateStore>,
    publisher: EventPublisher,
    clock: Arc<dyn Clock>,
    config: Arc<ConfigHandle>,
    producer_id: String,
}

impl TierOrchestrator {
    pub fn new(
        detectors: Vec<Arc<dyn Detector>>,
        model_manager: ModelManager,
        correlation: CorrelationEngine,
        validator: Validator,
        state_store: Arc<dyn CorrelationStateStore>,
        publisher: EventPublisher,
        clock: Arc<dyn Clock>,
        config: Arc<ConfigHandle>,
        producer_id: impl Into<String>,
    ) -> Self {
        Self {
            detectors,
            model_manager,
            correlation,
            validator,
            state_store,
            publisher,
            clock,
            config,
            producer_id: producer_id.into(),
        }
    }

    #[tracing::instrument(skip(self, batch))]
    pub async fn process_batch(&self, batch: Vec<FlowRecord>) -> BatchOutcome {
        let batch_id = uuid::Uuid::new_v4();
        let now = self.clock.now_unix();
        let deadlines = self.config.snapshot().deadlines.clone();
        let batch_deadline = Duration::from_secs(deadlines.batch_secs);
        let overall_start = std::time::Instant::now();

        let mut metadata = BatchMetadata { batch_size: batch.len(), timestamp: now, ..Default::default() };
        let batch = Arc::new(batch);

        let tier1_start = std::time::Instant::now();
        let tier1_anomalies = self.run_tier1(batch.clone(), Duration::from_secs(deadlines.tier1_secs)).await;
        metadata.tier1_ms = tier1_start.elapsed().as_secs_f64() * 1000.0;
        METRICS.tier_latency_ms.record(metadata.tier1_ms, &[opentelemetry::KeyValue::new("tier", "1")]);
        METRICS.anomalies_total.add(tier1_anomalies.len() as u64, &[]);

        let mut all_anomalies = tier1_anomalies.clone();
        if !tier1_anomalies.is_empty() {
            let tier2_start = std::time::Instant::now();
            let tier2_anomalies = tokio::time::timeout(
                Duration::from_secs(deadlines.tier2_secs),
                self.model_manager.detect_ml(&batch),
            )
            .await
            .unwrap_or_default();
            metadata.tier2_ms = tier2_start.elapsed().as_secs_f64() * 1000.0;
            METRICS.tier_latency_ms.record(metadata.tier2_ms, &[opentelemetry::KeyValue::new("tier", "2")]);
            all_anomalies.extend(tier2_anomalies);
        }

        for anomaly in &all_anomalies {
            self.record_state(anomaly).await;
        }

        let tier3_start = std::time::Instant::now();
        let groups = match tokio::time::timeout(
            Duration::from_secs(deadlines.tier3_secs),
            self.run_tier3(all_anomalies.clone(), now),
        )
        .await
        {
            Ok(groups) => groups,
            Err(_) => {
                metadata.deadline_missed = true;
                single_member_groups(all_anomalies, now)
            }
        };
        metadata.tier3_ms = tier3_start.elapsed().as_secs_f64() * 1000.0;
        METRICS.tier_latency_ms.record(metadata.tier3_ms, &[opentelemetry::KeyValue::new("tier", "3")]);

        let tier4_start = std::time::Instant::now();
        let groups_for_fallback = groups.clone();
        let findings = match tokio::time::timeout(
            Duration::from_secs(deadlines.tier4_secs),
            self.run_tier4(groups, batch_id, now),
        )
        .await
        {
            Ok(findings) => findings,
            Err(_) => {
                metadata.deadline_missed = true;
                tier4_fallback(groups_for_fallback, batch_id, &self.producer_id, now)
            }
        };
        metadata.tier4_ms = tier4_start.elapsed().as_secs_f64() * 1000.0;
        METRICS.tier_latency_ms.record(metadata.tier4_ms, &[opentelemetry::KeyValue::new("tier", "4")]);

        for finding in &findings {
            METRICS.findings_total.add(1, &[opentelemetry::KeyValue::new("severity", severity_label(finding.severity))]);
            if let Err(err) = self.publisher.publish(finding).await {
                tracing::error!(error = %err, "failed to publish finding after fallback exhausted");
            }
        }

        if overall_start.elapsed() > batch_deadline {
            metadata.deadline_missed = true;
        }

        BatchOutcome { batch_id, findings, metadata }
    }

    /// Runs the five statistical detectors concurrently, one `spawn_blocking`
    /// task each, under a shared deadline. A detector that doesn't finish (or
    /// panics) within the deadline contributes nothing; detectors that did
    /// finish in time still contribute their results (spec.md §5).
    async fn run_tier1(&self, batch: Arc<Vec<FlowRecord>>, deadline: Duration) -> Vec<Anomaly> {
        let tasks: Vec<_> = self
            .detectors
            .iter()
            .cloned()
            .map(|detector| {
                let batch = batch.clone();
                let name = detector.name();
                let task = tokio::task::spawn_blocking(move || detector.detect(&batch));
                async move {
                    match tokio::time::timeout(deadline, task).await {
                        Ok(Ok(Ok(anomalies))) => anomalies,
                        Ok(Ok(Err(err))) => {
                            tracing::warn!(detector = name, error = %err, "detector failed; treated as empty output");
                            Vec::new()
                        }
                        Ok(Err(join_err)) => {
                            tracing::warn!(detector = name, error = %join_err, "detector task panicked; treated as empty output");
                            Vec::new()
                        }
                        Err(_) => {
                            tracing::warn!(detector = name, "detector exceeded tier-1 deadline; treated as empty output");
                            Vec::new()
                        }
                    }
                }
            })
            .collect();
        futures::future::join_all(tasks).await.into_iter().flatten().collect()
    }

    async fn run_tier3(&self, anomalies: Vec<Anomaly>, now: i64) -> Vec<CorrelationGroup> {
        self.correlation.correlate(anomalies, now)
    }

    async fn run_tier4(&self, groups: Vec<CorrelationGroup>, batch_id: uuid::Uuid, now: i64) -> Vec<Finding> {
        let mut findings = Vec::new();
        for group in groups {
            let result = self.validator.validate(&group);
            if result.valid {
                findings.push(crate::validation::build_finding(group, result, batch_id, &self.producer_id, now, false));
            }
        }
        findings
    }

    async fn record_state(&self, anomaly: &Anomaly) {
        if let Some(source) = anomaly.source_addr {
            if let Err(err) = self.state_store.update_entity_state(&source.to_string(), anomaly, None).await {
                tracing::warn!(error = %err, "correlation state store update failed");
            }
        }
    }
}

fn single_member_groups(anomalies: Vec<Anomaly>, now: i64) -> Vec<CorrelationGroup> {
    anomalies
        .into_iter()
        .map(|a| CorrelationGroup {
            group_id: uuid::Uuid::new_v4(),
            confidence: a.confidence,
            primary: a,
            related: Vec::new(),
            created_at: now,
            updated_at: now,
        })
        .collect()
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

/// Confidence-gate-only admission used when Tier 4 itself fails outright
/// (as opposed to a group simply failing validation). spec.md §4.1 fixes
/// the fallback's severity at MEDIUM, independent of confidence or group size.
pub fn tier4_fallback(groups: Vec<CorrelationGroup>, batch_id: uuid::Uuid, producer_id: &str, now: i64) -> Vec<Finding> {
    groups
        .into_iter()
        .filter(|g| g.confidence > 0.7)
        .map(|g| {
            let result = ValidationResult {
                valid: true,
                whitelist_passed: true,
                contextual_passed: true,
                threat_specific_passed: true,
                historical_passed: true,
                failure_reasons: vec!["tier4 fallback: confidence gate only".to_string()],
                metadata: serde_json::json!({ "fallback": true }),
            };
            crate::validation::build_finding_with_severity(
                g,
                result,
                batch_id,
                producer_id,
                now,
                true,
                Some(Severity::Medium),
            )
        })
        .collect()
}
