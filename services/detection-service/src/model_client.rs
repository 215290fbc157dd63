//! External model client abstraction and manager (spec.md §4.3), grown from
//! the heuristic-classification shape of `swarm-core::ml_detection`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{BreakerConfig, ModelManagerConfig};
use crate::resilience::CircuitBreaker;
use crate::types::{Anomaly, AnomalyEvidence, AnomalyKind, FlowRecord};

#[async_trait]
pub trait ModelClient: Send + Sync {
    fn id(&self) -> &str;
    async fn detect_anomalies(&self, batch: &[FlowRecord]) -> anyhow::Result<Vec<Anomaly>>;
    async fn health_check(&self) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub healthy: bool,
    pub last_check: i64,
    pub error_count: u32,
    pub last_response_ms: f64,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self { healthy: true, last_check: 0, error_count: 0, last_response_ms: 0.0 }
    }
}

struct Registered {
    client: Arc<dyn ModelClient>,
    health: Mutex<HealthRecord>,
    breaker: CircuitBreaker,
}

pub struct ModelManager {
    clock: Arc<dyn Clock>,
    config: ModelManagerConfig,
    breaker_config: BreakerConfig,
    clients: Vec<Registered>,
}

impl ModelManager {
    pub fn new(clock: Arc<dyn Clock>, config: ModelManagerConfig) -> Self {
        Self { clock, config, breaker_config: BreakerConfig::default(), clients: Vec::new() }
    }

    pub fn with_breaker_config(mut self, breaker_config: BreakerConfig) -> Self {
        self.breaker_config = breaker_config;
        self
    }

    pub fn register(&mut self, client: Arc<dyn ModelClient>) {
        let breaker = CircuitBreaker::new(format!("model:{}", client.id()), self.breaker_config.clone());
        self.clients.push(Registered { client, health: Mutex::new(HealthRecord::default()), breaker });
    }

    pub fn health_snapshot(&self) -> HashMap<String, HealthRecord> {
        self.clients
            .iter()
            .map(|r| (r.client.id().to_string(), r.health.lock().clone()))
            .collect()
    }

    /// Invokes every eligible client and concatenates their anomalies. A
    /// single client's failure never masks another's success.
    pub async fn detect_ml(&self, batch: &[FlowRecord]) -> Vec<Anomaly> {
        let mut results = Vec::new();
        for registered in &self.clients {
            if !self.is_eligible(registered).await {
                continue;
            }
            let start = std::time::Instant::now();
            let client = &registered.client;
            let outcome = registered
                .breaker
                .call(
                    || async move { client.detect_anomalies(batch).await },
                    Some(|| async { Vec::new() }),
                )
                .await;
            match outcome {
                Ok(anomalies) => {
                    let mut health = registered.health.lock();
                    health.error_count = health.error_count.saturating_sub(1);
                    health.last_response_ms = start.elapsed().as_secs_f64() * 1000.0;
                    health.healthy = health.error_count < self.config.max_error_count;
                    results.extend(anomalies);
                }
                Err(err) => {
                    tracing::warn!(client = registered.client.id(), error = %err, "model client failed");
                    let mut health = registered.health.lock();
                    health.error_count += 1;
                    health.healthy = health.error_count < self.config.max_error_count;
                }
            }
        }
        results
    }

    async fn is_eligible(&self, registered: &Registered) -> bool {
        let needs_check = {
            let health = registered.health.lock();
            let stale = self.clock.now_unix() - health.last_check >= self.config.health_check_interval_secs;
            !health.healthy && stale || health.error_count >= self.config.max_error_count && stale
        };
        if needs_check {
            let healthy = registered.client.health_check().await.unwrap_or(false);
            let mut health = registered.health.lock();
            health.healthy = healthy;
            health.last_check = self.clock.now_unix();
            if healthy {
                health.error_count = 0;
            }
        }
        let health = registered.health.lock();
        health.healthy && health.error_count < self.config.max_error_count
    }
}

/// Reference model client: a simple z-score heuristic over packet/byte
/// features, grounded in `ml_detection.rs`'s `neural_inference`/
/// `calculate_anomaly_score` approach. Lets the crate run end-to-end
/// without an external inference endpoint.
pub struct HeuristicBehavioralClient {
    id: String,
    threshold: f64,
}

impl HeuristicBehavioralClient {
    pub fn new(id: impl Into<String>, threshold: f64) -> Self {
        Self { id: id.into(), threshold }
    }
}

#[async_trait]
impl ModelClient for HeuristicBehavioralClient {
    fn id(&self) -> &str {
        &self.id
    }

    async fn detect_anomalies(&self, batch: &[FlowRecord]) -> anyhow::Result<Vec<Anomaly>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let sizes: Vec<f64> = batch.iter().map(|r| r.byte_count as f64).collect();
        let (mean, stddev) = crate::detectors::mean_stddev(&sizes);
        if stddev <= 0.0 {
            return Ok(Vec::new());
        }
        let mut anomalies = Vec::new();
        for record in batch {
            let z = (record.byte_count as f64 - mean).abs() / stddev;
            let score = (z / 5.0).min(1.0);
            if score >= self.threshold {
                anomalies.push(Anomaly {
                    id: uuid::Uuid::new_v4(),
                    kind: AnomalyKind::MlBehavioral,
                    confidence: score,
                    detected_at: record.timestamp,
                    source_addr: Some(record.source_addr),
                    dest_addr: Some(record.dest_addr),
                    dest_port: Some(record.dest_port),
                    evidence: AnomalyEvidence::MlBehavioral { model_id: self.id.clone(), raw_score: z },
                });
            }
        }
        Ok(anomalies)
    }

    async fn health_check(&self) -> anyhow::Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::types::{FlowAction, Protocol};

    fn record(bytes: u64) -> FlowRecord {
        FlowRecord {
            timestamp: 0,
            source_addr: "10.0.0.1".parse().unwrap(),
            dest_addr: "10.0.0.2".parse().unwrap(),
            source_port: 1,
            dest_port: 2,
            protocol: Protocol::Tcp,
            action: FlowAction::Accept,
            packet_count: 1,
            byte_count: bytes,
            duration_secs: None,
        }
    }

    #[tokio::test]
    async fn manager_skips_unhealthy_clients_without_failing_others() {
        struct Failing;
        #[async_trait]
        impl ModelClient for Failing {
            fn id(&self) -> &str {
                "failing"
            }
            async fn detect_anomalies(&self, _batch: &[FlowRecord]) -> anyhow::Result<Vec<Anomaly>> {
                anyhow::bail!("down")
            }
            async fn health_check(&self) -> anyhow::Result<bool> {
                Ok(false)
            }
        }

        let mut manager = ModelManager::new(Arc::new(SystemClock), ModelManagerConfig::default());
        manager.register(Arc::new(Failing));
        manager.register(Arc::new(HeuristicBehavioralClient::new("heuristic", 0.0)));

        let mut batch = vec![record(100); 10];
        batch.push(record(100_000));
        let results = manager.detect_ml(&batch).await;
        assert!(!results.is_empty());
    }
}
