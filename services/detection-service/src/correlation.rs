//! Multi-dimensional correlation engine (spec.md §4.4).

use std::net::IpAddr;

use crate::config::CorrelationConfig;
use crate::types::{Anomaly, AnomalyKind, CorrelationGroup, RelatedAnomaly};

pub struct CorrelationEngine {
    config: CorrelationConfig,
}

impl CorrelationEngine {
    pub fn new(config: CorrelationConfig) -> Self {
        Self { config }
    }

    pub fn correlate(&self, anomalies: Vec<Anomaly>, now: i64) -> Vec<CorrelationGroup> {
        let mut sorted = anomalies;
        sorted.sort_by(|a, b| a.ordering_key().cmp(&b.ordering_key()));

        let n = sorted.len();
        let mut grouped = vec![false; n];
        let mut groups = Vec::new();

        for i in 0..n {
            if grouped[i] {
                continue;
            }
            grouped[i] = true;
            let mut related = Vec::new();
            for j in (i + 1)..n {
                if grouped[j] {
                    continue;
                }
                let score = self.pairwise_score(&sorted[i], &sorted[j]);
                if score > self.config.entity_threshold {
                    grouped[j] = true;
                    related.push(RelatedAnomaly { anomaly: sorted[j].clone(), correlation_score: score });
                }
            }
            let confidence = group_confidence(&sorted[i], &related);
            groups.push(CorrelationGroup {
                group_id: uuid::Uuid::new_v4(),
                primary: sorted[i].clone(),
                related,
                confidence,
                created_at: now,
                updated_at: now,
            });
        }
        groups
    }

    fn pairwise_score(&self, a: &Anomaly, b: &Anomaly) -> f64 {
        let temporal = temporal_score(a.detected_at, b.detected_at, self.config.time_window_secs as i64);
        let entity = entity_score(a, b);
        let kind = kind_score(a.kind, b.kind);
        0.4 * temporal + 0.4 * entity + 0.2 * kind
    }
}

fn temporal_score(a_ts: i64, b_ts: i64, window: i64) -> f64 {
    if window <= 0 {
        return 0.0;
    }
    let dt = (a_ts - b_ts).abs() as f64;
    (1.0 - dt / window as f64).max(0.0)
}

fn same_subnet_24(a: Option<IpAddr>, b: Option<IpAddr>) -> bool {
    match (a, b) {
        (Some(IpAddr::V4(a)), Some(IpAddr::V4(b))) => a.octets()[..3] == b.octets()[..3],
        _ => false,
    }
}

fn addr_match(a: Option<IpAddr>, b: Option<IpAddr>) -> bool {
    a.is_some() && a == b
}

/// An address is the same entity whichever role it plays: the source of a
/// port scan reappearing as the destination of a DDoS flood is the same
/// compromised host, not a coincidence the original source-source/dest-dest
/// matching alone would catch.
fn entity_score(a: &Anomaly, b: &Anomaly) -> f64 {
    let mut score = 0.0;
    if addr_match(a.source_addr, b.source_addr)
        || addr_match(a.dest_addr, b.dest_addr)
        || addr_match(a.source_addr, b.dest_addr)
        || addr_match(a.dest_addr, b.source_addr)
    {
        score += 0.5;
    }
    if a.dest_port.is_some() && a.dest_port == b.dest_port {
        score += 0.2;
    }
    if same_subnet_24(a.source_addr, b.source_addr)
        || same_subnet_24(a.source_addr, b.dest_addr)
        || same_subnet_24(a.dest_addr, b.source_addr)
    {
        score += 0.1;
    }
    score.min(1.0)
}

/// Fixed weights for cross-kind correlation, ported from the threat
/// correlation weight table in the original implementation. `a` is the
/// group's primary (earlier-sorted) anomaly, `b` the candidate — the
/// table is looked up keyed on `a` only, so it is not symmetric.
fn kind_score(a: AnomalyKind, b: AnomalyKind) -> f64 {
    if a == b {
        return 1.0;
    }
    use AnomalyKind::*;
    match (a, b) {
        (PortScan, Ddos) => 0.8,
        (PortScan, C2Beacon) => 0.3,
        (PortScan, CryptoMining) => 0.2,

        (Ddos, PortScan) => 0.8,
        (Ddos, CryptoMining) => 0.2,
        (Ddos, TorUsage) => 0.3,

        (C2Beacon, CryptoMining) => 0.6,
        (C2Beacon, TorUsage) => 0.7,
        (C2Beacon, PortScan) => 0.3,

        (CryptoMining, C2Beacon) => 0.6,
        (CryptoMining, TorUsage) => 0.5,
        (CryptoMining, Ddos) => 0.2,

        (TorUsage, C2Beacon) => 0.7,
        (TorUsage, CryptoMining) => 0.5,
        (TorUsage, PortScan) => 0.4,

        (MlBehavioral, PortScan) => 0.5,
        (MlBehavioral, Ddos) => 0.5,
        (MlBehavioral, C2Beacon) => 0.6,

        (BehavioralDeviation, C2Beacon) => 0.7,
        (BehavioralDeviation, CryptoMining) => 0.6,
        (BehavioralDeviation, TorUsage) => 0.5,

        _ => 0.0,
    }
}

fn group_confidence(primary: &Anomaly, related: &[RelatedAnomaly]) -> f64 {
    if related.is_empty() {
        return primary.confidence;
    }
    let k = related.len() as f64;
    let mut weighted = primary.confidence * 0.5;
    for r in related {
        weighted += r.correlation_score * 0.5 / k * r.anomaly.confidence;
    }
    let bonus = (0.1 * k).min(0.3);
    (weighted + bonus).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AnomalyEvidence;

    fn anomaly(kind: AnomalyKind, ts: i64, source: &str, confidence: f64) -> Anomaly {
        Anomaly {
            id: uuid::Uuid::new_v4(),
            kind,
            confidence,
            detected_at: ts,
            source_addr: Some(source.parse().unwrap()),
            dest_addr: None,
            dest_port: None,
            evidence: AnomalyEvidence::BehavioralDeviation { description: "test".into() },
        }
    }

    #[test]
    fn each_anomaly_assigned_to_exactly_one_group() {
        let engine = CorrelationEngine::new(CorrelationConfig::default());
        let anomalies = vec![
            anomaly(AnomalyKind::PortScan, 100, "10.0.0.10", 0.9),
            anomaly(AnomalyKind::Ddos, 110, "10.0.0.10", 0.85),
            anomaly(AnomalyKind::TorUsage, 5000, "10.0.0.99", 0.81),
        ];
        let groups = engine.correlate(anomalies, 0);
        let total: usize = groups.iter().map(|g| g.size()).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn same_source_within_window_correlates() {
        let engine = CorrelationEngine::new(CorrelationConfig::default());
        let anomalies = vec![
            anomaly(AnomalyKind::PortScan, 100, "10.0.0.10", 0.9),
            anomaly(AnomalyKind::Ddos, 110, "10.0.0.10", 0.85),
        ];
        let groups = engine.correlate(anomalies, 0);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].related.len(), 1);
        assert!(groups[0].confidence >= groups[0].primary.confidence.min(0.85));
    }
}
