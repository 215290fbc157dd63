use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use crate::config::TorUsageConfig;
use crate::types::{Anomaly, AnomalyEvidence, AnomalyKind, FlowRecord, TorUsageKind};

use super::Detector;

const TOR_PORTS: &[u16] = &[9001, 9030, 9050, 9051, 9150, 9040, 9053, 9063, 9090];
const BRIDGE_PORTS: &[u16] = &[80, 443, 8080, 8443];

pub struct TorUsageDetector {
    config: TorUsageConfig,
}

impl TorUsageDetector {
    pub fn new(config: TorUsageConfig) -> Self {
        Self { config }
    }
}

impl Detector for TorUsageDetector {
    fn name(&self) -> &'static str {
        "tor_usage"
    }

    fn detect(&self, batch: &[FlowRecord]) -> anyhow::Result<Vec<Anomaly>> {
        let mut by_source: HashMap<IpAddr, Vec<&FlowRecord>> = HashMap::new();
        for record in batch {
            by_source.entry(record.source_addr).or_default().push(record);
        }

        let mut anomalies = Vec::new();
        for (source, mut records) in by_source {
            if (records.len() as u32) < self.config.min_connections {
                continue;
            }
            let has_tor_port = records.iter().any(|r| TOR_PORTS.contains(&r.dest_port));
            let has_bridge_candidate = records.iter().any(|r| BRIDGE_PORTS.contains(&r.dest_port));
            if !has_tor_port && !has_bridge_candidate {
                continue;
            }
            records.sort_by_key(|r| r.timestamp);
            if let Some(anomaly) = self.validate(source, &records) {
                anomalies.push(anomaly);
            }
        }
        Ok(anomalies)
    }
}

impl TorUsageDetector {
    fn validate(&self, source: IpAddr, records: &[&FlowRecord]) -> Option<Anomaly> {
        let tor_hits = records.iter().filter(|r| TOR_PORTS.contains(&r.dest_port)).count();
        let tor_port_share = tor_hits as f64 / records.len() as f64;

        let destinations: HashSet<IpAddr> = records.iter().map(|r| r.dest_addr).collect();
        let destination_diversity_score = (destinations.len() as f64 / 3.0).min(1.0);

        let first_three_within_30s = records
            .iter()
            .take(3)
            .map(|r| r.timestamp)
            .max()
            .zip(records.first().map(|r| r.timestamp))
            .map(|(max_ts, min_ts)| max_ts - min_ts <= 30)
            .unwrap_or(false);

        let timestamps: Vec<i64> = records.iter().map(|r| r.timestamp).collect();
        let intervals: Vec<f64> = timestamps.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
        let (mean_interval, _) = super::mean_stddev(&intervals);
        let keepalive_score = if (60.0..=600.0).contains(&mean_interval) { 1.0 } else { 0.0 };

        let sizes: Vec<f64> = records.iter().map(|r| r.byte_count as f64).collect();
        let (mean_size, stddev_size) = super::mean_stddev(&sizes);
        let mixed_sizes = mean_size > 0.0 && (stddev_size / mean_size) > 0.2;

        let mut indicator_count = 0u32;
        if tor_hits > 0 {
            indicator_count += 1;
        }
        if destinations.len() >= 3 {
            indicator_count += 1;
        }
        if first_three_within_30s {
            indicator_count += 1;
        }
        if keepalive_score > 0.0 {
            indicator_count += 1;
        }
        if mixed_sizes {
            indicator_count += 1;
        }

        let confidence = (tor_port_share * 0.35
            + destination_diversity_score * 0.2
            + if first_three_within_30s { 0.15 } else { 0.0 }
            + keepalive_score * 0.15
            + if mixed_sizes { 0.15 } else { 0.0 })
        .min(1.0);
        if confidence < self.config.confidence_threshold {
            return None;
        }

        let usage_kind = if TOR_PORTS[..4].iter().any(|p| records.iter().any(|r| r.dest_port == *p)) {
            TorUsageKind::TorDirectoryAccess
        } else if records.iter().any(|r| r.dest_port == 9050 || r.dest_port == 9150) {
            TorUsageKind::TorSocksProxy
        } else if records.iter().any(|r| r.dest_port == 9001) {
            TorUsageKind::TorRelayConnection
        } else if destinations.len() >= 3 && first_three_within_30s {
            TorUsageKind::TorCircuitBuilding
        } else if !tor_hits.eq(&0) {
            TorUsageKind::TorBridgeConnection
        } else {
            TorUsageKind::TorGeneralUsage
        };

        Some(Anomaly {
            id: uuid::Uuid::new_v4(),
            kind: AnomalyKind::TorUsage,
            confidence,
            detected_at: records.last().map(|r| r.timestamp).unwrap_or(0),
            source_addr: Some(source),
            dest_addr: None,
            dest_port: None,
            evidence: AnomalyEvidence::TorUsage { usage_kind, indicator_count },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FlowAction, Protocol};

    fn record(ts: i64, dest: &str, port: u16, bytes: u64) -> FlowRecord {
        FlowRecord {
            timestamp: ts,
            source_addr: "10.0.5.9".parse().unwrap(),
            dest_addr: dest.parse().unwrap(),
            source_port: 5000,
            dest_port: port,
            protocol: Protocol::Tcp,
            action: FlowAction::Accept,
            packet_count: 2,
            byte_count: bytes,
            duration_secs: None,
        }
    }

    #[test]
    fn two_indicators_fail_threat_specific_threshold_via_low_confidence() {
        let detector = TorUsageDetector::new(TorUsageConfig::default());
        let batch = vec![
            record(0, "1.2.3.4", 9050, 500),
            record(5, "1.2.3.5", 9050, 520),
            record(10, "1.2.3.6", 443, 500),
        ];
        let anomalies = detector.detect(&batch).unwrap();
        assert!(anomalies.is_empty() || anomalies[0].confidence < 0.8);
    }

    #[test]
    fn strong_tor_pattern_emits() {
        let detector = TorUsageDetector::new(TorUsageConfig::default());
        let batch = vec![
            record(0, "1.2.3.4", 9050, 400),
            record(10, "1.2.3.5", 9001, 900),
            record(20, "1.2.3.6", 9030, 300),
            record(120, "1.2.3.7", 9050, 700),
            record(240, "1.2.3.8", 9150, 250),
        ];
        let anomalies = detector.detect(&batch).unwrap();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::TorUsage);
    }
}
