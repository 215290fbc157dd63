use std::collections::HashMap;
use std::net::IpAddr;

use crate::config::CryptoMiningConfig;
use crate::types::{Anomaly, AnomalyEvidence, AnomalyKind, FlowRecord, MiningProtocol, Protocol};

use super::Detector;

const MINING_PORTS: &[u16] = &[3333, 4444, 8333, 8080, 9999, 14444, 25565, 30303, 8545];

pub struct CryptoMiningDetector {
    config: CryptoMiningConfig,
}

impl CryptoMiningDetector {
    pub fn new(config: CryptoMiningConfig) -> Self {
        Self { config }
    }
}

impl Detector for CryptoMiningDetector {
    fn name(&self) -> &'static str {
        "crypto_mining"
    }

    fn detect(&self, batch: &[FlowRecord]) -> anyhow::Result<Vec<Anomaly>> {
        let mut by_source: HashMap<IpAddr, Vec<&FlowRecord>> = HashMap::new();
        for record in batch {
            by_source.entry(record.source_addr).or_default().push(record);
        }

        let mut anomalies = Vec::new();
        for (source, records) in by_source {
            if (records.len() as u32) < self.config.min_connections {
                continue;
            }
            let total_bytes: u64 = records.iter().map(|r| r.byte_count).sum();
            if total_bytes < self.config.data_threshold_bytes {
                continue;
            }
            let mining_port_hit = records.iter().any(|r| MINING_PORTS.contains(&r.dest_port));
            if !mining_port_hit {
                continue;
            }
            if let Some(anomaly) = self.validate(source, &records, total_bytes) {
                anomalies.push(anomaly);
            }
        }
        Ok(anomalies)
    }
}

impl CryptoMiningDetector {
    fn validate(&self, source: IpAddr, records: &[&FlowRecord], total_bytes: u64) -> Option<Anomaly> {
        let mining_hits = records.iter().filter(|r| MINING_PORTS.contains(&r.dest_port)).count();
        let mining_port_share = mining_hits as f64 / records.len() as f64;

        let first = records.iter().map(|r| r.timestamp).min().unwrap_or(0);
        let last = records.iter().map(|r| r.timestamp).max().unwrap_or(0);
        let persistence_secs = (last - first) as f64;
        let persistence_score = (persistence_secs / 300.0).min(1.0);

        let sizes: Vec<f64> = records.iter().map(|r| r.byte_count as f64).collect();
        let (mean_size, stddev_size) = super::mean_stddev(&sizes);
        let consistency_score = if mean_size > 0.0 {
            (1.0 - (stddev_size / mean_size).min(1.0)).max(0.0)
        } else {
            0.0
        };

        let tcp_bonus = if records.iter().all(|r| r.protocol == Protocol::Tcp) { 0.1 } else { 0.0 };

        let confidence =
            (mining_port_share * 0.4 + persistence_score * 0.25 + consistency_score * 0.25 + tcp_bonus).min(1.0);
        if confidence < self.config.confidence_threshold {
            return None;
        }

        let protocol = records
            .iter()
            .find_map(|r| match r.dest_port {
                3333 | 4444 => Some(MiningProtocol::Stratum),
                8333 => Some(MiningProtocol::BitcoinRpc),
                30303 => Some(MiningProtocol::Ethereum),
                8080 | 8545 => Some(MiningProtocol::HttpMining),
                _ => None,
            })
            .unwrap_or(MiningProtocol::UnknownMiningProtocol);

        Some(Anomaly {
            id: uuid::Uuid::new_v4(),
            kind: AnomalyKind::CryptoMining,
            confidence,
            detected_at: last,
            source_addr: Some(source),
            dest_addr: None,
            dest_port: None,
            evidence: AnomalyEvidence::CryptoMining {
                protocol,
                total_bytes,
                connection_count: records.len() as u32,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FlowAction;

    fn record(ts: i64, port: u16, bytes: u64) -> FlowRecord {
        FlowRecord {
            timestamp: ts,
            source_addr: "10.0.0.42".parse().unwrap(),
            dest_addr: "198.51.100.20".parse().unwrap(),
            source_port: 4000,
            dest_port: port,
            protocol: Protocol::Tcp,
            action: FlowAction::Accept,
            packet_count: 10,
            byte_count: bytes,
            duration_secs: None,
        }
    }

    #[test]
    fn sustained_stratum_traffic_emits() {
        let detector = CryptoMiningDetector::new(CryptoMiningConfig::default());
        let batch: Vec<_> = (0..8).map(|i| record(i * 60, 3333, 260_000)).collect();
        let anomalies = detector.detect(&batch).unwrap();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::CryptoMining);
    }

    #[test]
    fn below_data_threshold_does_not_emit() {
        let detector = CryptoMiningDetector::new(CryptoMiningConfig::default());
        let batch: Vec<_> = (0..8).map(|i| record(i * 60, 3333, 10)).collect();
        assert!(detector.detect(&batch).unwrap().is_empty());
    }
}
