use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use crate::config::DdosConfig;
use crate::types::{Anomaly, AnomalyEvidence, AnomalyKind, DdosSubType, FlowAction, FlowRecord, Protocol};

use super::Detector;

pub struct DdosDetector {
    config: DdosConfig,
}

impl DdosDetector {
    pub fn new(config: DdosConfig) -> Self {
        Self { config }
    }
}

struct Candidate<'a> {
    dest: (IpAddr, u16),
    records: Vec<&'a FlowRecord>,
}

impl Detector for DdosDetector {
    fn name(&self) -> &'static str {
        "ddos"
    }

    fn detect(&self, batch: &[FlowRecord]) -> anyhow::Result<Vec<Anomaly>> {
        let mut by_dest: HashMap<(IpAddr, u16), Vec<&FlowRecord>> = HashMap::new();
        for record in batch {
            by_dest.entry((record.dest_addr, record.dest_port)).or_default().push(record);
        }

        let mut anomalies = Vec::new();
        for (dest, records) in by_dest {
            let first = records.iter().map(|r| r.timestamp).min().unwrap_or(0);
            let last = records.iter().map(|r| r.timestamp).max().unwrap_or(0);
            let span = ((last - first).max(1)) as f64;
            let total_packets: u64 = records.iter().map(|r| r.packet_count).sum();
            let rate = total_packets as f64 / span;
            if rate <= self.config.packet_rate_threshold {
                continue;
            }
            if let Some(anomaly) = self.validate(&Candidate { dest, records }, rate) {
                anomalies.push(anomaly);
            }
        }
        Ok(anomalies)
    }
}

impl DdosDetector {
    fn validate(&self, candidate: &Candidate, rate: f64) -> Option<Anomaly> {
        let records = &candidate.records;
        let sources: HashSet<IpAddr> = records.iter().map(|r| r.source_addr).collect();
        let source_diversity = sources.len() as u32;

        let rejected = records.iter().filter(|r| r.action == FlowAction::Reject).count();
        let rejection_rate = rejected as f64 / records.len() as f64;

        let sizes: Vec<f64> = records.iter().map(|r| r.byte_count as f64).collect();
        let (mean_size, stddev_size) = super::mean_stddev(&sizes);
        let uniform_sizes = mean_size > 0.0 && (stddev_size / mean_size) < 0.1;

        let rate_score = (rate / (self.config.packet_rate_threshold * 5.0)).min(1.0);
        let diversity_score = (source_diversity as f64 / 50.0).min(1.0);
        let pattern_score = rejection_rate * 0.5 + if uniform_sizes { 0.5 } else { 0.0 };

        let confidence = (rate_score * 0.4 + diversity_score * 0.35 + pattern_score * 0.25).min(1.0);
        if confidence < self.config.confidence_threshold {
            return None;
        }

        let total_bytes: u64 = records.iter().map(|r| r.byte_count).sum();
        let total_packets: u64 = records.iter().map(|r| r.packet_count).sum();
        let avg_packet_size = total_bytes as f64 / (total_packets as f64).max(1.0);
        let protocols: HashSet<Protocol> = records.iter().map(|r| r.protocol).collect();
        let source_count = source_diversity;
        // A TCP flood with majority-reject traffic is a SYN flood regardless of
        // how distributed the sources are; the size/diversity-based
        // amplification split below only applies once that's ruled out.
        let sub_type = if source_count > 10 && protocols.contains(&Protocol::Tcp) && rejection_rate > 0.5 {
            DdosSubType::SynFlood
        } else if source_count > 100 {
            if avg_packet_size < 100.0 {
                DdosSubType::VolumetricFlood
            } else {
                DdosSubType::AmplificationAttack
            }
        } else if source_count > 10 {
            if protocols.contains(&Protocol::Udp) {
                DdosSubType::UdpFlood
            } else {
                DdosSubType::ProtocolAttack
            }
        } else {
            DdosSubType::SingleSourceFlood
        };

        let detected_at = records.iter().map(|r| r.timestamp).max().unwrap_or(0);
        Some(Anomaly {
            id: uuid::Uuid::new_v4(),
            kind: AnomalyKind::Ddos,
            confidence,
            detected_at,
            source_addr: None,
            dest_addr: Some(candidate.dest.0),
            dest_port: Some(candidate.dest.1),
            evidence: AnomalyEvidence::Ddos {
                packet_rate: rate,
                source_diversity,
                sub_type,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FlowAction;

    fn record(ts: i64, source_octet: u8, dest_port: u16, action: FlowAction) -> FlowRecord {
        FlowRecord {
            timestamp: ts,
            source_addr: std::net::IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, source_octet)),
            dest_addr: "203.0.113.10".parse().unwrap(),
            source_port: 1234,
            dest_port,
            protocol: Protocol::Tcp,
            action,
            packet_count: 1,
            byte_count: 64,
            duration_secs: None,
        }
    }

    #[test]
    fn at_threshold_rate_does_not_emit() {
        let detector = DdosDetector::new(DdosConfig { packet_rate_threshold: 1000.0, time_window_secs: 10, confidence_threshold: 0.8 });
        let batch: Vec<_> = (0..1000).map(|i| record(i % 10, (i % 255) as u8, 80, FlowAction::Accept)).collect();
        let anomalies = detector.detect(&batch).unwrap();
        assert!(anomalies.is_empty() || anomalies[0].confidence < 0.8);
    }

    #[test]
    fn flood_from_many_sources_emits() {
        let detector = DdosDetector::new(DdosConfig::default());
        let batch: Vec<_> = (0..6000)
            .map(|i| {
                let action = if i % 10 < 7 { FlowAction::Reject } else { FlowAction::Accept };
                record((i % 30) as i64, (i % 150) as u8, 80, action)
            })
            .collect();
        let anomalies = detector.detect(&batch).unwrap();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::Ddos);
        match &anomalies[0].evidence {
            AnomalyEvidence::Ddos { sub_type, source_diversity, .. } => {
                assert_eq!(*source_diversity, 150);
                assert_eq!(*sub_type, DdosSubType::SynFlood);
            }
            other => panic!("expected Ddos evidence, got {other:?}"),
        }
    }
}
