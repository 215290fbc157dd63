use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

/// Ports a legitimate client routinely dials; seen alongside random/ephemeral
/// ports they're the hallmark of a scan rather than ordinary traffic.
const WELL_KNOWN_PORTS: [u16; 11] = [21, 22, 23, 25, 53, 80, 110, 143, 443, 993, 995];

use crate::config::PortScanConfig;
use crate::types::{Anomaly, AnomalyEvidence, AnomalyKind, FlowAction, FlowRecord};

use super::Detector;

pub struct PortScanDetector {
    config: PortScanConfig,
}

impl PortScanDetector {
    pub fn new(config: PortScanConfig) -> Self {
        Self { config }
    }
}

struct Candidate<'a> {
    source: IpAddr,
    records: Vec<&'a FlowRecord>,
}

impl Detector for PortScanDetector {
    fn name(&self) -> &'static str {
        "port_scan"
    }

    fn detect(&self, batch: &[FlowRecord]) -> anyhow::Result<Vec<Anomaly>> {
        let window = self.config.time_window_secs as i64;
        let mut buckets: HashMap<(IpAddr, i64), Vec<&FlowRecord>> = HashMap::new();
        for record in batch {
            let bucket = record.timestamp.div_euclid(window.max(1));
            buckets.entry((record.source_addr, bucket)).or_default().push(record);
        }

        let mut candidates = Vec::new();
        for ((source, _bucket), records) in buckets {
            let unique_ports: HashSet<u16> = records.iter().map(|r| r.dest_port).collect();
            if unique_ports.len() as u32 > self.config.port_threshold {
                candidates.push(Candidate { source, records });
            }
        }

        let mut anomalies = Vec::new();
        for candidate in candidates {
            if let Some(anomaly) = self.validate(&candidate) {
                anomalies.push(anomaly);
            }
        }
        Ok(anomalies)
    }
}

/// Scores the mix of well-known vs. random ports hit: a blend of both is the
/// strongest scanning signal, all-random or all-well-known score lower.
fn port_diversity_score(ports: &[u16]) -> f64 {
    if ports.len() < 5 {
        return 0.0;
    }
    let well_known_count = ports.iter().filter(|p| WELL_KNOWN_PORTS.contains(p)).count();
    let ratio = well_known_count as f64 / ports.len() as f64;
    if (0.2..=0.8).contains(&ratio) {
        0.8
    } else if ratio < 0.2 {
        0.6
    } else {
        0.4
    }
}

impl PortScanDetector {
    fn validate(&self, candidate: &Candidate) -> Option<Anomaly> {
        let records = &candidate.records;
        let mut ports: Vec<u16> = records.iter().map(|r| r.dest_port).collect();
        ports.sort_unstable();
        ports.dedup();
        let unique_ports = ports.len() as u32;

        let rejected = records.iter().filter(|r| r.action == FlowAction::Reject).count();
        let success_rate = 1.0 - (rejected as f64 / records.len() as f64);

        let sequential_steps = ports.windows(2).filter(|w| w[1] == w[0] + 1).count();
        let sequential_ratio = if ports.len() > 1 {
            sequential_steps as f64 / (ports.len() - 1) as f64
        } else {
            0.0
        };

        let diversity_score = port_diversity_score(&ports);
        let low_success_bonus = if success_rate < 0.1 {
            0.4
        } else if success_rate < 0.5 {
            0.2
        } else {
            0.0
        };
        let confidence = (diversity_score * 0.4 + low_success_bonus + sequential_ratio * 0.2).min(1.0);

        if confidence < self.config.confidence_threshold {
            return None;
        }

        let detected_at = records.iter().map(|r| r.timestamp).max().unwrap_or(0);
        Some(Anomaly {
            id: uuid::Uuid::new_v4(),
            kind: AnomalyKind::PortScan,
            confidence,
            detected_at,
            source_addr: Some(candidate.source),
            dest_addr: None,
            dest_port: None,
            evidence: AnomalyEvidence::PortScan {
                unique_ports,
                window_secs: self.config.time_window_secs,
                sequential_ratio,
                success_rate,
            },
        })
    }
}
