use std::collections::HashMap;
use std::net::IpAddr;

use crate::config::C2BeaconConfig;
use crate::types::{Anomaly, AnomalyEvidence, AnomalyKind, FlowRecord};

use super::Detector;

pub struct C2BeaconDetector {
    config: C2BeaconConfig,
}

impl C2BeaconDetector {
    pub fn new(config: C2BeaconConfig) -> Self {
        Self { config }
    }
}

impl Detector for C2BeaconDetector {
    fn name(&self) -> &'static str {
        "c2_beacon"
    }

    fn detect(&self, batch: &[FlowRecord]) -> anyhow::Result<Vec<Anomaly>> {
        let mut groups: HashMap<(IpAddr, IpAddr, u16), Vec<i64>> = HashMap::new();
        for record in batch {
            groups
                .entry((record.source_addr, record.dest_addr, record.dest_port))
                .or_default()
                .push(record.timestamp);
        }

        let mut anomalies = Vec::new();
        for ((source, dest, port), mut timestamps) in groups {
            if (timestamps.len() as u32) < self.config.min_connections {
                continue;
            }
            timestamps.sort_unstable();
            let intervals: Vec<f64> = timestamps.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
            let (mean, stddev) = super::mean_stddev(&intervals);
            if mean <= 0.0 {
                continue;
            }
            let cv = (stddev / mean) * 100.0;
            if cv >= self.config.cv_threshold {
                continue;
            }
            if let Some(anomaly) = self.validate(source, dest, port, &timestamps, mean, cv) {
                anomalies.push(anomaly);
            }
        }
        Ok(anomalies)
    }
}

impl C2BeaconDetector {
    fn validate(
        &self,
        source: IpAddr,
        dest: IpAddr,
        port: u16,
        timestamps: &[i64],
        mean_interval: f64,
        cv: f64,
    ) -> Option<Anomaly> {
        let regularity = (1.0 - cv / 100.0).max(0.0);

        let interval_plausibility = if (60.0..=3600.0).contains(&mean_interval) {
            1.0
        } else if mean_interval < 60.0 {
            mean_interval / 60.0
        } else {
            (7200.0 - mean_interval).max(0.0) / 3600.0
        };

        let total_duration = (timestamps.last().unwrap() - timestamps.first().unwrap()) as f64;
        let duration_score = (total_duration / 3600.0).min(1.0);

        let confidence = (regularity * 0.4 + interval_plausibility * 0.3 + duration_score * 0.3).min(1.0);
        if confidence < self.config.confidence_threshold {
            return None;
        }

        Some(Anomaly {
            id: uuid::Uuid::new_v4(),
            kind: AnomalyKind::C2Beacon,
            confidence,
            detected_at: *timestamps.last().unwrap(),
            source_addr: Some(source),
            dest_addr: Some(dest),
            dest_port: Some(port),
            evidence: AnomalyEvidence::C2Beacon {
                mean_interval_secs: mean_interval,
                coefficient_of_variation: cv,
                connection_count: timestamps.len() as u32,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnomalyEvidence, FlowAction, Protocol};

    fn record(ts: i64) -> FlowRecord {
        FlowRecord {
            timestamp: ts,
            source_addr: "10.0.1.5".parse().unwrap(),
            dest_addr: "198.51.100.7".parse().unwrap(),
            source_port: 51000,
            dest_port: 443,
            protocol: Protocol::Tcp,
            action: FlowAction::Accept,
            packet_count: 4,
            byte_count: 512,
            duration_secs: None,
        }
    }

    #[test]
    fn regular_beacon_emits() {
        let detector = C2BeaconDetector::new(C2BeaconConfig::default());
        let batch: Vec<_> = (1..=12).map(|i| record(i * 300)).collect();
        let anomalies = detector.detect(&batch).unwrap();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::C2Beacon);
        if let AnomalyEvidence::C2Beacon { coefficient_of_variation, .. } = anomalies[0].evidence {
            assert!(coefficient_of_variation < 5.0);
        } else {
            panic!("wrong evidence variant");
        }
    }

    #[test]
    fn irregular_interval_does_not_emit() {
        let detector = C2BeaconDetector::new(C2BeaconConfig::default());
        let offsets = [10, 500, 30, 4000, 15, 900, 5, 1800, 2, 3600, 600, 1];
        let batch: Vec<_> = offsets.iter().scan(0i64, |acc, d| { *acc += d; Some(record(*acc)) }).collect();
        let anomalies = detector.detect(&batch).unwrap();
        assert!(anomalies.is_empty());
    }
}
