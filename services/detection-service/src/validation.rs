//! Multi-stage validator (spec.md §4.5).

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::net::IpAddr;

use crate::config::ValidationConfig;
use crate::types::{AnomalyEvidence, AnomalyKind, CorrelationGroup, Finding, Severity, ValidationResult};

/// Historical false-positive lookup for an entity/kind pair. The original
/// implementation hardcodes a constant; here it is pluggable so a real
/// feedback store can be wired in. Absence of history means no penalty.
pub trait FalsePositiveSource: Send + Sync {
    fn false_positive_rate(&self, entity_key: &str, kind: AnomalyKind) -> f64;
}

pub struct NoHistoryFalsePositiveSource;

impl FalsePositiveSource for NoHistoryFalsePositiveSource {
    fn false_positive_rate(&self, _entity_key: &str, _kind: AnomalyKind) -> f64 {
        0.0
    }
}

/// Scores how repetitive a group's pattern is versus prior observations.
/// Defaults to 0.0 (never penalizes) absent a real implementation.
pub trait PatternRepetitionScorer: Send + Sync {
    fn score(&self, group: &CorrelationGroup) -> f64;
}

pub struct ZeroPatternRepetitionScorer;

impl PatternRepetitionScorer for ZeroPatternRepetitionScorer {
    fn score(&self, _group: &CorrelationGroup) -> f64 {
        0.0
    }
}

pub struct Validator {
    config: ValidationConfig,
    fp_source: Box<dyn FalsePositiveSource>,
    repetition_scorer: Box<dyn PatternRepetitionScorer>,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            fp_source: Box::new(NoHistoryFalsePositiveSource),
            repetition_scorer: Box::new(ZeroPatternRepetitionScorer),
        }
    }

    pub fn with_collaborators(
        config: ValidationConfig,
        fp_source: Box<dyn FalsePositiveSource>,
        repetition_scorer: Box<dyn PatternRepetitionScorer>,
    ) -> Self {
        Self { config, fp_source, repetition_scorer }
    }

    pub fn validate(&self, group: &CorrelationGroup) -> ValidationResult {
        let mut reasons = Vec::new();
        let mut metadata = serde_json::Map::new();
        metadata.insert("group_size".to_string(), serde_json::json!(group.size()));

        let whitelist_passed = self.check_whitelist(group, &mut reasons, &mut metadata);
        let contextual_passed = self.check_contextual(group, &mut reasons, &mut metadata);
        let threat_specific_passed = self.check_threat_specific(group, &mut reasons, &mut metadata);
        let historical_passed = self.check_historical(group, &mut reasons, &mut metadata);

        let valid = whitelist_passed
            && contextual_passed
            && threat_specific_passed
            && historical_passed
            && group.confidence >= self.config.min_group_confidence;
        if group.confidence < self.config.min_group_confidence {
            reasons.push(format!(
                "group confidence {:.2} below minimum {:.2}",
                group.confidence, self.config.min_group_confidence
            ));
        }

        ValidationResult {
            valid,
            whitelist_passed,
            contextual_passed,
            threat_specific_passed,
            historical_passed,
            failure_reasons: reasons,
            metadata: serde_json::Value::Object(metadata),
        }
    }

    fn check_whitelist(
        &self,
        group: &CorrelationGroup,
        reasons: &mut Vec<String>,
        metadata: &mut serde_json::Map<String, serde_json::Value>,
    ) -> bool {
        let addr_whitelisted = |addr: Option<IpAddr>| -> bool {
            let Some(addr) = addr else { return false };
            if self.config.whitelist_addrs.iter().any(|w| w == &addr.to_string()) {
                return true;
            }
            self.config.whitelist_subnets.iter().any(|subnet| matches_subnet_24(addr, subnet))
        };
        let primary = &group.primary;
        metadata.insert(
            "whitelist".to_string(),
            serde_json::json!({
                "source_addr": primary.source_addr.map(|a| a.to_string()),
                "dest_addr": primary.dest_addr.map(|a| a.to_string()),
                "checked_subnets": self.config.whitelist_subnets,
            }),
        );
        if addr_whitelisted(primary.source_addr) {
            reasons.push("source address whitelisted".to_string());
            return false;
        }
        if addr_whitelisted(primary.dest_addr) {
            reasons.push("destination address whitelisted".to_string());
            return false;
        }
        true
    }

    fn check_contextual(
        &self,
        group: &CorrelationGroup,
        reasons: &mut Vec<String>,
        metadata: &mut serde_json::Map<String, serde_json::Value>,
    ) -> bool {
        let dt = DateTime::<Utc>::from_timestamp(group.primary.detected_at, 0).unwrap_or_else(|| Utc::now());
        let hour = dt.hour();
        let weekday = dt.weekday().number_from_monday();
        let is_weekend = weekday >= 6;
        let is_business_hours =
            !is_weekend && hour >= self.config.business_hours_start && hour < self.config.business_hours_end;

        let mut context_factor = 1.0;
        if !is_business_hours {
            context_factor *= 0.9;
        }
        if is_weekend {
            context_factor *= self.config.weekend_factor;
        }
        metadata.insert(
            "contextual".to_string(),
            serde_json::json!({
                "hour": hour,
                "weekday": weekday,
                "is_weekend": is_weekend,
                "is_business_hours": is_business_hours,
                "context_factor": context_factor,
            }),
        );

        if group.primary.kind == AnomalyKind::PortScan && is_business_hours && group.primary.confidence < 0.9 {
            reasons.push("port scan during business hours below confidence floor".to_string());
            return false;
        }
        true
    }

    fn check_threat_specific(
        &self,
        group: &CorrelationGroup,
        reasons: &mut Vec<String>,
        metadata: &mut serde_json::Map<String, serde_json::Value>,
    ) -> bool {
        let (passed, rule, compared) = match &group.primary.evidence {
            AnomalyEvidence::PortScan { unique_ports, .. } => {
                ("unique_ports >= 10", *unique_ports >= 10, serde_json::json!({ "unique_ports": unique_ports }))
            }
            AnomalyEvidence::Ddos { packet_rate, source_diversity, .. } => (
                "packet_rate >= 500.0 && source_diversity >= 5",
                *packet_rate >= 500.0 && *source_diversity >= 5,
                serde_json::json!({ "packet_rate": packet_rate, "source_diversity": source_diversity }),
            ),
            AnomalyEvidence::C2Beacon { coefficient_of_variation, .. } => (
                "1.0 - cv/100.0 >= 0.8",
                1.0 - coefficient_of_variation / 100.0 >= 0.8,
                serde_json::json!({ "coefficient_of_variation": coefficient_of_variation }),
            ),
            AnomalyEvidence::CryptoMining { total_bytes, .. } => {
                ("total_bytes >= 1024", *total_bytes >= 1024, serde_json::json!({ "total_bytes": total_bytes }))
            }
            AnomalyEvidence::TorUsage { indicator_count, .. } => (
                "indicator_count >= 2",
                *indicator_count >= 2,
                serde_json::json!({ "indicator_count": indicator_count }),
            ),
            AnomalyEvidence::MlBehavioral { .. } | AnomalyEvidence::BehavioralDeviation { .. } => {
                ("always passes for ml/behavioral evidence", true, serde_json::json!({}))
            }
        };
        metadata.insert(
            "threat_specific".to_string(),
            serde_json::json!({ "rule": rule, "values": compared }),
        );
        if !passed {
            reasons.push("threat-specific requirement not met".to_string());
        }
        passed
    }

    fn check_historical(
        &self,
        group: &CorrelationGroup,
        reasons: &mut Vec<String>,
        metadata: &mut serde_json::Map<String, serde_json::Value>,
    ) -> bool {
        let entity_key = group
            .primary
            .source_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let fp_rate = self.fp_source.false_positive_rate(&entity_key, group.primary.kind);
        let max_fp_rate = max_false_positive_rate(&self.config, group.primary.kind);
        let repetition = self.repetition_scorer.score(group);
        metadata.insert(
            "historical".to_string(),
            serde_json::json!({
                "false_positive_rate": fp_rate,
                "max_false_positive_rate": max_fp_rate,
                "pattern_repetition_score": repetition,
                "max_pattern_repetition_score": self.config.max_pattern_repetition_score,
            }),
        );
        if fp_rate > max_fp_rate {
            reasons.push(format!("false-positive rate {:.3} exceeds ceiling {:.3}", fp_rate, max_fp_rate));
            return false;
        }
        if repetition > self.config.max_pattern_repetition_score {
            reasons.push(format!("pattern repetition score {:.2} exceeds ceiling", repetition));
            return false;
        }
        true
    }
}

fn matches_subnet_24(addr: IpAddr, subnet: &str) -> bool {
    let (IpAddr::V4(addr), Ok(prefix)) = (addr, subnet.parse::<std::net::Ipv4Addr>()) else {
        return false;
    };
    addr.octets()[..3] == prefix.octets()[..3]
}

fn max_false_positive_rate(config: &ValidationConfig, kind: AnomalyKind) -> f64 {
    match kind {
        AnomalyKind::PortScan => config.max_false_positive_rate_port_scan,
        AnomalyKind::Ddos => config.max_false_positive_rate_ddos,
        AnomalyKind::C2Beacon => config.max_false_positive_rate_c2_beacon,
        AnomalyKind::CryptoMining => config.max_false_positive_rate_crypto_mining,
        AnomalyKind::TorUsage => config.max_false_positive_rate_tor_usage,
        AnomalyKind::MlBehavioral | AnomalyKind::BehavioralDeviation => 1.0,
    }
}

fn base_severity(kind: AnomalyKind) -> Severity {
    match kind {
        AnomalyKind::Ddos | AnomalyKind::C2Beacon => Severity::High,
        AnomalyKind::PortScan | AnomalyKind::CryptoMining | AnomalyKind::MlBehavioral => Severity::Medium,
        AnomalyKind::TorUsage | AnomalyKind::BehavioralDeviation => Severity::Low,
    }
}

pub fn assign_severity(group: &CorrelationGroup) -> Severity {
    let mut level = base_severity(group.primary.kind) as i32;
    if group.confidence > 0.9 {
        level += 1;
    } else if group.confidence <= 0.8 {
        level -= 1;
    }
    if group.size() > 3 {
        level += 1;
    }
    match level.clamp(0, 3) {
        0 => Severity::Low,
        1 => Severity::Medium,
        2 => Severity::High,
        _ => Severity::Critical,
    }
}

pub fn assign_priority(severity: Severity, confidence: f64) -> u8 {
    let base = match severity {
        Severity::Low => 2.0,
        Severity::Medium => 5.0,
        Severity::High => 8.0,
        Severity::Critical => 10.0,
    };
    let adjusted = base + ((confidence - 0.5) * 4.0).round();
    adjusted.clamp(1.0, 10.0) as u8
}

pub fn build_finding(
    group: CorrelationGroup,
    validation: ValidationResult,
    batch_id: uuid::Uuid,
    producer_id: &str,
    published_at: i64,
    fallback: bool,
) -> Finding {
    build_finding_with_severity(group, validation, batch_id, producer_id, published_at, fallback, None)
}

/// Builds a finding using an explicit severity instead of `assign_severity`.
/// Used by the Tier-4 fallback path, which spec.md §4.1 fixes at MEDIUM
/// regardless of confidence or group size.
pub fn build_finding_with_severity(
    group: CorrelationGroup,
    validation: ValidationResult,
    batch_id: uuid::Uuid,
    producer_id: &str,
    published_at: i64,
    fallback: bool,
    severity_override: Option<Severity>,
) -> Finding {
    let severity = severity_override.unwrap_or_else(|| assign_severity(&group));
    let priority = assign_priority(severity, group.confidence);
    Finding {
        finding_id: uuid::Uuid::new_v4(),
        batch_id,
        producer_id: producer_id.to_string(),
        schema_version: 1,
        published_at,
        kind: group.primary.kind,
        severity,
        priority,
        confidence: group.confidence,
        fallback,
        group,
        validation,
    }
}
