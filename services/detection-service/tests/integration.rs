use std::net::IpAddr;
use std::sync::Arc;

use detection_service::clock::SystemClock;
use detection_service::config::{BreakerConfig, ConfigHandle, ModelManagerConfig};
use detection_service::correlation::CorrelationEngine;
use detection_service::detectors::c2_beacon::C2BeaconDetector;
use detection_service::detectors::crypto_mining::CryptoMiningDetector;
use detection_service::detectors::ddos::DdosDetector;
use detection_service::detectors::port_scan::PortScanDetector;
use detection_service::detectors::Detector;
use detection_service::model_client::ModelManager;
use detection_service::orchestrator::TierOrchestrator;
use detection_service::publisher::{EventPublisher, LoggingBus};
use detection_service::state_store::InMemoryStateStore;
use detection_service::types::{FlowAction, FlowRecord, Protocol};
use detection_service::validation::{FalsePositiveSource, Validator};

fn flow(ts: i64, source: &str, dest: &str, dest_port: u16, action: FlowAction) -> FlowRecord {
    flow_sized(ts, source, dest, dest_port, action, 1, 60)
}

fn flow_sized(
    ts: i64,
    source: &str,
    dest: &str,
    dest_port: u16,
    action: FlowAction,
    packet_count: u64,
    byte_count: u64,
) -> FlowRecord {
    FlowRecord {
        timestamp: ts,
        source_addr: source.parse::<IpAddr>().unwrap(),
        dest_addr: dest.parse::<IpAddr>().unwrap(),
        source_port: 40000,
        dest_port,
        protocol: Protocol::Tcp,
        action,
        packet_count,
        byte_count,
        duration_secs: None,
    }
}

fn all_detectors() -> Vec<Arc<dyn Detector>> {
    vec![
        Arc::new(PortScanDetector::new(detection_service::config::PortScanConfig::default())),
        Arc::new(DdosDetector::new(detection_service::config::DdosConfig::default())),
        Arc::new(C2BeaconDetector::new(detection_service::config::C2BeaconConfig::default())),
        Arc::new(CryptoMiningDetector::new(detection_service::config::CryptoMiningConfig::default())),
    ]
}

fn build_orchestrator_with(
    validation_config: detection_service::config::ValidationConfig,
    detectors: Vec<Arc<dyn Detector>>,
) -> TierOrchestrator {
    let clock = Arc::new(SystemClock);
    let config = Arc::new(ConfigHandle::default());
    let model_manager = ModelManager::new(clock.clone(), ModelManagerConfig::default())
        .with_breaker_config(BreakerConfig::default());
    let correlation = CorrelationEngine::new(detection_service::config::CorrelationConfig::default());
    let validator = Validator::new(validation_config);
    let state_store = Arc::new(InMemoryStateStore::new(clock.clone(), detection_service::config::StateStoreConfig::default()));
    let publisher = EventPublisher::new(Arc::new(LoggingBus::new("primary")), None);
    TierOrchestrator::new(detectors, model_manager, correlation, validator, state_store, publisher, clock, config, "itest")
}

fn build_orchestrator(validation_config: detection_service::config::ValidationConfig) -> TierOrchestrator {
    build_orchestrator_with(validation_config, all_detectors())
}

#[tokio::test]
async fn port_scan_scenario_emits_finding() {
    let orchestrator = build_orchestrator(detection_service::config::ValidationConfig::default());
    let batch: Vec<FlowRecord> = (0..25)
        .map(|i| flow(30, "192.168.1.100", "192.168.1.5", 20 + i, FlowAction::Reject))
        .collect();
    let outcome = orchestrator.process_batch(batch).await;
    assert_eq!(outcome.findings.len(), 1);
    assert_eq!(outcome.findings[0].kind.name(), "PORT_SCAN");
}

#[tokio::test]
async fn whitelisted_source_suppresses_finding() {
    let mut validation = detection_service::config::ValidationConfig::default();
    validation.whitelist_addrs.push("192.168.1.100".to_string());
    let orchestrator = build_orchestrator(validation);
    let batch: Vec<FlowRecord> = (0..25)
        .map(|i| flow(30, "192.168.1.100", "192.168.1.5", 20 + i, FlowAction::Reject))
        .collect();
    let outcome = orchestrator.process_batch(batch).await;
    assert!(outcome.findings.is_empty());
}

#[tokio::test]
async fn empty_batch_produces_no_findings() {
    let orchestrator = build_orchestrator(detection_service::config::ValidationConfig::default());
    let outcome = orchestrator.process_batch(Vec::new()).await;
    assert!(outcome.findings.is_empty());
    assert_eq!(outcome.metadata.batch_size, 0);
}

#[tokio::test]
async fn ddos_scenario_emits_syn_flood_finding() {
    let orchestrator = build_orchestrator_with(
        detection_service::config::ValidationConfig::default(),
        vec![Arc::new(DdosDetector::new(detection_service::config::DdosConfig::default()))],
    );
    let batch: Vec<FlowRecord> = (0..6000u32)
        .map(|i| {
            let action = if i % 10 < 7 { FlowAction::Reject } else { FlowAction::Accept };
            flow_sized(
                (i % 30) as i64,
                &format!("10.0.1.{}", i % 150),
                "203.0.113.10",
                80,
                action,
                20,
                60,
            )
        })
        .collect();
    let outcome = orchestrator.process_batch(batch).await;
    assert_eq!(outcome.findings.len(), 1);
    let finding = &outcome.findings[0];
    assert_eq!(finding.kind.name(), "DDOS");
    match &finding.group.primary.evidence {
        detection_service::types::AnomalyEvidence::Ddos { sub_type, .. } => {
            assert_eq!(*sub_type, detection_service::types::DdosSubType::SynFlood);
        }
        other => panic!("expected Ddos evidence, got {other:?}"),
    }
    assert!(finding.severity >= detection_service::types::Severity::High);
}

#[tokio::test]
async fn c2_beacon_scenario_emits_finding() {
    let orchestrator = build_orchestrator_with(
        detection_service::config::ValidationConfig::default(),
        vec![Arc::new(C2BeaconDetector::new(detection_service::config::C2BeaconConfig::default()))],
    );
    let batch: Vec<FlowRecord> = (1..=12)
        .map(|i| flow(i * 300, "10.0.1.5", "198.51.100.7", 443, FlowAction::Accept))
        .collect();
    let outcome = orchestrator.process_batch(batch).await;
    assert_eq!(outcome.findings.len(), 1);
    let finding = &outcome.findings[0];
    assert_eq!(finding.kind.name(), "C2_BEACON");
    match &finding.group.primary.evidence {
        detection_service::types::AnomalyEvidence::C2Beacon { mean_interval_secs, coefficient_of_variation, .. } => {
            assert!((*mean_interval_secs - 300.0).abs() < 1.0);
            assert!(*coefficient_of_variation < 5.0);
        }
        other => panic!("expected C2Beacon evidence, got {other:?}"),
    }
    assert!(finding.severity >= detection_service::types::Severity::High);
}

#[tokio::test]
async fn crypto_mining_scenario_emits_finding() {
    let orchestrator = build_orchestrator_with(
        detection_service::config::ValidationConfig::default(),
        vec![Arc::new(CryptoMiningDetector::new(detection_service::config::CryptoMiningConfig::default()))],
    );
    let timestamps = [0i64, 86, 171, 257, 343, 429, 514, 600];
    let byte_counts = [131_072u64, 393_216, 131_072, 393_216, 131_072, 393_216, 131_072, 393_216];
    let batch: Vec<FlowRecord> = timestamps
        .iter()
        .zip(byte_counts.iter())
        .map(|(&ts, &bytes)| flow_sized(ts, "10.0.0.42", "198.51.100.20", 3333, FlowAction::Accept, 10, bytes))
        .collect();
    let outcome = orchestrator.process_batch(batch).await;
    assert_eq!(outcome.findings.len(), 1);
    let finding = &outcome.findings[0];
    assert_eq!(finding.kind.name(), "CRYPTO_MINING");
    match &finding.group.primary.evidence {
        detection_service::types::AnomalyEvidence::CryptoMining { protocol, total_bytes, .. } => {
            assert_eq!(*protocol, detection_service::types::MiningProtocol::Stratum);
            assert!(*total_bytes >= 2 * 1024 * 1024);
        }
        other => panic!("expected CryptoMining evidence, got {other:?}"),
    }
    assert_eq!(finding.severity, detection_service::types::Severity::Medium);
}

#[tokio::test]
async fn correlated_port_scan_and_ddos_share_a_group() {
    let orchestrator = build_orchestrator_with(
        detection_service::config::ValidationConfig::default(),
        vec![
            Arc::new(PortScanDetector::new(detection_service::config::PortScanConfig::default())),
            Arc::new(DdosDetector::new(detection_service::config::DdosConfig::default())),
        ],
    );
    let mut batch: Vec<FlowRecord> = (0..25)
        .map(|i| flow(30, "10.0.0.10", "10.0.0.50", 20 + i, FlowAction::Reject))
        .collect();
    for i in 0..3100u32 {
        let action = if i % 10 < 7 { FlowAction::Reject } else { FlowAction::Accept };
        batch.push(flow_sized(
            30 + (i % 10) as i64,
            &format!("10.0.2.{}", i % 31),
            "10.0.0.10",
            80,
            action,
            20,
            60,
        ));
    }
    let outcome = orchestrator.process_batch(batch).await;
    assert_eq!(outcome.findings.len(), 1);
    let group = &outcome.findings[0].group;
    assert_eq!(group.related.len(), 1, "port-scan and ddos anomalies must land in one group");
    let individual_max = group.primary.confidence.max(group.related[0].anomaly.confidence);
    assert!(
        group.confidence >= individual_max - 1e-9,
        "group confidence {} must be >= each individual's ({}, {})",
        group.confidence,
        group.primary.confidence,
        group.related[0].anomaly.confidence
    );
}

struct AlwaysFalsePositive;
impl FalsePositiveSource for AlwaysFalsePositive {
    fn false_positive_rate(&self, _entity_key: &str, _kind: detection_service::types::AnomalyKind) -> f64 {
        1.0
    }
}

#[test]
fn historical_stage_rejects_entities_with_high_false_positive_rate() {
    let validator = Validator::with_collaborators(
        detection_service::config::ValidationConfig::default(),
        Box::new(AlwaysFalsePositive),
        Box::new(detection_service::validation::ZeroPatternRepetitionScorer),
    );
    let batch: Vec<FlowRecord> = (0..25)
        .map(|i| flow(30, "192.168.1.100", "192.168.1.5", 20 + i, FlowAction::Reject))
        .collect();
    let detector = PortScanDetector::new(detection_service::config::PortScanConfig::default());
    let anomaly = detector.detect(&batch).unwrap().into_iter().next().unwrap();
    let group = detection_service::types::CorrelationGroup {
        group_id: uuid::Uuid::new_v4(),
        confidence: anomaly.confidence,
        primary: anomaly,
        related: Vec::new(),
        created_at: 0,
        updated_at: 0,
    };
    let result = validator.validate(&group);
    assert!(!result.historical_passed);
    assert!(!result.valid);
}
