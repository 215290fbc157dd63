//! Core data model: flow records, anomalies, correlation groups, findings.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Gre,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    Accept,
    Reject,
}

/// A single observed network flow. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub timestamp: i64,
    pub source_addr: IpAddr,
    pub dest_addr: IpAddr,
    pub source_port: u16,
    pub dest_port: u16,
    pub protocol: Protocol,
    pub action: FlowAction,
    pub packet_count: u64,
    pub byte_count: u64,
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum AnomalyKind {
    PortScan,
    Ddos,
    C2Beacon,
    CryptoMining,
    TorUsage,
    MlBehavioral,
    BehavioralDeviation,
}

impl AnomalyKind {
    pub fn name(&self) -> &'static str {
        match self {
            AnomalyKind::PortScan => "PORT_SCAN",
            AnomalyKind::Ddos => "DDOS",
            AnomalyKind::C2Beacon => "C2_BEACON",
            AnomalyKind::CryptoMining => "CRYPTO_MINING",
            AnomalyKind::TorUsage => "TOR_USAGE",
            AnomalyKind::MlBehavioral => "ML_BEHAVIORAL",
            AnomalyKind::BehavioralDeviation => "BEHAVIORAL_DEVIATION",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AnomalyEvidence {
    PortScan {
        unique_ports: u32,
        window_secs: u32,
        sequential_ratio: f64,
        success_rate: f64,
    },
    Ddos {
        packet_rate: f64,
        source_diversity: u32,
        sub_type: DdosSubType,
    },
    C2Beacon {
        mean_interval_secs: f64,
        coefficient_of_variation: f64,
        connection_count: u32,
    },
    CryptoMining {
        protocol: MiningProtocol,
        total_bytes: u64,
        connection_count: u32,
    },
    TorUsage {
        usage_kind: TorUsageKind,
        indicator_count: u32,
    },
    MlBehavioral {
        model_id: String,
        raw_score: f64,
    },
    BehavioralDeviation {
        description: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DdosSubType {
    VolumetricFlood,
    AmplificationAttack,
    SynFlood,
    UdpFlood,
    ProtocolAttack,
    SingleSourceFlood,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MiningProtocol {
    Stratum,
    BitcoinRpc,
    Ethereum,
    HttpMining,
    UnknownMiningProtocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TorUsageKind {
    TorDirectoryAccess,
    TorRelayConnection,
    TorSocksProxy,
    TorBridgeConnection,
    TorCircuitBuilding,
    TorGeneralUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: uuid::Uuid,
    pub kind: AnomalyKind,
    pub confidence: f64,
    pub detected_at: i64,
    pub source_addr: Option<IpAddr>,
    pub dest_addr: Option<IpAddr>,
    pub dest_port: Option<u16>,
    pub evidence: AnomalyEvidence,
}

impl Anomaly {
    /// Sort key used to make batch ordering deterministic: (timestamp, kind name, id).
    pub fn ordering_key(&self) -> (i64, &'static str, uuid::Uuid) {
        (self.detected_at, self.kind.name(), self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedAnomaly {
    pub anomaly: Anomaly,
    pub correlation_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationGroup {
    pub group_id: uuid::Uuid,
    pub primary: Anomaly,
    pub related: Vec<RelatedAnomaly>,
    pub confidence: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CorrelationGroup {
    pub fn size(&self) -> usize {
        1 + self.related.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationStage {
    Whitelist,
    Contextual,
    ThreatSpecific,
    Historical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub whitelist_passed: bool,
    pub contextual_passed: bool,
    pub threat_specific_passed: bool,
    pub historical_passed: bool,
    pub failure_reasons: Vec<String>,
    pub metadata: serde_json::Value,
}

impl ValidationResult {
    pub fn stage_passed(&self, stage: ValidationStage) -> bool {
        match stage {
            ValidationStage::Whitelist => self.whitelist_passed,
            ValidationStage::Contextual => self.contextual_passed,
            ValidationStage::ThreatSpecific => self.threat_specific_passed,
            ValidationStage::Historical => self.historical_passed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub finding_id: uuid::Uuid,
    pub batch_id: uuid::Uuid,
    pub producer_id: String,
    pub schema_version: u32,
    pub published_at: i64,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub priority: u8,
    pub confidence: f64,
    pub fallback: bool,
    pub group: CorrelationGroup,
    pub validation: ValidationResult,
}

/// Bounded recent-anomaly record kept for one entity in the correlation state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: i64,
    pub kind: AnomalyKind,
    pub confidence: f64,
    pub dest_addr: Option<IpAddr>,
    pub dest_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationStateEntry {
    pub schema_version: u32,
    pub entity_key: String,
    pub history: Vec<HistoryEntry>,
    pub context: serde_json::Value,
    pub updated_at: i64,
    pub expires_at: i64,
}
