use std::sync::Arc;

use anyhow::Result;
use swarm_core::{init_tracing, start_health_server};
use tokio::signal;
use tracing::{error, info};

use detection_service::clock::SystemClock;
use detection_service::config::ConfigHandle;
use detection_service::correlation::CorrelationEngine;
use detection_service::detectors::c2_beacon::C2BeaconDetector;
use detection_service::detectors::crypto_mining::CryptoMiningDetector;
use detection_service::detectors::ddos::DdosDetector;
use detection_service::detectors::port_scan::PortScanDetector;
use detection_service::detectors::tor_usage::TorUsageDetector;
use detection_service::detectors::Detector;
use detection_service::model_client::{HeuristicBehavioralClient, ModelManager};
use detection_service::orchestrator::TierOrchestrator;
use detection_service::publisher::{EventPublisher, LoggingBus, OutboxBus};
use detection_service::state_store::{CorrelationStateStore, InMemoryStateStore};
use detection_service::types::FlowRecord;
use detection_service::validation::Validator;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("detection-service")?;
    start_health_server(9091).await?;

    let initial_config = detection_service::config::load().unwrap_or_default();
    let config = Arc::new(ConfigHandle::new(initial_config));
    let snapshot = config.snapshot();
    let clock = Arc::new(SystemClock);

    let detectors: Vec<Arc<dyn Detector>> = vec![
        Arc::new(PortScanDetector::new(snapshot.port_scan.clone())),
        Arc::new(DdosDetector::new(snapshot.ddos.clone())),
        Arc::new(C2BeaconDetector::new(snapshot.c2_beacon.clone())),
        Arc::new(CryptoMiningDetector::new(snapshot.crypto_mining.clone())),
        Arc::new(TorUsageDetector::new(snapshot.tor_usage.clone())),
    ];

    let mut model_manager = ModelManager::new(clock.clone(), snapshot.model_manager.clone());
    model_manager.register(Arc::new(HeuristicBehavioralClient::new("heuristic-behavioral", 0.8)));

    let correlation = CorrelationEngine::new(snapshot.correlation.clone());
    let validator = Validator::new(snapshot.validation.clone());

    let state_store: Arc<dyn CorrelationStateStore> =
        Arc::new(InMemoryStateStore::new(clock.clone(), snapshot.state_store.clone()));

    let outbox_db = sled::Config::new().temporary(true).open()?;
    let primary_bus = Arc::new(LoggingBus::new("primary"));
    let fallback_bus = Arc::new(OutboxBus::open(&outbox_db)?);
    let publisher = EventPublisher::new(primary_bus, Some(fallback_bus));

    // Batches arrive from whatever ingress transport the deployment wires up
    // (queue, socket, sidecar) and are handed to `orchestrator.process_batch`;
    // that transport is outside this crate's scope, so no listener runs here.
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<FlowRecord>>(1024);

    let worker = {
        let orchestrator = Arc::new(TierOrchestrator::new(
            detectors,
            model_manager,
            correlation,
            validator,
            state_store.clone(),
            publisher,
            clock.clone(),
            config.clone(),
            "detection-service",
        ));
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                let outcome = orchestrator.process_batch(batch).await;
                info!(
                    batch_id = %outcome.batch_id,
                    findings = outcome.findings.len(),
                    deadline_missed = outcome.metadata.deadline_missed,
                    "batch processed"
                );
            }
        })
    };
    let _ingress_handle = tx;

    let cleanup_store = state_store.clone();
    let cleanup = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            snapshot.state_store.cleanup_interval_secs.max(1) as u64,
        ));
        loop {
            interval.tick().await;
            if let Err(err) = cleanup_store.cleanup().await {
                error!(error = %err, "correlation state cleanup failed");
            }
        }
    });

    info!("detection-service ready");

    signal::ctrl_c().await?;
    info!("shutdown");
    worker.abort();
    cleanup.abort();
    Ok(())
}
