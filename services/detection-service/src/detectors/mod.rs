//! Tier-1 statistical detectors (spec.md §4.2). Each implements [`Detector`]
//! and is held behind `Arc<dyn Detector>` by the orchestrator so the five
//! run concurrently, each in its own `spawn_blocking` task.

pub mod c2_beacon;
pub mod crypto_mining;
pub mod ddos;
pub mod port_scan;
pub mod tor_usage;

use crate::types::{Anomaly, FlowRecord};

pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, batch: &[FlowRecord]) -> anyhow::Result<Vec<Anomaly>>;
}

pub(crate) fn mean_stddev(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}
