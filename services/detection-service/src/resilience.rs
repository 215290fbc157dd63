//! Resilient service primitive (spec.md §4.8): a three-state circuit breaker
//! wrapping a fallible, cancellable async operation, grown from the
//! consecutive-failure-count shape of `swarm-resilience::CircuitBreaker` with
//! a registered fallback and a per-call timeout added.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::BreakerConfig;
use crate::errors::DetectionError;
use crate::metrics::METRICS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

#[derive(Default)]
pub struct BreakerMetrics {
    pub total_calls: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub fallback_invocations: AtomicU64,
    pub trips: AtomicU64,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    metrics: BreakerMetrics,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
            metrics: BreakerMetrics::default(),
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    fn maybe_transition_to_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= Duration::from_secs(self.config.recovery_timeout_secs) {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                }
            }
        }
    }

    fn record_success(&self, inner: &mut Inner) {
        self.metrics.successes.fetch_add(1, Ordering::Relaxed);
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, inner: &mut Inner) {
        self.metrics.failures.fetch_add(1, Ordering::Relaxed);
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(inner);
                }
            }
            CircuitState::HalfOpen => {
                self.trip(inner);
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.consecutive_successes = 0;
        self.metrics.trips.fetch_add(1, Ordering::Relaxed);
        METRICS.breaker_trips_total.add(1, &[]);
        tracing::warn!(breaker = %self.name, "circuit breaker tripped open");
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            state: self.state(),
            total_calls: self.metrics.total_calls.load(Ordering::Relaxed),
            successes: self.metrics.successes.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
            fallback_invocations: self.metrics.fallback_invocations.load(Ordering::Relaxed),
            trips: self.metrics.trips.load(Ordering::Relaxed),
        }
    }

    /// Runs `op` under the breaker, honoring the configured call timeout.
    /// If the breaker is open, or `op` fails/times out, `fallback` (if any)
    /// is invoked and its result returned instead of an error.
    pub async fn call<T, Fut, FbFut>(
        &self,
        op: impl FnOnce() -> Fut,
        fallback: Option<impl FnOnce() -> FbFut>,
    ) -> Result<T, DetectionError>
    where
        Fut: Future<Output = anyhow::Result<T>>,
        FbFut: Future<Output = T>,
    {
        self.metrics.total_calls.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock();
            self.maybe_transition_to_half_open(&mut inner);
            if inner.state == CircuitState::Open {
                drop(inner);
                return self.on_open(fallback).await;
            }
        }

        let timeout = Duration::from_secs(self.config.call_timeout_secs);
        match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => {
                let mut inner = self.inner.lock();
                self.record_success(&mut inner);
                Ok(value)
            }
            Ok(Err(_)) | Err(_) => {
                let mut inner = self.inner.lock();
                self.record_failure(&mut inner);
                drop(inner);
                self.on_failure(fallback).await
            }
        }
    }

    async fn on_open<T, FbFut>(&self, fallback: Option<impl FnOnce() -> FbFut>) -> Result<T, DetectionError>
    where
        FbFut: Future<Output = T>,
    {
        match fallback {
            Some(fb) => {
                self.metrics.fallback_invocations.fetch_add(1, Ordering::Relaxed);
                Ok(fb().await)
            }
            None => Err(DetectionError::BreakerOpen(self.name.clone())),
        }
    }

    async fn on_failure<T, FbFut>(&self, fallback: Option<impl FnOnce() -> FbFut>) -> Result<T, DetectionError>
    where
        FbFut: Future<Output = T>,
    {
        match fallback {
            Some(fb) => {
                self.metrics.fallback_invocations.fetch_add(1, Ordering::Relaxed);
                Ok(fb().await)
            }
            None => Err(DetectionError::BreakerOpen(self.name.clone())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub fallback_invocations: u64,
    pub trips: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BreakerConfig {
        BreakerConfig { failure_threshold: 2, recovery_timeout_secs: 0, success_threshold: 2, call_timeout_secs: 1 }
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", cfg());
        for _ in 0..2 {
            let _: Result<(), DetectionError> = breaker
                .call(|| async { Err::<(), _>(anyhow::anyhow!("boom")) }, None::<fn() -> std::future::Ready<()>>)
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_recovers_after_successes() {
        let breaker = CircuitBreaker::new("test", cfg());
        for _ in 0..2 {
            let _: Result<(), DetectionError> = breaker
                .call(|| async { Err::<(), _>(anyhow::anyhow!("boom")) }, None::<fn() -> std::future::Ready<()>>)
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        for _ in 0..2 {
            let _ = breaker
                .call(|| async { Ok::<_, anyhow::Error>(()) }, None::<fn() -> std::future::Ready<()>>)
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn fallback_invoked_when_open() {
        let breaker = CircuitBreaker::new("test", cfg());
        for _ in 0..2 {
            let _: Result<(), DetectionError> = breaker
                .call(|| async { Err::<(), _>(anyhow::anyhow!("boom")) }, None::<fn() -> std::future::Ready<()>>)
                .await;
        }
        let result = breaker
            .call(|| async { Ok::<_, anyhow::Error>(1u32) }, Some(|| async { 42u32 }))
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(breaker.stats().fallback_invocations, 1);
    }
}
