//! Service framework: the cycle-loop contract shared by all five
//! services, graceful shutdown, per-network concurrency bounds, and
//! chunk progress tracking.

pub mod finder;
pub mod metrics;
pub mod monitor;
pub mod queries;
pub mod seeder;
pub mod synchronizer;
pub mod validator;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Semaphore, watch};

use crate::config::{BaseServiceConfig, NetworksConfig};
use crate::error::Result;
use crate::models::relay::Network;
use crate::models::service_state::ServiceName;

pub use finder::Finder;
pub use monitor::Monitor;
pub use seeder::Seeder;
pub use synchronizer::Synchronizer;
pub use validator::Validator;

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Idempotent shutdown signal shared between the cycle loop, signal
/// handlers and long-running probes.
#[derive(Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Request a graceful shutdown. Safe to call repeatedly and from
    /// any task.
    pub fn request(&self) {
        let _ = self.sender.send(true);
    }

    pub fn is_running(&self) -> bool {
        !*self.sender.borrow()
    }

    /// Wait until shutdown is requested.
    pub async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Interruptible sleep: returns `true` when shutdown was requested
    /// during the wait, `false` when the timeout elapsed normally.
    pub async fn wait_for(&self, timeout: Duration) -> bool {
        tokio::select! {
            _ = self.wait() => true,
            _ = tokio::time::sleep(timeout) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Service contract
// ---------------------------------------------------------------------------

/// Why `run_forever` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Shutdown was requested (or a single `--once` cycle completed).
    Cancelled,
    /// The consecutive-failure limit was reached.
    FailureLimit,
}

/// A long-running cycle service. `run` performs exactly one bounded
/// cycle; the provided loop in [`run_forever`] handles failure streaks,
/// metrics and the interruptible inter-cycle sleep.
#[async_trait]
pub trait Service: Send {
    const NAME: ServiceName;

    fn base(&self) -> &BaseServiceConfig;

    fn shutdown(&self) -> &Shutdown;

    async fn run(&mut self) -> Result<()>;

    /// Set a named gauge for this service (no-op when metrics are
    /// disabled in config).
    fn set_gauge(&self, name: &str, value: f64) {
        if self.base().metrics.enabled {
            metrics::set_gauge(Self::NAME, name, value);
        }
    }

    /// Increment a named cumulative counter for this service (no-op
    /// when metrics are disabled in config).
    fn inc_counter(&self, name: &str, value: u64) {
        if self.base().metrics.enabled {
            metrics::inc_counter(Self::NAME, name, value);
        }
    }
}

/// Drive a service's cycle loop until shutdown or the failure limit.
///
/// A cycle error increments the consecutive-failure streak and the
/// `errors_<kind>` counter; success resets the streak. Cancellation
/// propagates immediately and is never counted as a failure.
pub async fn run_forever<S: Service>(service: &mut S) -> Outcome {
    let interval = service.base().interval_duration();
    let max_consecutive_failures = service.base().max_consecutive_failures;
    let name = S::NAME;

    tracing::info!(
        target: "bigbrotr::services",
        service = %name,
        interval_s = interval.as_secs_f64(),
        max_consecutive_failures,
        "run_forever_started"
    );

    let mut consecutive_failures: u32 = 0;
    let outcome = loop {
        if !service.shutdown().is_running() {
            break Outcome::Cancelled;
        }

        let cycle_start = Instant::now();
        match service.run().await {
            Ok(()) => {
                let duration = cycle_start.elapsed();
                service.inc_counter("cycles_success", 1);
                if service.base().metrics.enabled {
                    metrics::observe_cycle_duration(name, duration.as_secs_f64());
                }
                service.set_gauge("last_cycle_timestamp", chrono::Utc::now().timestamp() as f64);
                service.set_gauge("consecutive_failures", 0.0);
                consecutive_failures = 0;
                tracing::info!(
                    target: "bigbrotr::services",
                    service = %name,
                    duration_s = duration.as_secs_f64(),
                    next_cycle_s = interval.as_secs_f64(),
                    "cycle_completed"
                );
            }
            Err(e) if e.is_cancelled() => break Outcome::Cancelled,
            Err(e) => {
                consecutive_failures += 1;
                service.inc_counter("cycles_failed", 1);
                service.inc_counter(&format!("errors_{}", e.kind()), 1);
                service.set_gauge("consecutive_failures", f64::from(consecutive_failures));
                tracing::error!(
                    target: "bigbrotr::services",
                    service = %name,
                    error = %e,
                    consecutive_failures,
                    "run_cycle_error"
                );
                if max_consecutive_failures > 0 && consecutive_failures >= max_consecutive_failures
                {
                    tracing::error!(
                        target: "bigbrotr::services",
                        service = %name,
                        failures = consecutive_failures,
                        limit = max_consecutive_failures,
                        "max_consecutive_failures_reached"
                    );
                    break Outcome::FailureLimit;
                }
            }
        }

        if service.shutdown().wait_for(interval).await {
            break Outcome::Cancelled;
        }
    };

    tracing::info!(target: "bigbrotr::services", service = %name, "run_forever_stopped");
    outcome
}

// ---------------------------------------------------------------------------
// Per-network semaphores
// ---------------------------------------------------------------------------

/// One counting semaphore per operational network, sized from the
/// `max_tasks` config. Acquired whenever a task contacts a relay.
#[derive(Clone)]
pub struct NetworkSemaphores {
    map: HashMap<Network, Arc<Semaphore>>,
}

impl NetworkSemaphores {
    pub fn new(networks: &NetworksConfig) -> Self {
        let map = Network::ALL
            .into_iter()
            .map(|network| {
                let permits = networks.get(network).max_tasks.max(1);
                (network, Arc::new(Semaphore::new(permits)))
            })
            .collect();
        Self { map }
    }

    pub fn get(&self, network: Network) -> Arc<Semaphore> {
        self.map
            .get(&network)
            .cloned()
            .expect("all operational networks have a semaphore")
    }
}

// ---------------------------------------------------------------------------
// Chunk progress
// ---------------------------------------------------------------------------

/// Progress counters for a chunk-based processing cycle.
#[derive(Debug, Clone)]
pub struct ChunkProgress {
    pub started_at: i64,
    monotonic_start: Instant,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub chunks: usize,
}

impl Default for ChunkProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkProgress {
    pub fn new() -> Self {
        Self {
            started_at: chrono::Utc::now().timestamp(),
            monotonic_start: Instant::now(),
            total: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            chunks: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn record(&mut self, succeeded: usize, failed: usize) {
        self.processed += succeeded + failed;
        self.succeeded += succeeded;
        self.failed += failed;
        self.chunks += 1;
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.processed)
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.monotonic_start.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BigBrotrError;

    struct FakeService {
        base: BaseServiceConfig,
        shutdown: Shutdown,
        results: Vec<Result<()>>,
        cycles: usize,
    }

    impl FakeService {
        fn new(results: Vec<Result<()>>, max_failures: u32) -> Self {
            let base = BaseServiceConfig {
                interval: 0.05,
                max_consecutive_failures: max_failures,
                ..BaseServiceConfig::default()
            };
            Self {
                base,
                shutdown: Shutdown::new(),
                results,
                cycles: 0,
            }
        }
    }

    #[async_trait]
    impl Service for FakeService {
        const NAME: ServiceName = ServiceName::Seeder;

        fn base(&self) -> &BaseServiceConfig {
            &self.base
        }

        fn shutdown(&self) -> &Shutdown {
            &self.shutdown
        }

        async fn run(&mut self) -> Result<()> {
            self.cycles += 1;
            if self.results.is_empty() {
                self.shutdown.request();
                Ok(())
            } else {
                self.results.remove(0)
            }
        }
    }

    mod shutdown_tests {
        use super::*;

        #[tokio::test]
        async fn test_wait_for_times_out() {
            let shutdown = Shutdown::new();
            assert!(shutdown.is_running());
            let interrupted = shutdown.wait_for(Duration::from_millis(20)).await;
            assert!(!interrupted);
        }

        #[tokio::test]
        async fn test_wait_for_interrupted_by_request() {
            let shutdown = Shutdown::new();
            let waiter = shutdown.clone();
            let handle =
                tokio::spawn(async move { waiter.wait_for(Duration::from_secs(30)).await });
            tokio::time::sleep(Duration::from_millis(10)).await;
            shutdown.request();
            assert!(handle.await.unwrap());
            assert!(!shutdown.is_running());
        }

        #[tokio::test]
        async fn test_request_is_idempotent() {
            let shutdown = Shutdown::new();
            shutdown.request();
            shutdown.request();
            assert!(!shutdown.is_running());
            assert!(shutdown.wait_for(Duration::from_secs(1)).await);
        }
    }

    mod run_forever_tests {
        use super::*;

        #[tokio::test]
        async fn test_failure_limit_reached() {
            let mut service = FakeService::new(
                vec![
                    Err(BigBrotrError::Configuration("boom".to_string())),
                    Err(BigBrotrError::Configuration("boom".to_string())),
                ],
                2,
            );
            let outcome = run_forever(&mut service).await;
            assert_eq!(outcome, Outcome::FailureLimit);
            assert_eq!(service.cycles, 2);
        }

        #[tokio::test]
        async fn test_cancellation_not_counted_as_failure() {
            let mut service = FakeService::new(vec![Err(BigBrotrError::Cancelled)], 1);
            let before = metrics::counter_value(ServiceName::Seeder, "cycles_failed");
            let outcome = run_forever(&mut service).await;
            assert_eq!(outcome, Outcome::Cancelled);
            // metrics are disabled by default config, and cancellation
            // must not have counted even if they were on
            assert_eq!(
                metrics::counter_value(ServiceName::Seeder, "cycles_failed"),
                before
            );
        }

        #[tokio::test]
        async fn test_success_resets_streak() {
            let mut service = FakeService::new(
                vec![
                    Err(BigBrotrError::Configuration("boom".to_string())),
                    Ok(()),
                    Err(BigBrotrError::Configuration("boom".to_string())),
                ],
                2,
            );
            // streak: 1 then reset then 1 then the fake requests
            // shutdown on the 4th cycle
            let outcome = run_forever(&mut service).await;
            assert_eq!(outcome, Outcome::Cancelled);
            assert_eq!(service.cycles, 4);
        }
    }

    mod progress_tests {
        use super::*;

        #[test]
        fn test_chunk_progress_accounting() {
            let mut progress = ChunkProgress::new();
            progress.total = 10;
            progress.record(3, 1);
            progress.record(2, 0);
            assert_eq!(progress.processed, 6);
            assert_eq!(progress.succeeded, 5);
            assert_eq!(progress.failed, 1);
            assert_eq!(progress.chunks, 2);
            assert_eq!(progress.remaining(), 4);
        }

        #[test]
        fn test_semaphores_cover_all_networks() {
            let semaphores = NetworkSemaphores::new(&NetworksConfig::default());
            for network in Network::ALL {
                let semaphore = semaphores.get(network);
                assert!(semaphore.available_permits() >= 1);
            }
            assert_eq!(
                semaphores.get(Network::Clearnet).available_permits(),
                100
            );
        }
    }
}
