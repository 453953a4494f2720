//! Relay health probing.
//!
//! Probes the upstream status endpoint with configurable thresholds and
//! exponential backoff. The result lands in a shared flag that the relay
//! factory reports through `is_available`, which is what turns the node
//! DOWN while its upstream is gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use gridnode_core::{CoreResult, HttpMethod, RelayConfig};

use crate::client::{self, endpoint};

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The status endpoint returned 2xx.
    Healthy,
    /// The status endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayHealth {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Consecutive-failure counter for one upstream service.
///
/// A single good probe makes the relay healthy again. Failed probes back off
/// from the configured interval, doubling up to a minute.
#[derive(Debug)]
pub struct HealthTracker {
    status: RelayHealth,
    failures: u32,
    threshold: u32,
    interval: Duration,
    backoff: Duration,
}

const MAX_BACKOFF: Duration = Duration::from_secs(60);

impl HealthTracker {
    pub fn new(threshold: u32, interval: Duration) -> Self {
        Self {
            status: RelayHealth::Unknown,
            failures: 0,
            threshold: threshold.max(1),
            interval,
            backoff: interval,
        }
    }

    /// Record a probe result and return the new health status.
    pub fn record(&mut self, result: ProbeResult) -> RelayHealth {
        if result == ProbeResult::Healthy {
            self.failures = 0;
            self.backoff = self.interval;
            self.status = RelayHealth::Healthy;
        } else {
            self.failures += 1;
            self.backoff = (self.backoff * 2).min(MAX_BACKOFF.max(self.interval));
            if self.failures >= self.threshold {
                self.status = RelayHealth::Unhealthy;
            }
        }
        self.status
    }

    pub fn status(&self) -> RelayHealth {
        self.status
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay before the next probe.
    pub fn next_interval(&self) -> Duration {
        self.backoff
    }

    /// Unknown counts as up: a relay is trusted until probes say otherwise.
    pub fn is_available(&self) -> bool {
        self.status != RelayHealth::Unhealthy
    }
}

/// GET `url` and classify the answer.
pub async fn probe(url: &Url, timeout: Duration) -> ProbeResult {
    match client::send(HttpMethod::Get, url, Vec::new(), timeout).await {
        Ok(response) if response.is_success() => ProbeResult::Healthy,
        Ok(response) => {
            debug!(%url, status = response.status, "relay probe non-2xx");
            ProbeResult::Unhealthy
        }
        Err(e) => {
            debug!(%url, error = %e, "relay probe failed");
            ProbeResult::Failed
        }
    }
}

/// Background prober for one relay.
pub struct RelayHealthMonitor {
    status_url: Url,
    timeout: Duration,
    tracker: HealthTracker,
    healthy: Arc<AtomicBool>,
}

impl RelayHealthMonitor {
    /// Probe the relay described by `config`, publishing into `healthy`.
    pub fn new(config: &RelayConfig, healthy: Arc<AtomicBool>) -> CoreResult<Self> {
        let status_url = endpoint(&config.service_url()?, &config.status_endpoint);
        Ok(Self {
            status_url,
            timeout: config.probe_timeout()?,
            tracker: HealthTracker::new(config.unhealthy_threshold, config.probe_interval()?),
            healthy,
        })
    }

    pub fn status_url(&self) -> &Url {
        &self.status_url
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!(url = %self.status_url, "relay health loop starting");

        loop {
            let interval = self.tracker.next_interval();

            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let result = probe(&self.status_url, self.timeout).await;
                    self.apply(result);
                }
                _ = shutdown.changed() => {
                    debug!(url = %self.status_url, "relay health loop shutting down");
                    break;
                }
            }
        }
    }

    /// Feed one probe result through the tracker and update the flag.
    fn apply(&mut self, result: ProbeResult) -> RelayHealth {
        let previous = self.tracker.status();
        let current = self.tracker.record(result);
        self.healthy.store(self.tracker.is_available(), Ordering::SeqCst);

        if current != previous {
            match current {
                RelayHealth::Unhealthy => warn!(
                    url = %self.status_url,
                    failures = self.tracker.failures(),
                    "relay marked unhealthy"
                ),
                RelayHealth::Healthy if previous == RelayHealth::Unhealthy => {
                    info!(url = %self.status_url, "relay recovered")
                }
                _ => debug!(url = %self.status_url, status = ?current, "relay health changed"),
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32) -> RelayConfig {
        RelayConfig {
            url: "http://127.0.0.1:4723/wd/hub".to_string(),
            status_endpoint: "/status".to_string(),
            probe_interval: "1s".to_string(),
            probe_timeout: "500ms".to_string(),
            unhealthy_threshold: threshold,
            configs: Vec::new(),
        }
    }

    #[test]
    fn tracker_starts_unknown_and_available() {
        let tracker = HealthTracker::new(3, Duration::from_secs(5));
        assert_eq!(tracker.status(), RelayHealth::Unknown);
        assert!(tracker.is_available());
    }

    #[test]
    fn tracker_becomes_unhealthy_at_threshold() {
        let mut tracker = HealthTracker::new(3, Duration::from_secs(5));
        tracker.record(ProbeResult::Healthy);

        tracker.record(ProbeResult::Unhealthy);
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.status(), RelayHealth::Healthy);

        assert_eq!(tracker.record(ProbeResult::Failed), RelayHealth::Unhealthy);
        assert!(!tracker.is_available());
    }

    #[test]
    fn tracker_recovers_on_success() {
        let mut tracker = HealthTracker::new(2, Duration::from_secs(5));
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.status(), RelayHealth::Unhealthy);

        assert_eq!(tracker.record(ProbeResult::Healthy), RelayHealth::Healthy);
        assert_eq!(tracker.failures(), 0);
    }

    #[test]
    fn tracker_backoff_doubles_caps_and_resets() {
        let mut tracker = HealthTracker::new(100, Duration::from_secs(1));
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(2));
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(4));

        for _ in 0..10 {
            tracker.record(ProbeResult::Failed);
        }
        assert_eq!(tracker.next_interval(), Duration::from_secs(60));

        tracker.record(ProbeResult::Healthy);
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));
    }

    #[test]
    fn monitor_builds_status_url_from_config() {
        let monitor =
            RelayHealthMonitor::new(&config(3), Arc::new(AtomicBool::new(true))).unwrap();
        assert_eq!(
            monitor.status_url().as_str(),
            "http://127.0.0.1:4723/wd/hub/status"
        );
    }

    #[test]
    fn monitor_flips_shared_flag() {
        let healthy = Arc::new(AtomicBool::new(true));
        let mut monitor = RelayHealthMonitor::new(&config(2), Arc::clone(&healthy)).unwrap();

        monitor.apply(ProbeResult::Failed);
        assert!(healthy.load(Ordering::SeqCst));
        assert_eq!(monitor.apply(ProbeResult::Failed), RelayHealth::Unhealthy);
        assert!(!healthy.load(Ordering::SeqCst));

        monitor.apply(ProbeResult::Healthy);
        assert!(healthy.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn probe_of_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = Url::parse(&format!("http://127.0.0.1:{port}/status")).unwrap();
        assert_eq!(probe(&url, Duration::from_secs(1)).await, ProbeResult::Failed);
    }
}
