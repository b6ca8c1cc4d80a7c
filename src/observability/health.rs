//! Server health probes and the periodic health monitor

use crate::scheduler::IntervalHandle;
use crate::vector_db::VectorStore;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Heartbeat endpoints, newest API first
pub const HEARTBEAT_ENDPOINTS: [&str; 3] = ["/api/v2/heartbeat", "/api/v1/heartbeat", "/api/v1"];

const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Health status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Component health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name
    pub name: String,

    /// Health status
    pub status: HealthStatus,

    /// Optional message
    pub message: Option<String>,

    /// Response time in milliseconds
    pub response_time_ms: Option<u64>,
}

impl ComponentHealth {
    pub fn new(name: impl Into<String>, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: Some(message.into()),
            response_time_ms: None,
        }
    }

    pub fn with_response_time(mut self, elapsed: Duration) -> Self {
        self.response_time_ms = Some(elapsed.as_millis() as u64);
        self
    }
}

/// Overall health of the access layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    /// Overall status
    pub status: HealthStatus,

    /// Component health checks
    pub components: Vec<ComponentHealth>,

    /// Timestamp
    pub timestamp: i64,
}

impl ServiceHealth {
    /// Worst component status wins
    pub fn from_components(components: Vec<ComponentHealth>) -> Self {
        let status = if components.iter().all(|c| c.status == HealthStatus::Healthy) {
            HealthStatus::Healthy
        } else if components.iter().any(|c| c.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };

        Self {
            status,
            components,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Outcome of an HTTP heartbeat race
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHealth {
    pub healthy: bool,
    /// Path of the endpoint that answered first
    pub endpoint: Option<String>,
}

/// Race every heartbeat endpoint; healthy on the first 2xx
pub async fn check_health_via_http(
    client: &reqwest::Client,
    server_url: &str,
    per_endpoint_timeout: Duration,
) -> HttpHealth {
    let base = server_url.trim_end_matches('/');

    let probes: Vec<_> = HEARTBEAT_ENDPOINTS
        .into_iter()
        .map(|path| {
            let url = format!("{}{}", base, path);
            Box::pin(async move {
                let response = client
                    .get(&url)
                    .timeout(per_endpoint_timeout)
                    .send()
                    .await
                    .map_err(|e| format!("{}: {}", url, e))?;

                if response.status().is_success() {
                    Ok::<String, String>(path.to_string())
                } else {
                    Err(format!("{} returned {}", url, response.status()))
                }
            })
        })
        .collect();

    match futures::future::select_ok(probes).await {
        Ok((endpoint, _)) => {
            debug!("Heartbeat answered on {}", endpoint);
            HttpHealth {
                healthy: true,
                endpoint: Some(endpoint),
            }
        }
        Err(e) => {
            debug!("All heartbeat endpoints failed, last error: {}", e);
            HttpHealth {
                healthy: false,
                endpoint: None,
            }
        }
    }
}

/// Heartbeat through an existing store connection
pub async fn check_health_via_client(store: &dyn VectorStore, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, store.heartbeat()).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Heartbeat failed: {}", e);
            false
        }
        Err(_) => {
            debug!("Heartbeat timed out after {:?}", timeout);
            false
        }
    }
}

/// Probe the v2 heartbeat, retrying transient failures with exponential backoff
pub async fn is_server_available(
    client: &reqwest::Client,
    server_url: &str,
    timeout: Duration,
    max_retries: u32,
) -> bool {
    let url = format!("{}{}", server_url.trim_end_matches('/'), HEARTBEAT_ENDPOINTS[0]);
    if let Err(e) = reqwest::Url::parse(&url) {
        warn!("Invalid server URL {}: {}", server_url, e);
        return false;
    }

    let mut delay = Duration::from_millis(100);
    for attempt in 0..=max_retries {
        let retryable = match client.get(&url).timeout(timeout).send().await {
            Ok(response) if response.status().is_success() => return true,
            Ok(response) => {
                let status = response.status();
                debug!("Heartbeat attempt {} returned {}", attempt + 1, status);
                status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            Err(e) => {
                debug!("Heartbeat attempt {} failed: {}", attempt + 1, e);
                e.is_connect() || e.is_timeout()
            }
        };

        if !retryable {
            return false;
        }
        if attempt < max_retries {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_BACKOFF);
        }
    }
    false
}

/// A health check to run on a schedule
pub type HealthCheckFn = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Snapshot of the monitor
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorState {
    pub checks: u64,
    pub last_healthy: Option<bool>,
    pub last_checked_at: Option<chrono::DateTime<chrono::Utc>>,
    pub in_progress: bool,
    /// Checks abandoned because they ran past twice the timeout
    pub forced_resets: u64,
}

struct MonitorShared {
    check: HealthCheckFn,
    timeout: Duration,
    next_run: AtomicU64,
    running: Mutex<Option<(u64, Instant)>>,
    state: Mutex<MonitorState>,
}

impl MonitorShared {
    /// `None` when another check is still running
    async fn run_check(&self) -> Option<bool> {
        let run = self.next_run.fetch_add(1, Ordering::SeqCst);
        {
            let mut running = self.running.lock();
            if let Some((_, started)) = *running {
                if started.elapsed() < self.timeout * 2 {
                    debug!("Health check already in progress, skipping");
                    return None;
                }
                warn!("Health check stuck for {:?}, resetting", started.elapsed());
                self.state.lock().forced_resets += 1;
            }
            *running = Some((run, Instant::now()));
        }

        let healthy = match tokio::time::timeout(self.timeout, (self.check)()).await {
            Ok(healthy) => healthy,
            Err(_) => {
                warn!("Health check timed out after {:?}", self.timeout);
                false
            }
        };

        {
            let mut running = self.running.lock();
            if matches!(*running, Some((id, _)) if id == run) {
                *running = None;
            }
        }

        let mut state = self.state.lock();
        state.checks += 1;
        state.last_healthy = Some(healthy);
        state.last_checked_at = Some(chrono::Utc::now());
        Some(healthy)
    }
}

/// Periodic health checks; stopping (or dropping) the monitor ends them
pub struct HealthMonitor {
    shared: Arc<MonitorShared>,
    interval: IntervalHandle,
}

impl HealthMonitor {
    pub fn stop(&self) {
        self.interval.stop();
    }

    /// Run a check now; `None` if one is already running
    pub async fn force_check(&self) -> Option<bool> {
        self.shared.run_check().await
    }

    pub fn state(&self) -> MonitorState {
        let mut state = self.shared.state.lock().clone();
        state.in_progress = self.shared.running.lock().is_some();
        state
    }
}

/// Run `check` every `interval`, each run bounded by `timeout`
pub fn create_health_check_interval(check: HealthCheckFn, interval: Duration, timeout: Duration) -> HealthMonitor {
    let shared = Arc::new(MonitorShared {
        check,
        timeout,
        next_run: AtomicU64::new(0),
        running: Mutex::new(None),
        state: Mutex::new(MonitorState::default()),
    });

    let ticker = shared.clone();
    let interval = IntervalHandle::spawn(interval, move || {
        let shared = ticker.clone();
        async move {
            shared.run_check().await;
        }
    });

    HealthMonitor { shared, interval }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn counting_check(delay: Duration, counter: Arc<AtomicUsize>) -> HealthCheckFn {
        Arc::new(move || {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(delay).await;
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_http_health_any_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let _v2 = server
            .mock("GET", "/api/v2/heartbeat")
            .with_status(404)
            .create_async()
            .await;
        let _v1 = server
            .mock("GET", "/api/v1/heartbeat")
            .with_status(200)
            .with_body(r#"{"nanosecond heartbeat": 1}"#)
            .create_async()
            .await;
        let _root = server.mock("GET", "/api/v1").with_status(410).create_async().await;

        let client = reqwest::Client::new();
        let health = check_health_via_http(&client, &server.url(), Duration::from_millis(500)).await;

        assert!(health.healthy);
        assert_eq!(health.endpoint.as_deref(), Some("/api/v1/heartbeat"));
    }

    #[tokio::test]
    async fn test_http_health_all_failing() {
        let mut server = mockito::Server::new_async().await;
        let _all = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let health = check_health_via_http(&client, &server.url(), Duration::from_millis(500)).await;
        assert!(!health.healthy);
        assert!(health.endpoint.is_none());
    }

    #[tokio::test]
    async fn test_server_available_retries_transient() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v2/heartbeat")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        assert!(!is_server_available(&client, &server.url(), Duration::from_millis(500), 2).await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_available_stops_on_client_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v2/heartbeat")
            .with_status(403)
            .expect(1)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        assert!(!is_server_available(&client, &server.url(), Duration::from_millis(500), 3).await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_available() {
        let mut server = mockito::Server::new_async().await;
        let _ok = server
            .mock("GET", "/api/v2/heartbeat")
            .with_status(200)
            .with_body(r#"{"nanosecond heartbeat": 1}"#)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        assert!(is_server_available(&client, &server.url(), Duration::from_millis(500), 0).await);
        assert!(!is_server_available(&client, "not a url", Duration::from_millis(500), 0).await);
    }

    #[tokio::test]
    async fn test_client_check() {
        let store = crate::vector_db::InMemoryStore::new();
        assert!(check_health_via_client(&store, Duration::from_millis(100)).await);
        store.set_reachable(false);
        assert!(!check_health_via_client(&store, Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_monitor_runs_periodically() {
        let counter = Arc::new(AtomicUsize::new(0));
        let monitor = create_health_check_interval(
            counting_check(Duration::ZERO, counter.clone()),
            Duration::from_millis(10),
            Duration::from_millis(100),
        );

        tokio::time::sleep(Duration::from_millis(55)).await;
        monitor.stop();

        assert!(counter.load(Ordering::SeqCst) >= 2);
        let state = monitor.state();
        assert_eq!(state.last_healthy, Some(true));
        assert!(state.checks >= 2);
    }

    #[tokio::test]
    async fn test_overlapping_checks_skipped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let monitor = create_health_check_interval(
            counting_check(Duration::from_millis(50), counter.clone()),
            Duration::from_secs(3600),
            Duration::from_millis(500),
        );

        let (first, second) = tokio::join!(monitor.force_check(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            monitor.force_check().await
        });

        assert_eq!(first, Some(true));
        assert_eq!(second, None);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stuck_check_is_reset() {
        let counter = Arc::new(AtomicUsize::new(0));
        let monitor = create_health_check_interval(
            counting_check(Duration::ZERO, counter.clone()),
            Duration::from_secs(3600),
            Duration::from_millis(10),
        );

        let long_ago = Instant::now().checked_sub(Duration::from_millis(100)).unwrap();
        *monitor.shared.running.lock() = Some((u64::MAX, long_ago));

        assert_eq!(monitor.force_check().await, Some(true));
        let state = monitor.state();
        assert_eq!(state.forced_resets, 1);
        assert!(!state.in_progress);
    }

    #[tokio::test]
    async fn test_timed_out_check_is_unhealthy() {
        let counter = Arc::new(AtomicUsize::new(0));
        let monitor = create_health_check_interval(
            counting_check(Duration::from_millis(200), counter),
            Duration::from_secs(3600),
            Duration::from_millis(20),
        );

        assert_eq!(monitor.force_check().await, Some(false));
    }
}
