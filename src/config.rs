//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `BELAY_SERVER_URL`: Workflow server base URL (required for the HTTP gateway)
//! - `BELAY_HEARTBEAT_INTERVAL_MS`: Run heartbeat interval (default: 90000)
//! - `BELAY_HEARTBEAT_TOLERANCE`: Consecutive heartbeat misses tolerated (default: 3)
//! - `BELAY_SYNC_INTERVAL_MS`: Status sync interval (default: 10000)
//! - `BELAY_SYNC_TIMEOUT_MS`: Per-sync-pull deadline (default: 30000)
//! - `BELAY_REQUEST_TIMEOUT_MS`: Per-request gateway timeout (default: 20000)
//! - `BELAY_DISPATCH_BATCH`: Max tasks queued per dispatch cycle (default: 64)
//! - `BELAY_MAX_CONCURRENTLY_RUNNING`: Global slot cap, 0 for unbounded (default: 10000)
//! - `BELAY_WORKFLOW_TIMEOUT_MS`: Wall-clock budget for the whole run (default: none)
//! - `BELAY_FAIL_FAST`: Stop dispatching after the first fatal task failure (default: false)
//! - `BELAY_FORCE_CLEANUP`: Resume even with forced kills still pending (default: false)
//! - `BELAY_MAX_SYNC_FAILURES`: Consecutive sync failures before giving up (default: 5)
//! - `BELAY_AMBIGUOUS_REFETCH_THRESHOLD`: Ambiguous cycles before a snapshot refetch (default: 3)
//! - `BELAY_SUBMIT_PARALLELISM`: Concurrent instance submissions (default: num_cpus * 2)

use std::{env, time::Duration};

use anyhow::{Context, Result};

/// Orchestrator configuration for one workflow run.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Workflow server base URL
    pub server_url: String,

    /// Interval between run heartbeats
    pub heartbeat_interval: Duration,

    /// Consecutive heartbeat misses tolerated before the run is unhealthy
    pub heartbeat_tolerance: u32,

    /// Interval between status sync cycles
    pub sync_interval: Duration,

    /// Deadline for a single sync pull
    pub sync_timeout: Duration,

    /// Timeout for individual gateway requests
    pub request_timeout: Duration,

    /// Maximum tasks queued per dispatch cycle
    pub dispatch_batch: usize,

    /// Global cap on tasks holding slots at once. None means unbounded.
    pub max_concurrently_running: Option<usize>,

    /// Wall-clock budget for the run. None means no deadline.
    pub workflow_timeout: Option<Duration>,

    /// Stop dispatching new work after the first fatal task failure
    pub fail_fast: bool,

    /// Resume a halted run even while forced kills are still pending
    pub force_cleanup: bool,

    /// Consecutive sync failures before the run gives up
    pub max_sync_failures: u32,

    /// Consecutive ambiguous sync cycles before a snapshot refetch
    pub ambiguous_refetch_threshold: u32,

    /// Concurrent submissions to the distributor
    pub submit_parallelism: usize,
}

impl SwarmConfig {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let server_url =
            env::var("BELAY_SERVER_URL").context("BELAY_SERVER_URL environment variable is required")?;

        let heartbeat_interval = duration_ms("BELAY_HEARTBEAT_INTERVAL_MS", 90_000);
        let heartbeat_tolerance = parsed("BELAY_HEARTBEAT_TOLERANCE", 3);
        let sync_interval = duration_ms("BELAY_SYNC_INTERVAL_MS", 10_000);
        let sync_timeout = duration_ms("BELAY_SYNC_TIMEOUT_MS", 30_000);
        let request_timeout = duration_ms("BELAY_REQUEST_TIMEOUT_MS", 20_000);
        let dispatch_batch = parsed("BELAY_DISPATCH_BATCH", 64);

        // 0 lifts the global cap entirely.
        let max_concurrently_running = match parsed("BELAY_MAX_CONCURRENTLY_RUNNING", 10_000usize) {
            0 => None,
            cap => Some(cap),
        };

        let workflow_timeout = env::var("BELAY_WORKFLOW_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis);

        let fail_fast = flag("BELAY_FAIL_FAST");
        let force_cleanup = flag("BELAY_FORCE_CLEANUP");
        let max_sync_failures = parsed("BELAY_MAX_SYNC_FAILURES", 5);
        let ambiguous_refetch_threshold = parsed("BELAY_AMBIGUOUS_REFETCH_THRESHOLD", 3);

        let submit_parallelism = env::var("BELAY_SUBMIT_PARALLELISM")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| num_cpus::get() * 2);

        Ok(Self {
            server_url,
            heartbeat_interval,
            heartbeat_tolerance,
            sync_interval,
            sync_timeout,
            request_timeout,
            dispatch_batch,
            max_concurrently_running,
            workflow_timeout,
            fail_fast,
            force_cleanup,
            max_sync_failures,
            ambiguous_refetch_threshold,
            submit_parallelism,
        })
    }

    /// Configuration with intervals short enough for tests, in-process
    /// unit tests and the integration suite alike.
    pub fn test_config() -> Self {
        Self {
            server_url: "http://127.0.0.1:0".to_string(),
            heartbeat_interval: Duration::from_millis(500),
            heartbeat_tolerance: 3,
            sync_interval: Duration::from_millis(50),
            sync_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            dispatch_batch: 64,
            max_concurrently_running: Some(10_000),
            workflow_timeout: None,
            fail_fast: false,
            force_cleanup: false,
            max_sync_failures: 5,
            ambiguous_refetch_threshold: 3,
            submit_parallelism: 4,
        }
    }
}

fn duration_ms(name: &str, default: u64) -> Duration {
    Duration::from_millis(parsed(name, default))
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn flag(name: &str) -> bool {
    env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}
