//! Run liveness reporting on a timer of its own.
//!
//! The heartbeat task runs independently of the sync loop so a wedged or
//! slow sync cycle cannot silently let the server's liveness record lapse.
//! Delivery failures are tolerated up to a bound; past it the monitor
//! latches unhealthy and the orchestrator winds the run down.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::gateway::{HeartbeatReport, ServerGateway};
use crate::status::RunStatus;
use crate::workflow::WorkflowRunId;

/// Shared view between the orchestrator (writes run progress, reads health)
/// and the heartbeat task (reads progress, writes health).
#[derive(Clone)]
pub struct HeartbeatMonitor {
    run_status: Arc<Mutex<RunStatus>>,
    tasks_in_flight: Arc<AtomicUsize>,
    misses: Arc<AtomicU32>,
    healthy: Arc<AtomicBool>,
    tolerance: u32,
}

impl HeartbeatMonitor {
    pub fn new(tolerance: u32) -> Self {
        Self {
            run_status: Arc::new(Mutex::new(RunStatus::Initializing)),
            tasks_in_flight: Arc::new(AtomicUsize::new(0)),
            misses: Arc::new(AtomicU32::new(0)),
            healthy: Arc::new(AtomicBool::new(true)),
            tolerance,
        }
    }

    pub fn set_run_status(&self, status: RunStatus) {
        *self.run_status.lock().expect("heartbeat monitor poisoned") = status;
    }

    pub fn set_tasks_in_flight(&self, count: usize) {
        self.tasks_in_flight.store(count, Ordering::SeqCst);
    }

    /// Snapshot of what the next beat should carry.
    pub fn report(&self) -> HeartbeatReport {
        HeartbeatReport {
            recorded_at: Utc::now(),
            run_status: *self.run_status.lock().expect("heartbeat monitor poisoned"),
            tasks_in_flight: self.tasks_in_flight.load(Ordering::SeqCst),
        }
    }

    pub fn note_success(&self) {
        self.misses.store(0, Ordering::SeqCst);
    }

    /// Count a failed delivery. Once consecutive misses exceed the
    /// tolerance the monitor stays unhealthy even if later beats land.
    pub fn note_miss(&self) -> u32 {
        let misses = self.misses.fetch_add(1, Ordering::SeqCst) + 1;
        if misses > self.tolerance {
            self.healthy.store(false, Ordering::SeqCst);
        }
        misses
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn misses(&self) -> u32 {
        self.misses.load(Ordering::SeqCst)
    }
}

pub fn spawn_heartbeat(
    gateway: Arc<dyn ServerGateway>,
    run_id: WorkflowRunId,
    monitor: HeartbeatMonitor,
    interval: Duration,
    request_timeout: Duration,
    stop: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if stop.load(Ordering::SeqCst) {
                info!("heartbeat stop flag set");
                break;
            }
            tokio::select! {
                _ = stop_notify.notified() => {
                    info!("heartbeat stop notified");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            };
            let report = monitor.report();
            debug!(in_flight = report.tasks_in_flight, "heartbeat tick");
            match tokio::time::timeout(request_timeout, gateway.heartbeat(run_id, &report)).await {
                Ok(Ok(())) => monitor.note_success(),
                Ok(Err(err)) => {
                    let misses = monitor.note_miss();
                    metrics::counter!("belay_heartbeat_misses_total").increment(1);
                    warn!(error = %err, misses, "heartbeat delivery failed");
                }
                Err(_) => {
                    let misses = monitor.note_miss();
                    metrics::counter!("belay_heartbeat_misses_total").increment(1);
                    warn!(misses, "heartbeat timed out");
                }
            }
        }
        info!("heartbeat exiting");
    })
}

// ============================================================================
// Tests
// ============================================================================
