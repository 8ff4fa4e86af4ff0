//! Job accounting and the inactivity watchdog.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::shutdown::Shutdown;

/// Watchdog tick interval when inactivity tracking is disabled.
const DEFAULT_TICK: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Inner {
    completed: u64,
    failed: u64,
    last_activity: Instant,
    started: Instant,
}

/// Mutex-protected counters of completed and failed jobs plus the last
/// activity timestamp. Exactly one of `job_completed` / `job_failed` fires
/// per job admitted into a worker.
#[derive(Debug)]
pub struct Stats {
    inner: RwLock<Inner>,
}

impl Stats {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            inner: RwLock::new(Inner {
                completed: 0,
                failed: 0,
                last_activity: now,
                started: now,
            }),
        }
    }

    /// Record activity without an outcome (a job was picked up).
    pub fn touch(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.last_activity = Instant::now();
        }
    }

    pub fn job_completed(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.completed += 1;
            inner.last_activity = Instant::now();
        }
    }

    pub fn job_failed(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.failed += 1;
            inner.last_activity = Instant::now();
        }
    }

    /// `(completed, failed)` so far.
    pub fn totals(&self) -> (u64, u64) {
        match self.inner.read() {
            Ok(inner) => (inner.completed, inner.failed),
            Err(_) => (0, 0),
        }
    }

    pub fn idle_for(&self) -> Duration {
        match self.inner.read() {
            Ok(inner) => inner.last_activity.elapsed(),
            Err(_) => Duration::ZERO,
        }
    }

    fn jobs_per_minute(&self) -> f64 {
        match self.inner.read() {
            Ok(inner) => {
                let minutes = inner.started.elapsed().as_secs_f64() / 60.0;
                if minutes <= 0.0 {
                    0.0
                } else {
                    (inner.completed + inner.failed) as f64 / minutes
                }
            }
            Err(_) => 0.0,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically log throughput and, when `inactivity` is set, cancel the
/// engine once nothing has happened for that long.
///
/// The tick interval is `min(1 minute, inactivity / 2)`.
pub async fn run_watchdog(stats: &Stats, shutdown: &Shutdown, inactivity: Option<Duration>) {
    let tick = match inactivity {
        Some(window) => DEFAULT_TICK.min(window / 2),
        None => DEFAULT_TICK,
    };

    let mut interval = tokio::time::interval(tick.max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }

        let (completed, failed) = stats.totals();
        tracing::info!(
            completed,
            failed,
            per_minute = format!("{:.1}", stats.jobs_per_minute()),
            "scraping throughput"
        );

        if let Some(window) = inactivity {
            let idle = stats.idle_for();
            if idle > window {
                tracing::info!(idle_secs = idle.as_secs(), "inactivity timeout, shutting down");
                shutdown.cancel(Error::InactivityTimeout);
                return;
            }
        }
    }
}
