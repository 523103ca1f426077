//! Cycle scheduler.
//!
//! Runs one controller cycle at a time, on a fixed interval or aligned to bar
//! boundaries. A failed cycle is logged and followed by a back-off sleep;
//! it never ends the loop. Shutdown is checked between cycles and during
//! sleeps, so an in-flight cycle always finishes.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// A unit of work driven by the scheduler.
#[async_trait]
pub trait Cycle: Send {
    fn name(&self) -> &str;

    async fn tick(&mut self) -> Result<()>;
}

/// When cycles run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Sleep this long between the end of one cycle and the start of the next.
    FixedInterval(Duration),
    /// Wake just after each `period` boundary (UTC epoch aligned), plus `settle`.
    BoundaryAligned { period: Duration, settle: Duration },
}

/// Cooperative stop flag shared with the signal handler.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Time from `now_ms` until the next multiple of `period_ms`.
///
/// Exactly on a boundary waits a full period.
pub fn duration_until_next_boundary(now_ms: i64, period_ms: i64) -> Duration {
    if period_ms <= 0 {
        return Duration::ZERO;
    }
    let elapsed = now_ms.rem_euclid(period_ms);
    Duration::from_millis((period_ms - elapsed) as u64)
}

pub struct Scheduler {
    cadence: Cadence,
    error_backoff: Duration,
    shutdown: ShutdownFlag,
}

impl Scheduler {
    pub fn new(cadence: Cadence, error_backoff: Duration, shutdown: ShutdownFlag) -> Self {
        Self {
            cadence,
            error_backoff,
            shutdown,
        }
    }

    /// Drive `cycle` until shutdown. Returns the number of cycles run.
    pub async fn run<C: Cycle + ?Sized>(&self, cycle: &mut C) -> u64 {
        let mut count = 0u64;
        let mut retry_pending = false;

        info!(cycle = cycle.name(), cadence = ?self.cadence, "🚀 Starting cycle loop");

        while !self.shutdown.is_set() {
            if let Cadence::BoundaryAligned { period, settle } = self.cadence {
                // A failed cycle retries after its back-off instead of waiting a full period.
                if !retry_pending {
                    let now = chrono::Utc::now().timestamp_millis();
                    let wait = duration_until_next_boundary(now, period.as_millis() as i64) + settle;
                    debug!(cycle = cycle.name(), wait_ms = wait.as_millis() as u64, "Waiting for boundary");
                    if !self.sleep(wait).await {
                        break;
                    }
                }
            }

            count += 1;
            match cycle.tick().await {
                Ok(()) => {
                    retry_pending = false;
                    debug!(cycle = cycle.name(), count, "Cycle finished");
                    if let Cadence::FixedInterval(interval) = self.cadence {
                        if !self.sleep(interval).await {
                            break;
                        }
                    }
                }
                Err(e) => {
                    retry_pending = true;
                    let message = format!("{:#}", e);
                    error!(
                        cycle = cycle.name(),
                        count,
                        error = %message,
                        backoff_secs = self.error_backoff.as_secs(),
                        "❌ Cycle failed, backing off"
                    );
                    if !self.sleep(self.error_backoff).await {
                        break;
                    }
                }
            }
        }

        info!(cycle = cycle.name(), count, "🛑 Cycle loop stopped");
        count
    }

    /// Sleep in short slices so shutdown is noticed. Returns false on shutdown.
    async fn sleep(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_secs(1);
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.shutdown.is_set() {
                return false;
            }
            let step = remaining.min(SLICE);
            tokio::time::sleep(step).await;
            remaining -= step;
        }
        !self.shutdown.is_set()
    }
}

/// Set `flag` on Ctrl-C (and SIGTERM on unix).
pub fn spawn_signal_listener(flag: ShutdownFlag) {
    let ctrl_c_flag = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Shutdown signal received");
            ctrl_c_flag.trigger();
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
                info!("🛑 SIGTERM received");
                flag.trigger();
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    });
}
