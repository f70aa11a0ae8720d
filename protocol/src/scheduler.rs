//! # Scheduler Daemon
//!
//! The only thing that puts messages on the air. It runs a two-phase loop:
//!
//! ```text
//!            ┌─────────────────────────────────────────────┐
//!            ▼                                             │
//!   ┌──── dequeue ────┐  top paid order   ┌── transmit ──┐ │
//!   │ duty cycle due? │ ────────────────▶ │ sleep size / │─┘
//!   │  → reclaim      │                   │ rate, then   │
//!   │ nothing paid?   │                   │ end          │
//!   │  → poll again   │                   └──────────────┘
//!   └─────────────────┘
//! ```
//!
//! The channel is a fixed-rate resource, so "transmitting" is modelled as
//! holding it for `message_size / transmit_rate` seconds. That sleep is
//! never cut short: a shutdown request is only honoured in the dequeue
//! phase.
//!
//! Sequence numbers are assigned here and nowhere else. [`SchedulerLock`]
//! makes that true across processes: a second daemon on the same data
//! directory refuses to start.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fs2::FileExt;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{QueueError, QueueResult};
use crate::order::Order;
use crate::queue::BroadcastQueue;

// ---------------------------------------------------------------------------
// SchedulerLock
// ---------------------------------------------------------------------------

/// Exclusive lock on a data directory, held for the life of the daemon.
///
/// Released on drop.
#[derive(Debug)]
pub struct SchedulerLock {
    file: File,
    path: PathBuf,
    pid: u32,
}

impl SchedulerLock {
    pub const LOCK_FILE: &'static str = "scheduler.lock";

    /// Take the lock without blocking.
    pub fn acquire(data_dir: &Path) -> QueueResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(Self::LOCK_FILE);

        // Not truncated before locking: the holder's PID must survive.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(QueueError::SchedulerLocked {
                pid: Self::read_pid(&path),
                path: path.display().to_string(),
            });
        }

        let pid = std::process::id();
        file.set_len(0)?;
        writeln!(file, "{pid}")?;
        file.sync_all()?;

        Ok(Self { file, path, pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_pid(path: &Path) -> Option<u32> {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }
}

impl Drop for SchedulerLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = std::fs::remove_file(&self.path);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Time a message of `message_size` bytes holds the channel.
pub fn transmission_time(message_size: u64, transmit_rate: u64) -> Duration {
    Duration::from_secs_f64(message_size as f64 / transmit_rate.max(1) as f64)
}

pub struct Scheduler {
    queue: Arc<BroadcastQueue>,
    lock: SchedulerLock,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Claim `data_dir` for this daemon.
    pub fn new(
        queue: Arc<BroadcastQueue>,
        config: SchedulerConfig,
        data_dir: &Path,
    ) -> QueueResult<Self> {
        let lock = SchedulerLock::acquire(data_dir)?;
        info!(pid = lock.pid(), path = %lock.path().display(), "scheduler lock acquired");
        Ok(Self {
            queue,
            lock,
            config,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run until `shutdown` flips to `true`.
    ///
    /// Startup recovery runs first; a storage failure there is fatal.
    /// Everything after it is logged and retried.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> QueueResult<()> {
        let recovered = self.queue.recover_stuck(&self.lock)?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered interrupted transmissions");
        }

        info!(
            transmit_rate = self.config.transmit_rate,
            duty_cycle_secs = self.config.duty_cycle.as_secs(),
            "scheduler started"
        );

        let mut next_cleanup = Instant::now();
        loop {
            if *shutdown.borrow() {
                break;
            }

            if Instant::now() >= next_cleanup {
                self.cleanup();
                next_cleanup = Instant::now() + self.config.duty_cycle;
            }

            let next = match self.queue.next_sendable() {
                Ok(next) => next,
                Err(e) => {
                    error!(error = %e, "failed to poll for sendable orders");
                    None
                }
            };

            match next {
                Some(order) => self.transmit(order).await,
                None => {
                    tokio::select! {
                        _ = sleep(self.config.poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("scheduler stopped");
        Ok(())
    }

    fn cleanup(&self) {
        match self.queue.reclaim(Utc::now()) {
            Ok(report) if !report.is_empty() => info!(
                "expired {} invoices, {} orders, removed {} payloads",
                report.expired_invoices, report.expired_orders, report.removed_payloads
            ),
            Ok(_) => {}
            Err(e) => error!(error = %e, "cleanup pass failed"),
        }
    }

    /// Hold the channel for the order's transmission time. Not cancellable.
    async fn transmit(&self, order: Order) {
        let order = match self.queue.begin_transmission(&self.lock, &order.uuid) {
            Ok(order) => order,
            Err(e) => {
                // Typically cancelled between poll and dequeue.
                warn!(uuid = %order.uuid, error = %e, "could not start transmission");
                return;
            }
        };

        let duration = transmission_time(order.message_size, self.config.transmit_rate);
        info!(
            uuid = %order.uuid,
            tx_seq_num = order.tx_seq_num,
            size = order.message_size,
            duration_ms = duration.as_millis() as u64,
            "transmission started"
        );
        sleep(duration).await;

        match self.queue.end_transmission(&self.lock, &order.uuid) {
            Ok(order) => info!(uuid = %order.uuid, tx_seq_num = order.tx_seq_num, "transmission ended"),
            Err(e) => error!(uuid = %order.uuid, error = %e, "failed to end transmission"),
        }
    }
}
