//! Background checkpointer.
//!
//! Runs on its own thread and takes a fold-over checkpoint every cadence
//! tick, but only when mutations arrived since the last checkpoint. A
//! fold-over checkpoint is cheap (two syncs and a small JSON file), which
//! bounds how much of the log a crash leaves to be replayed past the last
//! checkpoint.
//!
//! The thread holds only a `Weak` reference to its target; once the store is
//! gone the loop exits on its own.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{HybridError, HybridResult};

/// What the checkpointer drives.
pub(crate) trait CheckpointTarget: Send + Sync + 'static {
    fn pending_mutations(&self) -> u64;
    fn fold_over(&self) -> HybridResult<()>;
}

/// Counters kept by the background thread.
#[derive(Debug, Default)]
pub struct CheckpointerStats {
    checkpoints: AtomicU64,
    failures: AtomicU64,
    idle_ticks: AtomicU64,
}

impl CheckpointerStats {
    pub fn checkpoints(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Ticks skipped because nothing changed
    pub fn idle_ticks(&self) -> u64 {
        self.idle_ticks.load(Ordering::Relaxed)
    }
}

/// Handle to a running checkpointer thread.
/// Dropping this handle signals the thread to stop and joins it.
pub struct CheckpointerHandle {
    shutdown: Arc<AtomicBool>,
    stats: Arc<CheckpointerStats>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CheckpointerHandle {
    /// Request shutdown and wait for the thread to finish. A tick in progress
    /// completes first.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    pub fn stats(&self) -> &CheckpointerStats {
        &self.stats
    }
}

impl Drop for CheckpointerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the checkpointer thread.
pub(crate) fn start_checkpointer<T: CheckpointTarget>(target: Weak<T>, cadence: Duration) -> HybridResult<CheckpointerHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let stats = Arc::new(CheckpointerStats::default());

    let thread = {
        let shutdown = Arc::clone(&shutdown);
        let stats = Arc::clone(&stats);
        thread::Builder::new()
            .name("hybridlog-checkpointer".to_string())
            .spawn(move || checkpointer_loop(target, cadence, shutdown, stats))
            .map_err(|e| HybridError::Checkpoint { reason: format!("Failed to spawn checkpointer thread: {}", e) })?
    };

    tracing::debug!(cadence_ms = cadence.as_millis() as u64, "checkpointer started");
    Ok(CheckpointerHandle { shutdown, stats, thread: Some(thread) })
}

fn checkpointer_loop<T: CheckpointTarget>(
    target: Weak<T>,
    cadence: Duration,
    shutdown: Arc<AtomicBool>,
    stats: Arc<CheckpointerStats>,
) {
    let slice = cadence.min(Duration::from_millis(100));
    loop {
        // Sleep for the cadence, checking shutdown periodically
        let wake_time = Instant::now() + cadence;
        while Instant::now() < wake_time {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(slice);
        }
        if shutdown.load(Ordering::Acquire) {
            return;
        }

        let Some(target) = target.upgrade() else {
            return;
        };
        tick(&*target, &stats);
    }
}

/// One cycle: checkpoint if anything changed since the last one.
fn tick<T: CheckpointTarget + ?Sized>(target: &T, stats: &CheckpointerStats) {
    let pending = target.pending_mutations();
    if pending == 0 {
        stats.idle_ticks.fetch_add(1, Ordering::Relaxed);
        return;
    }

    match target.fold_over() {
        Ok(()) => {
            stats.checkpoints.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(pending, "background checkpoint taken");
        }
        Err(e) => {
            stats.failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, "background checkpoint failed");
        }
    }
}
