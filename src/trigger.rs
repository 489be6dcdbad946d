// src/trigger.rs
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Trailing-edge debounce with an in-flight latch for re-aggregation.
///
/// Only the last trigger inside the quiet period runs, and a trigger that
/// fires while a run is in flight is dropped.
#[derive(Clone)]
pub struct AggregationTrigger {
    debounce: Duration,
    generation: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

struct LatchGuard(Arc<AtomicBool>);

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl AggregationTrigger {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            generation: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Resolves to `Some` with the job's output when this trigger was the one
    /// that ran, `None` when it was superseded or collapsed.
    pub fn trigger<F, R>(&self, job: F) -> JoinHandle<Option<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation.clone();
        let running = self.running.clone();
        let debounce = self.debounce;

        tokio::spawn(async move {
            sleep(debounce).await;
            if generation.load(Ordering::SeqCst) != ticket {
                debug!("Aggregation trigger {} superseded", ticket);
                return None;
            }
            if running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!("Aggregation already running, trigger {} collapsed", ticket);
                return None;
            }
            let _latch = LatchGuard(running);
            debug!("Running aggregation for trigger {}", ticket);
            // The job reads local storage synchronously.
            match tokio::task::spawn_blocking(job).await {
                Ok(output) => Some(output),
                Err(e) => {
                    warn!("Aggregation for trigger {} did not complete: {}", ticket, e);
                    None
                }
            }
        })
    }
}
