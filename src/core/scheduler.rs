// Bounded fan-out of stage units (tiles or strata)

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};

/// Admits stage units for execution, at most `max_parallelism` at a time.
///
/// Admission is FIFO over the pending list (the semaphore is fair). After the
/// first unit failure nothing new is admitted; units already running are
/// allowed to finish.
#[derive(Debug)]
pub struct Scheduler {
    max_parallelism: Option<usize>,
    tile_threads_hint: usize,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl Scheduler {
    pub fn new(max_parallelism: Option<usize>, tile_threads_hint: usize) -> Self {
        Self {
            max_parallelism,
            tile_threads_hint: tile_threads_hint.max(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Thread count handed to multi-threaded steps of one unit.
    pub fn unit_threads(&self) -> Option<usize> {
        Some(self.tile_threads_hint)
    }

    /// Units currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of units ever observed running together.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Run `work` for every unit and return the results in input order.
    ///
    /// The first failure (in input order among the units that ran) is
    /// returned once every admitted unit has completed.
    pub async fn run_all<U, T, F, Fut>(&self, label: &str, units: Vec<U>, work: F) -> PipelineResult<Vec<T>>
    where
        U: Send + 'static,
        T: Send + 'static,
        F: Fn(U) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PipelineResult<T>> + Send + 'static,
    {
        let permits = self
            .max_parallelism
            .unwrap_or(Semaphore::MAX_PERMITS)
            .clamp(1, Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(Semaphore::new(permits));
        let failed = Arc::new(AtomicBool::new(false));
        let work = Arc::new(work);

        let total = units.len();
        let mut handles = Vec::with_capacity(total);

        for unit in units {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Join(e.to_string()))?;

            if failed.load(Ordering::SeqCst) {
                warn!(
                    "{}: not dispatching {} remaining unit(s) after a failure",
                    label,
                    total - handles.len()
                );
                break;
            }

            let work = work.clone();
            let failed = failed.clone();
            let in_flight = self.in_flight.clone();
            let peak = self.peak_in_flight.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let mut guard = UnitGuard {
                    in_flight,
                    failed,
                    succeeded: false,
                };

                let result = work(unit).await;
                guard.succeeded = result.is_ok();
                result
            }));
        }

        debug!("{}: dispatched {}/{} unit(s)", label, handles.len(), total);

        let mut results = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(value)) => results.push(value),
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    first_error.get_or_insert(PipelineError::Join(join_err.to_string()));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }
}

/// Settles the counters when a unit ends. A unit that panics never reports
/// success, so it stops admission like an error does.
struct UnitGuard {
    in_flight: Arc<AtomicUsize>,
    failed: Arc<AtomicBool>,
    succeeded: bool,
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !self.succeeded {
            self.failed.store(true, Ordering::SeqCst);
        }
    }
}
