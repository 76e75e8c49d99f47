//! Background schedulers owned by modules.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// A source of background work that can be stopped.
pub trait Scheduler: Send + Sync {
    /// Scheduler name, for logs.
    fn name(&self) -> &str;

    /// Stop all work. Must be idempotent.
    fn close(&self);

    /// Whether [`close`](Scheduler::close) has run.
    fn is_closed(&self) -> bool;
}

/// Schedulers grouped by owning module.
#[derive(Default)]
pub struct SchedulerRegistry {
    schedulers: DashMap<String, Vec<Arc<dyn Scheduler>>>,
}

impl SchedulerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a scheduler to `owner`.
    pub fn attach(&self, owner: &str, scheduler: Arc<dyn Scheduler>) {
        self.schedulers
            .entry(owner.to_string())
            .or_default()
            .push(scheduler);
    }

    /// Close and forget every scheduler of `owner`. Returns the number closed.
    pub fn close_all(&self, owner: &str) -> usize {
        let Some((_, schedulers)) = self.schedulers.remove(owner) else {
            return 0;
        };
        for scheduler in &schedulers {
            tracing::debug!("Closing scheduler {} of {}", scheduler.name(), owner);
            scheduler.close();
        }
        schedulers.len()
    }

    /// Number of schedulers attached to `owner`.
    pub fn count(&self, owner: &str) -> usize {
        self.schedulers.get(owner).map(|s| s.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for SchedulerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerRegistry")
            .field("owners", &self.schedulers.len())
            .finish()
    }
}

/// Runs a task periodically on a tokio runtime until closed.
pub struct IntervalScheduler {
    name: String,
    closed: Arc<AtomicBool>,
    runs: Arc<AtomicU64>,
    abort: Mutex<Option<AbortHandle>>,
}

impl IntervalScheduler {
    /// Start running `task` every `period` on `handle`.
    ///
    /// The first run happens immediately.
    pub fn spawn<F>(handle: &Handle, name: impl Into<String>, period: Duration, task: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let closed = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicU64::new(0));

        let join = {
            let closed = closed.clone();
            let runs = runs.clone();
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    if closed.load(Ordering::Acquire) {
                        break;
                    }
                    task();
                    runs.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        Arc::new(Self {
            name: name.into(),
            closed,
            runs,
            abort: Mutex::new(Some(join.abort_handle())),
        })
    }

    /// How many times the task has run.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }
}

impl Scheduler for IntervalScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(abort) = self.abort.lock().take() {
            abort.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for IntervalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalScheduler")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .field("runs", &self.runs())
            .finish()
    }
}
