//! Deferred execution of blur jobs

use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::warn;

use crate::core::types::ItemId;

/// Callback fired once for an item
pub type ScheduledTask = Box<dyn FnOnce(ItemId) + Send + 'static>;

/// Fires a callback at or after a delay
pub trait Scheduler: Send + Sync {
    fn schedule_once(&self, delay: Duration, item: ItemId, task: ScheduledTask);
}

/// Runs tasks on a tokio runtime, blocking work on the blocking pool
#[derive(Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler bound to the runtime of the calling task
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, item: ItemId, task: ScheduledTask) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tokio::task::spawn_blocking(move || task(item)).await {
                warn!("Scheduled blur task for item {} did not finish: {}", item, e);
            }
        });
    }
}

struct PendingTask {
    delay: Duration,
    item: ItemId,
    task: ScheduledTask,
}

/// Collects tasks until [`ManualScheduler::run_pending`] is called
#[derive(Default)]
pub struct ManualScheduler {
    pending: Mutex<Vec<PendingTask>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Items with a pending task, in scheduling order
    pub fn pending_items(&self) -> Vec<ItemId> {
        self.pending.lock().iter().map(|p| p.item).collect()
    }

    /// Largest delay requested so far
    pub fn max_delay(&self) -> Option<Duration> {
        self.pending.lock().iter().map(|p| p.delay).max()
    }

    /// Run everything queued so far; tasks scheduled meanwhile wait for the next call
    pub fn run_pending(&self) -> usize {
        let drained: Vec<PendingTask> = std::mem::take(&mut *self.pending.lock());
        let count = drained.len();
        for pending in drained {
            (pending.task)(pending.item);
        }
        count
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, delay: Duration, item: ItemId, task: ScheduledTask) {
        self.pending.lock().push(PendingTask { delay, item, task });
    }
}
