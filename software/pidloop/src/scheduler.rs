//! Periodic execution of controller compute steps.
//!
//! A controller registers one standing periodic activity at construction.
//! [`ThreadScheduler`] runs each activity on its own thread;
//! [`ManualScheduler`] runs them only when stepped, for simulation and tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Sender, bounded, select, tick};
use tracing::{debug, info, warn};

use crate::PidError;

/// Work done once per period.
pub type Tick = Box<dyn FnMut() + Send>;

/// Something that can run a closure at a fixed period.
pub trait Scheduler: Send + Sync {
    /// Start calling `tick` every `period` until the returned task is cancelled.
    fn schedule(
        &self,
        name: &str,
        period: Duration,
        tick: Tick,
    ) -> Result<Box<dyn ScheduledTask>, PidError>;
}

/// Handle to a running periodic activity.
pub trait ScheduledTask: Send {
    /// Stop future ticks. A tick already in progress runs to completion.
    /// Calling this more than once has no further effect.
    fn cancel(&mut self);
}

/// Runs each periodic activity on a dedicated OS thread.
#[derive(Debug, Default, Clone)]
pub struct ThreadScheduler {
    core: Option<usize>,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin scheduled threads to a CPU core and raise their priority,
    /// where the platform allows it.
    #[cfg(feature = "affinity")]
    pub fn with_core(core: usize) -> Self {
        Self { core: Some(core) }
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(
        &self,
        name: &str,
        period: Duration,
        mut tick_fn: Tick,
    ) -> Result<Box<dyn ScheduledTask>, PidError> {
        if period.is_zero() {
            return Err(PidError::config("Scheduler period must be > 0"));
        }

        // The worker exits when the stop sender is dropped
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let core = self.core;
        let thread_name = name.to_owned();

        let join = Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                set_affinity(core);
                let ticker = tick(period);
                debug!("Periodic task `{thread_name}` started with period {period:?}");
                loop {
                    let stopped = select! {
                        recv(stop_rx) -> _ => true,
                        recv(ticker) -> _ => {
                            tick_fn();
                            false
                        }
                    };
                    if stopped {
                        break;
                    }
                }
                debug!("Periodic task `{thread_name}` exited");
            })
            .map_err(|e| PidError::Scheduler {
                msg: format!("Failed to spawn periodic task thread `{name}`: {e}"),
            })?;

        info!("Scheduled periodic task `{name}` every {period:?}");
        Ok(Box::new(ThreadTask {
            stop: Some(stop_tx),
            join: Some(join),
        }))
    }
}

#[cfg(feature = "affinity")]
fn set_affinity(core: Option<usize>) {
    // This may not be available on every platform, so it should not break if not available
    let Some(core) = core else { return };
    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    if let Some(id) = core_ids.into_iter().find(|c| c.id == core) {
        core_affinity::set_for_current(id);
    }
    let _ = thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max);
}

#[cfg(not(feature = "affinity"))]
fn set_affinity(_core: Option<usize>) {}

/// Thread handle with stop signal for a periodic task.
struct ThreadTask {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl ScheduledTask for ThreadTask {
    fn cancel(&mut self) {
        // Disconnect the stop channel to wake the worker
        self.stop.take();

        let Some(join) = self.join.take() else {
            return;
        };

        // A task cancelled from its own tick cannot wait for itself
        if join.thread().id() == std::thread::current().id() {
            return;
        }

        if join.join().is_err() {
            warn!("Periodic task thread panicked");
        }
    }
}

impl Drop for ThreadTask {
    /// Make sure to stop the thread when we exit to avoid leaking resources.
    fn drop(&mut self) {
        self.cancel();
    }
}

type TaskSlot = Arc<Mutex<Tick>>;

/// Scheduler that only ticks when [`ManualScheduler::step`] is called.
///
/// Cloning shares the same set of tasks.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    tasks: Arc<Mutex<BTreeMap<u64, (String, TaskSlot)>>>,
    next_id: Arc<AtomicU64>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every live task once, in the order they were scheduled.
    pub fn step(&self) {
        // Snapshot so that ticks may cancel tasks without deadlocking
        let slots: Vec<TaskSlot> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|(_, slot)| slot.clone())
            .collect();

        for slot in slots {
            let mut tick_fn = slot.lock().unwrap_or_else(PoisonError::into_inner);
            tick_fn();
        }
    }

    /// Run every live task `n` times.
    pub fn step_n(&self, n: usize) {
        for _ in 0..n {
            self.step();
        }
    }

    /// Number of tasks that have not been cancelled.
    pub fn task_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Names of tasks that have not been cancelled.
    pub fn task_names(&self) -> Vec<String> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(
        &self,
        name: &str,
        _period: Duration,
        tick_fn: Tick,
    ) -> Result<Box<dyn ScheduledTask>, PidError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (name.to_owned(), Arc::new(Mutex::new(tick_fn))));

        Ok(Box::new(ManualTask {
            id,
            tasks: self.tasks.clone(),
        }))
    }
}

struct ManualTask {
    id: u64,
    tasks: Arc<Mutex<BTreeMap<u64, (String, TaskSlot)>>>,
}

impl ScheduledTask for ManualTask {
    fn cancel(&mut self) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
