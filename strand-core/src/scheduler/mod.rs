//! Cooperative Task Scheduler
//!
//! Tasks run as ordinary futures, but yield only at the suspension points a
//! [`TaskHandle`] provides. Yielding parks the task until the next
//! scheduler "round": the scheduler asks the caller-supplied [`EventLoop`]
//! to invoke a callback at its next opportunity, the callback stamps the
//! round start time and bumps a round counter, and every parked task
//! resumes.
//!
//! Each executed task owns a child [`ValuesContainer`] (named `task-N` or
//! caller-supplied) holding its progress, info, and pause cells; when the
//! task settles, the scheduler removes it from the live list and disposes
//! that container, so no per-task reactive state leaks.

mod barrier;
pub(crate) mod progress;
pub(crate) mod task;

pub use barrier::Barrier;
pub use progress::ProgressTracker;
pub use task::{TaskController, TaskHandle, TaskStatus, DEFAULT_YIELD_MS};

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::error::TaskError;
use crate::reactive::{Value, ValueBuilder, ValuesContainer};
use crate::scheduler::task::TaskShared;

/// Caller-supplied scheduling primitive: invoked once per round, must
/// eventually run the callback.
pub type EventLoop = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

/// Monotonic clock in milliseconds.
pub type Timer = Arc<dyn Fn() -> f64 + Send + Sync>;

/// An [`EventLoop`] driven by the tokio runtime, one round per millisecond.
pub fn tokio_event_loop() -> EventLoop {
    Arc::new(|tick: Box<dyn FnOnce() + Send>| {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            tick();
        });
    })
}

/// A [`Timer`] counting milliseconds from its creation.
pub fn instant_timer() -> Timer {
    let start = Instant::now();
    Arc::new(move || start.elapsed().as_secs_f64() * 1000.0)
}

struct SchedulerInner {
    event_loop: EventLoop,
    timer: Timer,
    container: ValuesContainer,
    ticks: watch::Sender<u64>,
    tick_start: Arc<Mutex<f64>>,
    next_task: AtomicU64,
    running: Mutex<Vec<String>>,
}

/// Drives rounds and executes tasks. Clones share state; the round loop
/// stops once the last handle is dropped.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(event_loop: EventLoop, timer: Timer, container: ValuesContainer) -> Self {
        let (ticks, _) = watch::channel(0u64);
        let inner = Arc::new(SchedulerInner {
            event_loop,
            timer,
            container,
            ticks,
            tick_start: Arc::new(Mutex::new(0.0)),
            next_task: AtomicU64::new(0),
            running: Mutex::new(Vec::new()),
        });
        SchedulerInner::arm_round(Arc::downgrade(&inner));
        Self { inner }
    }

    /// Run a task under a generated `task-N` name.
    pub fn exec<T, F, Fut>(&self, task: F) -> TaskController<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(TaskHandle) -> Fut,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let n = self.inner.next_task.fetch_add(1, Ordering::Relaxed);
        self.exec_named(format!("task-{n}"), task)
    }

    /// Run a task under an explicit name. The name doubles as the task's
    /// child container name, so reusing a live task's name disposes the
    /// previous task's reactive state.
    pub fn exec_named<T, F, Fut>(&self, name: impl Into<String>, task: F) -> TaskController<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(TaskHandle) -> Fut,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let name = name.into();
        debug!(task = name, "exec");
        let child = self.inner.container.child(&name);
        let progress = ProgressTracker::new(&child);
        let paused = child.value_with(ValueBuilder::new("paused", false).eq_partial());
        let shared = Arc::new(TaskShared::new(
            name.clone(),
            progress,
            self.inner.ticks.subscribe(),
            Arc::clone(&self.inner.tick_start),
            Arc::clone(&self.inner.timer),
            paused,
        ));
        // The status cell deliberately lives outside the task's container:
        // observers may keep reading it after the container is disposed.
        let status = Value::new(format!("{name}-status"), TaskStatus::<T>::Running);
        let (done_tx, done_rx) = watch::channel(None);

        self.inner.running.lock().push(name.clone());
        let fut = task(TaskHandle::root(Arc::clone(&shared)));
        let inner = Arc::clone(&self.inner);
        let status_writer = status.clone();
        tokio::spawn(async move {
            let result = fut.await;
            debug!(task = name, ok = result.is_ok(), "task settled");
            status_writer.set(TaskStatus::Done(result.clone()));
            let _ = done_tx.send(Some(result));
            inner.running.lock().retain(|t| t != &name);
            child.dispose_deferred();
        });
        TaskController::new(shared, status, done_rx)
    }

    /// Names of tasks currently running.
    pub fn running(&self) -> Vec<String> {
        self.inner.running.lock().clone()
    }

    /// The container this scheduler creates task scopes under.
    pub fn container(&self) -> &ValuesContainer {
        &self.inner.container
    }
}

impl SchedulerInner {
    /// Ask the event loop for the next round. Holding only a weak
    /// reference lets the loop wind down when the scheduler is dropped.
    fn arm_round(weak: Weak<SchedulerInner>) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let event_loop = Arc::clone(&inner.event_loop);
        drop(inner);
        event_loop(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.run_round();
                SchedulerInner::arm_round(Arc::downgrade(&inner));
            }
        }));
    }

    fn run_round(&self) {
        *self.tick_start.lock() = (self.timer)();
        self.ticks.send_modify(|round| *round += 1);
    }
}
