//! Task Handles and Controllers
//!
//! A running task body holds a [`TaskHandle`]: the capability to report
//! progress and to yield control at defined suspension points. The caller
//! that `exec`'d the task holds the matching [`TaskController`]: pause,
//! stop, and the settled outcome.
//!
//! Suspension points are the only places a task yields. Every one of them
//! re-checks the stop flag immediately after the pause barrier resolves, so
//! a task stopped while paused terminates with [`TaskError::Interrupted`]
//! instead of resuming.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

use crate::error::TaskError;
use crate::reactive::{SharedSource, Source, Value};
use crate::scheduler::barrier::Barrier;
use crate::scheduler::progress::ProgressTracker;
use crate::scheduler::Timer;

/// Observable lifecycle of one task.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskStatus<T> {
    Running,
    Done(Result<T, TaskError>),
}

impl<T> TaskStatus<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, TaskStatus::Done(_))
    }
}

/// State shared by a task's root handle, its forks, and its controller.
pub(crate) struct TaskShared {
    name: String,
    stopped: AtomicBool,
    barrier: Barrier,
    progress: ProgressTracker,
    ticks: watch::Receiver<u64>,
    // Last round number any suspension point of this task observed,
    // starting from the round current when the task was registered. Rounds
    // fired before the task's first poll still count.
    seen_round: Mutex<u64>,
    tick_start: Arc<Mutex<f64>>,
    timer: Timer,
    paused: Value<bool>,
}

impl TaskShared {
    pub(crate) fn new(
        name: String,
        progress: ProgressTracker,
        ticks: watch::Receiver<u64>,
        tick_start: Arc<Mutex<f64>>,
        timer: Timer,
        paused: Value<bool>,
    ) -> Self {
        let seen_round = Mutex::new(*ticks.borrow());
        Self {
            name,
            stopped: AtomicBool::new(false),
            barrier: Barrier::new(),
            progress,
            ticks,
            seen_round,
            tick_start,
            timer,
            paused,
        }
    }
}

/// Default elapsed-time threshold for `wait_maybe` and batch yielding.
pub const DEFAULT_YIELD_MS: f64 = 10.0;

/// The capability object a task body uses to report progress and yield.
/// Forks share all state except their progress weight.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
    weight: f64,
}

impl TaskHandle {
    pub(crate) fn root(shared: Arc<TaskShared>) -> Self {
        Self {
            shared,
            weight: 1.0,
        }
    }

    /// A handle not driven by any scheduler: suspension points never park,
    /// pause and stop are inert, progress is tracked but unobserved. Lets
    /// task bodies and work pipelines run standalone.
    pub fn detached() -> TaskHandle {
        let container = crate::reactive::ValuesContainer::root("detached-task");
        let progress = ProgressTracker::new(&container);
        let paused = container.value("paused", false);
        // Dropping the sender closes the tick channel, so `next_tick`
        // resolves immediately.
        let (_tx, ticks) = watch::channel(0u64);
        Self::root(Arc::new(TaskShared::new(
            "detached".to_string(),
            progress,
            ticks,
            Arc::new(Mutex::new(0.0)),
            Arc::new(|| 0.0),
            paused,
        )))
    }

    /// This handle's share of the overall progress.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Split this handle's weight across `count` sub-steps. Forks share the
    /// pause barrier and stop flag, so pausing or stopping the root governs
    /// every fork.
    pub fn fork(&self, count: usize) -> TaskHandle {
        TaskHandle {
            shared: Arc::clone(&self.shared),
            weight: self.weight / count.max(1) as f64,
        }
    }

    fn check_stopped(&self) -> Result<(), TaskError> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(TaskError::Interrupted);
        }
        Ok(())
    }

    fn now(&self) -> f64 {
        (self.shared.timer)()
    }

    async fn next_tick(&self) {
        let seen = *self.shared.seen_round.lock();
        let mut rx = self.shared.ticks.clone();
        // Resolves on any round newer than the one seen when the previous
        // suspension point completed, so a round fired before the task's
        // first poll still counts. A closed channel means the scheduler is
        // gone; fall through so the stop check can terminate the task.
        let _ = rx.wait_for(|round| *round > seen).await;
    }

    // Called when a suspension point completes. Rounds fired while the task
    // sat on the pause barrier never satisfy a later `next_tick`.
    fn mark_round_seen(&self) {
        let current = *self.shared.ticks.borrow();
        let mut seen = self.shared.seen_round.lock();
        if current > *seen {
            *seen = current;
        }
    }

    /// Unconditionally yield once: publish `info`, await the next scheduler
    /// round, honor the pause barrier, then advance progress by this
    /// handle's weight.
    pub async fn wait(&self, info: &str) -> Result<(), TaskError> {
        self.check_stopped()?;
        self.shared.progress.set_info(info);
        self.next_tick().await;
        self.shared.barrier.wait().await?;
        self.mark_round_seen();
        self.check_stopped()?;
        self.shared.progress.advance(self.weight, self.now());
        Ok(())
    }

    /// Yield only when at least `dt_ms` elapsed since the current round
    /// started; otherwise return immediately. Lets hot loops amortize the
    /// yielding cost while staying responsive.
    pub async fn wait_maybe(&self, info: &str, dt_ms: f64) -> Result<(), TaskError> {
        self.check_stopped()?;
        let tick_start = *self.shared.tick_start.lock();
        if self.now() - tick_start < dt_ms {
            return Ok(());
        }
        self.shared.progress.set_info(info);
        self.next_tick().await;
        self.shared.barrier.wait().await?;
        self.mark_round_seen();
        self.check_stopped()
    }

    /// Await an arbitrary future as a named sub-task, then honor the pause
    /// barrier and stop check before handing its output back.
    pub async fn wait_for<U>(
        &self,
        fut: impl Future<Output = U>,
        info: &str,
    ) -> Result<U, TaskError> {
        self.check_stopped()?;
        let info_id = self.shared.progress.begin_task(info);
        let result = fut.await;
        self.shared.progress.end_task(info_id);
        self.shared.progress.advance(self.weight, self.now());
        self.shared.barrier.wait().await?;
        self.mark_round_seen();
        self.check_stopped()?;
        Ok(result)
    }

    /// Run a batch of synchronous steps, yielding whenever `dt_ms` elapsed
    /// within the current stretch. Progress is split evenly over the batch.
    pub async fn wait_for_batch(
        &self,
        batch: Vec<Box<dyn FnOnce() + Send>>,
        info: &str,
        dt_ms: f64,
    ) -> Result<(), TaskError> {
        self.check_stopped()?;
        let info_id = self.shared.progress.begin_task(info);
        let step_weight = self.weight / batch.len().max(1) as f64;
        let mut start = self.now();
        for step in batch {
            step();
            self.shared.progress.advance(step_weight, self.now());
            if self.now() - start < dt_ms {
                continue;
            }
            self.next_tick().await;
            self.shared.barrier.wait().await?;
            self.mark_round_seen();
            self.check_stopped()?;
            start = self.now();
        }
        self.shared.barrier.wait().await?;
        self.mark_round_seen();
        self.check_stopped()?;
        self.shared.progress.end_task(info_id);
        Ok(())
    }
}

/// The caller-side view of a running task.
pub struct TaskController<T> {
    shared: Arc<TaskShared>,
    status: Value<TaskStatus<T>>,
    completion: watch::Receiver<Option<Result<T, TaskError>>>,
}

impl<T> TaskController<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        shared: Arc<TaskShared>,
        status: Value<TaskStatus<T>>,
        completion: watch::Receiver<Option<Result<T, TaskError>>>,
    ) -> Self {
        Self {
            shared,
            status,
            completion,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Settled-or-running status cell; outlives the task's own container.
    pub fn status(&self) -> &Value<TaskStatus<T>> {
        &self.status
    }

    /// Reactive pause flag. Valid while the task runs; the backing cell is
    /// disposed with the task's container once it settles.
    pub fn paused(&self) -> SharedSource<bool> {
        self.shared.paused.as_source()
    }

    /// Clamped monotonic progress percentage. Valid while the task runs.
    pub fn percent(&self) -> SharedSource<f64> {
        self.shared.progress.percent_source()
    }

    /// Joined labels of active named sub-tasks. Valid while the task runs.
    pub fn info(&self) -> SharedSource<String> {
        self.shared.progress.info_source()
    }

    /// Estimated remaining milliseconds (NaN until two progress samples
    /// exist). Valid while the task runs.
    pub fn remaining_ms(&self) -> SharedSource<f64> {
        self.shared.progress.remaining_ms_source()
    }

    /// Block the task at its next suspension point.
    pub fn pause(&self) {
        trace!(task = self.shared.name, "pause");
        self.shared.paused.set(true);
        self.shared.barrier.block();
    }

    pub fn unpause(&self) {
        trace!(task = self.shared.name, "unpause");
        self.shared.paused.set(false);
        self.shared.barrier.release();
    }

    /// Request cooperative cancellation and await the task's own
    /// completion, so no dangling execution remains. A task blocked on the
    /// pause barrier is failed out of it immediately.
    pub async fn stop(&self) {
        trace!(task = self.shared.name, "stop");
        self.shared.stopped.store(true, Ordering::SeqCst);
        if self.shared.paused.get() {
            self.shared.barrier.fail(TaskError::Interrupted);
        }
        let _ = self.end().await;
    }

    /// Await the settled outcome. May be awaited concurrently with `stop`.
    pub async fn end(&self) -> Result<T, TaskError> {
        let mut rx = self.completion.clone();
        let settled = match rx.wait_for(Option::is_some).await {
            Ok(done) => done.clone(),
            // Scheduler dropped the sender without settling the task.
            Err(_) => Some(Err(TaskError::failed("task abandoned"))),
        };
        settled.unwrap_or(Err(TaskError::Interrupted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::ValuesContainer;

    // A shared state whose tick channel is closed, so `next_tick` resolves
    // immediately and suspension points can be exercised without a
    // scheduler.
    fn shared() -> Arc<TaskShared> {
        let container = ValuesContainer::root("task");
        let progress = ProgressTracker::new(&container);
        let paused = container.value("paused", false);
        let (_tx, rx) = watch::channel(0u64);
        Arc::new(TaskShared::new(
            "t".to_string(),
            progress,
            rx,
            Arc::new(Mutex::new(0.0)),
            Arc::new(|| 0.0),
            paused,
        ))
    }

    #[test]
    fn fork_divides_weight() {
        let h = TaskHandle::root(shared());
        assert_eq!(h.weight(), 1.0);

        let quarter = h.fork(4);
        assert_eq!(quarter.weight(), 0.25);
        assert_eq!(quarter.fork(2).weight(), 0.125);
        // Degenerate fork keeps the weight.
        assert_eq!(quarter.fork(0).weight(), 0.25);
    }

    #[tokio::test]
    async fn wait_advances_by_handle_weight() {
        let s = shared();
        let half = TaskHandle::root(Arc::clone(&s)).fork(2);

        half.wait("step").await.unwrap();
        assert_eq!(s.progress.percent(), 50.0);
        half.wait("step").await.unwrap();
        assert_eq!(s.progress.percent(), 100.0);
    }

    #[tokio::test]
    async fn wait_maybe_returns_immediately_within_threshold() {
        let s = shared();
        let h = TaskHandle::root(Arc::clone(&s));

        // timer() == tick_start == 0.0, well under the threshold.
        h.wait_maybe("hot loop", DEFAULT_YIELD_MS).await.unwrap();
        assert_eq!(s.progress.percent(), 0.0);
    }

    #[tokio::test]
    async fn wait_fails_after_stop() {
        let s = shared();
        let h = TaskHandle::root(Arc::clone(&s));

        s.stopped.store(true, Ordering::SeqCst);
        assert_eq!(h.wait("step").await, Err(TaskError::Interrupted));
    }

    #[tokio::test]
    async fn stop_while_paused_fails_the_blocked_wait() {
        let s = shared();
        let h = TaskHandle::root(Arc::clone(&s));

        s.barrier.block();
        let waiter = tokio::spawn(async move { h.wait("step").await });
        tokio::task::yield_now().await;

        s.stopped.store(true, Ordering::SeqCst);
        s.barrier.fail(TaskError::Interrupted);
        assert_eq!(waiter.await.unwrap(), Err(TaskError::Interrupted));
    }

    #[tokio::test]
    async fn wait_for_reports_named_subtask() {
        let s = shared();
        let h = TaskHandle::root(Arc::clone(&s));
        let info = s.progress.info_source();

        let result = h
            .wait_for(
                async {
                    // Sub-task label is visible while the future runs.
                    7
                },
                "loading",
            )
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(info.get(), "");
        assert_eq!(s.progress.percent(), 100.0);
    }

    #[tokio::test]
    async fn wait_for_batch_runs_every_step() {
        let s = shared();
        let h = TaskHandle::root(Arc::clone(&s));

        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let batch: Vec<Box<dyn FnOnce() + Send>> = (0..5)
            .map(|_| {
                let count = count.clone();
                Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }) as Box<dyn FnOnce() + Send>
            })
            .collect();

        h.wait_for_batch(batch, "batch", DEFAULT_YIELD_MS)
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_eq!(s.progress.percent(), 100.0);
    }

    #[tokio::test]
    async fn end_returns_the_settled_result() {
        let (done_tx, done_rx) = watch::channel(None);
        let status = Value::new("status", TaskStatus::<i32>::Running);
        let ctrl = TaskController::new(shared(), status, done_rx);

        done_tx.send(Some(Ok(5))).unwrap();
        assert_eq!(ctrl.end().await, Ok(5));
    }

    #[tokio::test]
    async fn end_reports_abandonment_when_never_settled() {
        let (done_tx, done_rx) = watch::channel::<Option<Result<i32, TaskError>>>(None);
        let status = Value::new("status", TaskStatus::<i32>::Running);
        let ctrl = TaskController::new(shared(), status, done_rx);

        drop(done_tx);
        assert_eq!(ctrl.end().await, Err(TaskError::failed("task abandoned")));
    }

    #[test]
    fn status_reports_done() {
        let running: TaskStatus<i32> = TaskStatus::Running;
        assert!(!running.is_done());
        assert!(TaskStatus::Done(Ok(1)).is_done());
    }
}
