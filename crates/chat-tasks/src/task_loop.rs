//! Recurring task loop
//!
//! A [`Loop`] runs an async work unit on a [`Schedule`] in its own tokio task.
//! Failures whose error type is in the loop's recoverable set are retried with
//! exponential backoff; any other failure stops the loop and marks it failed.
//!
//! Control requests (`stop`) travel over a watch channel so the running task
//! only observes them between iterations. `cancel` aborts the task outright.

use crate::backoff::ExponentialBackoff;
use crate::error::{LoopError, LoopResult};
use crate::schedule::Schedule;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::TypeId;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type WorkFn = Arc<dyn Fn(u64) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type HookFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
type ErrorHookFn = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Lifecycle state of a loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    /// Not running
    Stopped,
    /// Running iterations
    Running,
    /// Will exit after the current iteration
    Stopping,
    /// Aborted, waiting for the completion hook
    Cancelling,
}

impl fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Cancelling => "cancelling",
        };
        f.write_str(name)
    }
}

/// Error type treated as transient by a loop
#[derive(Clone, Copy)]
struct ExceptionType {
    id: TypeId,
    name: &'static str,
    matches: fn(&anyhow::Error) -> bool,
}

impl ExceptionType {
    fn of<E>() -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            id: TypeId::of::<E>(),
            name: std::any::type_name::<E>(),
            matches: error_is::<E>,
        }
    }
}

fn error_is<E>(err: &anyhow::Error) -> bool
where
    E: std::error::Error + Send + Sync + 'static,
{
    err.is::<E>() || err.chain().any(|cause| cause.is::<E>())
}

fn default_exception_types() -> Vec<ExceptionType> {
    vec![
        ExceptionType::of::<std::io::Error>(),
        ExceptionType::of::<tokio::time::error::Elapsed>(),
    ]
}

#[derive(Debug, Default)]
struct LoopState {
    current_loop: u64,
    next_iteration: Option<DateTime<Utc>>,
    failed: bool,
    last_error: Option<String>,
}

struct LoopInner {
    name: String,
    schedule: Mutex<Schedule>,
    count: Option<u64>,
    reconnect: bool,
    backoff_initial: Duration,
    backoff_max: Duration,
    initial_delay: Option<Duration>,
    exception_types: Mutex<Vec<ExceptionType>>,
    work: WorkFn,
    before_loop: Option<HookFn>,
    after_loop: Option<HookFn>,
    /// Set once this run's completion hook has been claimed
    after_loop_claimed: AtomicBool,
    on_error: Option<ErrorHookFn>,
    state: Mutex<LoopState>,
    status_tx: watch::Sender<LoopStatus>,
    stop_tx: watch::Sender<bool>,
}

impl LoopInner {
    fn is_recoverable(&self, err: &anyhow::Error) -> bool {
        self.exception_types
            .lock()
            .iter()
            .any(|kind| (kind.matches)(err))
    }

    fn set_next_iteration(&self, deadline: Instant) {
        let wait = deadline.saturating_duration_since(Instant::now());
        let at = chrono::Duration::from_std(wait)
            .ok()
            .and_then(|wait| Utc::now().checked_add_signed(wait));
        self.state.lock().next_iteration = at;
    }

    async fn finish(&self) {
        // A cancel can land while the task itself is inside the hook
        if !self.after_loop_claimed.swap(true, Ordering::AcqRel) {
            if let Some(hook) = &self.after_loop {
                hook().await;
            }
        }
        self.state.lock().next_iteration = None;
        self.status_tx.send_replace(LoopStatus::Stopped);
        tracing::debug!(task = %self.name, "Task loop finished");
    }
}

/// Builder for [`Loop`]
pub struct LoopBuilder {
    name: String,
    schedule: Schedule,
    count: Option<u64>,
    reconnect: bool,
    backoff_initial: Duration,
    backoff_max: Duration,
    initial_delay: Option<Duration>,
    exception_types: Vec<ExceptionType>,
    before_loop: Option<HookFn>,
    after_loop: Option<HookFn>,
    on_error: Option<ErrorHookFn>,
}

impl LoopBuilder {
    /// Start building a loop that fires on `schedule`
    #[must_use]
    pub fn new(schedule: Schedule) -> Self {
        Self {
            name: "task".to_string(),
            schedule,
            count: None,
            reconnect: true,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(128),
            initial_delay: None,
            exception_types: default_exception_types(),
            before_loop: None,
            after_loop: None,
            on_error: None,
        }
    }

    /// Name used in log output
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Stop after this many successful iterations
    pub fn count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Retry recoverable failures instead of stopping (default: true)
    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Backoff bounds used between retries of recoverable failures
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }

    /// Wait before the first iteration instead of firing immediately
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Treat errors of type `E` as recoverable
    pub fn add_exception_type<E>(mut self) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let kind = ExceptionType::of::<E>();
        if !self.exception_types.iter().any(|k| k.id == kind.id) {
            self.exception_types.push(kind);
        }
        self
    }

    /// Stop treating errors of type `E` as recoverable
    pub fn remove_exception_type<E>(mut self) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let id = TypeId::of::<E>();
        self.exception_types.retain(|kind| kind.id != id);
        self
    }

    /// Treat every error as fatal
    pub fn clear_exception_types(mut self) -> Self {
        self.exception_types.clear();
        self
    }

    /// Hook awaited once before the first iteration
    pub fn before_loop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.before_loop = Some(Arc::new(move || hook().boxed()));
        self
    }

    /// Hook awaited once after the loop ends for any reason
    pub fn after_loop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.after_loop = Some(Arc::new(move || hook().boxed()));
        self
    }

    /// Hook called with the error that stopped the loop
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&anyhow::Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Finish the loop around a work unit; the closure receives the iteration number
    pub fn build<F, Fut>(self, work: F) -> LoopResult<Loop>
    where
        F: Fn(u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.schedule.validate()?;

        let (status_tx, _) = watch::channel(LoopStatus::Stopped);
        let (stop_tx, _) = watch::channel(false);

        let inner = LoopInner {
            name: self.name,
            schedule: Mutex::new(self.schedule),
            count: self.count,
            reconnect: self.reconnect,
            backoff_initial: self.backoff_initial,
            backoff_max: self.backoff_max,
            initial_delay: self.initial_delay,
            exception_types: Mutex::new(self.exception_types),
            work: Arc::new(move |iteration| work(iteration).boxed()),
            before_loop: self.before_loop,
            after_loop: self.after_loop,
            after_loop_claimed: AtomicBool::new(false),
            on_error: self.on_error,
            state: Mutex::new(LoopState::default()),
            status_tx,
            stop_tx,
        };

        Ok(Loop {
            inner: Arc::new(inner),
            task: Mutex::new(None),
        })
    }
}

/// Handle to a recurring background task
pub struct Loop {
    inner: Arc<LoopInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Loop {
    /// Shorthand for [`LoopBuilder::new`]
    #[must_use]
    pub fn builder(schedule: Schedule) -> LoopBuilder {
        LoopBuilder::new(schedule)
    }

    /// Spawn the loop onto the current tokio runtime
    pub fn start(&self) -> LoopResult<()> {
        let mut task = self.task.lock();
        if *self.inner.status_tx.borrow() != LoopStatus::Stopped {
            return Err(LoopError::AlreadyRunning);
        }

        *self.inner.state.lock() = LoopState::default();
        self.inner.after_loop_claimed.store(false, Ordering::Release);
        self.inner.stop_tx.send_replace(false);
        self.inner.status_tx.send_replace(LoopStatus::Running);

        let stop_rx = self.inner.stop_tx.subscribe();
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(run(inner, stop_rx)));

        tracing::debug!(task = %self.inner.name, "Task loop started");
        Ok(())
    }

    /// Let the current iteration finish, then exit
    pub fn stop(&self) {
        let stopping = self.inner.status_tx.send_if_modified(|status| {
            if *status == LoopStatus::Running {
                *status = LoopStatus::Stopping;
                true
            } else {
                false
            }
        });
        if stopping {
            self.inner.stop_tx.send_replace(true);
        }
    }

    /// Abort the loop immediately; the completion hook still runs
    pub fn cancel(&self) {
        let Some(handle) = self.task.lock().take() else {
            return;
        };
        if handle.is_finished() || *self.inner.status_tx.borrow() == LoopStatus::Stopped {
            return;
        }

        self.inner.status_tx.send_replace(LoopStatus::Cancelling);
        handle.abort();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if handle.await.is_err_and(|err| err.is_cancelled()) {
                inner.finish().await;
            }
        });
    }

    /// Cancel, wait for completion, then start again
    pub async fn restart(&self) -> LoopResult<()> {
        self.cancel();
        self.wait().await;
        self.start()
    }

    /// Wait until the loop is no longer running
    pub async fn wait(&self) {
        let mut status_rx = self.inner.status_tx.subscribe();
        let _ = status_rx
            .wait_for(|status| *status == LoopStatus::Stopped)
            .await;
    }

    /// Replace the schedule; takes effect from the next computed deadline
    pub fn change_interval(&self, schedule: Schedule) -> LoopResult<()> {
        schedule.validate()?;
        *self.inner.schedule.lock() = schedule;
        Ok(())
    }

    pub fn add_exception_type<E>(&self)
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let kind = ExceptionType::of::<E>();
        let mut types = self.inner.exception_types.lock();
        if !types.iter().any(|k| k.id == kind.id) {
            types.push(kind);
        }
    }

    /// Returns whether `E` was in the recoverable set
    pub fn remove_exception_type<E>(&self) -> bool
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let id = TypeId::of::<E>();
        let mut types = self.inner.exception_types.lock();
        let before = types.len();
        types.retain(|kind| kind.id != id);
        types.len() != before
    }

    pub fn clear_exception_types(&self) {
        self.inner.exception_types.lock().clear();
    }

    /// Type names of the recoverable error set
    pub fn exception_types(&self) -> Vec<&'static str> {
        self.inner
            .exception_types
            .lock()
            .iter()
            .map(|kind| kind.name)
            .collect()
    }

    pub fn status(&self) -> LoopStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.status() != LoopStatus::Stopped
    }

    pub fn is_being_cancelled(&self) -> bool {
        self.status() == LoopStatus::Cancelling
    }

    /// Whether the last run ended on a non-recoverable error
    pub fn failed(&self) -> bool {
        self.inner.state.lock().failed
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.state.lock().last_error.clone()
    }

    /// Zero-based number of the iteration currently or last executed
    pub fn current_loop(&self) -> u64 {
        self.inner.state.lock().current_loop
    }

    /// When the next iteration is due, if one is scheduled
    pub fn next_iteration(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().next_iteration
    }
}

impl fmt::Debug for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loop")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .field("current_loop", &self.current_loop())
            .finish()
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Sleep until `deadline`; returns true when a stop was requested instead
async fn sleep_or_stop(deadline: Instant, stop_rx: &mut watch::Receiver<bool>) -> bool {
    let stopped = tokio::select! {
        () = tokio::time::sleep_until(deadline) => false,
        _ = stop_rx.wait_for(|stop| *stop) => true,
    };
    stopped || *stop_rx.borrow()
}

async fn run(inner: Arc<LoopInner>, mut stop_rx: watch::Receiver<bool>) {
    if let Some(hook) = &inner.before_loop {
        hook().await;
    }

    let mut backoff = ExponentialBackoff::new(inner.backoff_initial, inner.backoff_max);
    let mut iteration: u64 = 0;
    let mut scheduled = inner.schedule.lock().first_deadline();
    if let Some(delay) = inner.initial_delay {
        scheduled += delay;
    }
    let mut deadline = scheduled;

    loop {
        inner.set_next_iteration(deadline);
        if sleep_or_stop(deadline, &mut stop_rx).await {
            break;
        }

        inner.state.lock().current_loop = iteration;
        tracing::trace!(task = %inner.name, iteration, "Running task iteration");

        match (inner.work)(iteration).await {
            Ok(()) => backoff.reset(),
            Err(err) if inner.reconnect && inner.is_recoverable(&err) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    task = %inner.name,
                    iteration,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "Task iteration failed, retrying"
                );
                deadline = Instant::now() + delay;
                continue;
            }
            Err(err) => {
                tracing::error!(task = %inner.name, iteration, error = %err, "Task loop failed");
                {
                    let mut state = inner.state.lock();
                    state.failed = true;
                    state.last_error = Some(err.to_string());
                }
                if let Some(hook) = &inner.on_error {
                    hook(&err);
                }
                break;
            }
        }

        iteration += 1;
        if inner.count.is_some_and(|count| iteration >= count) {
            break;
        }

        scheduled = inner.schedule.lock().next_deadline(scheduled);
        deadline = scheduled;
    }

    inner.finish().await;
}
