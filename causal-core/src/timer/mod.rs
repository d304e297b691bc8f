//! Cancellable, resettable one-shot timers.
//!
//! A [`TimerService`] owns named [`Timer`]s that share one tokio runtime.
//! Each arm of a timer fires its handler at most once, and a timer's handler
//! never runs concurrently with itself: a firing that becomes due while a
//! previous invocation is still running waits for it to finish, and a firing
//! superseded by `set`, `reset` or `cancel` is dropped.
//!
//! Handlers run on the shared runtime and must stay short.

mod policy;

pub use policy::TimeoutPolicy;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{CoreError, Result};

/// Callback invoked when a timer fires.
pub type TimerHandler = Arc<dyn Fn(&Timer) + Send + Sync + 'static>;

struct TimerState {
    policy: Option<TimeoutPolicy>,
    /// Bumped on every arm and cancel; a pending firing only runs if its
    /// generation is still current.
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

struct TimerInner {
    name: String,
    runtime: Handle,
    handler: TimerHandler,
    state: Mutex<TimerState>,
    invocation: tokio::sync::Mutex<()>,
    fired: AtomicU64,
}

/// A named one-shot countdown.
///
/// Cloning yields another handle to the same timer.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    fn new(name: String, runtime: Handle, handler: TimerHandler) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                name,
                runtime,
                handler,
                state: Mutex::new(TimerState {
                    policy: None,
                    generation: 0,
                    pending: None,
                }),
                invocation: tokio::sync::Mutex::new(()),
                fired: AtomicU64::new(0),
            }),
        }
    }

    /// Name this timer was created with.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Arm with `policy`, cancelling any pending firing.
    pub fn set(&self, policy: TimeoutPolicy) {
        let mut state = self.inner.state.lock();
        state.policy = Some(policy);
        self.arm(&mut state, policy);
    }

    /// Re-arm with the last policy given to [`Timer::set`].
    ///
    /// Does nothing if the timer was never set.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        if let Some(policy) = state.policy {
            self.arm(&mut state, policy);
        }
    }

    /// Disarm. A handler already running is left to complete.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        state.generation = state.generation.wrapping_add(1);
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
    }

    /// Whether a firing is pending.
    pub fn is_armed(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }

    /// Number of times the handler has been invoked.
    pub fn invocations(&self) -> u64 {
        self.inner.fired.load(Ordering::Acquire)
    }

    fn arm(&self, state: &mut TimerState, policy: TimeoutPolicy) {
        state.generation = state.generation.wrapping_add(1);
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
        let generation = state.generation;
        let delay = policy.next_delay();
        let inner = Arc::clone(&self.inner);
        tracing::trace!(timer = %self.inner.name, delay_ms = delay.as_millis() as u64, "Timer armed");
        state.pending = Some(self.inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            Self::fire(inner, generation).await;
        }));
    }

    async fn fire(inner: Arc<TimerInner>, generation: u64) {
        // Serializes invocations. Arming never takes this lock, so a reset
        // racing with a running handler cannot deadlock.
        let _invocation = inner.invocation.lock().await;
        {
            let mut state = inner.state.lock();
            if state.generation != generation {
                return;
            }
            state.pending = None;
        }
        inner.fired.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(timer = %inner.name, "Timer fired");
        let timer = Timer {
            inner: Arc::clone(&inner),
        };
        (inner.handler)(&timer);
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("name", &self.inner.name)
            .field("armed", &self.is_armed())
            .field("invocations", &self.invocations())
            .finish()
    }
}

/// Registry of timers sharing one runtime.
pub struct TimerService {
    runtime: Handle,
    timers: Mutex<HashMap<String, Timer>>,
}

impl TimerService {
    /// Create a service that schedules on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Create a service on the runtime of the calling context.
    pub fn current() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| CoreError::NoRuntime(e.to_string()))?;
        Ok(Self::new(runtime))
    }

    /// Create a timer. An existing timer with the same name is cancelled and
    /// replaced.
    pub fn create<F>(&self, name: impl Into<String>, handler: F) -> Timer
    where
        F: Fn(&Timer) + Send + Sync + 'static,
    {
        let name = name.into();
        let timer = Timer::new(name.clone(), self.runtime.clone(), Arc::new(handler));
        if let Some(previous) = self.timers.lock().insert(name, timer.clone()) {
            previous.cancel();
        }
        timer
    }

    /// Look up a timer by name.
    pub fn get(&self, name: &str) -> Option<Timer> {
        self.timers.lock().get(name).cloned()
    }

    /// Cancel and forget a timer.
    pub fn remove(&self, name: &str) -> Option<Timer> {
        let timer = self.timers.lock().remove(name);
        if let Some(timer) = &timer {
            timer.cancel();
        }
        timer
    }

    /// Cancel every timer.
    pub fn cancel_all(&self) {
        for timer in self.timers.lock().values() {
            timer.cancel();
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.timers.lock().keys().cloned().collect();
        f.debug_struct("TimerService").field("timers", &names).finish()
    }
}
