//! One-shot debounce timer
//!
//! Arming an armed timer does nothing, so a burst of local changes results in
//! one tick `period` after the first change of the burst.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::warn;

type TickFn = dyn Fn() + Send + Sync;

#[derive(Default)]
struct TimerState {
    armed: bool,
    /// Bumped on every arm and cancel so a superseded sleeper never fires
    generation: u64,
    sleeper: Option<JoinHandle<()>>,
}

struct TimerInner {
    period: Duration,
    on_tick: Box<TickFn>,
    state: Mutex<TimerState>,
}

/// Fires a callback once, `period` after being armed
#[derive(Clone)]
pub struct SyncTimer {
    inner: Arc<TimerInner>,
}

impl SyncTimer {
    pub fn new<F>(period: Duration, on_tick: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(TimerInner {
                period,
                on_tick: Box::new(on_tick),
                state: Mutex::new(TimerState::default()),
            }),
        }
    }

    pub fn period(&self) -> Duration {
        self.inner.period
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.lock().armed
    }

    /// Arm the timer. No-op while armed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Sync timer not armed: {}", e);
                return;
            }
        };

        let mut state = self.inner.state.lock();
        if state.armed {
            return;
        }
        state.armed = true;
        state.generation += 1;
        let generation = state.generation;

        let inner = Arc::clone(&self.inner);
        state.sleeper = Some(runtime.spawn(async move {
            tokio::time::sleep(inner.period).await;

            let fire = {
                let mut state = inner.state.lock();
                if state.armed && state.generation == generation {
                    state.armed = false;
                    state.sleeper = None;
                    true
                } else {
                    false
                }
            };
            if fire {
                (inner.on_tick)();
            }
        }));
    }

    /// Cancel the timer. No-op when not armed.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if !state.armed {
            return;
        }
        state.armed = false;
        state.generation += 1;
        if let Some(sleeper) = state.sleeper.take() {
            sleeper.abort();
        }
    }
}

impl fmt::Debug for SyncTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTimer")
            .field("period", &self.inner.period)
            .field("armed", &self.is_started())
            .finish()
    }
}
