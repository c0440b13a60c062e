//! In-flight accounting used to detect quiescence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct State {
    count: AtomicUsize,
    last_change: Mutex<Instant>,
}

impl State {
    fn touch(&self) {
        *self
            .last_change
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

/// Counts spores that are published but not yet fully handled.
#[derive(Debug, Clone)]
pub struct InFlight {
    state: Arc<State>,
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlight {
    pub fn new() -> Self {
        Self {
            state: Arc::new(State {
                count: AtomicUsize::new(0),
                last_change: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Marks one unit of work as started. The work ends when the last clone
    /// of the returned guard is dropped.
    pub fn begin(&self) -> ActivityGuard {
        self.state.count.fetch_add(1, Ordering::SeqCst);
        self.state.touch();
        ActivityGuard {
            _token: Arc::new(Token {
                state: Arc::clone(&self.state),
            }),
        }
    }

    /// Units of work currently in flight.
    pub fn count(&self) -> usize {
        self.state.count.load(Ordering::SeqCst)
    }

    /// How long the count has been zero, `None` while work is in flight.
    pub fn idle_for(&self) -> Option<Duration> {
        if self.count() > 0 {
            return None;
        }
        let last_change = *self
            .state
            .last_change
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // A guard may have started between the two reads.
        if self.count() > 0 {
            return None;
        }
        Some(last_change.elapsed())
    }
}

#[derive(Debug)]
struct Token {
    state: Arc<State>,
}

impl Drop for Token {
    fn drop(&mut self) {
        self.state.touch();
        self.state.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Keeps one spore counted as in flight. Clones share the same unit.
#[derive(Debug, Clone)]
pub struct ActivityGuard {
    _token: Arc<Token>,
}
