//! Connection lifecycle state machine.
//!
//! Every change goes through [`ConnectionStateMachine`], which checks the
//! transition table, stamps it with the current session epoch and notifies
//! the registered observer while still holding the transition lock, so the
//! observer sees every transition exactly once and in order.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::error::ChatError;

/// Connection state for the hub connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
        )
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// One observed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

/// Observer invoked synchronously on every transition.
///
/// It runs while transitions are locked: it may read the state but must not
/// call `start`/`stop` synchronously.
pub type StateObserver = Arc<dyn Fn(StateChange) + Send + Sync>;

/// Identifies one start()..stop() span.
pub type SessionEpoch = u64;

#[derive(Debug)]
struct Lifecycle {
    state: ConnectionState,
    epoch: SessionEpoch,
}

/// Owner of the current [`ConnectionState`].
pub struct ConnectionStateMachine {
    lifecycle: Mutex<Lifecycle>,
    /// Mirror of `lifecycle.state` readable without the transition lock.
    current: AtomicU8,
    observer: RwLock<Option<StateObserver>>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Disconnected,
                epoch: 0,
            }),
            current: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            observer: RwLock::new(None),
        }
    }
}

impl std::fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.current.load(Ordering::Acquire))
    }

    /// Replace the observer. `None` keeps transitions silent.
    pub fn set_observer(&self, observer: Option<StateObserver>) {
        match self.observer.write() {
            Ok(mut slot) => *slot = observer,
            Err(poisoned) => *poisoned.into_inner() = observer,
        }
    }

    /// `Disconnected -> Connecting`, opening a new session epoch.
    pub fn begin_connecting(&self) -> Result<SessionEpoch, ChatError> {
        let mut lifecycle = self.lock();
        let previous = lifecycle.state;
        if !previous.can_transition_to(ConnectionState::Connecting) {
            return Err(ChatError::InvalidTransition {
                from: previous,
                to: ConnectionState::Connecting,
            });
        }
        lifecycle.epoch += 1;
        self.apply(&mut lifecycle, ConnectionState::Connecting);
        Ok(lifecycle.epoch)
    }

    /// Apply `next` on behalf of session `epoch`.
    ///
    /// Returns `Ok(false)` when the epoch has ended; the transition is
    /// dropped because `stop()` already owns the state.
    pub fn transition(
        &self,
        epoch: SessionEpoch,
        next: ConnectionState,
    ) -> Result<bool, ChatError> {
        self.transition_with(epoch, next, || {})
    }

    /// Same as [`transition`](Self::transition), with a guard that runs
    /// under the transition lock only when the transition is applied.
    ///
    /// Used to publish or retract the live link atomically with the state.
    pub fn transition_with<F: FnOnce()>(
        &self,
        epoch: SessionEpoch,
        next: ConnectionState,
        before_notify: F,
    ) -> Result<bool, ChatError> {
        let mut lifecycle = self.lock();
        if lifecycle.epoch != epoch {
            return Ok(false);
        }
        let previous = lifecycle.state;
        if !previous.can_transition_to(next) {
            return Err(ChatError::InvalidTransition {
                from: previous,
                to: next,
            });
        }
        before_notify();
        self.apply(&mut lifecycle, next);
        Ok(true)
    }

    /// End the current epoch and force `Disconnected`.
    ///
    /// Returns whether a transition happened; stopping while already
    /// disconnected is silent.
    pub fn stop(&self) -> bool {
        let mut lifecycle = self.lock();
        lifecycle.epoch += 1;
        if lifecycle.state == ConnectionState::Disconnected {
            return false;
        }
        self.apply(&mut lifecycle, ConnectionState::Disconnected);
        true
    }

    /// The epoch currently allowed to drive transitions.
    pub fn epoch(&self) -> SessionEpoch {
        self.lock().epoch
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        // An observer panic must not wedge the connection forever.
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply(&self, lifecycle: &mut Lifecycle, next: ConnectionState) {
        let change = StateChange {
            previous: lifecycle.state,
            current: next,
        };
        lifecycle.state = next;
        self.current.store(next.as_u8(), Ordering::Release);
        crate::log_info!("connection state {:?} -> {:?}", change.previous, change.current);

        let observer = match self.observer.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(observer) = observer {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| observer(change)));
            if outcome.is_err() {
                crate::log_error!("connection state observer panicked on {:?}", change);
            }
        }
    }
}
