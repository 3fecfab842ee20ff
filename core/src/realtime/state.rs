//! Connection state machine for the realtime channel.
//!
//! One [`ConnectionStateMachine`] exists per client session and is owned by
//! the realtime client. Everything else gets a [`ConnectionStateReader`] and
//! can only observe transitions.

use crate::gate::CallbackGate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

impl ConnectionState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
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
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Invalid connection state transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

struct HookEntry {
    id: u64,
    hook: ReconnectHook,
    gate: Arc<CallbackGate>,
}

/// Owner side of the connection state.
pub struct ConnectionStateMachine {
    tx: watch::Sender<ConnectionState>,
    /// Set on entering `Reconnecting`, consumed on the next `Connected`
    recovering: Mutex<bool>,
    hooks: Arc<Mutex<Vec<HookEntry>>>,
    next_hook_id: AtomicU64,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            tx,
            recovering: Mutex::new(false),
            hooks: Arc::new(Mutex::new(Vec::new())),
            next_hook_id: AtomicU64::new(1),
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn reader(&self) -> ConnectionStateReader {
        ConnectionStateReader {
            rx: self.tx.subscribe(),
        }
    }

    /// Move to `next`, firing reconnect hooks when a reconnect completes.
    pub fn transition(&self, next: ConnectionState) -> Result<(), InvalidTransition> {
        let fire_hooks = {
            let mut recovering = self.recovering.lock();
            let from = self.current();
            if !from.can_transition_to(next) {
                return Err(InvalidTransition { from, to: next });
            }
            self.tx.send_replace(next);
            tracing::info!("Realtime connection {} -> {}", from, next);

            match next {
                ConnectionState::Reconnecting => {
                    *recovering = true;
                    false
                }
                ConnectionState::Connected => std::mem::replace(&mut *recovering, false),
                ConnectionState::Disconnected => {
                    *recovering = false;
                    false
                }
                ConnectionState::Connecting => false,
            }
        };

        if fire_hooks {
            let hooks: Vec<(ReconnectHook, Arc<CallbackGate>)> = self
                .hooks
                .lock()
                .iter()
                .map(|e| (Arc::clone(&e.hook), Arc::clone(&e.gate)))
                .collect();
            tracing::debug!("Reconnected; running {} refetch hook(s)", hooks.len());
            for (hook, gate) in hooks {
                gate.run(|| hook());
            }
        }
        Ok(())
    }

    /// Register a hook run once per completed `reconnecting -> connected`
    /// cycle. Callers use it to refetch state missed while disconnected.
    pub fn on_reconnect<F>(&self, hook: F) -> ReconnectHookHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_hook_id.fetch_add(1, Ordering::Relaxed);
        let gate = Arc::new(CallbackGate::new());
        self.hooks.lock().push(HookEntry {
            id,
            hook: Arc::new(hook),
            gate: Arc::clone(&gate),
        });
        ReconnectHookHandle {
            id,
            gate,
            hooks: Arc::clone(&self.hooks),
        }
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Disposer for a reconnect hook. Dropping it removes the hook.
pub struct ReconnectHookHandle {
    id: u64,
    gate: Arc<CallbackGate>,
    hooks: Arc<Mutex<Vec<HookEntry>>>,
}

impl ReconnectHookHandle {
    pub fn remove(&self) {
        self.gate.close();
        self.hooks.lock().retain(|e| e.id != self.id);
    }
}

impl Drop for ReconnectHookHandle {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Read-only view of the connection state.
#[derive(Clone)]
pub struct ConnectionStateReader {
    rx: watch::Receiver<ConnectionState>,
}

impl ConnectionStateReader {
    /// A reader pinned to one state, for components run without a realtime
    /// client (e.g. a one-off CLI flush).
    pub fn constant(state: ConnectionState) -> Self {
        let (_tx, rx) = watch::channel(state);
        Self { rx }
    }

    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current() == ConnectionState::Connected
    }

    /// Wait for the next state change. Returns `None` once the owner is gone.
    pub async fn changed(&mut self) -> Option<ConnectionState> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}
