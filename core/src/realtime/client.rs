//! Realtime client: subscribes to row changes over one multiplexed channel
//! connection and keeps that connection alive.
//!
//! The client owns the [`ConnectionStateMachine`]. A session task reads
//! frames, dispatches changes to subscribers in arrival order, sends
//! heartbeats and, when the connection drops, reconnects with exponential
//! backoff. Reconnect hooks run after every subscription has been rejoined,
//! so a refetch triggered by a hook cannot miss a change.

use super::protocol::{
    heartbeat_frame, join_frame, leave_frame, ChangeEvent, PhoenixFrame, ProtocolError,
    ServerMessage, TopicFilter, HEARTBEAT_TOPIC,
};
use super::registry::SubscriptionRegistry;
use super::state::{
    ConnectionState, ConnectionStateMachine, ConnectionStateReader, InvalidTransition,
    ReconnectHookHandle,
};
use super::transport::{RealtimeConnection, RealtimeTransport, TransportError};
use crate::clock::duration_ms;
use crate::gate::CallbackGate;
use crate::store::retry::RetryPolicy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_max_delay: Duration,
    /// Failed reconnects before giving up and going `Disconnected`
    pub max_reconnect_attempts: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
        }
    }
}

impl RealtimeConfig {
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.reconnect_base_delay,
            max_delay: self.reconnect_max_delay,
            multiplier: 2.0,
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

enum Command {
    Join(String, TopicFilter),
    Leave(String),
    Close,
}

enum SessionEnd {
    Closed,
    Lost(String),
}

enum Reconnect {
    Restored(Box<dyn RealtimeConnection>),
    Exhausted,
    Closed,
}

struct Session {
    commands: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
}

struct ClientInner {
    transport: Arc<dyn RealtimeTransport>,
    config: RealtimeConfig,
    state: ConnectionStateMachine,
    registry: SubscriptionRegistry,
    access_token: Mutex<Option<String>>,
    session: Mutex<Option<Session>>,
}

impl ClientInner {
    fn send_command(&self, command: Command) {
        if let Some(session) = self.session.lock().as_ref() {
            let _ = session.commands.send(command);
        }
    }
}

/// Realtime subscription client.
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

impl RealtimeClient {
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: RealtimeConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                config,
                state: ConnectionStateMachine::new(),
                registry: SubscriptionRegistry::new(),
                access_token: Mutex::new(None),
                session: Mutex::new(None),
            }),
        }
    }

    /// Token sent with channel joins so row-level security applies.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.inner.access_token.lock() = token;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    pub fn state_reader(&self) -> ConnectionStateReader {
        self.inner.state.reader()
    }

    /// Run `hook` once after every completed reconnect.
    pub fn on_reconnect<F>(&self, hook: F) -> ReconnectHookHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.state.on_reconnect(hook)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Open the connection. A no-op unless currently `Disconnected`.
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        if self.inner.state.current() != ConnectionState::Disconnected {
            return Ok(());
        }
        self.inner.state.transition(ConnectionState::Connecting)?;

        let conn = match self.inner.transport.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Realtime connect failed: {}", e);
                self.inner.state.transition(ConnectionState::Disconnected)?;
                return Err(e.into());
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.session.lock() = Some(Session {
            commands: tx,
            task: None,
        });
        self.inner.state.transition(ConnectionState::Connected)?;

        let task = tokio::spawn(run_session(Arc::clone(&self.inner), conn, rx));
        if let Some(session) = self.inner.session.lock().as_mut() {
            session.task = Some(task);
        }
        Ok(())
    }

    /// Close the connection and stop reconnecting. Subscriptions stay
    /// registered and are rejoined by the next `connect`.
    pub async fn disconnect(&self) {
        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            let _ = session.commands.send(Command::Close);
            if let Some(task) = session.task {
                let abort = task.abort_handle();
                if tokio::time::timeout(Duration::from_secs(1), task)
                    .await
                    .is_err()
                {
                    abort.abort();
                }
            }
        }
        if self.inner.state.current() != ConnectionState::Disconnected {
            let _ = self.inner.state.transition(ConnectionState::Disconnected);
        }
    }

    /// Observe changes matching `filter`. Events for one subscription are
    /// delivered one at a time, in the order the server sent them.
    pub fn subscribe<F>(&self, filter: TopicFilter, on_event: F) -> SubscriptionHandle
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let (topic, gate) = self.inner.registry.insert(filter.clone(), Box::new(on_event));
        tracing::debug!("Subscribing to {} on {}", filter, topic);
        self.inner.send_command(Command::Join(topic.clone(), filter));
        SubscriptionHandle {
            topic,
            gate,
            client: Arc::downgrade(&self.inner),
        }
    }

    /// Stop a subscription. No callback runs after this returns.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.unsubscribe();
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        if let Some(session) = self.inner.session.lock().take() {
            let _ = session.commands.send(Command::Close);
            if let Some(task) = session.task {
                task.abort();
            }
        }
    }
}

/// Disposer for one subscription. Dropping it unsubscribes.
pub struct SubscriptionHandle {
    topic: String,
    gate: Arc<CallbackGate>,
    client: Weak<ClientInner>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        !self.gate.is_closed()
    }

    /// Events delivered so far
    pub fn delivered(&self) -> u64 {
        self.gate.delivered()
    }

    pub fn unsubscribe(&self) {
        self.gate.close();
        if let Some(inner) = self.client.upgrade() {
            if inner.registry.remove(&self.topic) {
                inner.send_command(Command::Leave(self.topic.clone()));
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[derive(Default)]
struct RefCounter(u64);

impl RefCounter {
    fn next(&mut self) -> String {
        self.0 += 1;
        self.0.to_string()
    }
}

async fn run_session(
    inner: Arc<ClientInner>,
    mut conn: Box<dyn RealtimeConnection>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut refs = RefCounter::default();
    let mut joined = HashSet::new();

    if let Err(e) = join_registered(&inner, conn.as_mut(), &mut joined, &mut refs).await {
        tracing::warn!("Initial channel join failed: {}", e);
    }

    loop {
        let end = session_loop(&inner, conn.as_mut(), &mut commands, &mut joined, &mut refs).await;
        conn.close().await;

        let reason = match end {
            SessionEnd::Closed => {
                tracing::debug!("Realtime session closed");
                return;
            }
            SessionEnd::Lost(reason) => reason,
        };
        tracing::warn!("Realtime connection lost: {}", reason);
        if inner
            .state
            .transition(ConnectionState::Reconnecting)
            .is_err()
        {
            return;
        }

        match reconnect(&inner, &mut commands).await {
            Reconnect::Restored(new_conn) => {
                conn = new_conn;
                joined.clear();
                if let Err(e) = join_registered(&inner, conn.as_mut(), &mut joined, &mut refs).await
                {
                    tracing::warn!("Rejoin after reconnect failed: {}", e);
                }
                // Hooks run here, after rejoin
                let _ = inner.state.transition(ConnectionState::Connected);
            }
            Reconnect::Exhausted => {
                tracing::error!(
                    "Realtime reconnect gave up after {} attempt(s)",
                    inner.config.max_reconnect_attempts
                );
                let _ = inner.state.transition(ConnectionState::Disconnected);
                return;
            }
            Reconnect::Closed => return,
        }
    }
}

async fn reconnect(
    inner: &ClientInner,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Reconnect {
    let policy = inner.config.reconnect_policy();
    for attempt in 1..=inner.config.max_reconnect_attempts {
        let deadline = Instant::now() + policy.delay_for(attempt);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                command = commands.recv() => match command {
                    Some(Command::Close) | None => return Reconnect::Closed,
                    // Rejoin covers whatever is registered at that point
                    Some(_) => {}
                },
            }
        }

        match inner.transport.connect().await {
            Ok(conn) => {
                tracing::info!("Realtime reconnected on attempt {}", attempt);
                return Reconnect::Restored(conn);
            }
            Err(e) => tracing::warn!(
                "Reconnect attempt {}/{} failed: {}",
                attempt,
                inner.config.max_reconnect_attempts,
                e
            ),
        }
    }
    Reconnect::Exhausted
}

async fn send_frame(
    conn: &mut dyn RealtimeConnection,
    frame: &PhoenixFrame,
) -> Result<(), RealtimeError> {
    conn.send(frame.encode()?).await?;
    Ok(())
}

async fn join_registered(
    inner: &ClientInner,
    conn: &mut dyn RealtimeConnection,
    joined: &mut HashSet<String>,
    refs: &mut RefCounter,
) -> Result<(), RealtimeError> {
    let token = inner.access_token.lock().clone();
    for (topic, filter) in inner.registry.snapshot() {
        send_frame(conn, &join_frame(&topic, &filter, token.as_deref(), &refs.next())).await?;
        joined.insert(topic);
    }
    Ok(())
}

async fn session_loop(
    inner: &ClientInner,
    conn: &mut dyn RealtimeConnection,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    joined: &mut HashSet<String>,
    refs: &mut RefCounter,
) -> SessionEnd {
    let period = inner.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending_heartbeat: Option<String> = None;

    loop {
        let result = tokio::select! {
            incoming = conn.recv() => match incoming {
                Ok(Some(text)) => {
                    handle_frame(inner, conn, &text, &mut pending_heartbeat, joined, refs).await
                }
                Ok(None) => return SessionEnd::Lost("closed by server".into()),
                Err(e) => return SessionEnd::Lost(e.to_string()),
            },
            command = commands.recv() => match command {
                Some(Command::Join(topic, filter)) => {
                    if joined.insert(topic.clone()) {
                        let token = inner.access_token.lock().clone();
                        let frame = join_frame(&topic, &filter, token.as_deref(), &refs.next());
                        send_frame(conn, &frame).await
                    } else {
                        Ok(())
                    }
                }
                Some(Command::Leave(topic)) => {
                    if joined.remove(&topic) {
                        send_frame(conn, &leave_frame(&topic, &refs.next())).await
                    } else {
                        Ok(())
                    }
                }
                Some(Command::Close) | None => return SessionEnd::Closed,
            },
            _ = heartbeat.tick() => {
                if let Some(reference) = pending_heartbeat.take() {
                    return SessionEnd::Lost(format!("heartbeat {} not acknowledged", reference));
                }
                let reference = refs.next();
                pending_heartbeat = Some(reference.clone());
                send_frame(conn, &heartbeat_frame(&reference)).await
            }
        };

        if let Err(e) = result {
            return SessionEnd::Lost(e.to_string());
        }
    }
}

async fn handle_frame(
    inner: &ClientInner,
    conn: &mut dyn RealtimeConnection,
    text: &str,
    pending_heartbeat: &mut Option<String>,
    joined: &mut HashSet<String>,
    refs: &mut RefCounter,
) -> Result<(), RealtimeError> {
    let message = match ServerMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Ignoring realtime frame: {}", e);
            return Ok(());
        }
    };

    match message {
        ServerMessage::Reply {
            topic,
            reference,
            ok,
            response,
        } => {
            if topic == HEARTBEAT_TOPIC {
                if reference.is_some() && *pending_heartbeat == reference {
                    *pending_heartbeat = None;
                }
            } else if !ok {
                tracing::warn!("Channel {} rejected: {}", topic, response);
            }
        }
        ServerMessage::Change { topic, event } => {
            inner.registry.dispatch(&topic, event);
        }
        ServerMessage::ChannelError { topic } => {
            if let Some(filter) = inner.registry.filter_for(&topic) {
                tracing::warn!("Channel {} errored; rejoining", topic);
                let token = inner.access_token.lock().clone();
                send_frame(conn, &join_frame(&topic, &filter, token.as_deref(), &refs.next()))
                    .await?;
            }
        }
        ServerMessage::ChannelClose { topic } => {
            joined.remove(&topic);
            tracing::debug!("Channel {} closed", topic);
        }
        ServerMessage::Other(frame) => {
            tracing::trace!("Unhandled realtime event {} on {}", frame.event, frame.topic);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::protocol::{change_frame, ChangeEventType, EVENT_JOIN, EVENT_LEAVE};
    use crate::realtime::transport::{MemoryPeer, MemoryServer, MemoryTransport};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> RealtimeConfig {
        RealtimeConfig {
            heartbeat_interval: Duration::from_secs(60),
            reconnect_base_delay: Duration::from_millis(10),
            reconnect_max_delay: Duration::from_millis(40),
            max_reconnect_attempts: 3,
        }
    }

    fn insert(table: &str, id: u64) -> ChangeEvent {
        ChangeEvent {
            event_type: ChangeEventType::Insert,
            schema: Some("public".into()),
            table: table.into(),
            new: Some(json!({ "id": id })),
            old: None,
            commit_timestamp: None,
        }
    }

    async fn connected(config: RealtimeConfig) -> (RealtimeClient, MemoryServer, MemoryPeer) {
        let (transport, mut server) = MemoryTransport::pair();
        let client = RealtimeClient::new(Arc::new(transport), config);
        client.connect().await.unwrap();
        let peer = server.accept().await.unwrap();
        (client, server, peer)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn wait_for_state(reader: &mut ConnectionStateReader, want: ConnectionState) {
        tokio::time::timeout(WAIT, async {
            while reader.current() != want {
                if reader.changed().await.is_none() {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(reader.current(), want);
    }

    #[tokio::test]
    async fn test_subscribe_delivers_in_order() {
        let (client, _server, mut peer) = connected(fast_config()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = client.subscribe(TopicFilter::table("incidents"), move |e| {
            let _ = tx.send(e.row_id());
        });

        let join = peer.expect_event(EVENT_JOIN).await.unwrap();
        assert_eq!(join.topic, handle.topic());
        for id in 1..=3 {
            peer.push(&change_frame(handle.topic(), &insert("incidents", id)));
        }
        for id in 1..=3 {
            let got = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(got, Some(id.to_string()));
        }
    }

    #[tokio::test]
    async fn test_no_delivery_after_unsubscribe() {
        let (client, _server, mut peer) = connected(fast_config()).await;
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = client.subscribe(TopicFilter::table("incidents"), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        peer.expect_event(EVENT_JOIN).await.unwrap();

        client.unsubscribe(&handle);
        assert!(!handle.is_active());
        let leave = peer.expect_event(EVENT_LEAVE).await.unwrap();
        assert_eq!(leave.topic, handle.topic());

        peer.push(&change_frame(handle.topic(), &insert("incidents", 1)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(client.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_rejoins_and_fires_hook_once() {
        let (client, mut server, mut peer) = connected(fast_config()).await;
        let hooks = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hooks);
        let _hook = client.on_reconnect(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let sub = client.subscribe(TopicFilter::table("volunteer_locations"), |_| {});
        peer.expect_event(EVENT_JOIN).await.unwrap();

        drop(peer);
        let mut peer = tokio::time::timeout(WAIT, server.accept()).await.unwrap().unwrap();
        let rejoin = peer.expect_event(EVENT_JOIN).await.unwrap();
        assert_eq!(rejoin.topic, sub.topic());

        wait_until(|| hooks.load(Ordering::SeqCst) == 1).await;
        assert_eq!(client.state(), ConnectionState::Connected);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (client, server, peer) = connected(fast_config()).await;
        let mut reader = client.state_reader();
        server.refuse_next(10);
        drop(peer);

        wait_for_state(&mut reader, ConnectionState::Disconnected).await;
        // One initial connect plus three refused reconnects
        assert_eq!(server.attempts(), 4);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_disconnected() {
        let (transport, server) = MemoryTransport::pair();
        server.refuse_next(1);
        let client = RealtimeClient::new(Arc::new(transport), fast_config());
        assert!(client.connect().await.is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_missed_heartbeat_triggers_reconnect() {
        let config = RealtimeConfig {
            heartbeat_interval: Duration::from_millis(20),
            ..fast_config()
        };
        // The first peer never answers heartbeats
        let (client, mut server, _silent_peer) = connected(config).await;
        let hooks = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hooks);
        let _hook = client.on_reconnect(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let mut next = tokio::time::timeout(WAIT, server.accept()).await.unwrap().unwrap();
        let serve = tokio::spawn(async move {
            let _ = next.expect_event("never").await;
        });
        wait_until(|| hooks.load(Ordering::SeqCst) >= 1).await;
        assert_eq!(server.attempts(), 2);
        serve.abort();
    }

    #[tokio::test]
    async fn test_disconnect_is_terminal_until_connect() {
        let (client, server, _peer) = connected(fast_config()).await;
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.attempts(), 1);
    }
}
