//! Transport seam for the realtime channel.
//!
//! The client speaks text frames over a [`RealtimeConnection`]. Production
//! uses the websocket transport; [`MemoryTransport`] wires the client to an
//! in-process peer for tests and offline demos.

use super::protocol::{heartbeat_frame, reply_frame, PhoenixFrame, EVENT_HEARTBEAT, EVENT_JOIN};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Connection lost: {0}")]
    Io(String),
}

/// Opens realtime connections.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RealtimeConnection>, TransportError>;
}

/// One open connection carrying text frames.
#[async_trait]
pub trait RealtimeConnection: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;
    /// Next text frame; `Ok(None)` once the peer closed the connection.
    /// Must be cancel-safe.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;
    async fn close(&mut self);
}

struct MemoryShared {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refuse_next: u32,
    attempts: u32,
}

/// In-process transport. Every successful `connect` hands a [`MemoryPeer`]
/// to the paired [`MemoryServer`].
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Mutex<MemoryShared>>,
}

/// Accepting side of a [`MemoryTransport`].
pub struct MemoryServer {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
    shared: Arc<Mutex<MemoryShared>>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(MemoryShared {
            peers: tx,
            refuse_next: 0,
            attempts: 0,
        }));
        (
            MemoryTransport {
                shared: Arc::clone(&shared),
            },
            MemoryServer { peers: rx, shared },
        )
    }
}

#[async_trait]
impl RealtimeTransport for MemoryTransport {
    async fn connect(&self) -> Result<Box<dyn RealtimeConnection>, TransportError> {
        let mut shared = self.shared.lock();
        shared.attempts += 1;
        if shared.refuse_next > 0 {
            shared.refuse_next -= 1;
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        shared
            .peers
            .send(MemoryPeer {
                incoming: server_rx,
                outgoing: server_tx,
            })
            .map_err(|_| TransportError::Connect("server gone".into()))?;

        Ok(Box::new(MemoryConnection {
            outgoing: client_tx,
            incoming: client_rx,
        }))
    }
}

impl MemoryServer {
    /// Wait for the client's next connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next(&self, n: u32) {
        self.shared.lock().refuse_next = n;
    }

    /// Connection attempts seen so far, refused ones included.
    pub fn attempts(&self) -> u32 {
        self.shared.lock().attempts
    }
}

struct MemoryConnection {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl RealtimeConnection for MemoryConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outgoing
            .send(text)
            .map_err(|_| TransportError::Io("peer closed".into()))
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.incoming.recv().await)
    }

    async fn close(&mut self) {
        self.incoming.close();
    }
}

/// Server end of one in-memory connection. Dropping it drops the connection.
pub struct MemoryPeer {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
}

impl MemoryPeer {
    /// Next frame from the client other than a heartbeat. Heartbeats and
    /// joins are acknowledged automatically; joins are still returned.
    pub async fn next_frame(&mut self) -> Option<PhoenixFrame> {
        loop {
            let text = self.incoming.recv().await?;
            let Ok(frame) = PhoenixFrame::decode(&text) else {
                continue;
            };
            if frame.event == EVENT_HEARTBEAT {
                self.push(&reply_frame(&frame, true));
                continue;
            }
            if frame.event == EVENT_JOIN {
                self.push(&reply_frame(&frame, true));
            }
            return Some(frame);
        }
    }

    /// Wait for a frame with the given event name, skipping others.
    pub async fn expect_event(&mut self, event: &str) -> Option<PhoenixFrame> {
        loop {
            let frame = self.next_frame().await?;
            if frame.event == event {
                return Some(frame);
            }
        }
    }

    pub fn push(&self, frame: &PhoenixFrame) {
        if let Ok(text) = frame.encode() {
            let _ = self.outgoing.send(text);
        }
    }

    pub fn push_raw(&self, text: impl Into<String>) {
        let _ = self.outgoing.send(text.into());
    }

    /// Send an unsolicited heartbeat, which clients ignore.
    pub fn ping(&self) {
        self.push(&heartbeat_frame("server"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_round_trip() {
        let (transport, mut server) = MemoryTransport::pair();
        let mut conn = transport.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();

        conn.send(heartbeat_frame("1").encode().unwrap()).await.unwrap();
        conn.send(
            PhoenixFrame::new("t", "custom", serde_json::json!({}))
                .encode()
                .unwrap(),
        )
        .await
        .unwrap();
        let frame = peer.next_frame().await.unwrap();
        assert_eq!(frame.event, "custom");

        // The heartbeat was answered
        let reply = conn.recv().await.unwrap().unwrap();
        assert!(reply.contains("phx_reply"));

        drop(peer);
        assert_eq!(conn.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refused_connections() {
        let (transport, server) = MemoryTransport::pair();
        server.refuse_next(2);
        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_ok());
        assert_eq!(server.attempts(), 3);
    }
}
