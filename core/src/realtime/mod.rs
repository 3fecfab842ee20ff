//! Realtime subscriptions: connection state, wire protocol and client

pub mod client;
pub mod protocol;
mod registry;
pub mod state;
pub mod transport;
pub mod websocket;

pub use client::{RealtimeClient, RealtimeConfig, RealtimeError, SubscriptionHandle};
pub use protocol::{ChangeEvent, ChangeEventType, ProtocolError, TopicFilter};
pub use state::{
    ConnectionState, ConnectionStateMachine, ConnectionStateReader, InvalidTransition,
    ReconnectHookHandle,
};
pub use transport::{
    MemoryPeer, MemoryServer, MemoryTransport, RealtimeConnection, RealtimeTransport,
    TransportError,
};
pub use websocket::{realtime_endpoint, WebSocketTransport};
