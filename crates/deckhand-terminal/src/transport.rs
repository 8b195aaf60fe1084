//! Host transport abstraction
//!
//! The session host is reached through two primitives: request/response
//! commands and a shared event bus. Every bridge operation is built on top
//! of these, so an IPC bridge, a socket or an in-process host can sit here.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Identifies one event listener registered on a transport
pub type ListenerId = u64;

/// A live registration on the host event bus.
///
/// Receives every payload published under the event name it was created
/// for, regardless of which session the payload belongs to.
#[derive(Debug)]
pub struct Listener {
    pub id: ListenerId,
    pub events: mpsc::UnboundedReceiver<Value>,
}

#[async_trait]
pub trait HostTransport: Send + Sync {
    /// Send a command and wait for the host to acknowledge it
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, TransportError>;

    /// Register a listener for an event name.
    /// Resolves once the registration is active on the host side.
    async fn listen(&self, event: &str) -> Result<Listener, TransportError>;

    /// Drop a listener registration; unknown ids are ignored
    fn unlisten(&self, id: ListenerId);

    /// Get transport name for debugging
    fn transport_name(&self) -> &str;
}
