//! In-process host transport
//!
//! `MemoryHost` answers commands through a pluggable `CommandHandler` and
//! publishes events on an `EventBus`. Every command is journaled before the
//! handler sees it, so callers can inspect exactly what went over the wire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use deckhand_types::{
    BridgeCommand, PtyClosedEvent, PtyOutputEvent, SeqValue, TERMINAL_CLOSED_EVENT,
    TERMINAL_OUTPUT_EVENT,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{HostTransport, Listener, ListenerId};
use crate::wire::encode_payload;

/// Shared, unfiltered event bus keyed by event name
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusState>>,
}

#[derive(Default)]
struct BusState {
    next_id: ListenerId,
    listeners: HashMap<ListenerId, (String, mpsc::UnboundedSender<Value>)>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self, event: &str) -> Listener {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.next_id += 1;
        let id = state.next_id;
        state.listeners.insert(id, (event.to_string(), tx));
        Listener { id, events: rx }
    }

    pub fn unlisten(&self, id: ListenerId) {
        if let Ok(mut state) = self.inner.lock() {
            state.listeners.remove(&id);
        }
    }

    /// Publish a payload to every listener of `event`.
    /// Returns how many listeners received it.
    pub fn emit(&self, event: &str, payload: Value) -> usize {
        let Ok(mut state) = self.inner.lock() else {
            return 0;
        };
        let mut delivered = 0;
        // Receivers dropped without unlisten are pruned here
        state.listeners.retain(|_, (name, tx)| {
            if name != event {
                return true;
            }
            if tx.send(payload.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                false
            }
        });
        delivered
    }

    pub fn emit_output(&self, session_id: &str, seq: u64, data: &[u8]) -> usize {
        let event = PtyOutputEvent {
            session_id: session_id.to_string(),
            seq: SeqValue::Number(seq),
            data: encode_payload(data),
        };
        self.emit(TERMINAL_OUTPUT_EVENT, json!(event))
    }

    pub fn emit_closed(&self, session_id: &str, exit_code: u32) -> usize {
        let event = PtyClosedEvent {
            session_id: session_id.to_string(),
            exit_code,
        };
        self.emit(TERMINAL_CLOSED_EVENT, json!(event))
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .lock()
            .map(|state| {
                state
                    .listeners
                    .values()
                    .filter(|(name, _)| name == event)
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Host-side behaviour for commands sent to a `MemoryHost`
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &str, args: &Value) -> Result<Value, TransportError>;
}

/// Accepts every command.
///
/// Replay requests get an empty page and the human-supervised start gets a
/// fixed agent session binding.
pub struct AcceptAll;

#[async_trait]
impl CommandHandler for AcceptAll {
    async fn handle(&self, command: &str, _args: &Value) -> Result<Value, TransportError> {
        Ok(default_response(command))
    }
}

/// Response a well-behaved host gives when it has nothing else to say
pub fn default_response(command: &str) -> Value {
    match BridgeCommand::from_name(command) {
        Some(BridgeCommand::ReplayOutput) => json!({
            "chunks": [],
            "hasMore": false,
            "truncated": false,
            "truncatedUntilSeq": null
        }),
        Some(BridgeCommand::StartHumanSession) => json!({
            "agentSessionId": "agent-session-1",
            "agentSessionNumber": 1
        }),
        _ => Value::Null,
    }
}

/// One command as the host received it
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub command: String,
    pub args: Value,
}

pub struct MemoryHost {
    bus: EventBus,
    handler: Arc<dyn CommandHandler>,
    journal: Mutex<Vec<Invocation>>,
}

impl std::fmt::Debug for MemoryHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHost")
            .field("output_listeners", &self.bus.listener_count(TERMINAL_OUTPUT_EVENT))
            .field("closed_listeners", &self.bus.listener_count(TERMINAL_CLOSED_EVENT))
            .finish()
    }
}

impl MemoryHost {
    /// Create a host that accepts every command
    pub fn new() -> Self {
        Self::with_handler(EventBus::new(), Arc::new(AcceptAll))
    }

    pub fn with_handler(bus: EventBus, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            bus,
            handler,
            journal: Mutex::new(Vec::new()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Every command received so far, in arrival order
    pub fn invocations(&self) -> Vec<Invocation> {
        self.journal
            .lock()
            .map(|journal| journal.clone())
            .unwrap_or_default()
    }

    /// Commands received under one protocol name
    pub fn invocations_of(&self, command: BridgeCommand) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|invocation| invocation.command == command.as_str())
            .collect()
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostTransport for MemoryHost {
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, TransportError> {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(Invocation {
                command: command.to_string(),
                args: args.clone(),
            });
        }
        self.handler.handle(command, &args).await
    }

    async fn listen(&self, event: &str) -> Result<Listener, TransportError> {
        Ok(self.bus.listen(event))
    }

    fn unlisten(&self, id: ListenerId) {
        self.bus.unlisten(id);
    }

    fn transport_name(&self) -> &str {
        "memory"
    }
}
