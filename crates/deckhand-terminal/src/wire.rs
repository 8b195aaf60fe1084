//! Wire client for the terminal bridge
//!
//! Maps bridge intents onto host commands and events. No retries and no
//! session policy live here; the controller decides what a failure means.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use deckhand_types::{
    BridgeCommand, EmitSystemMessageArgs, PtyClosedEvent, PtyOutputEvent, ReplayOutputArgs,
    ReplayOutputResult, ResizeArgs, SendInputArgs, SetStreamModeArgs, StartHumanSessionArgs,
    StartHumanSessionResult, StartSessionArgs, StartTaskSessionArgs, StreamMode, TerminateArgs,
    TERMINAL_CLOSED_EVENT, TERMINAL_OUTPUT_EVENT,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{FrameError, TransportError};
use crate::machine::OutputChunk;
use crate::transport::{HostTransport, Listener, ListenerId};

const LOG_PREFIX: &str = "[terminal_bridge]";
const PREVIEW_CHARS: usize = 220;
const INPUT_PREVIEW_CHARS: usize = 140;

/// Decode a base64 output payload.
///
/// Payloads that are not valid base64 are passed through as raw text so a
/// misbehaving host still shows something on screen.
pub fn decode_payload(data: &str) -> Vec<u8> {
    match STANDARD.decode(data) {
        Ok(bytes) => bytes,
        Err(err) => {
            log::debug!("{} rx.output.decode_fallback error={}", LOG_PREFIX, err);
            data.as_bytes().to_vec()
        }
    }
}

pub fn encode_payload(data: &[u8]) -> String {
    STANDARD.encode(data)
}

fn preview(bytes: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.chars().count() <= max_chars {
        return text.into_owned();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push('…');
    cut
}

/// What the host said when it accepted a start request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartAck {
    Accepted,
    AgentSession(StartHumanSessionResult),
}

#[derive(Clone)]
pub struct BridgeClient {
    transport: Arc<dyn HostTransport>,
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("transport", &self.transport.transport_name())
            .finish()
    }
}

impl BridgeClient {
    pub fn new(transport: Arc<dyn HostTransport>) -> Self {
        Self { transport }
    }

    async fn call<A, R>(&self, command: BridgeCommand, args: &A) -> Result<R, TransportError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = serde_json::to_value(args).map_err(|e| TransportError::Encode {
            command: command.as_str().to_string(),
            message: e.to_string(),
        })?;
        let response = self.transport.invoke(command.as_str(), args).await?;
        serde_json::from_value(response).map_err(|e| TransportError::Decode {
            command: command.as_str().to_string(),
            message: e.to_string(),
        })
    }

    /// Issue a command whose response carries nothing of interest
    async fn call_unit<A: Serialize>(
        &self,
        command: BridgeCommand,
        args: &A,
    ) -> Result<(), TransportError> {
        let _: serde::de::IgnoredAny = self.call(command, args).await?;
        Ok(())
    }

    /// Start an interactive agent session.
    /// Resolves when the host has accepted the request, not when output flows.
    pub async fn start_session(&self, args: &StartSessionArgs) -> Result<(), TransportError> {
        log::debug!("{} tx.startSession {:?}", LOG_PREFIX, args);
        self.call_unit(BridgeCommand::StartSession, args).await
    }

    /// Start an agent session bound to a task
    pub async fn start_task_session(
        &self,
        args: &StartTaskSessionArgs,
    ) -> Result<(), TransportError> {
        log::debug!("{} tx.startTaskSession {:?}", LOG_PREFIX, args);
        self.call_unit(BridgeCommand::StartTaskSession, args).await
    }

    /// Start a human-supervised session; the host reports the agent session it created
    pub async fn start_human_session(
        &self,
        args: &StartHumanSessionArgs,
    ) -> Result<StartHumanSessionResult, TransportError> {
        log::debug!("{} tx.startHumanSession {:?}", LOG_PREFIX, args);
        let result: StartHumanSessionResult =
            self.call(BridgeCommand::StartHumanSession, args).await?;
        log::debug!("{} tx.startHumanSession.result {:?}", LOG_PREFIX, result);
        Ok(result)
    }

    /// Send typed input as one UTF-8 byte transmission
    pub async fn send_input(&self, session_id: &str, text: &str) -> Result<(), TransportError> {
        let args = SendInputArgs {
            session_id: session_id.to_string(),
            data: text.as_bytes().to_vec(),
        };
        log::debug!(
            "{} tx.sendInput session={} bytes={} preview={:?}",
            LOG_PREFIX,
            session_id,
            args.data.len(),
            preview(&args.data, INPUT_PREVIEW_CHARS)
        );
        self.call_unit(BridgeCommand::SendInput, &args).await
    }

    /// Best effort: a lost resize is corrected by the next one
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        let args = ResizeArgs {
            session_id: session_id.to_string(),
            cols,
            rows,
        };
        log::debug!("{} tx.resize {:?}", LOG_PREFIX, args);
        if let Err(err) = self.call_unit(BridgeCommand::Resize, &args).await {
            log::warn!("{} resize failed for session {}: {}", LOG_PREFIX, session_id, err);
        }
    }

    /// Best effort: the host tears the session down idempotently
    pub async fn terminate(&self, session_id: &str) {
        let args = TerminateArgs {
            session_id: session_id.to_string(),
        };
        log::debug!("{} tx.terminate {:?}", LOG_PREFIX, args);
        if let Err(err) = self.call_unit(BridgeCommand::Terminate, &args).await {
            log::warn!("{} terminate failed for session {}: {}", LOG_PREFIX, session_id, err);
        }
    }

    pub async fn set_stream_mode(
        &self,
        session_id: &str,
        mode: StreamMode,
    ) -> Result<(), TransportError> {
        let args = SetStreamModeArgs {
            session_id: session_id.to_string(),
            mode,
        };
        log::debug!("{} tx.setStreamMode {:?}", LOG_PREFIX, args);
        self.call_unit(BridgeCommand::SetStreamMode, &args).await
    }

    /// Fetch output the host held back, starting after `after_seq`
    pub async fn replay_output(
        &self,
        session_id: &str,
        after_seq: u64,
        limit: u32,
    ) -> Result<ReplayOutputResult, TransportError> {
        let args = ReplayOutputArgs {
            session_id: session_id.to_string(),
            after_seq,
            limit,
        };
        log::debug!("{} tx.replayOutput {:?}", LOG_PREFIX, args);
        self.call(BridgeCommand::ReplayOutput, &args).await
    }

    /// Ask the host to inject a system message into the session's output
    pub async fn emit_system_message(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<(), TransportError> {
        let args = EmitSystemMessageArgs {
            session_id: session_id.to_string(),
            text: text.to_string(),
        };
        log::debug!("{} tx.emitSystemMessage {:?}", LOG_PREFIX, args);
        self.call_unit(BridgeCommand::EmitSystemMessage, &args).await
    }

    /// Subscribe to output for one session.
    /// The returned guard unregisters the listener when dropped.
    pub async fn listen_output(
        &self,
        session_id: &str,
    ) -> Result<OutputSubscription, TransportError> {
        log::debug!("{} rx.output.subscribe session={}", LOG_PREFIX, session_id);
        let listener = self.transport.listen(TERMINAL_OUTPUT_EVENT).await?;
        Ok(OutputSubscription {
            inner: Subscription::new(self.transport.clone(), session_id, listener),
        })
    }

    /// Subscribe to exit notifications for one session
    pub async fn listen_closed(
        &self,
        session_id: &str,
    ) -> Result<ClosedSubscription, TransportError> {
        log::debug!("{} rx.closed.subscribe session={}", LOG_PREFIX, session_id);
        let listener = self.transport.listen(TERMINAL_CLOSED_EVENT).await?;
        Ok(ClosedSubscription {
            inner: Subscription::new(self.transport.clone(), session_id, listener),
        })
    }
}

/// Listener registration scoped to one session id
struct Subscription {
    transport: Arc<dyn HostTransport>,
    session_id: String,
    id: ListenerId,
    events: tokio::sync::mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    fn new(transport: Arc<dyn HostTransport>, session_id: &str, listener: Listener) -> Self {
        Self {
            transport,
            session_id: session_id.to_string(),
            id: listener.id,
            events: listener.events,
        }
    }

    /// Decode a payload, keeping it only if it is addressed to this session
    fn accept<T, F>(&self, payload: Value, session_of: F) -> Option<T>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> &str,
    {
        match serde_json::from_value::<T>(payload) {
            Ok(event) if session_of(&event) == self.session_id => Some(event),
            Ok(_) => None,
            Err(err) => {
                log::debug!("{} rx.malformed error={}", LOG_PREFIX, err);
                None
            }
        }
    }

    /// Next payload of type `T` addressed to this session.
    /// Foreign and malformed payloads are skipped.
    async fn next_for_session<T, F>(&mut self, session_of: F) -> Option<T>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> &str,
    {
        loop {
            let payload = self.events.recv().await?;
            if let Some(event) = self.accept(payload, &session_of) {
                return Some(event);
            }
        }
    }

    /// Like `next_for_session`, but only looks at payloads already queued
    fn try_next_for_session<T, F>(&mut self, session_of: F) -> Option<T>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> &str,
    {
        while let Ok(payload) = self.events.try_recv() {
            if let Some(event) = self.accept(payload, &session_of) {
                return Some(event);
            }
        }
        None
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.transport.unlisten(self.id);
    }
}

/// Output events for one session, decoded to raw bytes
pub struct OutputSubscription {
    inner: Subscription,
}

impl OutputSubscription {
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Wait for the next output chunk.
    /// Returns `None` once the transport stops delivering events.
    pub async fn next(&mut self) -> Option<Result<OutputChunk, FrameError>> {
        let event: PtyOutputEvent = self
            .inner
            .next_for_session(|event: &PtyOutputEvent| event.session_id.as_str())
            .await?;
        Some(Self::frame(event))
    }

    /// Take an output chunk that has already arrived, without waiting.
    ///
    /// Used to drain output published ahead of a closed event, which travels
    /// on its own listener.
    pub fn try_next(&mut self) -> Option<Result<OutputChunk, FrameError>> {
        let event: PtyOutputEvent = self
            .inner
            .try_next_for_session(|event: &PtyOutputEvent| event.session_id.as_str())?;
        Some(Self::frame(event))
    }

    fn frame(event: PtyOutputEvent) -> Result<OutputChunk, FrameError> {
        let Some(seq) = event.seq.as_u64() else {
            return Err(FrameError::InvalidSeq {
                session_id: event.session_id,
                seq: event.seq.to_string(),
            });
        };
        let data = decode_payload(&event.data);
        log::debug!(
            "{} rx.output session={} seq={} bytes={} preview={:?}",
            LOG_PREFIX,
            event.session_id,
            seq,
            data.len(),
            preview(&data, PREVIEW_CHARS)
        );
        Ok(OutputChunk { seq, data })
    }
}

/// Exit notifications for one session
pub struct ClosedSubscription {
    inner: Subscription,
}

impl ClosedSubscription {
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Wait for the exit code of the session's process
    pub async fn next(&mut self) -> Option<u32> {
        let event: PtyClosedEvent = self
            .inner
            .next_for_session(|event: &PtyClosedEvent| event.session_id.as_str())
            .await?;
        log::debug!("{} rx.closed {:?}", LOG_PREFIX, event);
        Some(event.exit_code)
    }
}
