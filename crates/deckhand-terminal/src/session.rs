//! Session controller
//!
//! Owns one bridge session for the lifetime of a mounted terminal tab. The
//! public handle only posts commands; a driver task owns the
//! [`SessionMachine`] and is the single place where events, start results and
//! consumer calls are applied, in arrival order.
//!
//! Outgoing requests that must reach the host in order (input, resize,
//! stream mode, terminate) go through one sequential outbox task. Start and
//! replay requests run on their own tasks and post their result back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use deckhand_types::{StartHumanSessionResult, StreamMode};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::BridgeConfig;
use crate::error::{FrameError, TransportError};
use crate::launch::SessionConfig;
use crate::machine::{Effect, LifecycleState, OutputChunk, ReplayBatch, SessionMachine};
use crate::wire::{decode_payload, BridgeClient, ClosedSubscription, OutputSubscription, StartAck};

/// Callbacks a consumer registers for one session.
///
/// Called from the session's driver task; keep them short and non-blocking.
pub trait SessionHandlers: Send + Sync {
    fn on_started(&self) {}

    fn on_output(&self, _data: &[u8]) {}

    fn on_closed(&self, _exit_code: u32) {}

    fn on_error(&self, _message: &str) {}

    /// The host bound a human-supervised start to an agent session
    fn on_agent_session(&self, _session: &StartHumanSessionResult) {}
}

enum Command {
    MarkReady,
    SendInput(String),
    Resize { cols: u16, rows: u16 },
    SetActive(bool),
    StartSettled(Result<StartAck, TransportError>),
    ReplaySettled(Result<ReplayBatch, String>),
    Unmount(Option<oneshot::Sender<()>>),
}

enum Outgoing {
    Input(String),
    Resize { cols: u16, rows: u16 },
    StreamMode(StreamMode),
    Terminate,
    /// Acknowledged once everything queued before it was sent
    Barrier(oneshot::Sender<()>),
}

pub struct SessionController {
    session_id: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LifecycleState>,
    driver: JoinHandle<()>,
    unmounted: bool,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("session_id", &self.session_id)
            .field("state", &*self.state.borrow())
            .field("unmounted", &self.unmounted)
            .finish()
    }
}

impl SessionController {
    /// Mount a session: subscribe to its events, then ask the host to start it.
    ///
    /// Must be called from within a tokio runtime. The handle can be used
    /// immediately; calls made before the session starts are queued.
    pub fn mount(
        client: BridgeClient,
        config: SessionConfig,
        bridge: Arc<BridgeConfig>,
        handlers: Arc<dyn SessionHandlers>,
    ) -> Self {
        let session_id = config.session_id.clone();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(LifecycleState::Initializing);
        let disposed = Arc::new(AtomicBool::new(false));

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_outbox(
            client.clone(),
            session_id.clone(),
            handlers.clone(),
            outbox_rx,
            disposed.clone(),
        ));

        log::debug!(
            "[terminal_bridge] mount session={} mode={} enabled={} active={}",
            session_id,
            config.launch.name(),
            config.enabled,
            config.active
        );
        let driver = Driver {
            machine: SessionMachine::new(session_id.clone(), bridge.buffer_limit(), config.active),
            client,
            config,
            bridge,
            handlers,
            loopback: commands.clone(),
            outbox,
            state: state_tx,
            disposed,
            start_deadline: None,
        };
        let driver = tokio::spawn(driver.run(command_rx));

        Self {
            session_id,
            commands,
            state,
            driver,
            unmounted: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Lifecycle state as of the last applied event
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `target`.
    /// Returns false if the driver stopped first.
    pub async fn wait_for_state(&mut self, target: LifecycleState) -> bool {
        self.state.wait_for(|state| *state == target).await.is_ok()
    }

    fn post(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::trace!(
                "[terminal_bridge] session {} driver gone; command dropped",
                self.session_id
            );
        }
    }

    /// The consumer can render output now
    pub fn mark_ready(&self) {
        self.post(Command::MarkReady);
    }

    pub fn send_input(&self, text: impl Into<String>) {
        self.post(Command::SendInput(text.into()));
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        self.post(Command::Resize { cols, rows });
    }

    /// Tell the session whether its tab is visible
    pub fn set_active(&self, active: bool) {
        self.post(Command::SetActive(active));
    }

    /// Terminate the session and release its subscriptions.
    /// Resolves once the terminate request has been sent.
    pub async fn unmount(mut self) {
        self.unmounted = true;
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Unmount(Some(ack))).is_ok() {
            let _ = done.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.driver.is_finished()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if !self.unmounted {
            let _ = self.commands.send(Command::Unmount(None));
        }
    }
}

struct Driver {
    client: BridgeClient,
    config: SessionConfig,
    bridge: Arc<BridgeConfig>,
    handlers: Arc<dyn SessionHandlers>,
    machine: SessionMachine,
    loopback: mpsc::UnboundedSender<Command>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    state: watch::Sender<LifecycleState>,
    disposed: Arc<AtomicBool>,
    start_deadline: Option<Instant>,
}

async fn next_output(
    subscription: &mut Option<OutputSubscription>,
) -> Option<Result<OutputChunk, FrameError>> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

async fn next_closed(subscription: &mut Option<ClosedSubscription>) -> Option<u32> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

impl Driver {
    fn session_id(&self) -> &str {
        &self.config.session_id
    }

    async fn subscribe(&self) -> Result<(OutputSubscription, ClosedSubscription), TransportError> {
        let output = self.client.listen_output(self.session_id()).await?;
        let closed = self.client.listen_closed(self.session_id()).await?;
        Ok((output, closed))
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        // Both listeners are live before the start request goes out
        let (mut output, mut closed) = match self.subscribe().await {
            Ok((output, closed)) => (Some(output), Some(closed)),
            Err(err) => {
                self.handlers
                    .on_error(&format!("failed to subscribe to terminal events: {}", err));
                (None, None)
            }
        };

        if output.is_some() && self.config.enabled {
            self.issue_start();
        } else if !self.config.enabled {
            log::debug!(
                "[terminal_bridge] session {} disabled; not starting",
                self.session_id()
            );
        }

        loop {
            let timeout_armed = self.start_deadline.is_some()
                && self.machine.state() == LifecycleState::AwaitingStartAck;
            let deadline = self.start_deadline.unwrap_or_else(Instant::now);

            // Output is polled ahead of closed so a closed event never
            // overtakes output the host published before it
            tokio::select! {
                biased;

                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if self.handle_command(command) {
                        break;
                    }
                }
                event = next_output(&mut output) => match event {
                    Some(frame) => self.handle_frame(frame),
                    None => output = None,
                },
                event = next_closed(&mut closed) => match event {
                    Some(exit_code) => {
                        if let Some(output) = output.as_mut() {
                            while let Some(frame) = output.try_next() {
                                self.handle_frame(frame);
                            }
                        }
                        let effects = self.machine.closed(exit_code);
                        self.apply(effects);
                    }
                    None => closed = None,
                },
                _ = tokio::time::sleep_until(deadline), if timeout_armed => {
                    self.start_deadline = None;
                    let message = format!(
                        "terminal session did not start within {} ms",
                        self.bridge.start_timeout_ms.unwrap_or_default()
                    );
                    let effects = self.machine.start_timed_out(message);
                    self.apply(effects);
                }
            }
        }

        // Dropping the subscriptions unregisters both listeners
        drop(output);
        drop(closed);
        log::debug!("[terminal_bridge] session {} driver stopped", self.session_id());
    }

    fn issue_start(&mut self) {
        if !self.machine.begin_start() {
            return;
        }
        self.publish_state();
        self.start_deadline = self
            .bridge
            .start_timeout()
            .map(|timeout| Instant::now() + timeout);

        let client = self.client.clone();
        let config = self.config.clone();
        let loopback = self.loopback.clone();
        tokio::spawn(async move {
            let outcome = config.start(&client).await;
            // The driver may be gone by now; the result is then irrelevant
            let _ = loopback.send(Command::StartSettled(outcome));
        });
    }

    fn handle_frame(&mut self, frame: Result<OutputChunk, FrameError>) {
        match frame {
            Ok(chunk) => {
                let effects = self.machine.output(chunk);
                self.apply(effects);
            }
            Err(err) => self.handlers.on_error(&err.to_string()),
        }
    }

    /// Apply one command; returns true when the driver should stop
    fn handle_command(&mut self, command: Command) -> bool {
        let effects = match command {
            Command::MarkReady => self.machine.mark_ready(),
            Command::SendInput(text) => self.machine.send_input(text),
            Command::Resize { cols, rows } => self.machine.resize(cols, rows),
            Command::SetActive(active) => self.machine.set_active(active),
            Command::StartSettled(Ok(ack)) => {
                if let StartAck::AgentSession(session) = &ack {
                    log::debug!(
                        "[terminal_bridge] session {} bound to agent session {} (#{})",
                        self.session_id(),
                        session.agent_session_id,
                        session.agent_session_number
                    );
                    self.handlers.on_agent_session(session);
                }
                self.machine.start_resolved()
            }
            Command::StartSettled(Err(err)) => self.machine.start_rejected(err.to_string()),
            Command::ReplaySettled(outcome) => self.machine.replay_settled(outcome),
            Command::Unmount(ack) => {
                self.disposed.store(true, Ordering::SeqCst);
                let effects = self.machine.unmount();
                self.apply(effects);
                if let Some(ack) = ack {
                    self.send_out(Outgoing::Barrier(ack));
                }
                log::debug!("[terminal_bridge] unmount session={}", self.session_id());
                return true;
            }
        };
        self.apply(effects);
        false
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::SendInput(text) => self.send_out(Outgoing::Input(text)),
                Effect::Resize { cols, rows } => self.send_out(Outgoing::Resize { cols, rows }),
                Effect::SetStreamMode(mode) => self.send_out(Outgoing::StreamMode(mode)),
                Effect::Terminate => self.send_out(Outgoing::Terminate),
                Effect::Replay { after_seq } => self.spawn_replay(after_seq),
                Effect::Started => self.handlers.on_started(),
                Effect::Output(data) => self.handlers.on_output(&data),
                Effect::Closed(exit_code) => self.handlers.on_closed(exit_code),
                Effect::Error(message) => self.handlers.on_error(&message),
            }
        }
        self.publish_state();
    }

    fn publish_state(&self) {
        let state = self.machine.state();
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn send_out(&self, item: Outgoing) {
        if self.outbox.send(item).is_err() {
            log::warn!(
                "[terminal_bridge] outbox closed for session {}",
                self.session_id()
            );
        }
    }

    fn spawn_replay(&self, after_seq: u64) {
        let client = self.client.clone();
        let session_id = self.session_id().to_string();
        let page_size = self.bridge.replay_limit();
        let max_pages = self.bridge.replay_max_pages.max(1);
        let loopback = self.loopback.clone();
        tokio::spawn(async move {
            let outcome = fetch_replay(&client, &session_id, after_seq, page_size, max_pages)
                .await
                .map_err(|err| format!("failed to replay output: {}", err));
            let _ = loopback.send(Command::ReplaySettled(outcome));
        });
    }
}

/// Page through held-back output until the host has no more or the page cap is hit
async fn fetch_replay(
    client: &BridgeClient,
    session_id: &str,
    after_seq: u64,
    page_size: u32,
    max_pages: u32,
) -> Result<ReplayBatch, TransportError> {
    let mut batch = ReplayBatch::default();
    let mut cursor = after_seq;

    for _ in 0..max_pages {
        let page = client.replay_output(session_id, cursor, page_size).await?;
        if page.truncated {
            if let Some(until) = page.truncated_until_seq.as_ref().and_then(|seq| seq.as_u64()) {
                batch.truncated_until = Some(batch.truncated_until.map_or(until, |t| t.max(until)));
            }
        }

        let received = page.chunks.len();
        for chunk in page.chunks {
            let Some(seq) = chunk.seq.as_u64() else {
                log::warn!(
                    "[terminal_bridge] skipping replayed chunk with invalid seq `{}` for {}",
                    chunk.seq,
                    session_id
                );
                continue;
            };
            cursor = cursor.max(seq);
            batch.chunks.push(OutputChunk {
                seq,
                data: decode_payload(&chunk.data),
            });
        }
        log::debug!(
            "[terminal_bridge] rx.replay session={} chunks={} has_more={}",
            session_id,
            received,
            page.has_more
        );

        if !page.has_more || received == 0 {
            return Ok(batch);
        }
    }

    log::warn!(
        "[terminal_bridge] replay for {} stopped after {} pages",
        session_id,
        max_pages
    );
    Ok(batch)
}

async fn run_outbox(
    client: BridgeClient,
    session_id: String,
    handlers: Arc<dyn SessionHandlers>,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    disposed: Arc<AtomicBool>,
) {
    while let Some(item) = queue.recv().await {
        match item {
            Outgoing::Input(text) => {
                if let Err(err) = client.send_input(&session_id, &text).await {
                    if disposed.load(Ordering::SeqCst) {
                        log::debug!(
                            "[terminal_bridge] input failed after unmount for {}: {}",
                            session_id,
                            err
                        );
                    } else {
                        handlers.on_error(&err.to_string());
                    }
                }
            }
            Outgoing::Resize { cols, rows } => client.resize(&session_id, cols, rows).await,
            Outgoing::StreamMode(mode) => {
                if let Err(err) = client.set_stream_mode(&session_id, mode).await {
                    log::warn!(
                        "[terminal_bridge] set stream mode {} failed for {}: {}",
                        mode,
                        session_id,
                        err
                    );
                }
            }
            Outgoing::Terminate => client.terminate(&session_id).await,
            Outgoing::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
