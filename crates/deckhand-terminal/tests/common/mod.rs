#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use deckhand_terminal::memory::default_response;
use deckhand_terminal::{
    BridgeClient, CommandHandler, EventBus, MemoryHost, SessionHandlers, TerminalWidget,
    TransportError,
};
use deckhand_types::{
    BridgeCommand, StartHumanSessionResult, TERMINAL_CLOSED_EVENT, TERMINAL_OUTPUT_EVENT,
};
use serde_json::Value;
use tokio::sync::Notify;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One callback as a consumer saw it
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    Started,
    Output(Vec<u8>),
    Closed(u32),
    Error(String),
    AgentSession(String),
}

#[derive(Default)]
pub struct RecordingHandlers {
    events: Mutex<Vec<Observed>>,
}

impl RecordingHandlers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, event: Observed) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Observed> {
        self.events.lock().unwrap().clone()
    }

    pub fn started_count(&self) -> usize {
        self.count(|e| *e == Observed::Started)
    }

    pub fn closed_codes(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::Closed(code) => Some(code),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::Error(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    /// All output bytes delivered so far, as lossy text
    pub fn output_text(&self) -> String {
        let bytes: Vec<u8> = self
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::Output(data) => Some(data),
                _ => None,
            })
            .flatten()
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn count(&self, predicate: impl Fn(&Observed) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

impl SessionHandlers for RecordingHandlers {
    fn on_started(&self) {
        self.record(Observed::Started);
    }

    fn on_output(&self, data: &[u8]) {
        self.record(Observed::Output(data.to_vec()));
    }

    fn on_closed(&self, exit_code: u32) {
        self.record(Observed::Closed(exit_code));
    }

    fn on_error(&self, message: &str) {
        self.record(Observed::Error(message.to_string()));
    }

    fn on_agent_session(&self, session: &StartHumanSessionResult) {
        self.record(Observed::AgentSession(session.agent_session_id.clone()));
    }
}

/// Host whose start handshake and replay pages are scripted by the test
pub struct ScriptedHandler {
    bus: EventBus,
    start_gate: Option<Arc<Notify>>,
    start_error: Option<String>,
    input_error: Option<String>,
    start_output: Option<Vec<u8>>,
    start_exit: Option<u32>,
    replay_pages: Mutex<VecDeque<Result<Value, String>>>,
    listeners_at_start: Mutex<Option<(usize, usize)>>,
}

impl ScriptedHandler {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            start_gate: None,
            start_error: None,
            input_error: None,
            start_output: None,
            start_exit: None,
            replay_pages: Mutex::new(VecDeque::new()),
            listeners_at_start: Mutex::new(None),
        }
    }

    /// Hold every start request until the gate is notified
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.start_gate = Some(gate);
        self
    }

    pub fn rejecting_start(mut self, message: &str) -> Self {
        self.start_error = Some(message.to_string());
        self
    }

    pub fn rejecting_input(mut self, message: &str) -> Self {
        self.input_error = Some(message.to_string());
        self
    }

    /// Publish output for the session while its start request is handled
    pub fn emitting_on_start(mut self, data: &str) -> Self {
        self.start_output = Some(data.as_bytes().to_vec());
        self
    }

    /// Publish a closed event (after any start output) while handling start
    pub fn exiting_on_start(mut self, exit_code: u32) -> Self {
        self.start_exit = Some(exit_code);
        self
    }

    pub fn push_replay_page(&self, page: Result<Value, String>) {
        self.replay_pages.lock().unwrap().push_back(page);
    }

    /// Output and closed listener counts seen when the start request arrived
    pub fn listeners_at_start(&self) -> Option<(usize, usize)> {
        *self.listeners_at_start.lock().unwrap()
    }
}

#[async_trait]
impl CommandHandler for ScriptedHandler {
    async fn handle(&self, command: &str, args: &Value) -> Result<Value, TransportError> {
        let parsed = BridgeCommand::from_name(command);
        if parsed.map_or(false, |c| c.is_start()) {
            *self.listeners_at_start.lock().unwrap() = Some((
                self.bus.listener_count(TERMINAL_OUTPUT_EVENT),
                self.bus.listener_count(TERMINAL_CLOSED_EVENT),
            ));
            if let Some(gate) = &self.start_gate {
                gate.notified().await;
            }
            if let Some(message) = &self.start_error {
                return Err(TransportError::rejected(command, message.clone()));
            }
            let session_id = args
                .get("sessionId")
                .or_else(|| args.get("terminalSessionId"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if let Some(data) = &self.start_output {
                self.bus.emit_output(session_id, 1, data);
            }
            if let Some(exit_code) = self.start_exit {
                self.bus.emit_closed(session_id, exit_code);
            }
        }
        if parsed == Some(BridgeCommand::SendInput) {
            if let Some(message) = &self.input_error {
                return Err(TransportError::rejected(command, message.clone()));
            }
        }
        if parsed == Some(BridgeCommand::ReplayOutput) {
            let next = self.replay_pages.lock().unwrap().pop_front();
            if let Some(page) = next {
                return page.map_err(|message| TransportError::rejected(command, message));
            }
        }
        Ok(default_response(command))
    }
}

pub struct Fixture {
    pub host: Arc<MemoryHost>,
    pub handler: Arc<ScriptedHandler>,
    pub client: BridgeClient,
}

impl Fixture {
    pub fn new(configure: impl FnOnce(ScriptedHandler) -> ScriptedHandler) -> Self {
        init_logging();
        let bus = EventBus::new();
        let handler = Arc::new(configure(ScriptedHandler::new(bus.clone())));
        let host = Arc::new(MemoryHost::with_handler(bus, handler.clone()));
        let client = BridgeClient::new(host.clone());
        Self {
            host,
            handler,
            client,
        }
    }

    pub fn bus(&self) -> &EventBus {
        self.host.bus()
    }

    pub fn sent_input(&self) -> Vec<String> {
        self.host
            .invocations_of(BridgeCommand::SendInput)
            .into_iter()
            .map(|invocation| {
                let bytes: Vec<u8> = serde_json::from_value(invocation.args["data"].clone())
                    .expect("input data is a byte array");
                String::from_utf8(bytes).expect("input is UTF-8")
            })
            .collect()
    }

    pub fn count(&self, command: BridgeCommand) -> usize {
        self.host.invocations_of(command).len()
    }
}

/// Poll `condition` until it holds, failing the test after about two seconds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Give in-flight tasks a chance to run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

/// Widget that records everything written to it
pub struct RecordingWidget {
    pub written: Vec<u8>,
    pub cols: u16,
    pub rows: u16,
}

impl RecordingWidget {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            written: Vec::new(),
            cols,
            rows,
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.written).into_owned()
    }
}

impl TerminalWidget for RecordingWidget {
    fn write(&mut self, data: &[u8]) {
        self.written.extend_from_slice(data);
    }

    fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }
}
