//! Loopback session host: echoes input back as PTY output.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use deckhand_terminal::memory::default_response;
use deckhand_terminal::{CommandHandler, EventBus, TransportError};
use deckhand_types::{BridgeCommand, SendInputArgs, SYSTEM_MESSAGE_SEQ};
use serde_json::Value;

const EXIT_COMMAND: &str = "exit";

pub struct EchoHost {
    bus: EventBus,
    exit_code: u32,
    next_seq: AtomicU64,
    lines: Mutex<HashMap<String, String>>,
    closed: Mutex<HashSet<String>>,
}

impl EchoHost {
    pub fn new(bus: EventBus, exit_code: u32) -> Self {
        Self {
            bus,
            exit_code,
            next_seq: AtomicU64::new(1),
            lines: Mutex::new(HashMap::new()),
            closed: Mutex::new(HashSet::new()),
        }
    }

    fn session_of(command: &str, args: &Value) -> Result<String, TransportError> {
        args.get("sessionId")
            .or_else(|| args.get("terminalSessionId"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TransportError::rejected(command, "missing session id"))
    }

    fn close(&self, session_id: &str) {
        let first = self
            .closed
            .lock()
            .map(|mut closed| closed.insert(session_id.to_string()))
            .unwrap_or(false);
        if first {
            log::info!("echo host: session {} exited with {}", session_id, self.exit_code);
            self.bus.emit_closed(session_id, self.exit_code);
        }
    }

    fn echo(&self, session_id: &str, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        let rendered = text.replace('\n', "\r\n");
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.bus.emit_output(session_id, seq, rendered.as_bytes());

        // Watch for a complete `exit` line
        let mut exit_requested = false;
        if let Ok(mut lines) = self.lines.lock() {
            let line = lines.entry(session_id.to_string()).or_default();
            for ch in text.chars() {
                match ch {
                    '\n' | '\r' => {
                        exit_requested |= line.trim() == EXIT_COMMAND;
                        line.clear();
                    }
                    _ => line.push(ch),
                }
            }
        }
        if exit_requested {
            self.close(session_id);
        }
    }
}

#[async_trait]
impl CommandHandler for EchoHost {
    async fn handle(&self, command: &str, args: &Value) -> Result<Value, TransportError> {
        let Some(parsed) = BridgeCommand::from_name(command) else {
            return Err(TransportError::rejected(
                command,
                format!("unknown command {}", command),
            ));
        };
        match parsed {
            start if start.is_start() => {
                let session_id = Self::session_of(command, args)?;
                log::info!("echo host: starting session {} via {}", session_id, start);
                self.bus.emit_output(
                    &session_id,
                    SYSTEM_MESSAGE_SEQ,
                    b"\x1b[2m[echo host connected; type `exit` to end]\x1b[0m\r\n",
                );
            }
            BridgeCommand::SendInput => {
                let input: SendInputArgs = serde_json::from_value(args.clone()).map_err(|e| {
                    TransportError::rejected(command, format!("invalid input: {}", e))
                })?;
                self.echo(&input.session_id, &input.data);
            }
            BridgeCommand::Terminate => {
                let session_id = Self::session_of(command, args)?;
                self.close(&session_id);
            }
            _ => {}
        }
        Ok(default_response(command))
    }
}
