//! Terminal adapter
//!
//! Glues a terminal widget to a `SessionController`: keystrokes and resizes
//! flow to the session, output flows to the widget once it is attached.

use std::sync::{Arc, Mutex, MutexGuard};

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use deckhand_types::StartHumanSessionResult;

use crate::config::BridgeConfig;
use crate::launch::SessionConfig;
use crate::session::{SessionController, SessionHandlers};
use crate::wire::BridgeClient;

/// Sequence sent for Shift+Enter so agent CLIs can tell it apart from Enter
pub const SHIFT_ENTER_SEQUENCE: &str = "\x1b[13;2u";

const SESSION_ENDED_LINE: &str = "\r\n\x1b[2m[Session ended]\x1b[0m";

/// Anything that can render PTY output
pub trait TerminalWidget: Send {
    fn write(&mut self, data: &[u8]);

    /// Current size as (cols, rows)
    fn size(&self) -> (u16, u16);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Session handlers that render into a widget
pub struct TerminalView<W> {
    widget: Mutex<Option<W>>,
    error: Mutex<Option<String>>,
    agent_session: Mutex<Option<StartHumanSessionResult>>,
    exit_code: Mutex<Option<u32>>,
}

impl<W: TerminalWidget> TerminalView<W> {
    pub fn new() -> Self {
        Self {
            widget: Mutex::new(None),
            error: Mutex::new(None),
            agent_session: Mutex::new(None),
            exit_code: Mutex::new(None),
        }
    }

    /// Construct the widget once; later calls leave the existing one alone
    fn attach<F: FnOnce() -> W>(&self, factory: F) -> Option<(u16, u16)> {
        let mut slot = lock(&self.widget);
        if slot.is_some() {
            return None;
        }
        let widget = factory();
        let size = widget.size();
        *slot = Some(widget);
        Some(size)
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.widget).is_some()
    }

    pub fn with_widget<R>(&self, f: impl FnOnce(&mut W) -> R) -> Option<R> {
        lock(&self.widget).as_mut().map(f)
    }

    pub fn take_error(&self) -> Option<String> {
        lock(&self.error).take()
    }

    pub fn agent_session(&self) -> Option<StartHumanSessionResult> {
        lock(&self.agent_session).clone()
    }

    pub fn exit_code(&self) -> Option<u32> {
        *lock(&self.exit_code)
    }

    fn write(&self, data: &[u8]) {
        match lock(&self.widget).as_mut() {
            Some(widget) => widget.write(data),
            None => log::trace!(
                "[terminal_bridge] no widget attached; dropping {} bytes",
                data.len()
            ),
        }
    }
}

impl<W: TerminalWidget> Default for TerminalView<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: TerminalWidget> SessionHandlers for TerminalView<W> {
    fn on_output(&self, data: &[u8]) {
        self.write(data);
    }

    fn on_closed(&self, exit_code: u32) {
        *lock(&self.exit_code) = Some(exit_code);
        self.write(SESSION_ENDED_LINE.as_bytes());
    }

    fn on_error(&self, message: &str) {
        log::warn!("[terminal_bridge] {}", message);
        *lock(&self.error) = Some(message.to_string());
    }

    fn on_agent_session(&self, session: &StartHumanSessionResult) {
        *lock(&self.agent_session) = Some(session.clone());
    }
}

/// True for a Shift+Enter press with no other modifier held
pub fn is_shift_enter(key: &KeyEvent) -> bool {
    key.kind == KeyEventKind::Press
        && key.code == KeyCode::Enter
        && key.modifiers.contains(KeyModifiers::SHIFT)
        && !key.modifiers.intersects(
            KeyModifiers::CONTROL | KeyModifiers::ALT | KeyModifiers::SUPER | KeyModifiers::META,
        )
}

pub struct TerminalAdapter<W: TerminalWidget + 'static> {
    controller: SessionController,
    view: Arc<TerminalView<W>>,
}

impl<W: TerminalWidget + 'static> std::fmt::Debug for TerminalAdapter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalAdapter")
            .field("controller", &self.controller)
            .field("attached", &self.view.is_attached())
            .finish()
    }
}

impl<W: TerminalWidget + 'static> TerminalAdapter<W> {
    /// Mount the session behind a not yet attached widget
    pub fn mount(client: BridgeClient, config: SessionConfig, bridge: Arc<BridgeConfig>) -> Self {
        let view = Arc::new(TerminalView::new());
        let controller = SessionController::mount(client, config, bridge, view.clone());
        Self { controller, view }
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    pub fn view(&self) -> &TerminalView<W> {
        &self.view
    }

    /// Attach the widget, report its size, then release buffered output.
    /// Returns false if a widget was already attached.
    pub fn attach<F: FnOnce() -> W>(&self, factory: F) -> bool {
        let Some((cols, rows)) = self.view.attach(factory) else {
            return false;
        };
        self.controller.resize(cols, rows);
        self.controller.mark_ready();
        true
    }

    /// Typed data from the widget
    pub fn on_data(&self, text: &str) {
        self.controller.send_input(text);
    }

    pub fn on_resize(&self, cols: u16, rows: u16) {
        self.controller.resize(cols, rows);
    }

    /// Inspect a key before the widget handles it.
    /// Returns false when the key was consumed here.
    pub fn on_key(&self, key: &KeyEvent) -> bool {
        if is_shift_enter(key) {
            self.controller.send_input(SHIFT_ENTER_SEQUENCE);
            return false;
        }
        true
    }

    pub fn set_active(&self, active: bool) {
        self.controller.set_active(active);
    }

    /// Error for the inline banner; dismissing it clears it
    pub fn take_error(&self) -> Option<String> {
        self.view.take_error()
    }

    pub async fn close(self) {
        self.controller.unmount().await;
    }
}
