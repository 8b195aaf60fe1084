//! Session state machine.
//!
//! `SessionMachine` holds everything about one bridge session that must stay
//! consistent across the racing start request, output events and user input.
//! It performs no I/O: every input returns the [`Effect`]s the caller has to
//! carry out, in order.
//!
//! Lifecycle:
//!
//! ```text
//! Initializing -> AwaitingStartAck -> Started -> Closed
//!                        |
//!                        +----------> StartFailed
//! ```
//!
//! `Started` is entered on the first evidence of a live process: either the
//! start request resolving or an output event arriving, whichever comes
//! first. The second trigger finds the machine already started and is a
//! no-op, so the started notification fires exactly once.

use std::collections::VecDeque;

use deckhand_types::{StreamMode, SYSTEM_MESSAGE_SEQ};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initializing,
    AwaitingStartAck,
    Started,
    Closed,
    StartFailed,
}

/// One decoded chunk of PTY output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub seq: u64,
    pub data: Vec<u8>,
}

/// Output fetched from the host after the tab became active again
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayBatch {
    pub chunks: Vec<OutputChunk>,
    /// Set when the host no longer had everything after the requested seq
    pub truncated_until: Option<u64>,
}

/// Work the driver must perform on behalf of the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    SendInput(String),
    Resize { cols: u16, rows: u16 },
    Terminate,
    SetStreamMode(StreamMode),
    Replay { after_seq: u64 },
    Started,
    Output(Vec<u8>),
    Closed(u32),
    Error(String),
}

fn dim_notice(text: &str) -> Vec<u8> {
    format!("\x1b[2m[{}]\x1b[0m\r\n", text).into_bytes()
}

/// Output held until the consumer can render it
#[derive(Debug)]
struct OutputBuffer {
    chunks: VecDeque<Vec<u8>>,
    bytes: usize,
    limit: Option<usize>,
    discarded: usize,
}

impl OutputBuffer {
    fn new(limit: Option<usize>) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            limit,
            discarded: 0,
        }
    }

    /// Append a chunk, evicting the oldest chunks past the byte limit.
    /// The newest chunk is always kept.
    fn push(&mut self, data: Vec<u8>) {
        self.bytes += data.len();
        self.chunks.push_back(data);

        let Some(limit) = self.limit else {
            return;
        };
        while self.bytes > limit && self.chunks.len() > 1 {
            let Some(oldest) = self.chunks.pop_front() else {
                break;
            };
            if self.discarded == 0 {
                log::warn!(
                    "[terminal_bridge] output buffer over {} bytes before the terminal was ready; discarding oldest output",
                    limit
                );
            }
            self.bytes -= oldest.len();
            self.discarded += oldest.len();
        }
    }

    /// Take everything, returning the discarded byte count and the kept chunks
    fn drain(&mut self) -> (usize, Vec<Vec<u8>>) {
        let discarded = std::mem::take(&mut self.discarded);
        self.bytes = 0;
        (discarded, self.chunks.drain(..).collect())
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
        self.discarded = 0;
    }
}

#[derive(Debug)]
pub struct SessionMachine {
    session_id: String,
    state: LifecycleState,
    start_issued: bool,
    disposed: bool,
    ready: bool,
    buffer: OutputBuffer,
    pending_input: VecDeque<String>,
    pending_resize: Option<(u16, u16)>,
    last_seq: Option<u64>,
    active: bool,
    stream_mode: StreamMode,
    replaying: bool,
}

impl SessionMachine {
    pub fn new(session_id: impl Into<String>, buffer_limit: Option<usize>, active: bool) -> Self {
        Self {
            session_id: session_id.into(),
            state: LifecycleState::Initializing,
            start_issued: false,
            disposed: false,
            ready: false,
            buffer: OutputBuffer::new(buffer_limit),
            pending_input: VecDeque::new(),
            pending_resize: None,
            last_seq: None,
            active,
            stream_mode: StreamMode::Live,
            replaying: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn stream_mode(&self) -> StreamMode {
        self.stream_mode
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    pub fn pending_input_len(&self) -> usize {
        self.pending_input.len()
    }

    pub fn pending_resize(&self) -> Option<(u16, u16)> {
        self.pending_resize
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.bytes
    }

    fn awaiting_evidence(&self) -> bool {
        matches!(
            self.state,
            LifecycleState::Initializing | LifecycleState::AwaitingStartAck
        )
    }

    /// Claim the single start request for this session.
    /// Returns false if a start was already issued or can no longer be.
    pub fn begin_start(&mut self) -> bool {
        if self.disposed || self.start_issued || self.state != LifecycleState::Initializing {
            return false;
        }
        self.start_issued = true;
        self.state = LifecycleState::AwaitingStartAck;
        true
    }

    fn enter_started(&mut self, effects: &mut Vec<Effect>) {
        self.state = LifecycleState::Started;
        effects.extend(self.pending_input.drain(..).map(Effect::SendInput));
        if let Some((cols, rows)) = self.pending_resize.take() {
            effects.push(Effect::Resize { cols, rows });
        }
        if !self.active && self.stream_mode == StreamMode::Live {
            self.stream_mode = StreamMode::Buffered;
            effects.push(Effect::SetStreamMode(StreamMode::Buffered));
        }
        effects.push(Effect::Started);
    }

    fn abandon_pending(&mut self) {
        self.pending_input.clear();
        self.pending_resize = None;
    }

    pub fn start_resolved(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.disposed && self.awaiting_evidence() {
            self.enter_started(&mut effects);
        }
        effects
    }

    pub fn start_rejected(&mut self, message: impl Into<String>) -> Vec<Effect> {
        if self.disposed {
            return Vec::new();
        }
        match self.state {
            LifecycleState::Initializing | LifecycleState::AwaitingStartAck => {
                self.state = LifecycleState::StartFailed;
                self.abandon_pending();
                vec![Effect::Error(message.into())]
            }
            // Output already proved the process alive; report but keep going
            LifecycleState::Started => vec![Effect::Error(message.into())],
            LifecycleState::Closed | LifecycleState::StartFailed => Vec::new(),
        }
    }

    pub fn start_timed_out(&mut self, message: impl Into<String>) -> Vec<Effect> {
        if self.disposed || self.state != LifecycleState::AwaitingStartAck {
            return Vec::new();
        }
        self.state = LifecycleState::StartFailed;
        self.abandon_pending();
        vec![Effect::Error(message.into())]
    }

    pub fn output(&mut self, chunk: OutputChunk) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.disposed {
            return effects;
        }
        match self.state {
            LifecycleState::Closed | LifecycleState::StartFailed => {
                log::trace!(
                    "[terminal_bridge] ignoring output seq={} for ended session {}",
                    chunk.seq,
                    self.session_id
                );
                return effects;
            }
            LifecycleState::Initializing | LifecycleState::AwaitingStartAck => {
                self.enter_started(&mut effects);
            }
            LifecycleState::Started => {}
        }
        self.deliver(chunk, &mut effects);
        effects
    }

    fn deliver(&mut self, chunk: OutputChunk, effects: &mut Vec<Effect>) {
        if chunk.seq != SYSTEM_MESSAGE_SEQ {
            if let Some(last) = self.last_seq {
                if chunk.seq <= last {
                    log::trace!(
                        "[terminal_bridge] dropping duplicate output seq={} (last={}) for {}",
                        chunk.seq,
                        last,
                        self.session_id
                    );
                    return;
                }
            }
            self.last_seq = Some(chunk.seq);
        }
        self.emit(chunk.data, effects);
    }

    fn emit(&mut self, data: Vec<u8>, effects: &mut Vec<Effect>) {
        if self.ready {
            effects.push(Effect::Output(data));
        } else {
            self.buffer.push(data);
        }
    }

    pub fn closed(&mut self, exit_code: u32) -> Vec<Effect> {
        if self.disposed {
            return Vec::new();
        }
        match self.state {
            LifecycleState::Started => {
                self.state = LifecycleState::Closed;
                vec![Effect::Closed(exit_code)]
            }
            LifecycleState::Initializing | LifecycleState::AwaitingStartAck => {
                // The user never saw this session start, so there is nothing to end
                log::debug!(
                    "[terminal_bridge] suppressing close (exit={}) before start for {}",
                    exit_code,
                    self.session_id
                );
                self.state = LifecycleState::Closed;
                self.abandon_pending();
                Vec::new()
            }
            LifecycleState::Closed | LifecycleState::StartFailed => Vec::new(),
        }
    }

    /// The consumer can render now: release buffered output once, in order
    pub fn mark_ready(&mut self) -> Vec<Effect> {
        if self.disposed || self.ready {
            return Vec::new();
        }
        self.ready = true;
        let (discarded, chunks) = self.buffer.drain();
        let mut effects = Vec::with_capacity(chunks.len() + 1);
        if discarded > 0 {
            effects.push(Effect::Output(dim_notice(&format!(
                "{} bytes of earlier output discarded",
                discarded
            ))));
        }
        effects.extend(chunks.into_iter().map(Effect::Output));
        effects
    }

    pub fn send_input(&mut self, text: impl Into<String>) -> Vec<Effect> {
        let text = text.into();
        if self.disposed || text.is_empty() {
            return Vec::new();
        }
        match self.state {
            LifecycleState::Started => vec![Effect::SendInput(text)],
            LifecycleState::Initializing | LifecycleState::AwaitingStartAck => {
                self.pending_input.push_back(text);
                Vec::new()
            }
            LifecycleState::Closed | LifecycleState::StartFailed => {
                log::debug!(
                    "[terminal_bridge] dropping input for ended session {}",
                    self.session_id
                );
                Vec::new()
            }
        }
    }

    /// Forward a resize, or remember it until start; only the latest pending size is kept
    pub fn resize(&mut self, cols: u16, rows: u16) -> Vec<Effect> {
        if self.disposed || cols == 0 || rows == 0 {
            return Vec::new();
        }
        match self.state {
            LifecycleState::Started => vec![Effect::Resize { cols, rows }],
            LifecycleState::Initializing | LifecycleState::AwaitingStartAck => {
                self.pending_resize = Some((cols, rows));
                Vec::new()
            }
            LifecycleState::Closed | LifecycleState::StartFailed => Vec::new(),
        }
    }

    /// Track tab visibility; hidden tabs let the host hold output for replay
    pub fn set_active(&mut self, active: bool) -> Vec<Effect> {
        if self.disposed || self.active == active {
            return Vec::new();
        }
        self.active = active;
        if self.state != LifecycleState::Started || self.replaying {
            return Vec::new();
        }
        match (active, self.stream_mode) {
            (true, StreamMode::Buffered) => {
                self.replaying = true;
                vec![Effect::Replay {
                    after_seq: self.last_seq.unwrap_or(0),
                }]
            }
            (false, StreamMode::Live) => {
                self.stream_mode = StreamMode::Buffered;
                vec![Effect::SetStreamMode(StreamMode::Buffered)]
            }
            _ => Vec::new(),
        }
    }

    /// Finish a replay. Live mode is restored even when the replay failed.
    pub fn replay_settled(&mut self, outcome: Result<ReplayBatch, String>) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.disposed {
            return effects;
        }
        self.replaying = false;
        if self.state != LifecycleState::Started {
            return effects;
        }
        match outcome {
            Ok(batch) => {
                if let Some(until) = batch.truncated_until {
                    if self.last_seq.map_or(true, |last| until > last) {
                        self.last_seq = Some(until);
                        self.emit(dim_notice("earlier output truncated"), &mut effects);
                    }
                }
                for chunk in batch.chunks {
                    self.deliver(chunk, &mut effects);
                }
            }
            Err(message) => effects.push(Effect::Error(message)),
        }
        if self.active && self.stream_mode == StreamMode::Buffered {
            self.stream_mode = StreamMode::Live;
            effects.push(Effect::SetStreamMode(StreamMode::Live));
        }
        effects
    }

    /// Tear down unconditionally; everything held is discarded
    pub fn unmount(&mut self) -> Vec<Effect> {
        if self.disposed {
            return Vec::new();
        }
        self.disposed = true;
        self.abandon_pending();
        self.buffer.clear();
        vec![Effect::Terminate]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn chunk(seq: u64, data: &str) -> OutputChunk {
        OutputChunk {
            seq,
            data: data.as_bytes().to_vec(),
        }
    }

    fn started_machine() -> SessionMachine {
        let mut machine = SessionMachine::new("target", None, true);
        assert!(machine.begin_start());
        machine.start_resolved();
        machine
    }

    fn outputs(effects: &[Effect]) -> Vec<Vec<u8>> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Output(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn count_started(effects: &[Effect]) -> usize {
        effects.iter().filter(|e| **e == Effect::Started).count()
    }

    #[test]
    fn start_is_claimed_once() {
        let mut machine = SessionMachine::new("s", None, true);
        assert!(machine.begin_start());
        assert!(!machine.begin_start());
        assert_eq!(machine.state(), LifecycleState::AwaitingStartAck);
    }

    #[test]
    fn queued_input_flushes_when_output_arrives_first() {
        let mut machine = SessionMachine::new("s", None, true);
        assert!(machine.send_input("ls\n").is_empty());
        machine.begin_start();

        let effects = machine.output(chunk(1, "$ "));
        assert_eq!(
            effects,
            vec![Effect::SendInput("ls\n".to_string()), Effect::Started]
        );
        assert_eq!(machine.state(), LifecycleState::Started);
        assert_eq!(machine.pending_input_len(), 0);
        // Late resolution of the start request changes nothing
        assert!(machine.start_resolved().is_empty());
    }

    #[test]
    fn only_latest_pending_resize_is_applied() {
        let mut machine = SessionMachine::new("s", None, true);
        machine.begin_start();
        assert!(machine.resize(80, 24).is_empty());
        assert!(machine.resize(120, 40).is_empty());

        let effects = machine.start_resolved();
        assert_eq!(
            effects,
            vec![Effect::Resize { cols: 120, rows: 40 }, Effect::Started]
        );
    }

    #[test]
    fn zero_sized_resize_is_ignored() {
        let mut machine = started_machine();
        assert!(machine.resize(0, 24).is_empty());
        assert_eq!(
            machine.resize(100, 30),
            vec![Effect::Resize { cols: 100, rows: 30 }]
        );
    }

    #[test]
    fn rejected_start_fails_without_started_or_closed() {
        let mut machine = SessionMachine::new("s", None, true);
        machine.begin_start();
        machine.send_input("dropped");

        assert_eq!(
            machine.start_rejected("spawn failed"),
            vec![Effect::Error("spawn failed".to_string())]
        );
        assert_eq!(machine.state(), LifecycleState::StartFailed);
        assert!(machine.output(chunk(1, "late")).is_empty());
        assert!(machine.closed(1).is_empty());
        assert!(machine.send_input("more").is_empty());
    }

    #[test]
    fn rejection_after_output_keeps_session_started() {
        let mut machine = SessionMachine::new("s", None, true);
        machine.begin_start();
        machine.output(chunk(1, "hi"));

        assert_eq!(
            machine.start_rejected("late failure"),
            vec![Effect::Error("late failure".to_string())]
        );
        assert_eq!(machine.state(), LifecycleState::Started);
    }

    #[test]
    fn close_before_start_is_suppressed() {
        let mut machine = SessionMachine::new("s", None, true);
        machine.begin_start();

        assert!(machine.closed(0).is_empty());
        assert_eq!(machine.state(), LifecycleState::Closed);
        assert!(machine.start_resolved().is_empty());
    }

    #[test]
    fn close_after_start_reports_exit_code_once() {
        let mut machine = started_machine();
        assert_eq!(machine.closed(0), vec![Effect::Closed(0)]);
        assert!(machine.closed(0).is_empty());
        assert!(machine.resize(10, 10).is_empty());
    }

    #[test]
    fn buffered_output_flushes_in_arrival_order() {
        let mut machine = started_machine();
        assert!(machine.output(chunk(1, "He")).is_empty());
        assert!(machine.output(chunk(2, "llo")).is_empty());

        let effects = machine.mark_ready();
        assert_eq!(outputs(&effects), vec![b"He".to_vec(), b"llo".to_vec()]);
        assert_eq!(machine.buffered_bytes(), 0);
        assert!(machine.mark_ready().is_empty());
        assert_eq!(
            machine.output(chunk(3, "!")),
            vec![Effect::Output(b"!".to_vec())]
        );
    }

    #[test]
    fn buffer_limit_discards_oldest_chunks_and_reports_it() {
        let mut machine = SessionMachine::new("s", Some(4), true);
        machine.begin_start();
        machine.output(chunk(1, "aaa"));
        machine.output(chunk(2, "bbb"));
        machine.output(chunk(3, "cc"));
        assert_eq!(machine.buffered_bytes(), 2);

        let flushed = outputs(&machine.mark_ready());
        assert_eq!(flushed.len(), 2);
        assert!(String::from_utf8_lossy(&flushed[0]).contains("6 bytes of earlier output discarded"));
        assert_eq!(flushed[1], b"cc".to_vec());
    }

    #[test]
    fn oversized_single_chunk_is_kept() {
        let mut machine = SessionMachine::new("s", Some(2), true);
        machine.begin_start();
        machine.output(chunk(1, "too long"));
        assert_eq!(outputs(&machine.mark_ready()), vec![b"too long".to_vec()]);
    }

    #[test]
    fn duplicate_seqs_are_dropped_but_system_messages_pass() {
        let mut machine = started_machine();
        machine.mark_ready();
        assert_eq!(outputs(&machine.output(chunk(5, "a"))).len(), 1);
        assert!(machine.output(chunk(5, "a")).is_empty());
        assert!(machine.output(chunk(3, "old")).is_empty());
        assert_eq!(
            machine.output(chunk(0, "connected")),
            vec![Effect::Output(b"connected".to_vec())]
        );
        assert_eq!(machine.last_seq(), Some(5));
    }

    #[test]
    fn inactive_mount_requests_buffered_mode_on_start() {
        let mut machine = SessionMachine::new("s", None, false);
        machine.begin_start();
        let effects = machine.start_resolved();
        assert_eq!(
            effects,
            vec![Effect::SetStreamMode(StreamMode::Buffered), Effect::Started]
        );
    }

    #[test]
    fn reactivation_replays_after_last_seq_then_goes_live() {
        let mut machine = started_machine();
        machine.mark_ready();
        machine.output(chunk(1, "a"));

        assert_eq!(
            machine.set_active(false),
            vec![Effect::SetStreamMode(StreamMode::Buffered)]
        );
        assert_eq!(machine.set_active(true), vec![Effect::Replay { after_seq: 1 }]);
        // A second activation while replaying does not start another replay
        assert!(machine.set_active(true).is_empty());

        let effects = machine.replay_settled(Ok(ReplayBatch {
            chunks: vec![chunk(1, "a"), chunk(2, "Hi")],
            truncated_until: None,
        }));
        assert_eq!(
            effects,
            vec![
                Effect::Output(b"Hi".to_vec()),
                Effect::SetStreamMode(StreamMode::Live)
            ]
        );
        assert_eq!(machine.stream_mode(), StreamMode::Live);
    }

    #[test]
    fn failed_replay_reports_and_restores_live_mode() {
        let mut machine = started_machine();
        machine.set_active(false);
        machine.set_active(true);

        let effects = machine.replay_settled(Err("failed to replay output".to_string()));
        assert_eq!(
            effects,
            vec![
                Effect::Error("failed to replay output".to_string()),
                Effect::SetStreamMode(StreamMode::Live)
            ]
        );
    }

    #[test]
    fn truncated_replay_advances_cursor_with_notice() {
        let mut machine = started_machine();
        machine.mark_ready();
        machine.set_active(false);
        machine.set_active(true);

        let effects = machine.replay_settled(Ok(ReplayBatch {
            chunks: vec![chunk(9, "tail")],
            truncated_until: Some(8),
        }));
        let flushed = outputs(&effects);
        assert!(String::from_utf8_lossy(&flushed[0]).contains("earlier output truncated"));
        assert_eq!(flushed[1], b"tail".to_vec());
        assert_eq!(machine.last_seq(), Some(9));
    }

    #[test]
    fn unmount_terminates_once_and_ignores_everything_after() {
        let mut machine = SessionMachine::new("s", None, true);
        machine.begin_start();
        machine.send_input("pending");
        machine.output(chunk(1, "buffered"));

        assert_eq!(machine.unmount(), vec![Effect::Terminate]);
        assert!(machine.unmount().is_empty());
        assert!(machine.start_resolved().is_empty());
        assert!(machine.start_rejected("late").is_empty());
        assert!(machine.mark_ready().is_empty());
        assert!(machine.closed(0).is_empty());
        assert_eq!(machine.buffered_bytes(), 0);
    }

    proptest! {
        #[test]
        fn queued_input_reaches_wire_in_call_order(
            inputs in proptest::collection::vec(".{0,6}", 0..16),
            output_first in any::<bool>(),
        ) {
            let mut machine = SessionMachine::new("s", None, true);
            machine.begin_start();
            for input in &inputs {
                prop_assert!(machine.send_input(input.clone()).is_empty());
            }

            let effects = if output_first {
                machine.output(chunk(1, "x"))
            } else {
                machine.start_resolved()
            };
            let sent: String = effects
                .iter()
                .filter_map(|effect| match effect {
                    Effect::SendInput(text) => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            prop_assert_eq!(sent, inputs.concat());
        }

        #[test]
        fn buffered_output_is_released_in_arrival_order(
            early in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..32), 0..16),
            late in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..32), 0..8),
        ) {
            let mut machine = started_machine();
            let mut seq = 0;
            for data in &early {
                seq += 1;
                let effects = machine.output(OutputChunk { seq, data: data.clone() });
                prop_assert!(effects.is_empty());
            }
            prop_assert_eq!(outputs(&machine.mark_ready()), early.clone());

            for data in &late {
                seq += 1;
                let effects = machine.output(OutputChunk { seq, data: data.clone() });
                prop_assert_eq!(effects, vec![Effect::Output(data.clone())]);
            }
            prop_assert_eq!(machine.buffered_bytes(), 0);
        }

        #[test]
        fn started_fires_once_whichever_trigger_wins(output_first in any::<bool>(), extra in 0usize..4) {
            let mut machine = SessionMachine::new("s", None, true);
            machine.begin_start();
            let mut effects = Vec::new();
            if output_first {
                effects.extend(machine.output(chunk(1, "a")));
                effects.extend(machine.start_resolved());
            } else {
                effects.extend(machine.start_resolved());
                effects.extend(machine.output(chunk(1, "a")));
            }
            for i in 0..extra {
                effects.extend(machine.output(chunk(2 + i as u64, "b")));
            }
            prop_assert_eq!(count_started(&effects), 1);
        }
    }
}
