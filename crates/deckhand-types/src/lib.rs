//! Wire contract for the deckhand terminal bridge
//!
//! This crate holds the command names, event names and payload shapes shared
//! between the bridge client and the session host that owns the PTYs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Protocol Names
// ============================================================================

/// Event carrying a chunk of PTY output
pub const TERMINAL_OUTPUT_EVENT: &str = "terminal_bridge:output";

/// Event announcing that a PTY process exited
pub const TERMINAL_CLOSED_EVENT: &str = "terminal_bridge:closed";

/// Seq reserved for host-generated system messages
pub const SYSTEM_MESSAGE_SEQ: u64 = 0;

/// Requests understood by the session host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeCommand {
    StartSession,
    StartTaskSession,
    StartHumanSession,
    SendInput,
    Resize,
    Terminate,
    SetStreamMode,
    ReplayOutput,
    EmitSystemMessage,
}

impl BridgeCommand {
    pub const ALL: [BridgeCommand; 9] = [
        Self::StartSession,
        Self::StartTaskSession,
        Self::StartHumanSession,
        Self::SendInput,
        Self::Resize,
        Self::Terminate,
        Self::SetStreamMode,
        Self::ReplayOutput,
        Self::EmitSystemMessage,
    ];

    /// Protocol name used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartSession => "terminal_bridge_start_session",
            Self::StartTaskSession => "terminal_bridge_start_task_session",
            Self::StartHumanSession => "terminal_bridge_start_human_session",
            Self::SendInput => "terminal_bridge_send_input",
            Self::Resize => "terminal_bridge_resize",
            Self::Terminate => "terminal_bridge_terminate",
            Self::SetStreamMode => "terminal_bridge_set_stream_mode",
            Self::ReplayOutput => "terminal_bridge_replay_output",
            Self::EmitSystemMessage => "terminal_bridge_emit_system_message",
        }
    }

    /// Look up a command by its protocol name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|command| command.as_str() == name)
    }

    /// True for the three session-start variants
    pub fn is_start(&self) -> bool {
        matches!(
            self,
            Self::StartSession | Self::StartTaskSession | Self::StartHumanSession
        )
    }
}

impl fmt::Display for BridgeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Launch Options
// ============================================================================

/// Error returned when parsing one of the option enums from text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: '{value}'. Valid options: {expected}")]
pub struct ParseOptionError {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

/// Reasoning effort requested from the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    Low,
    Medium,
    High,
}

impl Effort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for Effort {
    type Err = ParseOptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(ParseOptionError {
                kind: "effort",
                value: s.to_string(),
                expected: "'low', 'medium', 'high'",
            }),
        }
    }
}

impl fmt::Display for Effort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much the agent may do without asking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Safe,
    Balanced,
    Auto,
    FullAuto,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Balanced => "balanced",
            Self::Auto => "auto",
            Self::FullAuto => "full_auto",
        }
    }
}

impl FromStr for PermissionLevel {
    type Err = ParseOptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "safe" => Ok(Self::Safe),
            "balanced" => Ok(Self::Balanced),
            "auto" => Ok(Self::Auto),
            "full_auto" => Ok(Self::FullAuto),
            _ => Err(ParseOptionError {
                kind: "permission level",
                value: s.to_string(),
                expected: "'safe', 'balanced', 'auto', 'full_auto'",
            }),
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the host pushes output events live or holds them for replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    Live,
    Buffered,
}

impl StreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Buffered => "buffered",
        }
    }
}

impl FromStr for StreamMode {
    type Err = ParseOptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "buffered" => Ok(Self::Buffered),
            _ => Err(ParseOptionError {
                kind: "stream mode",
                value: s.to_string(),
                expected: "'live', 'buffered'",
            }),
        }
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Request Arguments
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionArgs {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<Effort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_level: Option<PermissionLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_start_preamble: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTaskSessionArgs {
    pub session_id: String,
    pub task_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<Effort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_level: Option<PermissionLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_start_preamble: Option<String>,
}

/// Start for a human-supervised agent session bound to a terminal tab.
///
/// `terminal_session_id` is the bridge session id; the host answers with the
/// agent session it created for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartHumanSessionArgs {
    pub terminal_session_id: String,
    pub kind: String,
    pub task_id: Option<u32>,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub effort: Option<Effort>,
    pub permission_level: Option<PermissionLevel>,
    pub launch_command: Option<String>,
    pub post_start_preamble: Option<String>,
    pub init_prompt: Option<String>,
    pub mcp_mode: Option<String>,
    pub thinking: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartHumanSessionResult {
    pub agent_session_id: String,
    pub agent_session_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendInputArgs {
    pub session_id: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeArgs {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateArgs {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetStreamModeArgs {
    pub session_id: String,
    pub mode: StreamMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayOutputArgs {
    pub session_id: String,
    pub after_seq: u64,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayOutputResult {
    pub chunks: Vec<ReplayChunk>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub truncated_until_seq: Option<SeqValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayChunk {
    pub seq: SeqValue,
    /// Base64-encoded PTY output
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitSystemMessageArgs {
    pub session_id: String,
    pub text: String,
}

// ============================================================================
// Events
// ============================================================================

/// Output sequence number as it appears on the wire.
///
/// Hosts send it as a JSON number, but bigint-aware serializers emit numeric
/// strings, so both are accepted. Anything else is kept so it can be reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeqValue {
    Number(u64),
    Text(String),
    Other(serde_json::Value),
}

impl SeqValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Other(_) => None,
        }
    }
}

impl From<u64> for SeqValue {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

impl fmt::Display for SeqValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
            Self::Other(value) => write!(f, "{}", value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PtyOutputEvent {
    #[serde(alias = "session_id")]
    pub session_id: String,
    pub seq: SeqValue,
    /// Base64-encoded PTY output
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PtyClosedEvent {
    #[serde(alias = "session_id")]
    pub session_id: String,
    #[serde(alias = "exit_code")]
    pub exit_code: u32,
}
