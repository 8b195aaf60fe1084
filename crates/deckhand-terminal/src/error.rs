use std::path::PathBuf;

use thiserror::Error;

/// Failure talking to the session host.
///
/// A host rejection displays as the host's own message so it can be shown to
/// the user verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("{message}")]
    Rejected { command: String, message: String },

    #[error("failed to encode arguments for `{command}`: {message}")]
    Encode { command: String, message: String },

    #[error("unexpected response to `{command}`: {message}")]
    Decode { command: String, message: String },

    #[error("host transport closed")]
    Closed,
}

impl TransportError {
    pub fn rejected(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            command: command.into(),
            message: message.into(),
        }
    }
}

/// An output event for this session that could not be turned into a chunk
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("[terminal_bridge] invalid output seq `{seq}` for session {session_id}")]
    InvalidSeq { session_id: String, seq: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: '{value}'")]
    Env { var: &'static str, value: String },
}
