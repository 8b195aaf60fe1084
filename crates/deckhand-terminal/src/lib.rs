// Terminal session bridge
//
// Connects a UI-hosted terminal widget to an agent CLI running in a PTY owned
// by an out-of-process session host. The host is reached through a
// `HostTransport`; everything above it (wire client, session state machine,
// controller and widget adapter) lives here.

pub mod adapter;
pub mod config;
pub mod error;
pub mod launch;
pub mod machine;
pub mod memory;
pub mod session;
pub mod transport;
pub mod wire;

// Re-export public API
pub use adapter::{TerminalAdapter, TerminalView, TerminalWidget};
pub use config::BridgeConfig;
pub use error::{ConfigError, FrameError, TransportError};
pub use launch::{AgentOptions, LaunchMode, SessionConfig};
pub use machine::{Effect, LifecycleState, OutputChunk, ReplayBatch, SessionMachine};
pub use memory::{CommandHandler, EventBus, Invocation, MemoryHost};
pub use session::{SessionController, SessionHandlers};
pub use transport::{HostTransport, Listener, ListenerId};
pub use wire::{BridgeClient, ClosedSubscription, OutputSubscription, StartAck};

// Constants
pub const DEFAULT_AGENT: &str = "claude";
pub const DEFAULT_MCP_MODE: &str = "interactive";
pub const DEFAULT_OUTPUT_BUFFER_LIMIT: usize = 4 * 1024 * 1024;
pub const DEFAULT_REPLAY_PAGE_SIZE: u32 = 256;
pub const DEFAULT_REPLAY_MAX_PAGES: u32 = 64;
