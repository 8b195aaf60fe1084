use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use deckhand_terminal::{AgentOptions, BridgeConfig, LaunchMode, SessionConfig};
use deckhand_types::{Effort, PermissionLevel};

/// Which start handshake the session performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Interactive,
    Task,
    Human,
}

/// CLI arguments for deckhand
#[derive(Parser, Debug)]
#[command(name = "deckhand")]
#[command(about = "Drive a terminal bridge session against an in-process echo host")]
#[command(version)]
pub struct Cli {
    /// Bridge session id (a random one is generated when omitted)
    #[arg(long, env = "DECKHAND_SESSION_ID")]
    pub session_id: Option<String>,

    /// Launch mode of the session
    #[arg(long, value_enum, default_value_t = Mode::Interactive)]
    pub mode: Mode,

    /// Task to bind the session to (required with --mode task)
    #[arg(long)]
    pub task_id: Option<u32>,

    /// Agent CLI to launch
    #[arg(long, env = "DECKHAND_AGENT")]
    pub agent: Option<String>,

    #[arg(long)]
    pub model: Option<String>,

    /// Reasoning effort: low, medium or high
    #[arg(long)]
    pub effort: Option<Effort>,

    /// Permission level: safe, balanced, auto or full_auto
    #[arg(long)]
    pub permission_level: Option<PermissionLevel>,

    /// Terminal width (defaults to the current terminal)
    #[arg(long)]
    pub cols: Option<u16>,

    /// Terminal height (defaults to the current terminal)
    #[arg(long)]
    pub rows: Option<u16>,

    /// Bridge config file (TOML)
    #[arg(long, value_name = "PATH", env = "DECKHAND_CONFIG")]
    pub config: Option<PathBuf>,

    /// Exit code the echo host reports when the session ends
    #[arg(long, default_value_t = 0)]
    pub exit_code: u32,
}

impl Cli {
    pub fn launch_mode(&self) -> Result<LaunchMode> {
        match self.mode {
            Mode::Interactive => Ok(LaunchMode::Interactive { mcp_mode: None }),
            Mode::Task => {
                let task_id = self
                    .task_id
                    .context("--task-id is required with --mode task")?;
                Ok(LaunchMode::TaskBound { task_id })
            }
            Mode::Human => Ok(LaunchMode::HumanSupervised {
                kind: "human".to_string(),
                task_id: self.task_id,
                launch_command: None,
                init_prompt: None,
                mcp_mode: None,
            }),
        }
    }

    pub fn session_config(&self, session_id: String) -> Result<SessionConfig> {
        let agent = AgentOptions {
            agent: self.agent.clone(),
            model: self.model.clone(),
            effort: self.effort,
            permission_level: self.permission_level,
            ..AgentOptions::default()
        };
        Ok(SessionConfig::new(session_id, self.launch_mode()?).with_agent(agent))
    }

    /// Bridge tuning from the config file when given, environment otherwise
    pub fn bridge_config(&self) -> Result<BridgeConfig> {
        match &self.config {
            Some(path) => BridgeConfig::load(path)
                .with_context(|| format!("failed to load bridge config {}", path.display())),
            None => {
                let mut config = BridgeConfig::default();
                config
                    .apply_env_overrides()
                    .context("invalid bridge config override")?;
                Ok(config)
            }
        }
    }
}
