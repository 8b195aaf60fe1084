//! Per-session launch configuration

use deckhand_types::{
    Effort, PermissionLevel, StartHumanSessionArgs, StartSessionArgs, StartTaskSessionArgs,
};

use crate::error::TransportError;
use crate::wire::{BridgeClient, StartAck};
use crate::{DEFAULT_AGENT, DEFAULT_MCP_MODE};

/// Agent settings shared by every launch mode
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOptions {
    pub agent: Option<String>,
    pub model: Option<String>,
    pub effort: Option<Effort>,
    pub permission_level: Option<PermissionLevel>,
    pub thinking: Option<bool>,
    pub post_start_preamble: Option<String>,
}

impl AgentOptions {
    fn agent_or_default(&self) -> String {
        self.agent
            .clone()
            .unwrap_or_else(|| DEFAULT_AGENT.to_string())
    }
}

/// Which start handshake a session performs
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchMode {
    /// Free-form agent session in a terminal tab
    Interactive { mcp_mode: Option<String> },
    /// Agent session working on one task
    TaskBound { task_id: u32 },
    /// Agent session a human drives, optionally seeded with a prompt
    HumanSupervised {
        kind: String,
        task_id: Option<u32>,
        launch_command: Option<String>,
        init_prompt: Option<String>,
        mcp_mode: Option<String>,
    },
}

impl LaunchMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Interactive { .. } => "interactive",
            Self::TaskBound { .. } => "task-bound",
            Self::HumanSupervised { .. } => "human-supervised",
        }
    }
}

impl Default for LaunchMode {
    fn default() -> Self {
        Self::Interactive { mcp_mode: None }
    }
}

/// Everything needed to mount one terminal tab's session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub session_id: String,
    pub launch: LaunchMode,
    pub agent: AgentOptions,
    /// When false the session subscribes but never asks the host to start
    pub enabled: bool,
    /// Whether the tab is visible; inactive sessions ask for buffered output
    pub active: bool,
}

impl SessionConfig {
    pub fn new(session_id: impl Into<String>, launch: LaunchMode) -> Self {
        Self {
            session_id: session_id.into(),
            launch,
            agent: AgentOptions::default(),
            enabled: true,
            active: true,
        }
    }

    pub fn interactive(session_id: impl Into<String>) -> Self {
        Self::new(session_id, LaunchMode::default())
    }

    pub fn with_agent(mut self, agent: AgentOptions) -> Self {
        self.agent = agent;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn start_session_args(&self, mcp_mode: Option<&String>) -> StartSessionArgs {
        StartSessionArgs {
            session_id: self.session_id.clone(),
            agent: Some(self.agent.agent_or_default()),
            mcp_mode: Some(
                mcp_mode
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_MCP_MODE.to_string()),
            ),
            model: self.agent.model.clone(),
            effort: self.agent.effort,
            permission_level: self.agent.permission_level,
            thinking: self.agent.thinking,
            post_start_preamble: self.agent.post_start_preamble.clone(),
        }
    }

    pub fn start_task_session_args(&self, task_id: u32) -> StartTaskSessionArgs {
        StartTaskSessionArgs {
            session_id: self.session_id.clone(),
            task_id,
            agent: Some(self.agent.agent_or_default()),
            model: self.agent.model.clone(),
            effort: self.agent.effort,
            permission_level: self.agent.permission_level,
            thinking: self.agent.thinking,
            post_start_preamble: self.agent.post_start_preamble.clone(),
        }
    }

    /// Send the start request matching this session's launch mode
    pub async fn start(&self, client: &BridgeClient) -> Result<StartAck, TransportError> {
        match &self.launch {
            LaunchMode::Interactive { mcp_mode } => {
                let args = self.start_session_args(mcp_mode.as_ref());
                client.start_session(&args).await?;
                Ok(StartAck::Accepted)
            }
            LaunchMode::TaskBound { task_id } => {
                let args = self.start_task_session_args(*task_id);
                client.start_task_session(&args).await?;
                Ok(StartAck::Accepted)
            }
            LaunchMode::HumanSupervised {
                kind,
                task_id,
                launch_command,
                init_prompt,
                mcp_mode,
            } => {
                let args = StartHumanSessionArgs {
                    terminal_session_id: self.session_id.clone(),
                    kind: kind.clone(),
                    task_id: *task_id,
                    agent: Some(self.agent.agent_or_default()),
                    model: self.agent.model.clone(),
                    effort: self.agent.effort,
                    permission_level: self.agent.permission_level,
                    launch_command: launch_command.clone(),
                    post_start_preamble: self.agent.post_start_preamble.clone(),
                    init_prompt: init_prompt.clone(),
                    mcp_mode: mcp_mode.clone(),
                    thinking: self.agent.thinking,
                };
                let result = client.start_human_session(&args).await?;
                Ok(StartAck::AgentSession(result))
            }
        }
    }
}
