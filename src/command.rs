//! Command descriptor, state machine and HMAC signing.
//!
//! A `Command` is built on the coordinator, signed with the target agent's
//! rotating auth token, dispatched over the long-poll channel and then driven
//! through a fixed state machine by reports from the agent. Both ends run the
//! same transition table; anything outside it is rejected.
//!
//! # State machine
//! ```text
//! pending → validating → starting → started_execution → finished_execution → flushed_logs → finished
//!                                                     ↘ failed_execution  → flushed_logs → failed
//!                                                     ↘ killed_execution  → flushed_logs → failed
//!         ↘ invalid_signature (terminal)
//!           flushed_logs → failed_validation (terminal)
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::signing::{self, SigningError};

/// Commands older than this are purged from the dispatched history.
pub const COMMAND_RETENTION_SECS: i64 = 14 * 86400;

/// Applied when a template carries no usable timeout.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

/// Buffered lines (either stream) that trigger an intermediate log upload.
pub const LOG_FLUSH_THRESHOLD: usize = 10;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("illegal command state transition {from} → {to}")]
    InvalidTransition {
        from: CommandState,
        to: CommandState,
    },
}

/// Lifecycle state of a command, shared between coordinator and agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Pending,
    Validating,
    Starting,
    StartedExecution,
    FinishedExecution,
    FailedExecution,
    KilledExecution,
    FlushedLogs,
    Finished,
    Failed,
    FailedValidation,
    InvalidSignature,
}

impl CommandState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandState::Pending => "pending",
            CommandState::Validating => "validating",
            CommandState::Starting => "starting",
            CommandState::StartedExecution => "started_execution",
            CommandState::FinishedExecution => "finished_execution",
            CommandState::FailedExecution => "failed_execution",
            CommandState::KilledExecution => "killed_execution",
            CommandState::FlushedLogs => "flushed_logs",
            CommandState::Finished => "finished",
            CommandState::Failed => "failed",
            CommandState::FailedValidation => "failed_validation",
            CommandState::InvalidSignature => "invalid_signature",
        }
    }

    pub fn parse(s: &str) -> Option<CommandState> {
        Some(match s {
            "pending" => CommandState::Pending,
            "validating" => CommandState::Validating,
            "starting" => CommandState::Starting,
            "started_execution" => CommandState::StartedExecution,
            "finished_execution" => CommandState::FinishedExecution,
            "failed_execution" => CommandState::FailedExecution,
            "killed_execution" => CommandState::KilledExecution,
            "flushed_logs" => CommandState::FlushedLogs,
            "finished" => CommandState::Finished,
            "failed" => CommandState::Failed,
            "failed_validation" => CommandState::FailedValidation,
            "invalid_signature" => CommandState::InvalidSignature,
            _ => return None,
        })
    }

    /// No further transitions are allowed out of a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandState::Finished
                | CommandState::Failed
                | CommandState::FailedValidation
                | CommandState::InvalidSignature
        )
    }

    /// Terminal and successful.
    pub fn is_terminal_ok(&self) -> bool {
        matches!(self, CommandState::Finished)
    }

    /// The transition table from the lifecycle diagram; everything else is a
    /// programmer error.
    pub fn can_transition(from: CommandState, to: CommandState) -> bool {
        use CommandState::*;
        matches!(
            (from, to),
            (Pending, Validating)
                | (Validating, Starting)
                | (Validating, InvalidSignature)
                | (Starting, StartedExecution)
                | (Starting, FailedExecution)
                | (StartedExecution, FinishedExecution)
                | (StartedExecution, FailedExecution)
                | (StartedExecution, KilledExecution)
                | (FinishedExecution, FlushedLogs)
                | (FailedExecution, FlushedLogs)
                | (KilledExecution, FlushedLogs)
                | (FlushedLogs, Finished)
                | (FlushedLogs, Failed)
                | (FlushedLogs, FailedValidation)
                | (Finished, FailedValidation)
        )
    }
}

impl std::fmt::Display for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A shell command travelling from the coordinator to one agent.
///
/// The descriptor fields are set once at dispatch; `state` and the log
/// buffers mutate as the agent reports back. Commands reference their
/// consensus request by id, never by pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub requester_id: String,
    #[serde(default)]
    pub iteration: u32,
    pub command: String,
    pub timeout_secs: u64,
    /// Empty for local-only commands, which skip server reporting.
    #[serde(default)]
    pub signature: String,
    pub created: i64,
    state: CommandState,
    #[serde(default)]
    pub stdout: Vec<String>,
    #[serde(default)]
    pub stderr: Vec<String>,
}

impl Command {
    pub fn new(command: impl Into<String>, timeout_secs: u64) -> Self {
        let timeout_secs = if timeout_secs < 1 {
            DEFAULT_COMMAND_TIMEOUT_SECS
        } else {
            timeout_secs
        };
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: String::new(),
            request_id: String::new(),
            template_id: String::new(),
            requester_id: String::new(),
            iteration: 0,
            command: command.into(),
            timeout_secs,
            signature: String::new(),
            created: chrono::Utc::now().timestamp(),
            state: CommandState::Pending,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    /// Apply a state transition, rejecting anything outside the table.
    ///
    /// Returns the previous state so callers can branch on the edge that was
    /// taken (validation only runs on `finished_execution → flushed_logs`).
    pub fn set_state(&mut self, to: CommandState) -> Result<CommandState, CommandError> {
        let from = self.state;
        if !CommandState::can_transition(from, to) {
            return Err(CommandError::InvalidTransition { from, to });
        }
        self.state = to;
        tracing::debug!(command = %self.id, %from, %to, "command state transition");
        Ok(from)
    }

    /// Sign the command with the target agent's rotating auth token.
    pub fn sign(&mut self, auth_token: &str) -> Result<(), SigningError> {
        self.signature = signing::command_signature(auth_token, &self.command, &self.id)?;
        Ok(())
    }

    /// Recompute the HMAC with the given token and compare against the
    /// carried signature. An empty signature never verifies.
    pub fn verify_signature(&self, auth_token: &str) -> bool {
        if self.signature.is_empty() {
            return false;
        }
        match signing::command_signature(auth_token, &self.command, &self.id) {
            Ok(expected) => signing::constant_time_eq(&expected, &self.signature),
            Err(_) => false,
        }
    }

    /// Whether this command belongs to the given rollout wave.
    pub fn is_execution(&self, request_id: &str, iteration: u32) -> bool {
        self.request_id == request_id && self.iteration == iteration
    }

    /// Commands past the retention window are dropped from history reads.
    pub fn is_expired(&self, now: i64) -> bool {
        self.created < now - COMMAND_RETENTION_SECS
    }

    pub fn log_output(&mut self, line: impl Into<String>) {
        self.stdout.push(line.into());
    }

    pub fn log_error(&mut self, line: impl Into<String>) {
        self.stderr.push(line.into());
    }

    /// Either stream has accumulated enough lines for an intermediate upload.
    pub fn wants_log_flush(&self) -> bool {
        self.stdout.len() >= LOG_FLUSH_THRESHOLD || self.stderr.len() >= LOG_FLUSH_THRESHOLD
    }

    /// Drain both buffers for an upload.
    pub fn take_buffers(&mut self) -> (Vec<String>, Vec<String>) {
        (
            std::mem::take(&mut self.stdout),
            std::mem::take(&mut self.stderr),
        )
    }
}
