//! Output validation rules attached to templates.
//!
//! A rule is a substring check against one of the two output streams of a
//! finished command. Rules are evaluated in order once the agent has flushed
//! its logs; a violated fatal rule fails the command.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::command::Command;

/// Stream a validation rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    /// Numeric stream selector used on the wire (1 = stdout, 2 = stderr).
    pub fn from_id(id: u8) -> Option<OutputStream> {
        match id {
            1 => Some(OutputStream::Stdout),
            2 => Some(OutputStream::Stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ValidationRuleError {
    #[error("validation text can not be empty")]
    EmptyText,

    #[error("unknown output stream {0}, expected 1 (stdout) or 2 (stderr)")]
    UnknownStream(u8),
}

/// Substring check gating whether a command counts as successful.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRule {
    pub id: String,
    pub text: String,
    /// `true`: the text must appear; `false`: the text must not appear.
    pub must_contain: bool,
    pub stream: OutputStream,
    /// A violated fatal rule fails the command; non-fatal violations are
    /// only logged.
    pub fatal: bool,
}

impl ValidationRule {
    /// Build a rule from caller-supplied values.
    ///
    /// # Errors
    ///
    /// Rejects empty match text and stream ids outside 1/2.
    pub fn new(
        text: impl Into<String>,
        fatal: bool,
        must_contain: bool,
        stream_id: u8,
    ) -> Result<Self, ValidationRuleError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ValidationRuleError::EmptyText);
        }
        let stream = OutputStream::from_id(stream_id).ok_or(ValidationRuleError::UnknownStream(stream_id))?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            text,
            must_contain,
            stream,
            fatal,
        })
    }

    /// A rule matches when any buffered line of the selected stream contains
    /// the text as a substring.
    pub fn matches(&self, cmd: &Command) -> bool {
        let stream = match self.stream {
            OutputStream::Stdout => &cmd.stdout,
            OutputStream::Stderr => &cmd.stderr,
        };
        stream.iter().any(|line| line.contains(&self.text))
    }

    /// Whether this rule is violated by the command's buffered output.
    pub fn is_violated(&self, cmd: &Command) -> bool {
        let matched = self.matches(cmd);
        (self.must_contain && !matched) || (!self.must_contain && matched)
    }
}

/// Evaluate rules in order against a command's buffered output.
///
/// Returns `true` when no fatal rule is violated. Non-fatal violations are
/// logged and do not gate the result.
pub fn evaluate(rules: &[ValidationRule], cmd: &Command) -> bool {
    for rule in rules {
        if rule.is_violated(cmd) {
            if rule.fatal {
                tracing::info!(
                    command = %cmd.id,
                    rule = %rule.id,
                    text = %rule.text,
                    "fatal validation rule violated"
                );
                return false;
            }
            tracing::warn!(
                command = %cmd.id,
                rule = %rule.id,
                text = %rule.text,
                "validation rule violated (non-fatal)"
            );
        }
    }
    true
}
