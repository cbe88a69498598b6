//! Command templates and the JSON-backed template store.
//!
//! A template couples the command text with its selection tags, approval
//! quorum, timeout, rollout strategy and ordered validation rules. Templates
//! are immutable except for appending and removing validation rules.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::validation::ValidationRule;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("title can not be empty")]
    EmptyTitle,

    #[error("command can not be empty")]
    EmptyCommand,

    #[error("min approvals must be at least 1")]
    MinApprovalsTooLow,

    #[error("timeout must be at least 1 second")]
    TimeoutTooLow,

    #[error("strategy not found: {0}")]
    UnknownStrategy(String),
}

/// Policy deciding wave sizes across the iterations of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStrategy {
    /// Everything at once.
    Simple,
    /// One canary, then everything remaining.
    OneTest,
    /// One agent per iteration.
    Rolling,
    /// Wave of `2^i`, clamped to the remaining count.
    ExponentialRolling,
}

impl ExecutionStrategy {
    pub fn parse(s: &str) -> Result<ExecutionStrategy, TemplateError> {
        Ok(match s {
            "simple" => ExecutionStrategy::Simple,
            "one-test" => ExecutionStrategy::OneTest,
            "rolling" => ExecutionStrategy::Rolling,
            "exponential-rolling" => ExecutionStrategy::ExponentialRolling,
            other => return Err(TemplateError::UnknownStrategy(other.to_string())),
        })
    }

    /// Number of agents dispatched at `iteration` given how many are still
    /// pending.
    pub fn wave_size(&self, iteration: u32, remaining: usize) -> usize {
        let wave = match self {
            ExecutionStrategy::Simple => remaining,
            ExecutionStrategy::OneTest => {
                if iteration == 0 {
                    1
                } else {
                    remaining
                }
            }
            ExecutionStrategy::Rolling => 1,
            ExecutionStrategy::ExponentialRolling => {
                2usize.saturating_pow(iteration.min(u32::BITS - 1))
            }
        };
        wave.min(remaining)
    }

    /// Simple fires one all-at-once wave and tolerates per-agent failures;
    /// every staged strategy aborts the request on the first failed wave.
    pub fn aborts_on_failure(&self) -> bool {
        !matches!(self, ExecutionStrategy::Simple)
    }
}

/// A reusable, consensus-gated command definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub title: String,
    pub description: String,
    pub command: String,
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub min_approvals: u32,
    pub timeout_secs: u64,
    pub strategy: ExecutionStrategy,
    pub validation_rules: Vec<ValidationRule>,
}

impl Template {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        command: impl Into<String>,
        include_tags: Vec<String>,
        exclude_tags: Vec<String>,
        min_approvals: u32,
        timeout_secs: u64,
        strategy: ExecutionStrategy,
    ) -> Result<Self, TemplateError> {
        let template = Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            command: command.into(),
            include_tags: clean_tags(include_tags),
            exclude_tags: clean_tags(exclude_tags),
            min_approvals,
            timeout_secs,
            strategy,
            validation_rules: Vec::new(),
        };
        template.validate()?;
        Ok(template)
    }

    pub fn validate(&self) -> Result<(), TemplateError> {
        if self.title.trim().is_empty() {
            return Err(TemplateError::EmptyTitle);
        }
        if self.command.trim().is_empty() {
            return Err(TemplateError::EmptyCommand);
        }
        if self.min_approvals < 1 {
            return Err(TemplateError::MinApprovalsTooLow);
        }
        if self.timeout_secs < 1 {
            return Err(TemplateError::TimeoutTooLow);
        }
        Ok(())
    }
}

fn clean_tags(tags: Vec<String>) -> Vec<String> {
    tags.into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct TemplateSnapshot {
    templates: HashMap<String, Template>,
}

/// JSON-file-backed template store. Every mutation rewrites the snapshot
/// atomically (write tmp, rename).
pub struct TemplateStore {
    path: PathBuf,
    templates: RwLock<HashMap<String, Template>>,
    persist_lock: Mutex<()>,
}

impl TemplateStore {
    pub async fn open(path: PathBuf) -> Self {
        let snapshot = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<TemplateSnapshot>(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!("Failed to parse template store {}: {}", path.display(), e);
                    TemplateSnapshot::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => TemplateSnapshot::default(),
            Err(err) => {
                tracing::warn!("Failed to read template store {}: {}", path.display(), err);
                TemplateSnapshot::default()
            }
        };
        Self {
            path,
            templates: RwLock::new(snapshot.templates),
            persist_lock: Mutex::new(()),
        }
    }

    pub async fn get(&self, id: &str) -> Option<Template> {
        self.templates.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Template> {
        let mut templates: Vec<Template> = self.templates.read().await.values().cloned().collect();
        templates.sort_by(|a, b| a.title.cmp(&b.title));
        templates
    }

    pub async fn add(&self, template: Template) {
        self.templates
            .write()
            .await
            .insert(template.id.clone(), template);
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.templates.write().await.remove(id).is_some()
    }

    /// Append a validation rule to a template. Returns false when the
    /// template does not exist.
    pub async fn add_validation_rule(&self, template_id: &str, rule: ValidationRule) -> bool {
        match self.templates.write().await.get_mut(template_id) {
            Some(template) => {
                template.validation_rules.push(rule);
                true
            }
            None => false,
        }
    }

    /// Remove a validation rule by id. Returns false when nothing matched.
    pub async fn remove_validation_rule(&self, template_id: &str, rule_id: &str) -> bool {
        match self.templates.write().await.get_mut(template_id) {
            Some(template) => {
                let before = template.validation_rules.len();
                template.validation_rules.retain(|r| r.id != rule_id);
                template.validation_rules.len() != before
            }
            None => false,
        }
    }

    /// Persist the current snapshot. Call after every mutation.
    pub async fn save(&self) -> anyhow::Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = TemplateSnapshot {
            templates: self.templates.read().await.clone(),
        };
        let data = serde_json::to_vec_pretty(&snapshot)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}
