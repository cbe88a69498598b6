//! The coordinator: one application object owning the agent registry, the
//! tag catalog, the persistent stores and the rollout engine.
//!
//! HTTP handlers translate requests into the operations here; nothing in
//! this module reads ambient globals. Command state reports funnel through
//! `report_command_state`, which runs output validation on the
//! `finished_execution → flushed_logs` edge and feeds terminal outcomes to
//! the rollout driver.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::command::{Command, CommandError, CommandState};
use crate::config::Config;
use crate::consensus::{Consensus, ConsensusRequest, PendingView, RequestState};
use crate::registry::{AgentRegistry, RegisteredAgent, LONG_POLL_TIMEOUT};
use crate::rollout::ExecutionCoordinator;
use crate::signing;
use crate::template::TemplateStore;
use crate::users::{SecondFactor, UserStore};
use crate::validation;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Minimum length of a consensus request reason.
const MIN_REASON_LEN: usize = 4;

pub struct Server {
    pub config: Config,
    /// Fresh per process start; agents re-authenticate when it changes.
    pub instance_id: String,
    pub registry: Arc<AgentRegistry>,
    pub templates: Arc<TemplateStore>,
    pub consensus: Arc<Consensus>,
    pub users: Arc<UserStore>,
    pub rollout: Arc<ExecutionCoordinator>,
    pub second_factor: Arc<dyn SecondFactor>,
    tags: RwLock<BTreeSet<String>>,
}

impl Server {
    /// Open the stores under the configured home directory and assemble the
    /// coordinator.
    pub async fn new(
        config: Config,
        second_factor: Arc<dyn SecondFactor>,
    ) -> anyhow::Result<Arc<Server>> {
        tokio::fs::create_dir_all(&config.home_dir).await?;

        let registry = Arc::new(AgentRegistry::new());
        let templates = Arc::new(TemplateStore::open(config.home_file("templates.json")).await);
        let consensus = Arc::new(Consensus::open(config.home_file("consensus.json")).await);
        let users = Arc::new(UserStore::open(config.home_file("users.json")).await);
        users.bootstrap().await?;

        let rollout =
            ExecutionCoordinator::new(registry.clone(), templates.clone(), consensus.clone());

        Ok(Arc::new(Server {
            config,
            instance_id: Uuid::new_v4().to_string(),
            registry,
            templates,
            consensus,
            users,
            rollout,
            second_factor,
            tags: RwLock::new(BTreeSet::new()),
        }))
    }

    /// Minutely sweep dropping agents that stopped pinging.
    pub fn spawn_cleanup_loop(self: &Arc<Self>) {
        let server = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.tick().await; // first tick fires immediately
            loop {
                tick.tick().await;
                server.registry.cleanup(server.config.ping_interval).await;
            }
        });
    }

    /// Presence ping: register on first contact, refresh tags, and fold the
    /// tags into the append-only catalog.
    pub async fn register_agent(&self, agent_id: &str, tags: Vec<String>) -> Arc<RegisteredAgent> {
        let (agent, created) = self.registry.get_or_register(agent_id).await;
        if created {
            tracing::info!(agent = %agent_id, ?tags, "agent registered");
        }
        agent.update(tags.clone()).await;

        let mut catalog = self.tags.write().await;
        catalog.extend(tags);
        agent
    }

    pub async fn tags(&self) -> Vec<String> {
        self.tags.read().await.iter().cloned().collect()
    }

    /// Rotate an agent's command-signing token. Returns the token plus its
    /// signature under the pre-shared secret.
    pub async fn rotate_agent_token(&self, agent_id: &str) -> Result<(String, String), ServerError> {
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or(ServerError::NotFound("agent"))?;
        let token = signing::secure_random_token(32);
        agent.set_auth_token(token.clone()).await;
        tracing::info!(agent = %agent_id, "agent authenticated, token rotated");
        let signature = signing::token_signature(&token, &self.config.token);
        Ok((token, signature))
    }

    /// Long-poll the pending commands of an agent. Rejected until the agent
    /// has rotated a token, since unsigned commands would be discarded
    /// anyway.
    pub async fn poll_agent_commands(&self, agent_id: &str) -> Result<Vec<Command>, ServerError> {
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or(ServerError::NotFound("agent"))?;
        if agent.auth_token().await.is_none() {
            return Err(ServerError::Invalid(format!(
                "agent {agent_id} has no auth token yet"
            )));
        }
        Ok(agent.poll_pending(LONG_POLL_TIMEOUT).await)
    }

    /// Submit a consensus request. Role and second-factor gates are the
    /// HTTP boundary's job; policy on the request itself lives here.
    pub async fn submit_request(
        &self,
        template_id: &str,
        agent_ids: Vec<String>,
        requester_id: &str,
        reason: &str,
    ) -> Result<ConsensusRequest, ServerError> {
        let reason = reason.trim();
        if reason.len() < MIN_REASON_LEN {
            return Err(ServerError::Invalid(
                "please provide a valid reason".to_string(),
            ));
        }
        let template = self
            .templates
            .get(template_id)
            .await
            .ok_or(ServerError::NotFound("template"))?;
        let agent_ids: Vec<String> = agent_ids
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        if agent_ids.is_empty() {
            return Err(ServerError::Invalid("select at least one agent".to_string()));
        }

        let request = ConsensusRequest::new(template_id, agent_ids, requester_id, reason);
        self.consensus.insert(request.clone()).await;
        // A quorum of zero distinct approvers can not exist (min is 1), but
        // the check mirrors the approval path so both go through one gate.
        self.hand_off_if_ready(&request.id, template.min_approvals)
            .await;
        self.persist_consensus().await;
        Ok(request)
    }

    /// Record an approval vote and hand the request to the rollout engine
    /// once quorum is reached. Returns whether the vote counted.
    pub async fn approve_request(
        &self,
        request_id: &str,
        approver_id: &str,
    ) -> Result<bool, ServerError> {
        let request = self
            .consensus
            .get(request_id)
            .await
            .ok_or(ServerError::NotFound("request"))?;
        let template = self
            .templates
            .get(&request.template_id)
            .await
            .ok_or(ServerError::NotFound("template"))?;

        let counted = self
            .consensus
            .approve(request_id, approver_id)
            .await
            .ok_or(ServerError::NotFound("request"))?;
        self.hand_off_if_ready(request_id, template.min_approvals)
            .await;
        self.persist_consensus().await;
        Ok(counted)
    }

    async fn hand_off_if_ready(&self, request_id: &str, min_approvals: u32) {
        if let Some(approved) = self
            .consensus
            .try_mark_approved(request_id, min_approvals)
            .await
        {
            tracing::info!(
                request = %request_id,
                approvals = approved.approvers.len(),
                "quorum reached, scheduling execution"
            );
            self.rollout.start(approved).await;
        }
    }

    /// Abort a request: drop its commands fleet-wide, unblock the rollout
    /// driver, and record the state.
    pub async fn abort_request(&self, request_id: &str) -> Result<(), ServerError> {
        let request = self
            .consensus
            .get(request_id)
            .await
            .ok_or(ServerError::NotFound("request"))?;
        self.registry.abort_broadcast(&request.id).await;
        self.rollout.drop_entry(&request.id).await;
        self.consensus
            .set_state(&request.id, RequestState::Aborted)
            .await;
        self.persist_consensus().await;
        Ok(())
    }

    pub async fn pending_view(&self, user_id: &str) -> PendingView {
        self.consensus.pending_view(user_id).await
    }

    /// Apply a state report from an agent to the coordinator's view of the
    /// command. Runs validation rules on the log-flush edge and feeds
    /// terminal outcomes to the rollout driver.
    pub async fn report_command_state(
        &self,
        agent_id: &str,
        cmd_id: &str,
        state: &str,
    ) -> Result<CommandState, ServerError> {
        let new_state = CommandState::parse(state)
            .ok_or_else(|| ServerError::Invalid(format!("unknown command state '{state}'")))?;
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or(ServerError::NotFound("agent"))?;
        let shared = agent
            .command(cmd_id)
            .await
            .ok_or(ServerError::NotFound("command"))?;

        let snapshot = {
            let mut cmd = shared.write().await;
            let prev = cmd.set_state(new_state)?;

            if new_state == CommandState::FlushedLogs {
                match prev {
                    CommandState::FinishedExecution => {
                        self.validate_command(&mut cmd).await?;
                    }
                    CommandState::FailedExecution | CommandState::KilledExecution => {
                        cmd.set_state(CommandState::Failed)?;
                    }
                    _ => {}
                }
            }
            cmd.clone()
        };

        if snapshot.state().is_terminal() {
            self.rollout.on_command_terminal(&snapshot).await;
        }
        Ok(snapshot.state())
    }

    /// Run the template's validation rules against the flushed buffers.
    async fn validate_command(&self, cmd: &mut Command) -> Result<(), ServerError> {
        let passed = match self.templates.get(&cmd.template_id).await {
            Some(template) => validation::evaluate(&template.validation_rules, cmd),
            None => {
                tracing::warn!(
                    command = %cmd.id,
                    template = %cmd.template_id,
                    "template missing at validation time, treating output as valid"
                );
                true
            }
        };
        if passed {
            cmd.set_state(CommandState::Finished)?;
        } else {
            cmd.set_state(CommandState::FailedValidation)?;
        }
        Ok(())
    }

    /// Append uploaded log lines to the coordinator-side buffers.
    pub async fn append_command_logs(
        &self,
        agent_id: &str,
        cmd_id: &str,
        output: Vec<String>,
        error: Vec<String>,
    ) -> Result<(), ServerError> {
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or(ServerError::NotFound("agent"))?;
        let shared = agent
            .command(cmd_id)
            .await
            .ok_or(ServerError::NotFound("command"))?;
        let mut cmd = shared.write().await;
        cmd.stdout.extend(output);
        cmd.stderr.extend(error);
        Ok(())
    }

    /// Coordinator-side buffers of one command, for the logs view.
    pub async fn command_logs(
        &self,
        agent_id: &str,
        cmd_id: &str,
    ) -> Result<(Vec<String>, Vec<String>), ServerError> {
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or(ServerError::NotFound("agent"))?;
        let shared = agent
            .command(cmd_id)
            .await
            .ok_or(ServerError::NotFound("command"))?;
        let cmd = shared.read().await;
        Ok((cmd.stdout.clone(), cmd.stderr.clone()))
    }

    async fn persist_consensus(&self) {
        if let Err(e) = self.consensus.save().await {
            tracing::error!("Failed to persist consensus store: {e:#}");
        }
    }
}
