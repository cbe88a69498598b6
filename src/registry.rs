//! Registered agents and the coordinator-side registry.
//!
//! Each remote agent is represented by a `RegisteredAgent` holding its
//! presence data, tag set, auth token and two command maps: `pending`
//! (awaiting long-poll drain) and `inflight` (handed off, kept for state
//! reports and history until aborted or aged out). A capacity-1 wake channel
//! connects `submit` to the agent's parked long-poll.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::command::Command;

/// Server-side bound on a command long-poll; agents re-poll on empty.
pub const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(25);

/// An agent is alive while its last ping is within this many intervals.
pub const LIVENESS_INTERVALS: u32 = 5;

pub type SharedCommand = Arc<RwLock<Command>>;

/// Presence snapshot returned by the clients listing.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub id: String,
    pub tags: Vec<String>,
    pub last_seen_secs: u64,
    pub authenticated: bool,
}

struct AgentState {
    auth_token: Option<String>,
    /// Unix seconds of the last presence ping.
    last_seen: i64,
    tags: Vec<String>,
    /// Commands awaiting long-poll drain. Subset of `inflight` at submit time.
    pending: HashMap<String, SharedCommand>,
    /// Commands handed off, kept until aborted or aged out.
    inflight: HashMap<String, SharedCommand>,
}

/// One registered remote agent.
pub struct RegisteredAgent {
    id: String,
    state: RwLock<AgentState>,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<mpsc::Receiver<()>>,
}

impl RegisteredAgent {
    pub fn new(id: impl Into<String>) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Self {
            id: id.into(),
            state: RwLock::new(AgentState {
                auth_token: None,
                last_seen: chrono::Utc::now().timestamp(),
                tags: Vec::new(),
                pending: HashMap::new(),
                inflight: HashMap::new(),
            }),
            wake_tx,
            wake_rx: Mutex::new(wake_rx),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Refresh presence and the tag set from a ping.
    pub async fn update(&self, tags: Vec<String>) {
        let mut state = self.state.write().await;
        state.last_seen = chrono::Utc::now().timestamp();
        state.tags = tags;
    }

    pub async fn has_tag(&self, tag: &str) -> bool {
        self.state.read().await.tags.iter().any(|t| t == tag)
    }

    pub async fn tags(&self) -> Vec<String> {
        self.state.read().await.tags.clone()
    }

    /// Alive iff the last ping is recent enough.
    pub async fn is_alive(&self, ping_interval: Duration) -> bool {
        let state = self.state.read().await;
        let window = (ping_interval * LIVENESS_INTERVALS).as_secs() as i64;
        chrono::Utc::now().timestamp() - state.last_seen <= window
    }

    pub async fn auth_token(&self) -> Option<String> {
        self.state.read().await.auth_token.clone()
    }

    pub async fn set_auth_token(&self, token: String) {
        self.state.write().await.auth_token = Some(token);
    }

    pub async fn info(&self) -> AgentInfo {
        let state = self.state.read().await;
        AgentInfo {
            id: self.id.clone(),
            tags: state.tags.clone(),
            last_seen_secs: (chrono::Utc::now().timestamp() - state.last_seen).max(0) as u64,
            authenticated: state.auth_token.is_some(),
        }
    }

    /// Queue a signed command for this agent and wake its long-poll.
    pub async fn submit(&self, cmd: Command) -> SharedCommand {
        let cmd_id = cmd.id.clone();
        tracing::info!(
            target: "audit",
            agent = %self.id,
            command = %cmd_id,
            request = %cmd.request_id,
            "execute '{}'",
            cmd.command
        );
        let shared: SharedCommand = Arc::new(RwLock::new(cmd));
        {
            let mut state = self.state.write().await;
            state.pending.insert(cmd_id.clone(), shared.clone());
            state.inflight.insert(cmd_id, shared.clone());
        }
        // Capacity-1 mailbox: a full buffer means a wake is already queued
        // and the drain will pick this command up too.
        let _ = self.wake_tx.try_send(());
        shared
    }

    /// Long-poll for pending commands: parks on the wake channel up to
    /// `timeout`, then drains everything pending. Returns an empty list on
    /// timeout.
    pub async fn poll_pending(&self, timeout: Duration) -> Vec<Command> {
        let mut rx = self.wake_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(())) => self.drain_pending().await,
            // Channel closed or poll timed out.
            _ => Vec::new(),
        }
    }

    async fn drain_pending(&self) -> Vec<Command> {
        let mut state = self.state.write().await;
        let drained: Vec<SharedCommand> = state.pending.drain().map(|(_, c)| c).collect();
        drop(state);
        let mut cmds = Vec::with_capacity(drained.len());
        for shared in drained {
            cmds.push(shared.read().await.clone());
        }
        cmds
    }

    /// Drop every in-flight command belonging to the given request. Pending
    /// entries stay addressable but the coordinator's view is authoritative.
    pub async fn abort_execution(&self, request_id: &str) {
        let mut state = self.state.write().await;
        let mut doomed = Vec::new();
        for (id, cmd) in state.inflight.iter() {
            if cmd.read().await.request_id == request_id {
                doomed.push(id.clone());
            }
        }
        for id in doomed {
            state.inflight.remove(&id);
            tracing::info!(agent = %self.id, command = %id, request = %request_id, "aborted in-flight command");
        }
    }

    /// Look up an in-flight command by id.
    pub async fn command(&self, cmd_id: &str) -> Option<SharedCommand> {
        self.state.read().await.inflight.get(cmd_id).cloned()
    }

    /// Snapshot of the dispatched history, purging entries past the
    /// retention window first.
    pub async fn commands(&self) -> Vec<Command> {
        let now = chrono::Utc::now().timestamp();

        let mut expired = Vec::new();
        {
            let state = self.state.read().await;
            for (id, cmd) in state.inflight.iter() {
                if cmd.read().await.is_expired(now) {
                    expired.push(id.clone());
                }
            }
        }
        if !expired.is_empty() {
            let mut state = self.state.write().await;
            for id in &expired {
                state.inflight.remove(id);
                state.pending.remove(id);
            }
            tracing::debug!(agent = %self.id, purged = expired.len(), "purged aged-out commands");
        }

        let state = self.state.read().await;
        let shared: Vec<SharedCommand> = state.inflight.values().cloned().collect();
        drop(state);
        let mut cmds = Vec::with_capacity(shared.len());
        for c in shared {
            cmds.push(c.read().await.clone());
        }
        cmds
    }

    #[cfg(test)]
    pub async fn rewind_last_seen(&self, by: Duration) {
        let mut state = self.state.write().await;
        state.last_seen -= by.as_secs() as i64;
    }
}

/// Thread-safe mapping of agent id to registered agent.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<RegisteredAgent>>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch an agent, registering it on first contact.
    pub async fn get_or_register(&self, id: &str) -> (Arc<RegisteredAgent>, bool) {
        if let Some(agent) = self.get(id).await {
            return (agent, false);
        }
        let mut agents = self.agents.write().await;
        // Double-checked: another ping may have registered it meanwhile.
        if let Some(agent) = agents.get(id) {
            return (agent.clone(), false);
        }
        let agent = Arc::new(RegisteredAgent::new(id));
        agents.insert(id.to_string(), agent.clone());
        (agent, true)
    }

    pub async fn add(&self, agent: Arc<RegisteredAgent>) {
        self.agents
            .write()
            .await
            .insert(agent.id().to_string(), agent);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<RegisteredAgent>> {
        self.agents.read().await.get(id).cloned()
    }

    pub async fn remove_by_id(&self, id: &str) {
        self.agents.write().await.remove(id);
    }

    /// Drop every agent whose last ping fell outside the liveness window.
    pub async fn cleanup(&self, ping_interval: Duration) {
        let mut dead = Vec::new();
        {
            let agents = self.agents.read().await;
            for (id, agent) in agents.iter() {
                if !agent.is_alive(ping_interval).await {
                    dead.push(id.clone());
                }
            }
        }
        if dead.is_empty() {
            return;
        }
        let mut agents = self.agents.write().await;
        for id in dead {
            if agents.remove(&id).is_some() {
                tracing::info!(agent = %id, "agent disconnected");
            }
        }
    }

    /// Agents whose tag set contains every `include` tag and none of the
    /// `exclude` tags. Empty filters mean no constraint.
    pub async fn list(&self, include: &[String], exclude: &[String]) -> Vec<Arc<RegisteredAgent>> {
        let agents = self.agents.read().await;
        let mut res = Vec::with_capacity(agents.len());
        'agents: for agent in agents.values() {
            for tag in exclude {
                if agent.has_tag(tag).await {
                    continue 'agents;
                }
            }
            for tag in include {
                if !agent.has_tag(tag).await {
                    continue 'agents;
                }
            }
            res.push(agent.clone());
        }
        res
    }

    /// Propagate an abort to every registered agent.
    pub async fn abort_broadcast(&self, request_id: &str) {
        let agents: Vec<Arc<RegisteredAgent>> =
            self.agents.read().await.values().cloned().collect();
        for agent in agents {
            agent.abort_execution(request_id).await;
        }
    }

    /// Dispatched-command audit view: agent id to command snapshots.
    pub async fn list_commands(&self) -> HashMap<String, Vec<Command>> {
        let agents: Vec<Arc<RegisteredAgent>> =
            self.agents.read().await.values().cloned().collect();
        let mut res = HashMap::with_capacity(agents.len());
        for agent in agents {
            res.insert(agent.id().to_string(), agent.commands().await);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::COMMAND_RETENTION_SECS;

    async fn agent_with_tags(id: &str, tags: &[&str]) -> Arc<RegisteredAgent> {
        let agent = Arc::new(RegisteredAgent::new(id));
        agent
            .update(tags.iter().map(|t| t.to_string()).collect())
            .await;
        agent
    }

    fn request_cmd(request_id: &str) -> Command {
        let mut cmd = Command::new("uptime", 30);
        cmd.request_id = request_id.to_string();
        cmd
    }

    #[tokio::test]
    async fn list_with_exclusion_only() {
        let registry = AgentRegistry::new();
        registry.add(agent_with_tags("a", &["x"]).await).await;
        registry.add(agent_with_tags("b", &["x", "z"]).await).await;

        let list = registry.list(&[], &["z".to_string()]).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id(), "a");
    }

    #[tokio::test]
    async fn list_with_inclusion_requires_all_tags() {
        let registry = AgentRegistry::new();
        registry.add(agent_with_tags("a", &["x", "y"]).await).await;
        registry.add(agent_with_tags("b", &["x"]).await).await;

        let list = registry
            .list(&["x".to_string(), "y".to_string()], &[])
            .await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id(), "a");
    }

    #[tokio::test]
    async fn list_combined_criteria() {
        // a{x,y} b{x} c{y,z}; include x, exclude z selects {a, b}.
        let registry = AgentRegistry::new();
        registry.add(agent_with_tags("a", &["x", "y"]).await).await;
        registry.add(agent_with_tags("b", &["x"]).await).await;
        registry.add(agent_with_tags("c", &["y", "z"]).await).await;

        let list = registry.list(&["x".to_string()], &["z".to_string()]).await;
        let mut ids: Vec<&str> = list.iter().map(|a| a.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn list_empty_filters_return_everyone() {
        let registry = AgentRegistry::new();
        registry.add(agent_with_tags("a", &[]).await).await;
        registry.add(agent_with_tags("b", &["x"]).await).await;
        assert_eq!(registry.list(&[], &[]).await.len(), 2);
    }

    #[tokio::test]
    async fn get_or_register_is_idempotent() {
        let registry = AgentRegistry::new();
        let (first, created) = registry.get_or_register("node-1").await;
        assert!(created);
        let (second, created) = registry.get_or_register("node-1").await;
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn cleanup_removes_only_dead_agents() {
        let ping = Duration::from_secs(30);
        let registry = AgentRegistry::new();
        let alive = agent_with_tags("alive", &[]).await;
        let dead = agent_with_tags("dead", &[]).await;
        dead.rewind_last_seen(ping * (LIVENESS_INTERVALS + 1)).await;
        registry.add(alive).await;
        registry.add(dead).await;

        registry.cleanup(ping).await;
        assert!(registry.get("alive").await.is_some());
        assert!(registry.get("dead").await.is_none());
    }

    #[tokio::test]
    async fn submit_wakes_parked_long_poll() {
        let agent = Arc::new(RegisteredAgent::new("node-1"));
        let poller = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.poll_pending(Duration::from_secs(5)).await })
        };
        // Give the poller a moment to park on the wake channel.
        tokio::time::sleep(Duration::from_millis(20)).await;
        agent.submit(request_cmd("req-1")).await;

        let cmds = poller.await.expect("join");
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].request_id, "req-1");

        // Drained from pending, still tracked in-flight.
        assert!(agent.command(&cmds[0].id).await.is_some());
        assert_eq!(agent.commands().await.len(), 1);
    }

    #[tokio::test]
    async fn poll_times_out_with_empty_list() {
        let agent = RegisteredAgent::new("node-1");
        let cmds = agent.poll_pending(Duration::from_millis(30)).await;
        assert!(cmds.is_empty());
    }

    #[tokio::test]
    async fn one_wake_drains_every_pending_command() {
        let agent = Arc::new(RegisteredAgent::new("node-1"));
        agent.submit(request_cmd("req-1")).await;
        agent.submit(request_cmd("req-1")).await;
        let cmds = agent.poll_pending(Duration::from_millis(100)).await;
        assert_eq!(cmds.len(), 2);
    }

    #[tokio::test]
    async fn abort_broadcast_removes_matching_inflight_everywhere() {
        let registry = AgentRegistry::new();
        let a = Arc::new(RegisteredAgent::new("a"));
        let b = Arc::new(RegisteredAgent::new("b"));
        a.submit(request_cmd("req-1")).await;
        a.submit(request_cmd("req-2")).await;
        b.submit(request_cmd("req-1")).await;
        registry.add(a.clone()).await;
        registry.add(b.clone()).await;

        registry.abort_broadcast("req-1").await;

        let survivors = a.commands().await;
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].request_id, "req-2");
        assert!(b.commands().await.is_empty());
    }

    #[tokio::test]
    async fn commands_purges_aged_out_entries() {
        let agent = RegisteredAgent::new("node-1");
        let mut old = request_cmd("req-1");
        old.created = chrono::Utc::now().timestamp() - COMMAND_RETENTION_SECS - 60;
        agent.submit(old).await;
        agent.submit(request_cmd("req-2")).await;

        let cmds = agent.commands().await;
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].request_id, "req-2");
    }

    #[tokio::test]
    async fn list_commands_covers_all_agents() {
        let registry = AgentRegistry::new();
        let a = Arc::new(RegisteredAgent::new("a"));
        a.submit(request_cmd("req-1")).await;
        registry.add(a).await;
        registry.add(Arc::new(RegisteredAgent::new("b"))).await;

        let by_agent = registry.list_commands().await;
        assert_eq!(by_agent.len(), 2);
        assert_eq!(by_agent["a"].len(), 1);
        assert!(by_agent["b"].is_empty());
    }
}
