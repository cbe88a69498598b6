//! Staged rollout of approved consensus requests.
//!
//! Each approved request gets a driver task that walks the agent selection
//! in waves sized by the template's strategy. The driver dispatches one wave,
//! parks on a per-request event channel until every in-flight command of the
//! wave is terminal, then either advances, completes the request, or aborts
//! it. Terminal command transitions and external aborts arrive as events, so
//! an abort unblocks a parked wave immediately.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::command::Command;
use crate::consensus::{Consensus, ConsensusRequest, RequestState};
use crate::registry::AgentRegistry;
use crate::template::{Template, TemplateStore};

/// Events feeding a parked rollout driver.
#[derive(Debug)]
enum WaveEvent {
    /// A command of this request reached a terminal state.
    Terminal {
        agent_id: String,
        iteration: u32,
        ok: bool,
    },
    /// The request was aborted externally; the driver exits without
    /// touching request state.
    Abort,
}

/// Shared view of one request's rollout progress.
pub struct RolloutEntry {
    request_id: String,
    iteration: RwLock<u32>,
    events: mpsc::UnboundedSender<WaveEvent>,
}

impl RolloutEntry {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn iteration(&self) -> u32 {
        *self.iteration.read().await
    }

    /// Whether a command report belongs to the wave currently gating this
    /// entry. Retried commands from earlier iterations fail this check.
    pub async fn is_execution(&self, cmd: &Command) -> bool {
        cmd.is_execution(&self.request_id, self.iteration().await)
    }
}

/// Dispatches approved requests and advances them wave by wave.
pub struct ExecutionCoordinator {
    registry: Arc<AgentRegistry>,
    templates: Arc<TemplateStore>,
    consensus: Arc<Consensus>,
    entries: RwLock<HashMap<String, Arc<RolloutEntry>>>,
}

impl ExecutionCoordinator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        templates: Arc<TemplateStore>,
        consensus: Arc<Consensus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            templates,
            consensus,
            entries: RwLock::new(HashMap::new()),
        })
    }

    pub async fn entry(&self, request_id: &str) -> Option<Arc<RolloutEntry>> {
        self.entries.read().await.get(request_id).cloned()
    }

    /// Begin executing an approved request: register an entry and spawn its
    /// driver task.
    pub async fn start(self: &Arc<Self>, request: ConsensusRequest) {
        let template = match self.templates.get(&request.template_id).await {
            Some(t) => t,
            None => {
                tracing::error!(
                    request = %request.id,
                    template = %request.template_id,
                    "template vanished before execution, aborting request"
                );
                self.consensus.set_state(&request.id, RequestState::Aborted).await;
                if let Err(e) = self.consensus.save().await {
                    tracing::error!("Failed to persist consensus store: {e:#}");
                }
                return;
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let entry = Arc::new(RolloutEntry {
            request_id: request.id.clone(),
            iteration: RwLock::new(0),
            events: events_tx,
        });
        self.entries
            .write()
            .await
            .insert(request.id.clone(), entry.clone());

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.drive(request, template, entry, events_rx).await;
        });
    }

    /// Feed a terminal command transition into its request's driver, if the
    /// request is still being rolled out. Reports from superseded iterations
    /// (retried commands) do not feed the current wave.
    pub async fn on_command_terminal(&self, cmd: &Command) {
        let Some(entry) = self.entry(&cmd.request_id).await else {
            return;
        };
        if !entry.is_execution(cmd).await {
            return;
        }
        let _ = entry.events.send(WaveEvent::Terminal {
            agent_id: cmd.agent_id.clone(),
            iteration: cmd.iteration,
            ok: cmd.state().is_terminal_ok(),
        });
    }

    /// Drop a request's rollout and unblock its driver. Used by external
    /// aborts; the caller owns the request state change and the agent
    /// broadcast.
    pub async fn drop_entry(&self, request_id: &str) {
        if let Some(entry) = self.entries.write().await.remove(request_id) {
            let _ = entry.events.send(WaveEvent::Abort);
        }
    }

    async fn remove_entry(&self, request_id: &str) {
        self.entries.write().await.remove(request_id);
    }

    /// The per-request driver loop.
    async fn drive(
        self: Arc<Self>,
        request: ConsensusRequest,
        template: Template,
        entry: Arc<RolloutEntry>,
        mut events: mpsc::UnboundedReceiver<WaveEvent>,
    ) {
        let request_id = request.id.clone();
        let strategy = template.strategy;

        self.set_request_state(&request_id, RequestState::Executing)
            .await;

        let mut pending: VecDeque<String> = request.agent_ids.iter().cloned().collect();
        let mut iteration: u32 = 0;

        loop {
            let wave_size = strategy.wave_size(iteration, pending.len());
            if wave_size == 0 {
                break;
            }
            *entry.iteration.write().await = iteration;

            let wave: Vec<String> = pending.drain(..wave_size).collect();
            tracing::info!(
                request = %request_id,
                iteration,
                wave = wave.len(),
                remaining = pending.len(),
                "dispatching rollout wave"
            );

            let mut inflight: HashSet<String> = HashSet::new();
            let mut wave_failed = false;
            for agent_id in &wave {
                match self
                    .dispatch_one(&request, &template, agent_id, iteration)
                    .await
                {
                    Ok(()) => {
                        inflight.insert(agent_id.clone());
                    }
                    Err(e) => {
                        tracing::warn!(
                            request = %request_id,
                            agent = %agent_id,
                            "dispatch failed: {e:#}"
                        );
                        wave_failed = true;
                    }
                }
            }

            // Park until every in-flight command of this wave is terminal.
            while !inflight.is_empty() {
                match events.recv().await {
                    None | Some(WaveEvent::Abort) => {
                        tracing::info!(request = %request_id, "rollout aborted");
                        self.remove_entry(&request_id).await;
                        return;
                    }
                    Some(WaveEvent::Terminal {
                        agent_id,
                        iteration: cmd_iteration,
                        ok,
                    }) => {
                        if cmd_iteration != iteration || !inflight.remove(&agent_id) {
                            continue;
                        }
                        if !ok {
                            wave_failed = true;
                        }
                    }
                }
            }

            if wave_failed && strategy.aborts_on_failure() {
                tracing::warn!(
                    request = %request_id,
                    iteration,
                    "wave failed, aborting request"
                );
                self.registry.abort_broadcast(&request_id).await;
                self.set_request_state(&request_id, RequestState::Aborted)
                    .await;
                self.remove_entry(&request_id).await;
                return;
            }

            iteration += 1;
        }

        self.set_request_state(&request_id, RequestState::Completed)
            .await;
        self.remove_entry(&request_id).await;
        tracing::info!(request = %request_id, "rollout completed");
    }

    async fn dispatch_one(
        &self,
        request: &ConsensusRequest,
        template: &Template,
        agent_id: &str,
        iteration: u32,
    ) -> anyhow::Result<()> {
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("agent {agent_id} is not registered"))?;
        let token = agent
            .auth_token()
            .await
            .ok_or_else(|| anyhow::anyhow!("agent {agent_id} has no auth token"))?;

        let mut cmd = Command::new(template.command.clone(), template.timeout_secs);
        cmd.agent_id = agent_id.to_string();
        cmd.request_id = request.id.clone();
        cmd.template_id = template.id.clone();
        cmd.requester_id = request.requester_id.clone();
        cmd.iteration = iteration;
        cmd.sign(&token)?;

        agent.submit(cmd).await;
        Ok(())
    }

    async fn set_request_state(&self, request_id: &str, state: RequestState) {
        self.consensus.set_state(request_id, state).await;
        if let Err(e) = self.consensus.save().await {
            tracing::error!("Failed to persist consensus store: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandState;
    use crate::registry::RegisteredAgent;
    use crate::signing::secure_random_token;
    use crate::template::ExecutionStrategy;
    use std::time::Duration;

    struct Fixture {
        registry: Arc<AgentRegistry>,
        consensus: Arc<Consensus>,
        coordinator: Arc<ExecutionCoordinator>,
        _temp: tempfile::TempDir,
    }

    async fn fixture(strategy: ExecutionStrategy, agents: &[&str]) -> (Fixture, ConsensusRequest) {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(AgentRegistry::new());
        for id in agents {
            let agent = Arc::new(RegisteredAgent::new(*id));
            agent.set_auth_token(secure_random_token(32)).await;
            registry.add(agent).await;
        }
        let templates = Arc::new(TemplateStore::open(temp.path().join("templates.json")).await);
        let template = Template::new(
            "Rollout",
            "",
            "systemctl restart app",
            vec![],
            vec![],
            1,
            30,
            strategy,
        )
        .expect("template");
        let template_id = template.id.clone();
        templates.add(template).await;

        let consensus = Arc::new(Consensus::open(temp.path().join("consensus.json")).await);
        let mut request = ConsensusRequest::new(
            template_id,
            agents.iter().map(|a| a.to_string()).collect(),
            "u1",
            "test rollout",
        );
        request.state = RequestState::Approved;
        consensus.insert(request.clone()).await;

        let coordinator =
            ExecutionCoordinator::new(registry.clone(), templates.clone(), consensus.clone());
        (
            Fixture {
                registry,
                consensus,
                coordinator,
                _temp: temp,
            },
            request,
        )
    }

    async fn dispatched(fx: &Fixture, agent_id: &str) -> Vec<Command> {
        fx.registry
            .get(agent_id)
            .await
            .expect("agent")
            .commands()
            .await
    }

    /// Poll until the agent has `n` dispatched commands or time runs out.
    async fn wait_for_dispatch(fx: &Fixture, agent_id: &str, n: usize) -> Vec<Command> {
        for _ in 0..200 {
            let cmds = dispatched(fx, agent_id).await;
            if cmds.len() >= n {
                return cmds;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent {agent_id} never received {n} commands");
    }

    async fn wait_for_request_state(fx: &Fixture, request_id: &str, state: RequestState) {
        for _ in 0..200 {
            if fx.consensus.get(request_id).await.expect("request").state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("request never reached {state:?}");
    }

    /// Report a command as terminal to the coordinator the way the state
    /// handler does once an agent finishes.
    async fn report_terminal(fx: &Fixture, mut cmd: Command, ok: bool) {
        use CommandState::*;
        cmd.set_state(Validating).expect("transition");
        cmd.set_state(Starting).expect("transition");
        if ok {
            cmd.set_state(StartedExecution).expect("transition");
            cmd.set_state(FinishedExecution).expect("transition");
            cmd.set_state(FlushedLogs).expect("transition");
            cmd.set_state(Finished).expect("transition");
        } else {
            cmd.set_state(StartedExecution).expect("transition");
            cmd.set_state(FailedExecution).expect("transition");
            cmd.set_state(FlushedLogs).expect("transition");
            cmd.set_state(Failed).expect("transition");
        }
        fx.coordinator.on_command_terminal(&cmd).await;
    }

    #[tokio::test]
    async fn rolling_advances_one_agent_per_iteration() {
        let (fx, request) = fixture(ExecutionStrategy::Rolling, &["a", "b", "c"]).await;
        fx.coordinator.start(request.clone()).await;

        let a_cmds = wait_for_dispatch(&fx, "a", 1).await;
        assert_eq!(a_cmds[0].iteration, 0);
        // Nothing for b or c while the first wave is open.
        assert!(dispatched(&fx, "b").await.is_empty());
        assert!(dispatched(&fx, "c").await.is_empty());

        report_terminal(&fx, a_cmds[0].clone(), true).await;
        let b_cmds = wait_for_dispatch(&fx, "b", 1).await;
        assert_eq!(b_cmds[0].iteration, 1);
        assert!(dispatched(&fx, "c").await.is_empty());

        // Failure on the second wave aborts the whole request and c never
        // receives anything.
        report_terminal(&fx, b_cmds[0].clone(), false).await;
        wait_for_request_state(&fx, &request.id, RequestState::Aborted).await;
        assert!(dispatched(&fx, "c").await.is_empty());
        assert!(fx.coordinator.entry(&request.id).await.is_none());
    }

    #[tokio::test]
    async fn exponential_rolling_waves_are_one_two_two() {
        let (fx, request) =
            fixture(ExecutionStrategy::ExponentialRolling, &["a", "b", "c", "d", "e"]).await;
        fx.coordinator.start(request.clone()).await;

        let wave0 = wait_for_dispatch(&fx, "a", 1).await;
        assert!(dispatched(&fx, "b").await.is_empty());
        report_terminal(&fx, wave0[0].clone(), true).await;

        let b = wait_for_dispatch(&fx, "b", 1).await;
        let c = wait_for_dispatch(&fx, "c", 1).await;
        assert_eq!(b[0].iteration, 1);
        assert_eq!(c[0].iteration, 1);
        assert!(dispatched(&fx, "d").await.is_empty());
        report_terminal(&fx, b[0].clone(), true).await;
        report_terminal(&fx, c[0].clone(), true).await;

        let d = wait_for_dispatch(&fx, "d", 1).await;
        let e = wait_for_dispatch(&fx, "e", 1).await;
        assert_eq!(d[0].iteration, 2);
        assert_eq!(e[0].iteration, 2);
        report_terminal(&fx, d[0].clone(), true).await;
        report_terminal(&fx, e[0].clone(), true).await;

        wait_for_request_state(&fx, &request.id, RequestState::Completed).await;
    }

    #[tokio::test]
    async fn one_test_dispatches_canary_then_rest() {
        let (fx, request) = fixture(ExecutionStrategy::OneTest, &["a", "b", "c"]).await;
        fx.coordinator.start(request.clone()).await;

        let canary = wait_for_dispatch(&fx, "a", 1).await;
        assert!(dispatched(&fx, "b").await.is_empty());
        report_terminal(&fx, canary[0].clone(), true).await;

        let b = wait_for_dispatch(&fx, "b", 1).await;
        let c = wait_for_dispatch(&fx, "c", 1).await;
        report_terminal(&fx, b[0].clone(), true).await;
        report_terminal(&fx, c[0].clone(), true).await;
        wait_for_request_state(&fx, &request.id, RequestState::Completed).await;
    }

    #[tokio::test]
    async fn simple_dispatches_everything_at_once() {
        let (fx, request) = fixture(ExecutionStrategy::Simple, &["a", "b"]).await;
        fx.coordinator.start(request.clone()).await;

        let a = wait_for_dispatch(&fx, "a", 1).await;
        let b = wait_for_dispatch(&fx, "b", 1).await;
        assert_eq!(a[0].iteration, 0);
        assert_eq!(b[0].iteration, 0);

        // Simple tolerates a failed agent; the request still completes.
        report_terminal(&fx, a[0].clone(), false).await;
        report_terminal(&fx, b[0].clone(), true).await;
        wait_for_request_state(&fx, &request.id, RequestState::Completed).await;
    }

    #[tokio::test]
    async fn stale_iteration_reports_are_ignored() {
        let (fx, request) = fixture(ExecutionStrategy::Rolling, &["a", "b"]).await;
        fx.coordinator.start(request.clone()).await;

        let a = wait_for_dispatch(&fx, "a", 1).await;

        // A stale report from a wrong iteration must not advance the wave.
        let mut stale = a[0].clone();
        stale.iteration = 7;
        report_terminal(&fx, stale, true).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dispatched(&fx, "b").await.is_empty());

        report_terminal(&fx, a[0].clone(), true).await;
        wait_for_dispatch(&fx, "b", 1).await;
    }

    #[tokio::test]
    async fn external_abort_unblocks_parked_driver() {
        let (fx, request) = fixture(ExecutionStrategy::Rolling, &["a", "b"]).await;
        fx.coordinator.start(request.clone()).await;
        wait_for_dispatch(&fx, "a", 1).await;

        // What the server does on DELETE /consensus/request.
        fx.registry.abort_broadcast(&request.id).await;
        fx.coordinator.drop_entry(&request.id).await;
        fx.consensus
            .set_state(&request.id, RequestState::Aborted)
            .await;

        // Driver exits; no further dispatch happens.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.coordinator.entry(&request.id).await.is_none());
        assert!(dispatched(&fx, "b").await.is_empty());
        // The aborted request's commands are gone from the agent too.
        assert!(dispatched(&fx, "a").await.is_empty());
    }

    #[tokio::test]
    async fn unregistered_agent_fails_the_wave_for_staged_strategies() {
        let (fx, mut request) = fixture(ExecutionStrategy::Rolling, &["a"]).await;
        request.agent_ids = vec!["ghost".to_string(), "a".to_string()];
        fx.consensus.insert(request.clone()).await;
        fx.coordinator.start(request.clone()).await;

        wait_for_request_state(&fx, &request.id, RequestState::Aborted).await;
        assert!(dispatched(&fx, "a").await.is_empty());
    }

    #[tokio::test]
    async fn missing_template_aborts_request() {
        let (fx, mut request) = fixture(ExecutionStrategy::Rolling, &["a"]).await;
        request.template_id = "no-such-template".to_string();
        fx.consensus.insert(request.clone()).await;
        fx.coordinator.start(request.clone()).await;
        wait_for_request_state(&fx, &request.id, RequestState::Aborted).await;
    }
}
