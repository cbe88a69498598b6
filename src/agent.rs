//! The remote agent runtime.
//!
//! An agent pings the coordinator for presence, long-polls for signed
//! commands, executes them serially through a temporary shell script, and
//! streams state transitions and buffered output back. Every request to the
//! coordinator carries a URI signature; every received command is verified
//! against the agent's rotating auth token before anything runs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use reqwest::Method;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::command::{Command, CommandState};
use crate::config::Config;
use crate::signing;

/// Retry budget for requests to the coordinator.
const MAX_REQUEST_ATTEMPTS: u32 = 10;

/// Backoff before retry attempt `i`: quadratic ramp plus jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..50);
    Duration::from_millis(25 + jitter + 10_000 * u64::from(attempt) * u64::from(attempt))
}

/// How a shell job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exit status zero.
    Clean,
    /// Non-zero exit or wait failure.
    Failed,
    /// Killed after the timeout expired.
    Killed,
}

#[derive(Debug)]
pub struct ShellOutcome {
    pub kind: ExitKind,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// One spawned command: the temporary script, the child process and its
/// stream readers.
pub struct ShellJob {
    script_path: PathBuf,
    child: tokio::process::Child,
    stdout_task: JoinHandle<Vec<String>>,
    stderr_task: JoinHandle<Vec<String>>,
}

impl ShellJob {
    /// Write the command text to a per-command temp script and spawn it.
    ///
    /// The script gets a bash shebang and mode 0644; it is removed on every
    /// exit path of `wait`.
    pub async fn spawn(cmd_id: &str, command: &str) -> anyhow::Result<ShellJob> {
        let script_path = std::env::temp_dir().join(format!("quorumd_{cmd_id}"));
        let contents = format!("#!/bin/bash\n{command}");
        tokio::fs::write(&script_path, contents)
            .await
            .with_context(|| format!("writing {}", script_path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o644))
                .await?;
        }

        let spawned = tokio::process::Command::new("bash")
            .arg(&script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(c) => c,
            Err(e) => {
                let _ = tokio::fs::remove_file(&script_path).await;
                return Err(e).context("spawning bash");
            }
        };

        let stdout = child.stdout.take().context("child stdout missing")?;
        let stderr = child.stderr.take().context("child stderr missing")?;
        let stdout_task = tokio::spawn(read_lines(stdout));
        let stderr_task = tokio::spawn(read_lines(stderr));

        Ok(ShellJob {
            script_path,
            child,
            stdout_task,
            stderr_task,
        })
    }

    /// Wait for completion with a hard timeout, killing the process on
    /// expiry. Joins the stream readers and removes the temp script.
    pub async fn wait(mut self, timeout: Duration) -> ShellOutcome {
        let (kind, exit_status) = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) if status.success() => (ExitKind::Clean, Some(status)),
            Ok(Ok(status)) => (ExitKind::Failed, Some(status)),
            Ok(Err(e)) => {
                tracing::warn!("Failed waiting on child: {e}");
                (ExitKind::Failed, None)
            }
            Err(_) => {
                if let Err(e) = self.child.kill().await {
                    tracing::warn!("Failed to kill timed-out process: {e}");
                }
                (ExitKind::Killed, None)
            }
        };

        let stdout = self.stdout_task.await.unwrap_or_default();
        let mut stderr = self.stderr_task.await.unwrap_or_default();
        if kind == ExitKind::Failed {
            if let Some(status) = exit_status {
                stderr.push(format!("exit status: {}", status.code().unwrap_or(-1)));
            }
        }

        if let Err(e) = tokio::fs::remove_file(&self.script_path).await {
            tracing::warn!("Failed to remove {}: {e}", self.script_path.display());
        }

        ShellOutcome {
            kind,
            stdout,
            stderr,
        }
    }
}

async fn read_lines<R>(reader: R) -> Vec<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut collected = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        collected.push(line);
    }
    collected
}

/// HTTP client half of the agent: signed requests with retry, token
/// rotation, ping and long-poll loops.
pub struct AgentClient {
    config: Config,
    base_uri: String,
    http: reqwest::Client,
    auth_token: RwLock<Option<String>>,
    server_instance: RwLock<Option<String>>,
}

impl AgentClient {
    pub fn new(config: Config) -> anyhow::Result<AgentClient> {
        let base_uri = config
            .effective_seed_uri()
            .context("agent mode requires QUORUMD_SEED (or a local coordinator)")?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(AgentClient {
            config,
            base_uri,
            http,
            auth_token: RwLock::new(None),
            server_instance: RwLock::new(None),
        })
    }

    /// Register with the coordinator and start the background loops. Fails
    /// when the coordinator is unreachable within the retry budget, which
    /// the caller turns into a non-zero exit.
    pub async fn start(config: Config) -> anyhow::Result<Arc<AgentClient>> {
        let client = Arc::new(AgentClient::new(config)?);
        client
            .ping_server()
            .await
            .context("cannot reach coordinator at startup")?;
        client.authenticate().await?;

        {
            let client = client.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(client.config.ping_interval);
                tick.tick().await; // initial ping already sent
                loop {
                    tick.tick().await;
                    if let Err(e) = client.ping_server().await {
                        tracing::warn!("Ping failed: {e:#}");
                    }
                }
            });
        }
        {
            let client = client.clone();
            tokio::spawn(async move {
                loop {
                    match client.poll_cmds().await {
                        Ok(cmds) => {
                            // Serial execution: one command at a time, in
                            // the order they were drained.
                            for cmd in cmds {
                                client.execute(cmd).await;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Command poll failed: {e:#}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            });
        }
        client.spawn_uptime_server();

        Ok(client)
    }

    /// Signed request with the retry budget and quadratic backoff. Server
    /// errors and transport errors are retried; anything else is returned
    /// as the parsed body.
    async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<serde_json::Value>,
    ) -> anyhow::Result<serde_json::Value> {
        let mut last_err = None;
        for attempt in 0..MAX_REQUEST_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }
            match self.request_once(method.clone(), path_and_query, body.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::debug!(attempt, "request to {path_and_query} failed: {e:#}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("request retry budget exhausted")))
    }

    async fn request_once(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<serde_json::Value>,
    ) -> anyhow::Result<serde_json::Value> {
        let url = format!("{}{}", self.base_uri, path_and_query);
        // The coordinator recomputes the signature over the URI it received.
        let signed_uri = format!("/{path_and_query}");
        let mut req = self
            .http
            .request(method, &url)
            .header("X-Auth", signing::uri_signature(&signed_uri, &self.config.token));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await?;
        if resp.status().is_server_error() {
            anyhow::bail!("coordinator returned {}", resp.status());
        }
        Ok(resp.json().await?)
    }

    /// Presence ping. Detects a coordinator restart through the instance id
    /// and re-authenticates, since the rotated token died with the old
    /// process.
    pub async fn ping_server(&self) -> anyhow::Result<()> {
        let path = format!(
            "client/{}/ping?tags={}",
            self.config.hostname,
            self.config.tags.join(",")
        );
        let resp = self.request(Method::GET, &path, None).await?;
        let instance = resp
            .get("server_instance_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if instance.is_empty() {
            return Ok(());
        }

        let changed = {
            let known = self.server_instance.read().await;
            matches!(&*known, Some(previous) if previous != &instance)
        };
        *self.server_instance.write().await = Some(instance);
        if changed {
            tracing::info!("Coordinator instance changed, re-authenticating");
            if let Err(e) = self.authenticate().await {
                tracing::warn!("Re-authentication failed: {e:#}");
            }
        }
        Ok(())
    }

    /// Rotate the command-signing token. The returned token is only trusted
    /// once its signature under the pre-shared secret checks out.
    pub async fn authenticate(&self) -> anyhow::Result<()> {
        let path = format!("client/{}/auth", self.config.hostname);
        let resp = self.request(Method::POST, &path, None).await?;
        let token = resp
            .get("token")
            .and_then(|v| v.as_str())
            .context("auth response carried no token")?;
        let token_signature = resp
            .get("token_signature")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let expected = signing::token_signature(token, &self.config.token);
        if !signing::constant_time_eq(token_signature, &expected) {
            anyhow::bail!("token signature mismatch, refusing rotated token");
        }
        *self.auth_token.write().await = Some(token.to_string());
        tracing::info!("Authenticated with coordinator, command token rotated");
        Ok(())
    }

    /// One long-poll round. An empty list means the poll timed out.
    async fn poll_cmds(&self) -> anyhow::Result<Vec<Command>> {
        let path = format!("client/{}/cmds", self.config.hostname);
        let resp = self.request(Method::GET, &path, None).await?;
        if let Some(error) = resp.get("error").and_then(|v| v.as_str()) {
            anyhow::bail!("coordinator rejected poll: {error}");
        }
        let cmds = resp.get("cmds").cloned().unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(cmds)?)
    }

    /// Run one command through the full lifecycle, from signature
    /// validation to the final log flush.
    pub async fn execute(&self, mut cmd: Command) {
        tracing::info!(command = %cmd.id, "executing '{}'", cmd.command);

        self.notify_state(&mut cmd, CommandState::Validating).await;
        let token = self.auth_token.read().await.clone();
        let signature_ok = match &token {
            Some(token) => cmd.verify_signature(token),
            None => false,
        };
        if !signature_ok {
            self.notify_state(&mut cmd, CommandState::InvalidSignature)
                .await;
            tracing::error!(
                command = %cmd.id,
                "invalid command signature, coordinator link may be tampered with"
            );
            // Establish a fresh token before accepting anything else.
            if let Err(e) = self.authenticate().await {
                tracing::warn!("Re-authentication failed: {e:#}");
            }
            return;
        }

        self.notify_state(&mut cmd, CommandState::Starting).await;
        let job = match ShellJob::spawn(&cmd.id, &cmd.command).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(command = %cmd.id, "failed to start: {e:#}");
                cmd.log_error(format!("{e:#}"));
                self.notify_state(&mut cmd, CommandState::FailedExecution)
                    .await;
                self.flush_logs(&mut cmd).await;
                self.notify_state(&mut cmd, CommandState::FlushedLogs).await;
                return;
            }
        };
        self.notify_state(&mut cmd, CommandState::StartedExecution)
            .await;

        let outcome = job.wait(Duration::from_secs(cmd.timeout_secs)).await;
        match outcome.kind {
            ExitKind::Clean => {
                self.notify_state(&mut cmd, CommandState::FinishedExecution)
                    .await;
            }
            ExitKind::Failed => {
                self.notify_state(&mut cmd, CommandState::FailedExecution)
                    .await;
            }
            ExitKind::Killed => {
                tracing::warn!(command = %cmd.id, "process killed after {}s timeout", cmd.timeout_secs);
                self.notify_state(&mut cmd, CommandState::KilledExecution)
                    .await;
            }
        }

        for line in outcome.stdout {
            cmd.log_output(line);
            self.maybe_flush_logs(&mut cmd).await;
        }
        for line in outcome.stderr {
            cmd.log_error(line);
            self.maybe_flush_logs(&mut cmd).await;
        }
        self.flush_logs(&mut cmd).await;
        self.notify_state(&mut cmd, CommandState::FlushedLogs).await;
    }

    /// Apply the transition locally and report it, unless the command is
    /// local-only (empty signature).
    async fn notify_state(&self, cmd: &mut Command, state: CommandState) {
        if let Err(e) = cmd.set_state(state) {
            tracing::error!(command = %cmd.id, "refusing transition: {e}");
            return;
        }
        if cmd.signature.is_empty() {
            return;
        }
        let path = format!(
            "client/{}/cmd/{}/state?state={}",
            self.config.hostname,
            cmd.id,
            state.as_str()
        );
        if let Err(e) = self.request(Method::PUT, &path, None).await {
            tracing::warn!(command = %cmd.id, "state report failed: {e:#}");
        }
    }

    async fn maybe_flush_logs(&self, cmd: &mut Command) {
        if cmd.wants_log_flush() {
            self.flush_logs(cmd).await;
        }
    }

    /// Upload and clear the output buffers. Local-only commands keep their
    /// buffers.
    async fn flush_logs(&self, cmd: &mut Command) {
        if cmd.signature.is_empty() {
            return;
        }
        let (output, error) = cmd.take_buffers();
        let path = format!("client/{}/cmd/{}/logs", self.config.hostname, cmd.id);
        let body = json!({ "output": output, "error": error });
        if let Err(e) = self.request(Method::PUT, &path, Some(body)).await {
            tracing::warn!(command = %cmd.id, "log upload failed: {e:#}");
        }
    }

    /// Tiny uptime endpoint on the agent port.
    fn spawn_uptime_server(self: &Arc<Self>) {
        let port = self.config.agent_port;
        tokio::spawn(async move {
            let router = axum::Router::new().route(
                "/ping",
                axum::routing::get(|| async { axum::Json(json!({ "ping": "pong" })) }),
            );
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    if let Err(e) = axum::serve(listener, router).await {
                        tracing::warn!("Agent uptime server failed: {e}");
                    }
                }
                Err(e) => tracing::warn!("Agent uptime server could not bind {addr}: {e}"),
            }
        });
    }
}
