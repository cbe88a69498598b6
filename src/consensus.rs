//! Consensus requests: proposals that need a human approval quorum before
//! the coordinator may dispatch anything.
//!
//! The store keeps every request (executed and aborted ones included, for
//! auditing) and rewrites its JSON snapshot atomically after each mutation,
//! so a coordinator restart is state-equivalent for this store.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Lifecycle of a consensus request. Ordering matters: everything from
/// `Executing` on counts as executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Approved,
    Executing,
    Completed,
    Aborted,
}

/// A proposal to run one template against a snapshot of selected agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRequest {
    pub id: String,
    pub template_id: String,
    /// Ordered selection snapshot taken at submit time.
    pub agent_ids: Vec<String>,
    pub requester_id: String,
    pub reason: String,
    pub created: i64,
    pub approvers: BTreeSet<String>,
    pub state: RequestState,
}

impl ConsensusRequest {
    pub fn new(
        template_id: impl Into<String>,
        agent_ids: Vec<String>,
        requester_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            template_id: template_id.into(),
            agent_ids,
            requester_id: requester_id.into(),
            reason: reason.into(),
            created: chrono::Utc::now().timestamp(),
            approvers: BTreeSet::new(),
            state: RequestState::Pending,
        }
    }

    /// Record a vote. The requester never counts, and repeat votes are
    /// no-ops. Returns whether the vote was recorded.
    pub fn approve(&mut self, user_id: &str) -> bool {
        if user_id == self.requester_id {
            return false;
        }
        self.approvers.insert(user_id.to_string())
    }

    /// Quorum reached and still awaiting hand-off.
    pub fn is_ready(&self, min_approvals: u32) -> bool {
        self.state == RequestState::Pending && self.approvers.len() as u32 >= min_approvals
    }

    /// Shortcut for "no longer actionable in the approval view".
    pub fn executed(&self) -> bool {
        self.state >= RequestState::Executing
    }
}

/// Approval-view split: the caller's own or already-voted requests versus
/// requests still awaiting their vote.
#[derive(Debug, Clone, Serialize)]
pub struct PendingView {
    pub requests: Vec<ConsensusRequest>,
    pub work: Vec<ConsensusRequest>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct ConsensusSnapshot {
    requests: HashMap<String, ConsensusRequest>,
}

/// JSON-file-backed request store.
pub struct Consensus {
    path: PathBuf,
    requests: RwLock<HashMap<String, ConsensusRequest>>,
    persist_lock: Mutex<()>,
}

impl Consensus {
    pub async fn open(path: PathBuf) -> Self {
        let snapshot = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<ConsensusSnapshot>(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!("Failed to parse consensus store {}: {}", path.display(), e);
                    ConsensusSnapshot::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ConsensusSnapshot::default(),
            Err(err) => {
                tracing::warn!("Failed to read consensus store {}: {}", path.display(), err);
                ConsensusSnapshot::default()
            }
        };
        Self {
            path,
            requests: RwLock::new(snapshot.requests),
            persist_lock: Mutex::new(()),
        }
    }

    pub async fn insert(&self, request: ConsensusRequest) {
        self.requests
            .write()
            .await
            .insert(request.id.clone(), request);
    }

    pub async fn get(&self, id: &str) -> Option<ConsensusRequest> {
        self.requests.read().await.get(id).cloned()
    }

    /// Record a vote on a request. Returns `None` for an unknown request,
    /// otherwise whether the vote counted.
    pub async fn approve(&self, id: &str, user_id: &str) -> Option<bool> {
        let mut requests = self.requests.write().await;
        requests.get_mut(id).map(|req| req.approve(user_id))
    }

    /// Atomically flip a request to `Approved` once quorum is reached.
    ///
    /// Returns the request snapshot exactly once per request: concurrent
    /// approvals race on the write lock and only the vote that completes
    /// the quorum gets the hand-off.
    pub async fn try_mark_approved(
        &self,
        id: &str,
        min_approvals: u32,
    ) -> Option<ConsensusRequest> {
        let mut requests = self.requests.write().await;
        let req = requests.get_mut(id)?;
        if !req.is_ready(min_approvals) {
            return None;
        }
        req.state = RequestState::Approved;
        Some(req.clone())
    }

    /// Move a request to a new lifecycle state. Returns false for an
    /// unknown request.
    pub async fn set_state(&self, id: &str, state: RequestState) -> bool {
        let mut requests = self.requests.write().await;
        match requests.get_mut(id) {
            Some(req) => {
                tracing::info!(request = %id, from = ?req.state, to = ?state, "consensus request state change");
                req.state = state;
                true
            }
            None => false,
        }
    }

    /// The approval view for one user: non-executed requests split into
    /// "mine or already voted" and "awaiting my vote".
    pub async fn pending_view(&self, user_id: &str) -> PendingView {
        let requests = self.requests.read().await;
        let mut view = PendingView {
            requests: Vec::new(),
            work: Vec::new(),
        };
        for req in requests.values() {
            if req.executed() {
                continue;
            }
            if req.requester_id == user_id || req.approvers.contains(user_id) {
                view.requests.push(req.clone());
            } else {
                view.work.push(req.clone());
            }
        }
        view.requests.sort_by_key(|r| r.created);
        view.work.sort_by_key(|r| r.created);
        view
    }

    /// Persist the current snapshot. Call after every mutation.
    pub async fn save(&self) -> anyhow::Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = ConsensusSnapshot {
            requests: self.requests.read().await.clone(),
        };
        let data = serde_json::to_vec_pretty(&snapshot)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ConsensusRequest {
        ConsensusRequest::new(
            "tpl-1",
            vec!["a".to_string(), "b".to_string()],
            "u1",
            "rotate web fleet",
        )
    }

    #[test]
    fn requester_vote_never_counts() {
        let mut req = request();
        assert!(!req.approve("u1"));
        assert!(req.approvers.is_empty());
    }

    #[test]
    fn votes_are_idempotent() {
        let mut req = request();
        assert!(req.approve("u2"));
        assert!(!req.approve("u2"));
        assert_eq!(req.approvers.len(), 1);
    }

    #[test]
    fn ready_needs_quorum_and_pending_state() {
        let mut req = request();
        req.approve("u2");
        assert!(!req.is_ready(2));
        req.approve("u3");
        assert!(req.is_ready(2));
        req.state = RequestState::Approved;
        assert!(!req.is_ready(2));
    }

    #[test]
    fn executed_covers_everything_from_executing_on() {
        let mut req = request();
        for (state, executed) in [
            (RequestState::Pending, false),
            (RequestState::Approved, false),
            (RequestState::Executing, true),
            (RequestState::Completed, true),
            (RequestState::Aborted, true),
        ] {
            req.state = state;
            assert_eq!(req.executed(), executed, "{state:?}");
        }
    }

    #[tokio::test]
    async fn quorum_hand_off_happens_exactly_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Consensus::open(temp.path().join("consensus.json")).await;
        let req = request();
        let id = req.id.clone();
        store.insert(req).await;

        assert_eq!(store.approve(&id, "u2").await, Some(true));
        assert!(store.try_mark_approved(&id, 2).await.is_none());

        assert_eq!(store.approve(&id, "u2").await, Some(false));
        assert_eq!(store.approve(&id, "u3").await, Some(true));

        let approved = store.try_mark_approved(&id, 2).await.expect("quorum");
        assert_eq!(approved.state, RequestState::Approved);
        // Second caller loses the race.
        assert!(store.try_mark_approved(&id, 2).await.is_none());
    }

    #[tokio::test]
    async fn snapshot_survives_restart() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("consensus.json");

        let store = Consensus::open(path.clone()).await;
        let req = request();
        let id = req.id.clone();
        store.insert(req).await;
        store.approve(&id, "u2").await;
        store.set_state(&id, RequestState::Aborted).await;
        store.save().await.expect("save");

        let reloaded = Consensus::open(path).await;
        let req = reloaded.get(&id).await.expect("request survives restart");
        assert_eq!(req.state, RequestState::Aborted);
        assert!(req.approvers.contains("u2"));
        assert_eq!(req.agent_ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn pending_view_splits_and_filters() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Consensus::open(temp.path().join("consensus.json")).await;

        let mine = request();
        let mine_id = mine.id.clone();
        store.insert(mine).await;

        let mut voted = ConsensusRequest::new("tpl-1", vec![], "u9", "patch kernel");
        voted.approve("u1");
        let voted_id = voted.id.clone();
        store.insert(voted).await;

        let mut done = ConsensusRequest::new("tpl-1", vec![], "u9", "old business");
        done.state = RequestState::Completed;
        store.insert(done).await;

        let work = ConsensusRequest::new("tpl-1", vec![], "u9", "needs my vote");
        let work_id = work.id.clone();
        store.insert(work).await;

        let view = store.pending_view("u1").await;
        let request_ids: Vec<&str> = view.requests.iter().map(|r| r.id.as_str()).collect();
        assert!(request_ids.contains(&mine_id.as_str()));
        assert!(request_ids.contains(&voted_id.as_str()));
        assert_eq!(view.work.len(), 1);
        assert_eq!(view.work[0].id, work_id);
    }
}
