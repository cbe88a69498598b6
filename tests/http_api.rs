//! End-to-end tests over the real HTTP boundary: a coordinator served on an
//! ephemeral port, driven by raw signed requests and by the actual agent
//! runtime executing shell commands.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quorumd::consensus::RequestState;
use quorumd::users::{DefaultSecondFactor, Role};
use quorumd::{api, signing, Config, Server};
use serde_json::{json, Value};

struct TestCoordinator {
    server: Arc<Server>,
    base_uri: String,
    http: reqwest::Client,
    _temp: tempfile::TempDir,
}

async fn start_coordinator() -> TestCoordinator {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = Config {
        token: "integration-preshared-token".to_string(),
        server_enabled: true,
        seed_uri: None,
        server_port: 0,
        agent_port: 0,
        home_dir: temp.path().to_path_buf(),
        hostname: "coordinator".to_string(),
        tags: Vec::new(),
        ping_interval: Duration::from_secs(30),
        debug: false,
    };
    let server = Server::new(config, Arc::new(DefaultSecondFactor))
        .await
        .expect("server");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let router = api::router(server.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });

    TestCoordinator {
        server,
        base_uri: format!("http://{addr}/"),
        http: reqwest::Client::new(),
        _temp: temp,
    }
}

impl TestCoordinator {
    /// Signed agent request, the way a fleet agent would issue it.
    async fn agent_request(
        &self,
        method: reqwest::Method,
        path_and_query: &str,
        body: Option<Value>,
    ) -> Value {
        let url = format!("{}{}", self.base_uri, path_and_query);
        let signature = signing::uri_signature(
            &format!("/{path_and_query}"),
            &self.server.config.token,
        );
        let mut req = self.http.request(method, &url).header("X-Auth", signature);
        if let Some(body) = body {
            req = req.json(&body);
        }
        req.send().await.expect("send").json().await.expect("json")
    }

    /// Session-authenticated user request.
    async fn user_request(
        &self,
        method: reqwest::Method,
        path_and_query: &str,
        username: &str,
        session: &str,
        body: Option<Value>,
    ) -> (reqwest::StatusCode, Value) {
        let url = format!("{}{}", self.base_uri, path_and_query);
        let mut req = self
            .http
            .request(method, &url)
            .header("X-Auth-User", username)
            .header("X-Auth-Session", session);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.expect("send");
        let status = resp.status();
        (status, resp.json().await.expect("json"))
    }

    /// Seed a user and log in over the API, returning the session token.
    async fn login_new_user(&self, username: &str, roles: BTreeSet<Role>) -> String {
        self.server
            .users
            .create_user(username, "a perfectly long password", "", roles)
            .await
            .expect("create user");
        let resp = self
            .http
            .post(format!("{}auth", self.base_uri))
            .json(&json!({ "username": username, "password": "a perfectly long password" }))
            .send()
            .await
            .expect("send");
        assert!(resp.status().is_success());
        let body: Value = resp.json().await.expect("json");
        body["session_token"].as_str().expect("token").to_string()
    }
}

fn all_roles() -> BTreeSet<Role> {
    BTreeSet::from([Role::Requester, Role::Approver, Role::Admin])
}

#[tokio::test]
async fn agent_requests_require_a_valid_uri_signature() {
    let tc = start_coordinator().await;

    // Unsigned request is rejected.
    let resp = tc
        .http
        .get(format!("{}client/node-1/ping", tc.base_uri))
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.expect("json");
    assert!(body["error"].is_string());

    // A signature over a different URI is rejected too.
    let wrong = signing::uri_signature("/client/other/ping", &tc.server.config.token);
    let resp = tc
        .http
        .get(format!("{}client/node-1/ping", tc.base_uri))
        .header("X-Auth", wrong)
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    // Correctly signed ping registers the agent.
    let body = tc
        .agent_request(reqwest::Method::GET, "client/node-1/ping?tags=web,eu", None)
        .await;
    assert_eq!(body["ack"], json!(true));
    assert_eq!(
        body["server_instance_id"].as_str().expect("instance id"),
        tc.server.instance_id
    );
    assert!(tc.server.registry.get("node-1").await.is_some());
}

#[tokio::test]
async fn token_rotation_returns_a_verifiable_signature() {
    let tc = start_coordinator().await;
    tc.agent_request(reqwest::Method::GET, "client/node-1/ping?tags=", None)
        .await;

    let body = tc
        .agent_request(reqwest::Method::POST, "client/node-1/auth", None)
        .await;
    let token = body["token"].as_str().expect("token");
    let signature = body["token_signature"].as_str().expect("signature");
    assert_eq!(
        signature,
        signing::token_signature(token, &tc.server.config.token)
    );

    let agent = tc.server.registry.get("node-1").await.expect("agent");
    assert_eq!(agent.auth_token().await.as_deref(), Some(token));
}

#[tokio::test]
async fn login_failures_use_one_constant_message() {
    let tc = start_coordinator().await;
    tc.server
        .users
        .create_user("operator", "a perfectly long password", "", all_roles())
        .await
        .expect("create user");

    let wrong_password = tc
        .http
        .post(format!("{}auth", tc.base_uri))
        .json(&json!({ "username": "operator", "password": "wrong" }))
        .send()
        .await
        .expect("send");
    assert_eq!(wrong_password.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body_a: Value = wrong_password.json().await.expect("json");

    let unknown_user = tc
        .http
        .post(format!("{}auth", tc.base_uri))
        .json(&json!({ "username": "nobody", "password": "wrong" }))
        .send()
        .await
        .expect("send");
    let body_b: Value = unknown_user.json().await.expect("json");

    // No oracle: both failures read identically.
    assert_eq!(body_a["error"], body_b["error"]);
}

#[tokio::test]
async fn session_endpoints_reject_missing_or_stale_sessions() {
    let tc = start_coordinator().await;
    let resp = tc
        .http
        .get(format!("{}templates", tc.base_uri))
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    let (status, _) = tc
        .user_request(
            reqwest::Method::GET,
            "templates",
            "ghost",
            "not-a-session",
            None,
        )
        .await;
    assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn role_gates_are_enforced() {
    let tc = start_coordinator().await;
    let session = tc
        .login_new_user("viewer", BTreeSet::from([Role::Approver]))
        .await;

    // Approver without the admin role can not create templates.
    let (status, body) = tc
        .user_request(
            reqwest::Method::POST,
            "template",
            "viewer",
            &session,
            Some(json!({
                "title": "Nope",
                "command": "true",
                "strategy": "simple",
                "min_approvals": 1,
                "timeout_secs": 10,
            })),
        )
        .await;
    assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    // Nor submit consensus requests without the requester role.
    let (status, _) = tc
        .user_request(
            reqwest::Method::POST,
            "consensus/request",
            "viewer",
            &session,
            Some(json!({
                "template": "whatever",
                "clients": ["a"],
                "reason": "because reasons",
            })),
        )
        .await;
    assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);
}

/// The flagship path: a real agent runtime connects to the coordinator,
/// a template is created and approved over the API, the agent executes the
/// shell command, output validation passes, and the request completes.
#[tokio::test]
async fn full_fleet_round_trip_completes_a_request() {
    let tc = start_coordinator().await;

    // Start a real agent against the test coordinator.
    let agent_config = Config {
        token: tc.server.config.token.clone(),
        server_enabled: false,
        seed_uri: Some(tc.base_uri.clone()),
        server_port: 0,
        agent_port: 0,
        home_dir: tc._temp.path().to_path_buf(),
        hostname: "fleet-node".to_string(),
        tags: vec!["web".to_string()],
        ping_interval: Duration::from_secs(5),
        debug: false,
    };
    let _agent = quorumd::agent::AgentClient::start(agent_config)
        .await
        .expect("agent start");

    let admin_session = tc.login_new_user("admin-op", all_roles()).await;

    // Create the template over the API.
    let (status, body) = tc
        .user_request(
            reqwest::Method::POST,
            "template",
            "admin-op",
            &admin_session,
            Some(json!({
                "title": "Say hello",
                "description": "prints a marker line",
                "command": "echo hello-fleet",
                "strategy": "rolling",
                "min_approvals": 1,
                "timeout_secs": 30,
            })),
        )
        .await;
    assert!(status.is_success(), "template create failed: {body}");
    let template_id = body["template"]["id"].as_str().expect("id").to_string();

    // Gate success on the marker actually appearing on stdout.
    let (status, _) = tc
        .user_request(
            reqwest::Method::POST,
            &format!("template/{template_id}/validation"),
            "admin-op",
            &admin_session,
            Some(json!({
                "text": "hello-fleet",
                "fatal": true,
                "must_contain": true,
                "stream": 1,
            })),
        )
        .await;
    assert!(status.is_success());

    // Submit against the connected agent and approve with a second user.
    let (status, body) = tc
        .user_request(
            reqwest::Method::POST,
            "consensus/request",
            "admin-op",
            &admin_session,
            Some(json!({
                "template": template_id,
                "clients": ["fleet-node"],
                "reason": "integration round trip",
            })),
        )
        .await;
    assert!(status.is_success(), "submit failed: {body}");
    let request_id = body["request"]["id"].as_str().expect("id").to_string();

    let approver_session = tc
        .login_new_user("second-op", BTreeSet::from([Role::Approver]))
        .await;
    let (status, body) = tc
        .user_request(
            reqwest::Method::POST,
            "consensus/approve",
            "second-op",
            &approver_session,
            Some(json!({ "id": request_id })),
        )
        .await;
    assert!(status.is_success());
    assert_eq!(body["approved"], json!(true));

    // The agent picks the command up, runs it, and validation passes.
    let mut final_state = None;
    for _ in 0..300 {
        let state = tc
            .server
            .consensus
            .get(&request_id)
            .await
            .expect("request")
            .state;
        if matches!(state, RequestState::Completed | RequestState::Aborted) {
            final_state = Some(state);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(final_state, Some(RequestState::Completed));

    // The coordinator kept the validated output.
    let agent = tc.server.registry.get("fleet-node").await.expect("agent");
    let cmds = agent.commands().await;
    assert_eq!(cmds.len(), 1);
    assert!(cmds[0].stdout.iter().any(|l| l.contains("hello-fleet")));
}
