//! End-to-end verb tests through the axum router.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use fleetgrid_model::Registry;
use fleetgrid_rpc::{
    Container, DeployRequest, ManagerContext, StaticDirectory, Supervisor, SupervisorError,
    build_router,
};
use fleetgrid_tasks::{MaintenanceGate, TaskRunner, TaskTracker};
use serde_json::{Value, json};
use tower::ServiceExt;

const REGION: &str = "us-east-1";
const HOST: &str = "mgr-1";

// ── Fakes ──────────────────────────────────────────────────────

#[derive(Default)]
struct FakeSupervisor {
    next_port: AtomicU16,
    failing_hosts: HashSet<String>,
    deployed: Mutex<Vec<(String, String)>>,
    torn_down: Mutex<Vec<String>>,
}

impl FakeSupervisor {
    fn new() -> Self {
        Self {
            next_port: AtomicU16::new(30000),
            ..Self::default()
        }
    }

    fn failing_on(mut self, host: &str) -> Self {
        self.failing_hosts.insert(host.to_string());
        self
    }
}

#[async_trait]
impl Supervisor for FakeSupervisor {
    async fn get(&self, host: &str, id: &str) -> Result<Container, SupervisorError> {
        Ok(Container {
            id: id.to_string(),
            host: host.to_string(),
            status: "running".into(),
            ..Container::default()
        })
    }

    async fn container_maintenance(
        &self,
        _host: &str,
        _id: &str,
        maintenance: bool,
    ) -> Result<String, SupervisorError> {
        Ok(if maintenance { "maintenance" } else { "running" }.into())
    }

    async fn deploy(
        &self,
        host: &str,
        id: &str,
        _request: &DeployRequest,
    ) -> Result<u16, SupervisorError> {
        if self.failing_hosts.contains(host) {
            return Err(SupervisorError::Transport {
                host: host.to_string(),
                reason: "connection refused".into(),
            });
        }
        self.deployed
            .lock()
            .unwrap()
            .push((host.to_string(), id.to_string()));
        Ok(self.next_port.fetch_add(1, Ordering::SeqCst))
    }

    async fn teardown(&self, _host: &str, id: &str) -> Result<(), SupervisorError> {
        self.torn_down.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

// ── Harness ────────────────────────────────────────────────────

struct Harness {
    router: Router,
    ctx: Arc<ManagerContext>,
    supervisor: Arc<FakeSupervisor>,
}

const ROLES: [(&str, &str); 4] = [
    ("apps", "write"),
    ("envs", "write"),
    ("deploys", "write"),
    ("routers", "write"),
];

async fn harness_with(supervisor: FakeSupervisor, roles: &[(&str, &str)]) -> Harness {
    let registry = Registry::in_memory().await.unwrap();
    registry
        .register_manager(REGION, HOST, "mgr-1.fleet.example")
        .await
        .unwrap();
    for (role, rtype) in roles {
        registry
            .set_manager_role(REGION, HOST, role, rtype, true)
            .await
            .unwrap();
    }

    let directory = StaticDirectory::new()
        .with_user("root", "s3cret", ["fleet-admins"])
        .with_user("alice", "pw", ["web-team"])
        .with_user("bob", "pw", ["other-team"]);
    let supervisor = Arc::new(supervisor);
    let runner = TaskRunner::new(TaskTracker::new(Duration::from_secs(60)), MaintenanceGate::new());
    let ctx = Arc::new(
        ManagerContext::new(
            REGION,
            HOST,
            registry,
            runner,
            Arc::new(directory),
            supervisor.clone(),
        )
        .with_supervisor_hosts(vec!["sup-1".into(), "sup-2".into()])
        .with_result_wait(Duration::from_secs(5)),
    );
    Harness {
        router: build_router(ctx.clone()),
        ctx,
        supervisor,
    }
}

async fn harness() -> Harness {
    harness_with(FakeSupervisor::new(), &ROLES).await
}

fn root() -> Value {
    json!({ "user": "root", "secret": "s3cret" })
}

fn alice() -> Value {
    json!({ "user": "alice", "secret": "pw" })
}

async fn call(router: &Router, verb: &str, body: Value) -> (StatusCode, Value) {
    let resp = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/rpc/{verb}"))
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn register_web(h: &Harness, internal: bool) {
    let (status, body) = call(
        &h.router,
        "RegisterApp",
        json!({
            "auth": root(),
            "name": "web",
            "internal": internal,
            "repo": "git@example.com:web.git",
            "root": "/",
            "email": "web@example.com",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let (status, body) = call(&h.router, "UpdateEnv", json!({ "auth": root(), "name": "prod" })).await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

// ── Tests ──────────────────────────────────────────────────────

#[tokio::test]
async fn healthz_reports_identity() {
    let h = harness().await;
    let resp = h
        .router
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "OK");
    assert_eq!(body["data"]["region"], REGION);
    assert_eq!(body["data"]["maintenance"], false);
}

#[tokio::test]
async fn register_and_get_app() {
    let h = harness().await;
    register_web(&h, false).await;

    let (status, body) = call(&h.router, "GetApp", json!({ "auth": root(), "name": "web" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "web");
    assert_eq!(body["data"]["email"], "web@example.com");

    let (status, body) = call(&h.router, "ListApps", json!({ "auth": root() })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["apps"], json!(["web"]));
}

#[tokio::test]
async fn missing_fields_are_validation_errors() {
    let h = harness().await;
    let (status, body) = call(
        &h.router,
        "RegisterApp",
        json!({ "auth": root(), "name": "web", "email": "web@example.com" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "ERROR");
    assert_eq!(body["kind"], "validation");
    assert_eq!(body["error"], "please specify a repo");
}

#[tokio::test]
async fn malformed_argument_is_rejected() {
    let h = harness().await;
    let (status, body) = call(&h.router, "GetApp", json!({ "name": 42 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("invalid GetApp argument"));
}

#[tokio::test]
async fn unknown_verb_is_not_found() {
    let h = harness().await;
    let (status, body) = call(&h.router, "LaunchMissiles", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn team_allow_list_grants_app_access() {
    let h = harness().await;
    register_web(&h, false).await;

    let (status, body) = call(&h.router, "GetApp", json!({ "auth": alice(), "name": "web" })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "permission_denied");

    // Only members of the team (or super users) edit its allow-list.
    let bob = json!({ "user": "bob", "secret": "pw" });
    let (status, body) = call(
        &h.router,
        "AllowApp",
        json!({ "auth": bob, "team": "web-team", "app": "web" }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        body["error"],
        "You do not have permission to allow apps for team web-team"
    );

    let (status, _) = call(
        &h.router,
        "AllowApp",
        json!({ "auth": alice(), "team": "web-team", "app": "web" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(&h.router, "GetApp", json!({ "auth": alice(), "name": "web" })).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = call(&h.router, "ListApps", json!({ "auth": alice() })).await;
    assert_eq!(body["data"]["apps"], json!(["web"]));
    let (_, body) = call(
        &h.router,
        "IsAppAllowed",
        json!({ "auth": alice(), "app": "web" }),
    )
    .await;
    assert_eq!(body["data"]["is_allowed"], true);

    // A super user may ask about someone else.
    let (_, body) = call(
        &h.router,
        "ListAllowedApps",
        json!({ "auth": root(), "user": "bob" }),
    )
    .await;
    assert_eq!(body["data"]["apps"], json!([]));

    let (status, _) = call(
        &h.router,
        "DisallowApp",
        json!({ "auth": alice(), "team": "web-team", "app": "web" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&h.router, "GetApp", json!({ "auth": alice(), "name": "web" })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_credentials_are_denied() {
    let h = harness().await;
    let (status, body) = call(
        &h.router,
        "ListApps",
        json!({ "auth": { "user": "alice", "secret": "wrong" } }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "permission_denied");
}

#[tokio::test]
async fn reserve_router_port_is_idempotent() {
    let h = harness().await;
    register_web(&h, true).await;

    let arg = json!({ "auth": root(), "app": "web", "env": "prod", "internal": true });
    let (status, first) = call(&h.router, "ReserveRouterPort", arg.clone()).await;
    assert_eq!(status, StatusCode::OK, "{first}");
    assert_eq!(first["data"]["created"], true);

    let (_, second) = call(&h.router, "ReserveRouterPort", arg).await;
    assert_eq!(second["data"]["created"], false);
    assert_eq!(second["data"]["port"], first["data"]["port"]);

    let (_, listed) = call(
        &h.router,
        "ListRouterPorts",
        json!({ "auth": root(), "internal": true }),
    )
    .await;
    assert_eq!(listed["data"]["ports"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn missing_role_names_managers_that_hold_it() {
    let h = harness_with(FakeSupervisor::new(), &[("envs", "write")]).await;
    let registry = &h.ctx.registry;
    registry
        .register_manager(REGION, "mgr-2", "mgr-2.fleet.example")
        .await
        .unwrap();
    registry
        .set_manager_role(REGION, "mgr-2", "apps", "write", true)
        .await
        .unwrap();

    let (status, body) = call(
        &h.router,
        "RegisterApp",
        json!({
            "auth": root(),
            "name": "web",
            "repo": "git@example.com:web.git",
            "root": "/",
            "email": "web@example.com",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        body["error"],
        "This manager does not have the ability to write apps. \
         Please try one of these:\nmgr-2.fleet.example\n"
    );
}

#[tokio::test]
async fn deploy_pools_routes_and_tears_down() {
    let h = harness().await;
    register_web(&h, true).await;

    let (status, body) = call(
        &h.router,
        "Deploy",
        json!({
            "auth": root(),
            "app": "web",
            "sha": "abc123",
            "env": "prod",
            "hosts": ["sup-1", "sup-2"],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = call(&h.router, "DeployResult", json!({ "auth": root(), "id": id })).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let containers = body["data"]["containers"].as_array().unwrap();
    assert_eq!(containers.len(), 2);
    assert_eq!(containers[0]["status"], "running");
    let router_port = body["data"]["router_port"].clone();
    assert_eq!(h.supervisor.deployed.lock().unwrap().len(), 2);

    // The pool mirrors the new instances.
    let (status, pool) = call(
        &h.router,
        "GetPool",
        json!({ "auth": root(), "internal": true, "name": "web.abc123.prod" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{pool}");
    let hosts: Vec<&String> = pool["data"]["hosts"].as_object().unwrap().keys().collect();
    assert_eq!(hosts, vec!["sup-1:30000", "sup-2:30001"]);

    // The deploy already reserved the (app, env) port.
    let (_, reserved) = call(
        &h.router,
        "ReserveRouterPort",
        json!({ "auth": root(), "app": "web", "env": "prod", "internal": true }),
    )
    .await;
    assert_eq!(reserved["data"]["port"], router_port);
    assert_eq!(reserved["data"]["created"], false);

    let (_, shas) = call(&h.router, "ListShas", json!({ "auth": root(), "app": "web" })).await;
    assert_eq!(shas["data"]["shas"], json!(["abc123"]));

    let (status, body) = call(&h.router, "Teardown", json!({ "auth": root(), "app": "web" })).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let id = body["data"]["id"].as_str().unwrap().to_string();
    let (status, body) = call(&h.router, "TeardownResult", json!({ "auth": root(), "id": id })).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["container_ids"].as_array().unwrap().len(), 2);
    assert_eq!(h.supervisor.torn_down.lock().unwrap().len(), 2);

    let (status, _) = call(
        &h.router,
        "GetPool",
        json!({ "auth": root(), "internal": true, "name": "web.abc123.prod" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, listed) = call(&h.router, "ListContainers", json!({ "auth": root() })).await;
    assert_eq!(listed["data"]["container_ids"], json!([]));
}

async fn deploy_one(h: &Harness, host: &str) -> String {
    let (_, body) = call(
        &h.router,
        "Deploy",
        json!({ "auth": root(), "app": "web", "sha": "abc123", "env": "prod", "hosts": [host] }),
    )
    .await;
    let id = body["data"]["id"].as_str().unwrap().to_string();
    let (status, body) = call(&h.router, "DeployResult", json!({ "auth": root(), "id": id })).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["data"]["containers"][0]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn pool_membership_verbs_need_router_role_and_super_user() {
    let h = harness().await;
    register_web(&h, true).await;
    let container = deploy_one(&h, "sup-1").await;
    let pool = json!({ "auth": root(), "internal": true, "name": "web.abc123.prod" });
    let members = |auth: Value| json!({ "auth": auth, "container_ids": [container.clone()] });

    let (status, body) = call(&h.router, "DeleteFromPool", members(alice())).await;
    assert_eq!(status, StatusCode::FORBIDDEN, "{body}");

    let (status, body) = call(&h.router, "DeleteFromPool", members(root())).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["container_ids"], json!([container.clone()]));
    let (status, _) = call(&h.router, "GetPool", pool.clone()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&h.router, "AddToPool", members(root())).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let (status, body) = call(&h.router, "GetPool", pool).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let hosts: Vec<&String> = body["data"]["hosts"].as_object().unwrap().keys().collect();
    assert_eq!(hosts, vec!["sup-1:30000"]);

    let (status, body) = call(
        &h.router,
        "AddToPool",
        json!({ "auth": root(), "container_ids": [] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "please specify a container id");

    let (status, body) = call(
        &h.router,
        "AddToPool",
        json!({ "auth": root(), "container_ids": ["web.abc123.prod.00000000.9"] }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND, "{body}");
}

#[tokio::test]
async fn pool_membership_verbs_are_refused_without_router_role() {
    let h = harness_with(
        FakeSupervisor::new(),
        &[("apps", "write"), ("envs", "write")],
    )
    .await;
    let (status, body) = call(
        &h.router,
        "AddToPool",
        json!({ "auth": root(), "container_ids": ["web.abc123.prod.00000000.0"] }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(
        body["error"]
            .as_str()
            .unwrap()
            .starts_with("This manager does not have the ability to write routers."),
        "{body}"
    );
}

#[tokio::test]
async fn failed_supervisor_deploy_leaves_no_record() {
    let h = harness_with(FakeSupervisor::new().failing_on("sup-bad"), &ROLES).await;
    register_web(&h, false).await;

    let (_, body) = call(
        &h.router,
        "Deploy",
        json!({
            "auth": root(),
            "app": "web",
            "sha": "abc123",
            "env": "prod",
            "hosts": ["sup-bad"],
        }),
    )
    .await;
    let id = body["data"]["id"].as_str().unwrap().to_string();
    let (status, body) = call(&h.router, "DeployResult", json!({ "auth": root(), "id": id })).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["kind"], "connection");

    let (_, listed) = call(&h.router, "ListContainers", json!({ "auth": root() })).await;
    assert_eq!(listed["data"]["container_ids"], json!([]));
}

#[tokio::test]
async fn deploy_authorization_fails_synchronously() {
    let h = harness().await;
    register_web(&h, false).await;
    let (status, body) = call(
        &h.router,
        "Deploy",
        json!({ "auth": alice(), "app": "web", "sha": "abc", "env": "prod" }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "permission_denied");
}

#[tokio::test]
async fn result_poll_rejects_unknown_and_mismatched_tasks() {
    let h = harness().await;
    let (status, _) = call(
        &h.router,
        "DeployResult",
        json!({ "auth": root(), "id": "no-such-task" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    register_web(&h, false).await;
    let (_, body) = call(
        &h.router,
        "Deploy",
        json!({ "auth": root(), "app": "web", "sha": "abc", "env": "prod", "hosts": ["sup-1"] }),
    )
    .await;
    let id = body["data"]["id"].as_str().unwrap().to_string();
    let (status, body) = call(&h.router, "TeardownResult", json!({ "auth": root(), "id": id })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("is not a Teardown task"));
}

#[tokio::test]
async fn maintenance_blocks_everything_but_idle() {
    let h = harness().await;
    h.ctx.gate().set(true);

    let (status, body) = call(&h.router, "ListApps", json!({ "auth": root() })).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["kind"], "maintenance_mode");

    let (status, body) = call(&h.router, "Idle", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["idle"], true);

    h.ctx.gate().set(false);
    let (status, _) = call(&h.router, "ListApps", json!({ "auth": root() })).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn team_directory_writes_are_not_supported() {
    let h = harness_with(FakeSupervisor::new(), &[("permissions", "write")]).await;

    let (status, body) = call(
        &h.router,
        "CreateTeam",
        json!({ "auth": root(), "team": "new-team" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(body["kind"], "not_supported");
    assert_eq!(body["error"], "Team creation is no longer supported");

    let (status, body) = call(
        &h.router,
        "AddTeamMember",
        json!({ "auth": root(), "team": "web-team", "user": "bob" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(body["error"], "Modify Team member is no longer supported");

    // Non-admins are stopped at authorization.
    let (status, _) = call(
        &h.router,
        "DeleteTeam",
        json!({ "auth": alice(), "team": "web-team" }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Nobody is a team admin any more.
    let (status, body) = call(
        &h.router,
        "AddTeamAdmin",
        json!({ "auth": root(), "team": "web-team", "user": "alice" }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Permission denied");
    let (_, body) = call(
        &h.router,
        "IsTeamAdmin",
        json!({ "auth": root(), "team": "web-team", "user": "alice" }),
    )
    .await;
    assert_eq!(body["data"]["is_admin"], false);
}

#[tokio::test]
async fn team_queries() {
    let h = harness().await;
    let (_, body) = call(&h.router, "ListTeams", json!({ "auth": alice() })).await;
    assert_eq!(body["data"]["teams"], json!(["web-team"]));

    let (_, body) = call(&h.router, "IsSuperUser", json!({ "auth": alice() })).await;
    assert_eq!(body["data"]["is_super_user"], false);
    let (_, body) = call(
        &h.router,
        "IsSuperUser",
        json!({ "auth": root(), "user": "alice" }),
    )
    .await;
    assert_eq!(body["data"]["is_super_user"], false);
    let (_, body) = call(&h.router, "IsSuperUser", json!({ "auth": root() })).await;
    assert_eq!(body["data"]["is_super_user"], true);
}

#[tokio::test]
async fn grant_role_requires_super_user() {
    let h = harness().await;
    let arg = |auth: Value| {
        json!({
            "auth": auth,
            "region": REGION,
            "host": HOST,
            "role": "permissions",
            "rtype": "write",
        })
    };
    let (status, _) = call(&h.router, "GrantRole", arg(alice())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(&h.router, "GrantRole", arg(root())).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let me = h.ctx.registry.get_manager(REGION, HOST).await.unwrap();
    assert!(me.has_role("permissions", "write"));

    let (status, _) = call(&h.router, "RevokeRole", arg(root())).await;
    assert_eq!(status, StatusCode::OK);
    let me = h.ctx.registry.get_manager(REGION, HOST).await.unwrap();
    assert!(!me.has_role("permissions", "write"));
}
