//! fleetgrid-rpc: the manager's RPC surface.
//!
//! Every verb is a JSON `POST` to `/rpc/{verb}`; every reply is an
//! [`RpcReply`] envelope. Deploy and Teardown run in the background and
//! are polled with `DeployResult` / `TeardownResult`.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/rpc/{verb}` | Run one verb |
//! | GET | `/healthz` | Manager identity, maintenance flag, task count |
//!
//! # Verbs
//!
//! | Area | Verbs |
//! |---|---|
//! | Managers | `Idle`, `ListManagers`, `GrantRole`, `RevokeRole` |
//! | Apps | `RegisterApp`, `UnregisterApp`, `GetApp`, `ListApps`, `Add/RemoveDependerEnvData`, `Add/RemoveDependerAppData` |
//! | Envs | `UpdateEnv`, `DeleteEnv`, `GetEnv`, `ListEnvs`, `SetEnvDep`, `DeleteEnvDep` |
//! | Containers | `GetContainer`, `ListContainers`, `ListShas`, `ContainerMaintenance`, `Deploy`, `DeployResult`, `Teardown`, `TeardownResult` |
//! | Routing | `ReserveRouterPort`, `ListRouterPorts`, `ListPools`, `GetPool`, `AddToPool`, `DeleteFromPool`, `RegisterRouter`, `UnregisterRouter`, `GetRouter`, `ListRouters` |
//! | Teams | `ListTeams`, `AllowApp`, `DisallowApp`, `ListTeamApps`, `IsAppAllowed`, `ListAllowedApps`, `IsSuperUser`, `IsTeamAdmin` |
//!
//! Team directory writes (`CreateTeam`, `DeleteTeam`, `Add/RemoveTeamEmail`,
//! `Add/RemoveTeamAdmin`, `Add/RemoveTeamMember`) are answered with
//! `not_supported`.

pub mod auth;
pub mod commands;
pub mod context;
pub mod handlers;
pub mod protocol;
pub mod supervisor;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

pub use auth::{AuthArg, AuthSettings, StaticDirectory, TeamDirectory};
pub use context::{DEFAULT_RESULT_WAIT, ManagerContext};
pub use protocol::{ReplyStatus, ResultArg, RpcReply};
pub use supervisor::{
    Container, DEFAULT_SUPERVISOR_PORT, DeployRequest, HttpSupervisor, Supervisor,
    SupervisorError,
};

/// Shared state for the handlers.
#[derive(Clone)]
pub struct RpcState {
    pub ctx: Arc<ManagerContext>,
}

/// Build the manager router.
pub fn build_router(ctx: Arc<ManagerContext>) -> Router {
    let state = RpcState { ctx };
    Router::new()
        .route("/rpc/{verb}", post(handlers::rpc))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}
