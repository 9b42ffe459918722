//! HTTP handlers: decode the verb argument, hand the command to the task
//! runner, and wrap the outcome in an [`RpcReply`].

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use fleetgrid_tasks::{TaskError, TaskResult};
use serde_json::{Value, json};
use tracing::debug;

use crate::RpcState;
use crate::commands::apps::*;
use crate::commands::containers::*;
use crate::commands::deploy::*;
use crate::commands::envs::*;
use crate::commands::managers::*;
use crate::commands::routing::*;
use crate::commands::teams::*;
use crate::commands::{Call, Verb, VerbSpec};
use crate::context::ManagerContext;
use crate::protocol::{ResultArg, RpcReply};

fn decode<T: serde::de::DeserializeOwned>(verb: &str, body: &Bytes) -> TaskResult<T> {
    let raw: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        body
    };
    serde_json::from_slice(raw)
        .map_err(|e| TaskError::Validation(format!("invalid {verb} argument: {e}")))
}

/// Run a verb to completion.
async fn run<V: Verb>(ctx: &Arc<ManagerContext>, body: &Bytes) -> TaskResult<Value> {
    let arg = decode::<V::Arg>(V::NAME, body)?;
    ctx.runner
        .run(Arc::new(Call(V::new(ctx.clone(), arg))))
        .await
}

/// Start a verb in the background; the reply carries the task ID.
async fn spawn<V: Verb>(ctx: &Arc<ManagerContext>, body: &Bytes) -> TaskResult<Value> {
    let arg = decode::<V::Arg>(V::NAME, body)?;
    let id = ctx
        .runner
        .spawn(Arc::new(Call(V::new(ctx.clone(), arg))))
        .await?;
    Ok(json!({ "id": id }))
}

/// Outcome of a background task started by verb `name`.
async fn poll(ctx: &ManagerContext, name: &str, body: &Bytes) -> TaskResult<Value> {
    let arg: ResultArg = decode(&format!("{name}Result"), body)?;
    if arg.id.is_empty() {
        return Err(TaskError::missing("task id"));
    }
    let snapshot = ctx.runner.result(&arg.id, ctx.result_wait).await?;
    if snapshot.name != name {
        return Err(TaskError::NotFound(format!(
            "task {} is not a {name} task",
            arg.id
        )));
    }
    match snapshot.outcome() {
        Some(outcome) => outcome,
        None => Err(TaskError::Pending(format!(
            "task {} is still executing",
            arg.id
        ))),
    }
}

async fn dispatch(ctx: &Arc<ManagerContext>, verb: &str, body: &Bytes) -> TaskResult<Value> {
    match verb {
        // ── Managers ──
        "Idle" => run::<Idle>(ctx, body).await,
        "ListManagers" => run::<ListManagers>(ctx, body).await,
        "GrantRole" => run::<GrantRole>(ctx, body).await,
        "RevokeRole" => run::<RevokeRole>(ctx, body).await,

        // ── Apps ──
        "RegisterApp" => run::<RegisterApp>(ctx, body).await,
        "UnregisterApp" => run::<UnregisterApp>(ctx, body).await,
        "GetApp" => run::<GetApp>(ctx, body).await,
        "ListApps" => run::<ListApps>(ctx, body).await,
        "AddDependerEnvData" => run::<AddDependerEnvData>(ctx, body).await,
        "RemoveDependerEnvData" => run::<RemoveDependerEnvData>(ctx, body).await,
        "AddDependerAppData" => run::<AddDependerAppData>(ctx, body).await,
        "RemoveDependerAppData" => run::<RemoveDependerAppData>(ctx, body).await,

        // ── Envs ──
        "UpdateEnv" => run::<UpdateEnv>(ctx, body).await,
        "DeleteEnv" => run::<DeleteEnv>(ctx, body).await,
        "GetEnv" => run::<GetEnv>(ctx, body).await,
        "ListEnvs" => run::<ListEnvs>(ctx, body).await,
        "SetEnvDep" => run::<SetEnvDep>(ctx, body).await,
        "DeleteEnvDep" => run::<DeleteEnvDep>(ctx, body).await,

        // ── Containers ──
        "GetContainer" => run::<GetContainer>(ctx, body).await,
        "ListContainers" => run::<ListContainers>(ctx, body).await,
        "ListShas" => run::<ListShas>(ctx, body).await,
        "ContainerMaintenance" => run::<ContainerMaintenance>(ctx, body).await,
        "Deploy" => spawn::<Deploy>(ctx, body).await,
        "DeployResult" => poll(ctx, Deploy::NAME, body).await,
        "Teardown" => spawn::<Teardown>(ctx, body).await,
        "TeardownResult" => poll(ctx, Teardown::NAME, body).await,

        // ── Routing ──
        "ReserveRouterPort" => run::<ReserveRouterPort>(ctx, body).await,
        "ListRouterPorts" => run::<ListRouterPorts>(ctx, body).await,
        "ListPools" => run::<ListPools>(ctx, body).await,
        "GetPool" => run::<GetPool>(ctx, body).await,
        "AddToPool" => run::<AddToPool>(ctx, body).await,
        "DeleteFromPool" => run::<DeleteFromPool>(ctx, body).await,
        "RegisterRouter" => run::<RegisterRouter>(ctx, body).await,
        "UnregisterRouter" => run::<UnregisterRouter>(ctx, body).await,
        "GetRouter" => run::<GetRouter>(ctx, body).await,
        "ListRouters" => run::<ListRouters>(ctx, body).await,

        // ── Teams ──
        "ListTeams" => run::<ListTeams>(ctx, body).await,
        "AllowApp" => run::<AllowApp>(ctx, body).await,
        "DisallowApp" => run::<DisallowApp>(ctx, body).await,
        "ListTeamApps" => run::<ListTeamApps>(ctx, body).await,
        "IsAppAllowed" => run::<IsAppAllowed>(ctx, body).await,
        "ListAllowedApps" => run::<ListAllowedApps>(ctx, body).await,
        "IsSuperUser" => run::<IsSuperUser>(ctx, body).await,
        "IsTeamAdmin" => run::<IsTeamAdmin>(ctx, body).await,
        "CreateTeam" => run::<CreateTeam>(ctx, body).await,
        "DeleteTeam" => run::<DeleteTeam>(ctx, body).await,
        "AddTeamEmail" => run::<AddTeamEmail>(ctx, body).await,
        "RemoveTeamEmail" => run::<RemoveTeamEmail>(ctx, body).await,
        "AddTeamAdmin" => run::<AddTeamAdmin>(ctx, body).await,
        "RemoveTeamAdmin" => run::<RemoveTeamAdmin>(ctx, body).await,
        "AddTeamMember" => run::<AddTeamMember>(ctx, body).await,
        "RemoveTeamMember" => run::<RemoveTeamMember>(ctx, body).await,

        other => Err(TaskError::NotFound(format!("unknown verb {other:?}"))),
    }
}

/// POST /rpc/{verb}
pub async fn rpc(
    State(state): State<RpcState>,
    Path(verb): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    debug!(%verb, bytes = body.len(), "rpc request");
    RpcReply::from_result(dispatch(&state.ctx, &verb, &body).await)
}

/// GET /healthz
pub async fn healthz(State(state): State<RpcState>) -> impl IntoResponse {
    RpcReply::ok(json!({
        "region": state.ctx.region,
        "host": state.ctx.host,
        "maintenance": state.ctx.gate().is_active(),
        "tasks": state.ctx.tracker().len(),
    }))
}
