//! Automation API route handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use chrono::Utc;
use flowpost_core::FlowpostError;
use flowpost_scheduler::ops::{self, RequeueFilter};
use flowpost_scheduler::{EnrollRequest, Flow, QueueWorker, RunStatus};

use crate::auth::Caller;
use crate::server::AppState;

/// Status plus JSON body. Every body carries `ok`.
pub type Reply = (StatusCode, Json<serde_json::Value>);

fn ok(body: serde_json::Value) -> Reply {
    let mut body = body;
    if let Some(map) = body.as_object_mut() {
        map.insert("ok".into(), serde_json::Value::Bool(true));
    }
    (StatusCode::OK, Json(body))
}

fn fail(status: StatusCode, code: &str, error: impl Into<String>) -> Reply {
    (
        status,
        Json(serde_json::json!({"ok": false, "code": code, "error": error.into()})),
    )
}

pub fn error_reply(e: &FlowpostError) -> Reply {
    let status = match e {
        FlowpostError::FlowNotFound(_)
        | FlowpostError::RecipientNotFound(_)
        | FlowpostError::RunNotFound(_) => StatusCode::NOT_FOUND,
        FlowpostError::NoTrigger(_)
        | FlowpostError::InvalidFlow(_)
        | FlowpostError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
        FlowpostError::TenantMismatch(_) => StatusCode::FORBIDDEN,
        FlowpostError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("❌ API error: {e}");
    }
    fail(status, e.code(), e.to_string())
}

fn forbidden(caller: &Caller, what: &str) -> Reply {
    tracing::warn!("🚫 {} denied access to {what}", caller.label());
    fail(StatusCode::FORBIDDEN, "FORBIDDEN", format!("{what} belongs to another owner"))
}

fn secret_only(caller: &Caller) -> Option<Reply> {
    (!caller.is_secret()).then(|| {
        fail(StatusCode::FORBIDDEN, "FORBIDDEN", "this endpoint requires the cron secret")
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_default()
}

/// Load a flow the caller may act on. Flows without a trigger are returned
/// too, so operators can inspect them.
fn owned_flow(state: &AppState, caller: &Caller, flow_id: &str) -> Result<Flow, Reply> {
    let flow = state
        .engine
        .collaborators()
        .flows
        .load_flow(flow_id)
        .map_err(|e| error_reply(&e))?
        .ok_or_else(|| error_reply(&FlowpostError::FlowNotFound(flow_id.to_string())))?;
    if !caller.can_act_for(&flow.owner_id) {
        return Err(forbidden(caller, &format!("flow {flow_id}")));
    }
    Ok(flow)
}

/// Health check (public).
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "status": "ok",
        "service": "flowpost-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Engine info: uptime, gateway, batch limits.
pub async fn system_info(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Reply {
    let settings = state.engine.settings();
    ok(serde_json::json!({
        "name": "Flowpost",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "caller": caller.label(),
        "delivery": state.engine.collaborators().gateway.name(),
        "engine": {
            "max_runs_per_tick": settings.max_runs_per_tick,
            "max_flows_per_pass": settings.max_flows_per_pass,
            "max_hops_per_step": settings.max_hops_per_step,
            "worker_batch_limit": settings.worker_batch_limit,
            "tick_interval_secs": settings.tick_interval_secs,
        },
    }))
}

// ---- Tick ----

/// Tick one flow: `{flow_id, max?}`.
pub async fn tick(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<serde_json::Value>,
) -> Reply {
    let flow_id = body["flow_id"]
        .as_str()
        .or_else(|| body["flowId"].as_str())
        .map(str::trim)
        .unwrap_or("");
    if flow_id.is_empty() {
        return fail(StatusCode::UNPROCESSABLE_ENTITY, "INVALID_INPUT", "flow_id is required");
    }
    let max = body["max"].as_u64().map(|m| m as usize);

    // Ownership before any precondition check.
    if let Err(reply) = owned_flow(&state, &caller, flow_id) {
        return reply;
    }

    match state.engine.tick(flow_id, max).await {
        Ok(report) => ok(to_json(&report)),
        Err(e) => error_reply(&e),
    }
}

/// Tick every flow with due runs (secret only).
pub async fn tick_all(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<serde_json::Value>,
) -> Reply {
    if let Some(denied) = secret_only(&caller) {
        return denied;
    }
    let max_flows = body["max_flows"].as_u64().map(|m| m as usize);
    let max_per_flow = body["max_per_flow"].as_u64().map(|m| m as usize);
    match state.engine.tick_all(max_flows, max_per_flow).await {
        Ok(report) => ok(to_json(&report)),
        Err(e) => error_reply(&e),
    }
}

// ---- Enrollment ----

pub async fn enroll(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<EnrollRequest>,
) -> Reply {
    if let Caller::Owner(_) = &caller {
        match state
            .engine
            .collaborators()
            .recipients
            .get_recipient(req.recipient_id.trim())
        {
            Ok(Some(r)) if !caller.can_act_for(&r.owner_id) => {
                return forbidden(&caller, &format!("recipient {}", r.id));
            }
            Ok(_) => {}
            Err(e) => return error_reply(&e),
        }
    }
    match state.engine.enroll(&req) {
        Ok(outcome) => ok(to_json(&outcome)),
        Err(e) => error_reply(&e),
    }
}

// ---- Queue worker ----

/// Process one batch of due queue jobs (secret only): `{limit?, project_flow_id?}`.
pub async fn worker(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<serde_json::Value>,
) -> Reply {
    if let Some(denied) = secret_only(&caller) {
        return denied;
    }
    let worker = QueueWorker::new(state.engine.clone());

    let projected = match body["project_flow_id"].as_str().filter(|s| !s.is_empty()) {
        Some(flow_id) => match worker.project_flow(flow_id, Utc::now()) {
            Ok(p) => Some(p),
            Err(e) => return error_reply(&e),
        },
        None => None,
    };

    let limit = body["limit"].as_u64().map(|l| l as usize);
    match worker.run_batch(limit).await {
        Ok(report) => {
            let mut body = to_json(&report);
            if let Some(p) = projected {
                body["projected"] = to_json(&p);
            }
            ok(body)
        }
        Err(e) => error_reply(&e),
    }
}

// ---- Operator actions ----

/// Requeue failed runs (secret only): `{run_id?, flow_id?, recipient_id?}`.
pub async fn requeue(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(filter): Json<RequeueFilter>,
) -> Reply {
    if let Some(denied) = secret_only(&caller) {
        return denied;
    }
    match ops::requeue(state.engine.db(), &filter, Utc::now()) {
        Ok(report) => ok(to_json(&report)),
        Err(e) => error_reply(&e),
    }
}

pub async fn kick_flow(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(flow_id): Path<String>,
) -> Reply {
    if let Err(denied) = owned_flow(&state, &caller, &flow_id) {
        return denied;
    }
    match ops::kick(state.engine.db(), &flow_id, Utc::now()) {
        Ok(touched) => ok(serde_json::json!({"flow_id": flow_id, "kicked": touched})),
        Err(e) => error_reply(&e),
    }
}

/// Delete all runs, jobs and events of a flow: `{confirm_deletion: true}`.
pub async fn reset_flow(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(flow_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Reply {
    if let Err(denied) = owned_flow(&state, &caller, &flow_id) {
        return denied;
    }
    let confirm = body["confirm_deletion"].as_bool().unwrap_or(false);
    match ops::reset_flow(state.engine.db(), &flow_id, confirm) {
        Ok(counts) => ok(serde_json::json!({"flow_id": flow_id, "deleted": to_json(&counts)})),
        Err(e) => error_reply(&e),
    }
}

pub async fn flow_stats(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(flow_id): Path<String>,
) -> Reply {
    let flow = match owned_flow(&state, &caller, &flow_id) {
        Ok(flow) => flow,
        Err(denied) => return denied,
    };
    match ops::node_stats(state.engine.db(), &flow) {
        Ok(stats) => ok(to_json(&stats)),
        Err(e) => error_reply(&e),
    }
}

pub async fn flow_diagnose(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(flow_id): Path<String>,
) -> Reply {
    let flow = match owned_flow(&state, &caller, &flow_id) {
        Ok(flow) => flow,
        Err(denied) => return denied,
    };
    match ops::diagnose(state.engine.db(), &flow) {
        Ok(diagnosis) => ok(serde_json::json!({"diagnosis": to_json(&diagnosis)})),
        Err(e) => error_reply(&e),
    }
}

/// List runs of a flow: `?status=active|done|failed&limit=N`.
pub async fn flow_runs(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(flow_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Reply {
    if let Err(denied) = owned_flow(&state, &caller, &flow_id) {
        return denied;
    }
    let status = match params.get("status").map(String::as_str) {
        None | Some("") | Some("all") => None,
        Some(s) => match RunStatus::parse(s) {
            Some(status) => Some(status),
            None => {
                return fail(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "INVALID_INPUT",
                    format!("unknown status '{s}'"),
                );
            }
        },
    };
    let limit = params
        .get("limit")
        .and_then(|l| l.parse::<usize>().ok())
        .unwrap_or(100)
        .clamp(1, 1000);

    match state.engine.db().list_runs(&flow_id, status, limit) {
        Ok(runs) => ok(serde_json::json!({
            "flow_id": flow_id,
            "count": runs.len(),
            "runs": to_json(&runs),
        })),
        Err(e) => error_reply(&e),
    }
}

pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(run_id): Path<String>,
) -> Reply {
    let db = state.engine.db();
    match db.get_run(&run_id) {
        Ok(Some(run)) if !caller.can_act_for(&run.owner_id) => {
            return forbidden(&caller, &format!("run {run_id}"));
        }
        Ok(Some(_)) => {}
        Ok(None) => return error_reply(&FlowpostError::RunNotFound(run_id)),
        Err(e) => return error_reply(&e),
    }
    match ops::cancel(db, &run_id, Utc::now()) {
        Ok((run, changed)) => ok(serde_json::json!({"cancelled": changed, "run": to_json(&run)})),
        Err(e) => error_reply(&e),
    }
}
