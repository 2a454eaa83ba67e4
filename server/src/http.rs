use crate::env;
use crate::error::BrokerError;
use crate::state::AppState;
use crate::store::{SessionData, now_secs};
use crate::workloads::{self, RDP_PORT, TERMINATION_GRACE};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

pub fn build_cors(state: &AppState) -> CorsLayer {
    let mut cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    if !state.env.mode.is_production() {
        cors = cors.allow_origin(Any);
    } else if let Some(origin) = state
        .env
        .access_control_allowed_origin
        .as_deref()
        .filter(|s| !s.is_empty())
        .and_then(|s| HeaderValue::from_str(s).ok())
    {
        cors = cors.allow_origin(origin);
    }

    cors
}

pub async fn get_version() -> impl IntoResponse {
    Json(json!({
        "version": env::version(),
    }))
}

pub async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "active_tunnels": state.registry.count(),
        "stored_params": state.registry.params_count(),
    }))
}

#[derive(Deserialize)]
pub(crate) struct DeploySessionRequest {
    #[serde(default)]
    pub width: String,
    #[serde(default)]
    pub height: String,
    #[serde(default)]
    pub share: bool,
}

/// Provisions a sandbox workload, waits for its remote-desktop port, and
/// persists the session record plus the connection-parameter snapshot.
/// Only the connection id goes back to the client; credentials stay
/// server-side.
pub(crate) async fn deploy_sandbox(
    State(state): State<AppState>,
    Json(body): Json<DeploySessionRequest>,
) -> Result<impl IntoResponse, BrokerError> {
    let name = format!("sandbox-{}", &Uuid::new_v4().to_string()[..8]);

    let workload = state.workloads.create_sandbox(&name).await?;
    let fqdn = state.env.workload_fqdn(&workload.name);
    let connection_id = Uuid::new_v4().to_string();

    workloads::wait_for_rdp(
        &fqdn,
        RDP_PORT,
        state.env.readiness_timeout(),
        state.env.readiness_poll(),
    )
    .await?;

    let pod_ip = workload.ip.clone().unwrap_or_else(|| fqdn.clone());
    info!("workload {} for session {connection_id} is at {pod_ip}", workload.name);

    let params = connection_params(
        &fqdn,
        &state.env.sandbox_rdp_user,
        &state.env.sandbox_rdp_password,
        &body.width,
        &body.height,
        &connection_id,
    );
    state
        .registry
        .put_params(connection_id.clone(), params.clone());

    let now = now_secs();
    let timeout = state.env.session_timeout();
    let session = SessionData {
        pod_name: workload.name.clone(),
        pod_ip,
        fqdn: fqdn.clone(),
        connection_id: connection_id.clone(),
        tunnel_id: None,
        connection_params: params,
        share: body.share,
        disconnection_count: 0,
        created_at: now,
        expire_at: now + timeout.as_secs(),
        timeout_secs: timeout.as_secs(),
        last_extended_at: None,
    };
    state.store.put(&connection_id, &session, timeout).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "podName": workload.name,
            "fqdn": fqdn,
            "connection_id": connection_id,
            "status": "creating",
            "message": "sandbox deployed and connection parameters generated",
        })),
    ))
}

pub(crate) async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let ids = state.registry.all_ids();
    let connection_ids: Vec<_> = ids.iter().map(|id| json!({ "uuid": id })).collect();

    Json(json!({
        "active_sessions": ids.len(),
        "connection_ids": connection_ids,
    }))
}

pub(crate) async fn connect_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, BrokerError> {
    if !state.store.session_exists(&id).await? {
        return Err(BrokerError::NotFound);
    }
    if state.registry.params(&id).is_none() {
        return Err(BrokerError::NotFound);
    }

    Ok(Json(json!({
        "websocket_url": format!("/websocket-tunnel?uuid={id}"),
        "status": "ready",
        "message": "connection parameters ready",
    })))
}

/// Flips `share` on, preserving the session's TTL, and hands back the
/// share-tunnel URL.
pub(crate) async fn share_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, BrokerError> {
    let mut session = state.store.get(&id).await?;
    session.share = true;
    let ttl = state.store.put_preserving_ttl(&id, &session).await?;

    if state.registry.params(&id).is_none() {
        return Err(BrokerError::NotFound);
    }

    info!("enabled sharing for session {id} ({}s left)", ttl.as_secs());

    Ok(Json(json!({
        "websocket_url": format!("/websocket-tunnel/share?uuid={id}"),
        "status": "ready",
        "message": "session sharing enabled",
    })))
}

pub(crate) async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, BrokerError> {
    let session = state.store.get(&id).await?;

    if let Err(err) = state
        .workloads
        .terminate(&session.pod_name, TERMINATION_GRACE)
        .await
    {
        warn!("failed to terminate workload {}: {err}", session.pod_name);
    }

    if let Some(tunnel_id) = &session.tunnel_id {
        if let Some(tunnel) = state.registry.get(tunnel_id) {
            tunnel.close();
        }
        state.registry.delete(tunnel_id);
        state.registry.delete_params(tunnel_id);
    }
    state.registry.delete_params(&id);

    state.store.delete_session(&id).await?;
    let _ = state.store.clear_reconnect(&id).await;

    info!("session {id} stopped, workload {} reclaimed", session.pod_name);

    Ok(Json(json!({
        "message": format!("session {id} stopped and workload deleted"),
    })))
}

#[derive(Deserialize)]
pub(crate) struct ExtendSessionRequest {
    pub extension_minutes: u64,
}

pub(crate) async fn extend_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExtendSessionRequest>,
) -> Response {
    let delta = Duration::from_secs(req.extension_minutes * 60);

    match state.store.extend(&id, delta).await {
        Ok(new_ttl) => (
            StatusCode::OK,
            Json(json!({
                "session_id": id,
                "extended": true,
                "new_time_left": fmt_duration(new_ttl),
                "extension_amount": fmt_duration(delta),
                "message": format!("session extended by {} minutes", req.extension_minutes),
            })),
        )
            .into_response(),
        Err(BrokerError::Forbidden(message)) => (
            StatusCode::FORBIDDEN,
            Json(json!({
                "session_id": id,
                "extended": false,
                "message": message,
            })),
        )
            .into_response(),
        Err(BrokerError::Expired) => (
            StatusCode::GONE,
            Json(json!({
                "session_id": id,
                "extended": false,
                "message": "session has already expired",
            })),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn session_time_left(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, BrokerError> {
    let ttl = state.store.time_left(&id).await?;
    let (can_extend, _) = state.store.can_extend(&id).await?;

    Ok(Json(json!({
        "session_id": id,
        "time_left": fmt_duration(ttl),
        "can_extend": can_extend,
        "total_seconds": ttl.as_secs(),
    })))
}

fn connection_params(
    fqdn: &str,
    username: &str,
    password: &str,
    width: &str,
    height: &str,
    connection_id: &str,
) -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert("scheme".to_string(), "rdp".to_string());
    params.insert("hostname".to_string(), fqdn.to_string());
    params.insert("port".to_string(), RDP_PORT.to_string());
    params.insert("username".to_string(), username.to_string());
    params.insert("password".to_string(), password.to_string());
    params.insert("security".to_string(), String::new());
    params.insert("ignore-cert".to_string(), "true".to_string());
    params.insert("width".to_string(), width.to_string());
    params.insert("height".to_string(), height.to_string());
    params.insert("uuid".to_string(), connection_id.to_string());
    params
}

fn fmt_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{}m{}s", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_format_like_clocks() {
        assert_eq!(fmt_duration(Duration::from_secs(45)), "45s");
        assert_eq!(fmt_duration(Duration::from_secs(60)), "1m0s");
        assert_eq!(fmt_duration(Duration::from_secs(630)), "10m30s");
    }

    #[test]
    fn connection_params_carry_the_whole_snapshot() {
        let params = connection_params(
            "sandbox-1.sandbox-instances.browser-sandbox.svc.cluster.local",
            "rdpuser",
            "secret",
            "1280",
            "720",
            "ext-1",
        );

        assert_eq!(params.get("scheme").map(String::as_str), Some("rdp"));
        assert_eq!(params.get("port").map(String::as_str), Some("3389"));
        assert_eq!(params.get("width").map(String::as_str), Some("1280"));
        assert_eq!(params.get("height").map(String::as_str), Some("720"));
        assert_eq!(params.get("uuid").map(String::as_str), Some("ext-1"));
        assert_eq!(params.get("ignore-cert").map(String::as_str), Some("true"));
    }

    #[test]
    fn deploy_request_fields_are_optional() {
        let req: DeploySessionRequest = serde_json::from_str("{}").unwrap();
        assert!(req.width.is_empty());
        assert!(!req.share);

        let req: DeploySessionRequest =
            serde_json::from_str(r#"{"width": "1024", "height": "768", "share": true}"#).unwrap();
        assert_eq!(req.width, "1024");
        assert!(req.share);
    }
}
