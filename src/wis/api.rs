//! WIS HTTP API. Every POST body under `/smsgateway/api` is a codec token;
//! bodies that do not decode are answered with 400.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::node::WisNode;
use crate::delivery::assign_route;
use crate::error::AppError;
use crate::types::{
    now_secs, Message, MessageStatus, RouteEntry, Submission, SubmissionReceipt,
};
use crate::wire::{
    DelegateRequest, HeartbeatRequest, HistoryRequest, ManageModem, RouterStatusRequest,
    RoutingRequest, WatchdogRequest, API_PREFIX,
};

type NodeState = State<Arc<WisNode>>;

pub fn router(node: Arc<WisNode>) -> Router {
    let api = Router::new()
        .route("/watchdog", post(watchdog))
        .route("/heartbeat", post(heartbeat))
        .route("/receiverouting", post(receive_routing))
        .route("/requestrouting", post(request_routing))
        .route("/managemodem", post(manage_modem))
        .route("/delegatesms", post(delegate_sms))
        .route("/router", post(router_status))
        .route("/getsms", post(get_sms))
        .route("/sendsms", post(send_sms));

    Router::new()
        .nest(API_PREFIX, api)
        .route("/smsgateway/sendsms", get(legacy_send).post(legacy_send))
        .route("/health", get(health))
        .with_state(node)
}

fn decode<T: DeserializeOwned>(node: &WisNode, endpoint: &str, body: &str) -> Result<T, Response> {
    node.codec().decode(body).map_err(|e| {
        tracing::warn!("⚠️  Rejected {} request: {}", endpoint, e);
        StatusCode::BAD_REQUEST.into_response()
    })
}

fn reply<T: Serialize + ?Sized>(node: &WisNode, status: StatusCode, value: &T) -> Response {
    match node.codec().encode(value) {
        Ok(token) => (status, token).into_response(),
        Err(e) => {
            tracing::error!("❌ Failed to encode response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn watchdog(State(node): NodeState, body: String) -> Response {
    let request: WatchdogRequest = match decode(&node, "watchdog", &body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if request.run != "True" {
        return StatusCode::BAD_REQUEST.into_response();
    }
    node.ensure_running();
    node.watchdog().wake();
    StatusCode::OK.into_response()
}

async fn heartbeat(State(node): NodeState, body: String) -> Response {
    let request: HeartbeatRequest = match decode(&node, "heartbeat", &body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if node.routes().heartbeat(&request.route_id, now_secs()) > 0 {
        StatusCode::OK.into_response()
    } else {
        tracing::debug!("Heartbeat for unknown or withdrawn route {}", request.route_id);
        StatusCode::BAD_REQUEST.into_response()
    }
}

async fn receive_routing(State(node): NodeState, body: String) -> Response {
    let routes: Vec<RouteEntry> = match decode(&node, "receiverouting", &body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let outcome = node.routes().merge(routes);
    if outcome.inserted > 0 {
        tracing::info!(
            "🧭 Learned {} new routes ({} updated)",
            outcome.inserted,
            outcome.updated
        );
    }
    StatusCode::OK.into_response()
}

async fn request_routing(State(node): NodeState, body: String) -> Response {
    let request: RoutingRequest = match decode(&node, "requestrouting", &body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if request.get != "peers" {
        return StatusCode::BAD_REQUEST.into_response();
    }
    reply(&node, StatusCode::OK, &node.routes().read())
}

async fn manage_modem(State(node): NodeState, body: String) -> Response {
    let request: ManageModem = match decode(&node, "managemodem", &body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match request {
        ManageModem::Register(registration) => {
            if registration.route_id.is_empty()
                || regex::Regex::new(&registration.number_pattern).is_err()
            {
                tracing::warn!(
                    "⚠️  Refused registration of modem {} (route id {:?}, pattern {:?})",
                    registration.modem_id,
                    registration.route_id,
                    registration.number_pattern
                );
                return StatusCode::BAD_REQUEST.into_response();
            }
            let route =
                RouteEntry::from_registration(&registration, node.node_id(), node.public_url());
            tracing::info!(
                "📶 Registered modem {} ({}) as route {}",
                route.modem_id,
                route.number_pattern,
                route.route_id
            );
            node.routes().upsert(route, None);
        }
        ManageModem::Unregister { route_id } => {
            let withdrawn = node.routes().withdraw_route(&route_id);
            tracing::info!("📴 Unregistered route {} ({} rows)", route_id, withdrawn);
        }
    }

    node.broadcast_now();
    StatusCode::OK.into_response()
}

async fn delegate_sms(State(node): NodeState, body: String) -> Response {
    let request: DelegateRequest = match decode(&node, "delegatesms", &body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let mut sms = request.sms;
    sms.set_status(MessageStatus::DelegatedIn);

    match node.messages().insert(&sms).await {
        Ok(()) => {
            tracing::debug!("📥 Accepted delegated message {} for modem {}", sms.id, sms.modem_id);
            node.watchdog().wake();
            StatusCode::OK.into_response()
        }
        Err(e) => {
            tracing::error!("❌ Failed to store delegated message {}: {}", sms.id, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn router_status(State(node): NodeState, body: String) -> Response {
    let request: RouterStatusRequest = match decode(&node, "router", &body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if request.action != "status" {
        return StatusCode::BAD_REQUEST.into_response();
    }
    reply(&node, StatusCode::OK, &node.status())
}

async fn get_sms(State(node): NodeState, body: String) -> Response {
    let request: HistoryRequest = match decode(&node, "getsms", &body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if request.get != "sms" {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let date = match request.date.as_deref() {
        None | Some("") => chrono::Utc::now().date_naive(),
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(d) => d,
            Err(_) => return StatusCode::BAD_REQUEST.into_response(),
        },
    };

    match node.messages().read_by_date(date).await {
        Ok(messages) => reply(&node, StatusCode::OK, &messages),
        Err(e) => {
            tracing::error!("❌ Failed to read messages for {}: {}", date, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn send_sms(
    State(node): NodeState,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: String,
) -> Response {
    let submission: Submission = match decode(&node, "sendsms", &body) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let mut msg = Message::from_submission(submission, Some(peer.ip().to_string()));
    let result = submit(&node, &mut msg).await;

    let receipt = SubmissionReceipt {
        id: msg.id.clone(),
        status: msg.status,
        modem_id: msg.modem_id.clone(),
    };
    match result {
        Ok(()) => reply(&node, StatusCode::OK, &receipt),
        Err(_) => reply(&node, StatusCode::INTERNAL_SERVER_ERROR, &receipt),
    }
}

/// Route, persist and hand a fresh message to the watchdog.
async fn submit(node: &WisNode, msg: &mut Message) -> Result<(), AppError> {
    assign_route(node.routes(), node.messages().as_ref(), msg).await?;
    tracing::info!(
        "📨 Accepted message {} for {} via modem {}",
        msg.id,
        msg.target_number,
        msg.modem_id
    );
    node.watchdog().wake();
    Ok(())
}

#[derive(Debug, Deserialize)]
struct LegacySend {
    mobile: Option<String>,
    content: Option<String>,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(default)]
    appid: Option<String>,
}

const LEGACY_OK: &str = "SUC0001";
const LEGACY_ERR: &str = "ERR0001";

fn legacy_reply(code: &str) -> Response {
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <SmsSendReturn><returnCode>{}</returnCode></SmsSendReturn>",
        code
    );
    ([(header::CONTENT_TYPE, "text/xml; charset=utf-8")], body).into_response()
}

/// Plain query-string submission kept for old integrations.
async fn legacy_send(
    State(node): NodeState,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<LegacySend>,
) -> Response {
    let (Some(mobile), Some(content)) = (params.mobile, params.content) else {
        return legacy_reply(LEGACY_ERR);
    };
    if mobile.trim().is_empty() {
        return legacy_reply(LEGACY_ERR);
    }

    let forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let submission = Submission {
        id: None,
        target_number: mobile,
        content,
        priority: params.priority.unwrap_or(0),
        app_id: params.appid,
        forwarded_for,
    };

    let mut msg = Message::from_submission(submission, Some(peer.ip().to_string()));
    match submit(&node, &mut msg).await {
        Ok(()) => legacy_reply(LEGACY_OK),
        Err(_) => legacy_reply(LEGACY_ERR),
    }
}
