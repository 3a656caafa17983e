//! HTTP surface: webhook intake and the operator read model.
//!
//! Endpoints:
//! - `POST /webhooks/messaging`: inbound messages from the provider,
//!   form-encoded or JSON. Always answers 200 so the provider stops
//!   retrying, except on store failure (502, retry wanted).
//! - `POST /webhooks/billing`: billing platform events, HMAC-signed.
//!   401 on signature mismatch, with no side effects.
//! - `GET /status`: health check.
//! - `GET /threads`, `GET /threads/{id}/messages`: read model.
//! - `PATCH /threads/{id}`: operator overrides: forced stage (accepted
//!   even when not a legal successor) and the human-takeover flag.
//! - `POST /threads/{id}/messages`: a human-authored outbound reply.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, patch, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::leadflow::billing::BillingProcessor;
use crate::leadflow::dispatch::{DispatchOutcome, InboundMessage, IngressDispatcher};
use crate::leadflow::error::{BillingError, DispatchError};
use crate::leadflow::locks::ThreadLocks;
use crate::leadflow::sender::OutboundSender;
use crate::leadflow::store::{Role, Store};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<IngressDispatcher>,
    pub billing: Arc<BillingProcessor>,
    pub store: Arc<Store>,
    pub sender: Arc<dyn OutboundSender>,
    pub locks: Arc<ThreadLocks>,
}

/// Assemble the router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/webhooks/messaging", post(messaging_webhook))
        .route("/webhooks/billing", post(billing_webhook))
        .route("/threads", get(list_threads))
        .route("/threads/{id}", patch(patch_thread))
        .route(
            "/threads/{id}/messages",
            get(list_messages).post(post_human_message),
        )
        .with_state(state)
}

async fn status() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Decode a form-encoded body into a key/value map.
fn parse_form(body: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for pair in body.split('&') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        let decode = |s: &str| {
            urlencoding::decode(&s.replace('+', " "))
                .map(|cow| cow.into_owned())
                .unwrap_or_else(|_| s.to_string())
        };
        if !key.is_empty() {
            fields.insert(decode(key), decode(value));
        }
    }
    fields
}

/// Decode a provider webhook into an [`InboundMessage`], accepting both
/// the form-encoded provider shape (`From`, `Body`, `MessageSid`,
/// `MediaContentType0`…) and a plain JSON shape (`from`, `body`,
/// `message_id`, `media`).
fn decode_inbound(headers: &HeaderMap, body: &[u8]) -> Option<InboundMessage> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if content_type.starts_with("application/json") {
        let value: Value = serde_json::from_slice(body).ok()?;
        let from = value.get("from")?.as_str()?.to_string();
        return Some(InboundMessage {
            channel: value
                .get("channel")
                .and_then(Value::as_str)
                .unwrap_or("whatsapp")
                .to_string(),
            from,
            body: value
                .get("body")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            timestamp: None,
            provider_message_id: value
                .get("message_id")
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
            media: value
                .get("media")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(|s| s.to_string())
                        .collect()
                })
                .unwrap_or_default(),
        });
    }

    let fields = parse_form(std::str::from_utf8(body).ok()?);
    let from = fields.get("From")?.clone();
    let channel = from
        .split_once(':')
        .map(|(prefix, _)| prefix.to_string())
        .unwrap_or_else(|| "whatsapp".to_string());
    let media_count: usize = fields
        .get("NumMedia")
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);
    let media = (0..media_count)
        .filter_map(|n| fields.get(&format!("MediaContentType{}", n)).cloned())
        .collect();
    Some(InboundMessage {
        channel,
        from,
        body: fields.get("Body").cloned().unwrap_or_default(),
        timestamp: None,
        provider_message_id: fields.get("MessageSid").cloned(),
        media,
    })
}

async fn messaging_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inbound = match decode_inbound(&headers, &body) {
        Some(inbound) => inbound,
        None => {
            log::warn!("Undecodable messaging webhook body");
            return (StatusCode::OK, "ignored").into_response();
        }
    };

    match state.dispatcher.handle_inbound(inbound).await {
        Ok(outcome) => {
            let label = match outcome {
                DispatchOutcome::Duplicate => "duplicate",
                DispatchOutcome::HumanTakeover => "human_takeover",
                DispatchOutcome::SupportHandoff => "support_handoff",
                DispatchOutcome::FunnelEntry { .. } => "funnel_entry",
                DispatchOutcome::TriggerFired { .. } => "trigger",
                DispatchOutcome::LlmReplied => "llm",
                DispatchOutcome::LlmFallback => "llm_fallback",
            };
            (StatusCode::OK, label).into_response()
        }
        Err(DispatchError::InvalidPhone(raw)) => {
            log::warn!("Dropping inbound with unparseable phone: {}", raw);
            (StatusCode::OK, "ignored").into_response()
        }
        // The provider retries on 5xx; that is exactly what we want
        // when the store is down.
        Err(DispatchError::Store(err)) => {
            log::error!("Store failure handling inbound webhook: {}", err);
            (StatusCode::BAD_GATEWAY, "store unavailable").into_response()
        }
    }
}

async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok());

    match state.billing.handle(&body, signature).await {
        Ok(outcome) => (StatusCode::OK, format!("{:?}", outcome)).into_response(),
        Err(BillingError::SignatureMismatch) => {
            (StatusCode::UNAUTHORIZED, "signature mismatch").into_response()
        }
        Err(BillingError::Malformed(msg)) => {
            (StatusCode::BAD_REQUEST, format!("malformed: {}", msg)).into_response()
        }
        Err(BillingError::Store(err)) => {
            log::error!("Store failure handling billing webhook: {}", err);
            (StatusCode::BAD_GATEWAY, "store unavailable").into_response()
        }
    }
}

async fn list_threads(State(state): State<AppState>) -> Json<Value> {
    let threads = state.store.list_threads().await;
    Json(json!({ "threads": threads }))
}

#[derive(Deserialize)]
struct MessagesQuery {
    limit: Option<usize>,
}

async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> Json<Value> {
    let messages = state.store.list_messages(id, query.limit).await;
    Json(json!({ "messages": messages }))
}

#[derive(Deserialize)]
struct ThreadPatch {
    lead_stage: Option<String>,
    human_takeover: Option<bool>,
}

async fn patch_thread(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ThreadPatch>,
) -> Response {
    let _guard = state.locks.acquire(id).await;
    if let Some(stage) = &body.lead_stage {
        // Operator overrides bypass the successor check; the next
        // trigger match runs against the forced stage.
        let result = state
            .store
            .update_thread_meta_and_stage(id, Some(stage), &serde_json::Map::new())
            .await;
        if let Err(err) = result {
            return store_error_response(err);
        }
        let note = format!("[Stage overridden by operator: -> {}]", stage);
        if let Err(err) = state.store.append_message(id, Role::System, &note, false).await {
            return store_error_response(err);
        }
    }
    if let Some(takeover) = body.human_takeover {
        if let Err(err) = state.store.set_human_takeover(id, takeover).await {
            return store_error_response(err);
        }
    }
    match state.store.thread(id).await {
        Some(thread) => Json(json!({ "thread": thread })).into_response(),
        None => (StatusCode::NOT_FOUND, "no such thread").into_response(),
    }
}

#[derive(Deserialize)]
struct HumanMessage {
    body: String,
}

async fn post_human_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(message): Json<HumanMessage>,
) -> Response {
    let _guard = state.locks.acquire(id).await;
    let thread = match state.store.thread(id).await {
        Some(thread) => thread,
        None => return (StatusCode::NOT_FOUND, "no such thread").into_response(),
    };
    let contact = match state.store.contact(thread.contact_id).await {
        Some(contact) => contact,
        None => return (StatusCode::NOT_FOUND, "no such contact").into_response(),
    };
    if let Err(err) = state.sender.send_text(&contact.phone, &message.body).await {
        return (StatusCode::BAD_GATEWAY, format!("send failed: {}", err)).into_response();
    }
    match state
        .store
        .append_message(id, Role::Assistant, &message.body, true)
        .await
    {
        Ok(record) => Json(json!({ "message": record })).into_response(),
        Err(err) => store_error_response(err),
    }
}

fn store_error_response(err: crate::leadflow::error::StoreError) -> Response {
    match err {
        crate::leadflow::error::StoreError::NotFound(kind, id) => (
            StatusCode::NOT_FOUND,
            format!("{} not found: {}", kind, id),
        )
            .into_response(),
        other => {
            log::error!("Store failure in read-model handler: {}", other);
            (StatusCode::BAD_GATEWAY, "store unavailable").into_response()
        }
    }
}
