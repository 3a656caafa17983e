use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use leadflow::{build_router, sign_body, AppState, OutboundSender, Role};

mod common;
use common::{harness, inbound, Harness, TEST_SECRET};

const PHONE: &str = "whatsapp:+15551112222";

fn app(h: &Harness) -> axum::Router {
    let sender: std::sync::Arc<dyn OutboundSender> = h.sender.clone();
    build_router(AppState {
        dispatcher: h.dispatcher.clone(),
        billing: h.billing.clone(),
        store: h.store.clone(),
        sender,
        locks: h.locks.clone(),
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_form_encoded_messaging_webhook() {
    let h = harness();
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/messaging")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(
            "MessageSid=SM123&From=whatsapp%3A%2B15551112222&Body=I+want+to+know+about+the+product",
        ))
        .unwrap();
    let response = app(&h).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let contact = h
        .store
        .find_contact_by_phone("+15551112222")
        .await
        .expect("contact persisted");
    let thread = h.store.latest_thread_for_contact(contact.id).await.unwrap();
    let messages = h.store.list_messages(thread.id, None).await;
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "I want to know about the product");
    // Entry welcome audio went out.
    assert_eq!(h.sender.sends().len(), 1);
}

#[tokio::test]
async fn test_json_messaging_webhook_with_media_marker() {
    let h = harness();
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/messaging")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "from": PHONE,
                "body": "",
                "message_id": "SMjson1",
                "media": ["audio/ogg"]
            })
            .to_string(),
        ))
        .unwrap();
    let response = app(&h).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let contact = h.store.find_contact_by_phone("+15551112222").await.unwrap();
    let thread = h.store.latest_thread_for_contact(contact.id).await.unwrap();
    let messages = h.store.list_messages(thread.id, None).await;
    assert_eq!(messages[0].content, "[Media received: audio/ogg]");
}

#[tokio::test]
async fn test_billing_webhook_rejects_bad_signature() {
    let h = harness();
    let body = json!({ "event": "sale.approved", "order_id": "1" }).to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/billing")
        .header("content-type", "application/json")
        .header("x-signature", "deadbeef")
        .body(Body::from(body))
        .unwrap();
    let response = app(&h).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(h.store.sales_events().await.is_empty());
}

#[tokio::test]
async fn test_billing_webhook_accepts_signed_event() {
    let h = harness();
    let body = serde_json::to_vec(&json!({
        "event": "sale.approved",
        "order_id": "ord-http-1",
        "buyer_phone": "+15559998888",
        "value": 29.0
    }))
    .unwrap();
    let signature = sign_body(TEST_SECRET, &body).unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/billing")
        .header("content-type", "application/json")
        .header("x-signature", signature)
        .body(Body::from(body))
        .unwrap();
    let response = app(&h).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.store.sales_events().await.len(), 1);
}

#[tokio::test]
async fn test_read_model_lists_threads_and_messages() {
    let h = harness();
    h.dispatcher.handle_inbound(inbound(PHONE, "hello")).await.unwrap();
    let contact = h.store.find_contact_by_phone("+15551112222").await.unwrap();
    let thread = h.store.latest_thread_for_contact(contact.id).await.unwrap();

    let response = app(&h)
        .oneshot(Request::builder().uri("/threads").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listing = body_json(response).await;
    assert_eq!(listing["threads"].as_array().unwrap().len(), 1);

    let response = app(&h)
        .oneshot(
            Request::builder()
                .uri(format!("/threads/{}/messages?limit=1", thread.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let listing = body_json(response).await;
    assert_eq!(listing["messages"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_operator_stage_override_bypasses_successor_check() {
    let h = harness();
    h.dispatcher.handle_inbound(inbound(PHONE, "hello")).await.unwrap();
    let contact = h.store.find_contact_by_phone("+15551112222").await.unwrap();
    let thread = h.store.latest_thread_for_contact(contact.id).await.unwrap();
    assert_eq!(thread.lead_stage.as_deref(), Some("cold"));

    // cold -> warm is not a machine edge, but operators may force it.
    let request = Request::builder()
        .method("PATCH")
        .uri(format!("/threads/{}", thread.id))
        .header("content-type", "application/json")
        .body(Body::from(json!({ "lead_stage": "warm" }).to_string()))
        .unwrap();
    let response = app(&h).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let thread = h.store.thread(thread.id).await.unwrap();
    assert_eq!(thread.lead_stage.as_deref(), Some("warm"));

    // The next trigger match runs against the forced stage: "monthly"
    // now fires the checkout trigger.
    let outcome = h
        .dispatcher
        .handle_inbound(inbound(PHONE, "monthly"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        leadflow::DispatchOutcome::TriggerFired {
            trigger_id: "plan_choice_monthly".to_string()
        }
    );
}

#[tokio::test]
async fn test_operator_takeover_toggle_and_human_reply() {
    let h = harness();
    h.dispatcher.handle_inbound(inbound(PHONE, "hello")).await.unwrap();
    let contact = h.store.find_contact_by_phone("+15551112222").await.unwrap();
    let thread = h.store.latest_thread_for_contact(contact.id).await.unwrap();

    let request = Request::builder()
        .method("PATCH")
        .uri(format!("/threads/{}", thread.id))
        .header("content-type", "application/json")
        .body(Body::from(json!({ "human_takeover": true }).to_string()))
        .unwrap();
    app(&h).oneshot(request).await.unwrap();
    assert!(h.store.thread(thread.id).await.unwrap().human_takeover);

    let request = Request::builder()
        .method("POST")
        .uri(format!("/threads/{}/messages", thread.id))
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "body": "Hi, Marina here, how can I help?" }).to_string(),
        ))
        .unwrap();
    let response = app(&h).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let last_send = h.sender.sends().pop().unwrap();
    assert_eq!(last_send.payload, "Hi, Marina here, how can I help?");
    let messages = h.store.list_messages(thread.id, None).await;
    let last = messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(last.is_human);
}

#[tokio::test]
async fn test_status_endpoint() {
    let h = harness();
    let response = app(&h)
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}
