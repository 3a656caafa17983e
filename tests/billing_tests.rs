use serde_json::json;

use leadflow::{
    sign_body, verify_signature, BillingError, BillingOutcome, JobStatus, Role,
};

mod common;
use common::{harness, inbound, TEST_SECRET};

const PHONE: &str = "whatsapp:+15551112222";

fn sale_body(event: &str, order_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "event": event,
        "order_id": order_id,
        "buyer_email": "ana@example.com",
        "buyer_phone": "+15551112222",
        "value": 29.0,
        "product_id": "monthly"
    }))
    .unwrap()
}

#[test]
fn test_signature_verification_round_trip() {
    let body = br#"{"event":"sale.approved","order_id":"1"}"#;
    let signature = sign_body(TEST_SECRET, body).unwrap();
    assert!(verify_signature(TEST_SECRET, body, Some(&signature)));

    // Wrong key, tampered body, truncated signature: all rejected.
    assert!(!verify_signature("other-secret", body, Some(&signature)));
    let tampered = br#"{"event":"sale.approved","order_id":"2"}"#;
    assert!(!verify_signature(TEST_SECRET, tampered, Some(&signature)));
    assert!(!verify_signature(TEST_SECRET, body, Some(&signature[..10])));
    assert!(!verify_signature(TEST_SECRET, body, Some("zz-not-hex")));
}

#[test]
fn test_body_level_signature_is_accepted() {
    // Sign the canonical body without the signature field, then embed
    // the signature into the payload.
    let mut body = json!({
        "event": "sale.approved",
        "order_id": "1",
        "value": 29.0
    });
    let canonical = serde_json::to_vec(&body).unwrap();
    let signature = sign_body(TEST_SECRET, &canonical).unwrap();
    body.as_object_mut()
        .unwrap()
        .insert("signature".to_string(), json!(signature));
    let signed = serde_json::to_vec(&body).unwrap();

    assert!(verify_signature(TEST_SECRET, &signed, None));
    assert!(!verify_signature("other-secret", &signed, None));
}

#[test]
fn test_empty_secret_rejects_everything() {
    let body = b"{}";
    assert!(!verify_signature("", body, Some("00")));
}

#[tokio::test]
async fn test_mismatched_signature_has_no_side_effects() {
    let h = harness();
    let body = sale_body("sale.approved", "ord-1");
    let result = h.billing.handle(&body, Some("deadbeef")).await;
    assert!(matches!(result, Err(BillingError::SignatureMismatch)));
    assert!(h.store.sales_events().await.is_empty());
    assert!(h.sender.sends().is_empty());
}

#[tokio::test]
async fn test_redelivered_sale_is_idempotent() {
    let h = harness();
    h.dispatcher.handle_inbound(inbound(PHONE, "hello")).await.unwrap();

    let body = sale_body("sale.approved", "ord-1");
    let signature = sign_body(TEST_SECRET, &body).unwrap();

    let first = h.billing.handle(&body, Some(&signature)).await.unwrap();
    assert_eq!(
        first,
        BillingOutcome::SaleProcessed {
            contact_found: true
        }
    );
    let sends_after_first = h.sender.sends().len();

    let second = h.billing.handle(&body, Some(&signature)).await.unwrap();
    assert_eq!(second, BillingOutcome::Duplicate);

    // One sale, one welcome dispatch, one stage transition.
    assert_eq!(h.store.sales_events().await.len(), 1);
    assert_eq!(h.sender.sends().len(), sends_after_first);

    let contact = h.store.find_contact_by_phone("+15551112222").await.unwrap();
    let thread = h.store.latest_thread_for_contact(contact.id).await.unwrap();
    let transitions = h
        .store
        .list_messages(thread.id, None)
        .await
        .into_iter()
        .filter(|m| m.role == Role::System && m.content.contains("-> customer"))
        .count();
    assert_eq!(transitions, 1);
}

#[tokio::test]
async fn test_sale_updates_contact_aggregates() {
    let h = harness();
    h.dispatcher.handle_inbound(inbound(PHONE, "hello")).await.unwrap();

    let body = sale_body("sale.approved", "ord-1");
    let signature = sign_body(TEST_SECRET, &body).unwrap();
    h.billing.handle(&body, Some(&signature)).await.unwrap();

    let contact = h.store.find_contact_by_phone("+15551112222").await.unwrap();
    assert_eq!(contact.orders_count, 1);
    assert_eq!(contact.total_spent_cents, 2900);
    // Email backfilled from the billing payload.
    assert_eq!(contact.email.as_deref(), Some("ana@example.com"));
}

#[tokio::test]
async fn test_sale_for_unknown_buyer_is_recorded_without_dispatch() {
    let h = harness();
    let body = sale_body("sale.approved", "ord-9");
    let signature = sign_body(TEST_SECRET, &body).unwrap();
    let outcome = h.billing.handle(&body, Some(&signature)).await.unwrap();
    assert_eq!(
        outcome,
        BillingOutcome::SaleProcessed {
            contact_found: false
        }
    );
    let sales = h.store.sales_events().await;
    assert_eq!(sales.len(), 1);
    assert!(sales[0].contact_id.is_none());
    assert!(h.sender.sends().is_empty());
}

#[tokio::test]
async fn test_abandonment_schedules_recovery_once() {
    let h = harness();
    h.dispatcher.handle_inbound(inbound(PHONE, "hello")).await.unwrap();
    let contact = h.store.find_contact_by_phone("+15551112222").await.unwrap();
    let thread = h.store.latest_thread_for_contact(contact.id).await.unwrap();

    let body = sale_body("cart.abandonment", "ord-2");
    let signature = sign_body(TEST_SECRET, &body).unwrap();
    let outcome = h.billing.handle(&body, Some(&signature)).await.unwrap();
    assert_eq!(outcome, BillingOutcome::AbandonmentRecorded { scheduled: true });
    assert!(h.store.has_pending_job(thread.id, "cart_recovery_").await);

    // A second abandonment does not stack another job.
    let body = sale_body("cart.abandonment", "ord-3");
    let signature = sign_body(TEST_SECRET, &body).unwrap();
    let outcome = h.billing.handle(&body, Some(&signature)).await.unwrap();
    assert_eq!(
        outcome,
        BillingOutcome::AbandonmentRecorded { scheduled: false }
    );
    let pending = h
        .store
        .jobs_for_thread(thread.id)
        .await
        .into_iter()
        .filter(|j| j.status == JobStatus::Pending)
        .count();
    assert_eq!(pending, 1);
}

#[tokio::test]
async fn test_unknown_event_is_persisted_and_ignored() {
    let h = harness();
    let body = sale_body("subscription.renewed", "ord-4");
    let signature = sign_body(TEST_SECRET, &body).unwrap();
    let outcome = h.billing.handle(&body, Some(&signature)).await.unwrap();
    assert_eq!(
        outcome,
        BillingOutcome::Ignored {
            event: "subscription.renewed".to_string()
        }
    );
    assert_eq!(h.store.sales_events().await.len(), 1);
    assert!(h.sender.sends().is_empty());
}

#[tokio::test]
async fn test_malformed_body_is_rejected_after_verification() {
    let h = harness();
    let body = br#"{"not_an_event": true}"#;
    let signature = sign_body(TEST_SECRET, body).unwrap();
    let result = h.billing.handle(body, Some(&signature)).await;
    assert!(matches!(result, Err(BillingError::Malformed(_))));
}
