//! Billing-platform webhook intake.
//!
//! Purchase and cart events arrive as JSON POSTs authenticated with an
//! HMAC-SHA256 signature under a shared secret. Verification is
//! constant-time; a mismatch produces no side effects beyond one
//! structured warning.
//!
//! `sale.approved` finalizes a conversion: the event is persisted
//! idempotently (at most one row and one stage transition per
//! (source, event, order id)), correlated to a contact by email or
//! phone, pending cart-recovery follow-ups are cancelled, the thread
//! advances to the funnel's post-purchase stage, and the welcome
//! action list is dispatched. `cart.abandonment` is recorded and, when
//! no cart-recovery job is already pending, schedules one. Unknown
//! events are persisted and ignored.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::leadflow::config::LeadflowConfig;
use crate::leadflow::dispatch::normalize_phone;
use crate::leadflow::error::BillingError;
use crate::leadflow::funnel::{Action, FunnelLibrary};
use crate::leadflow::locks::ThreadLocks;
use crate::leadflow::processor::ResponseProcessor;
use crate::leadflow::store::{Contact, NewJob, Store, Thread};

type HmacSha256 = Hmac<Sha256>;

const SOURCE: &str = "billing";
const CART_RECOVERY_PREFIX: &str = "cart_recovery_";

/// Decoded billing webhook body.
#[derive(Debug, Clone, Deserialize)]
pub struct BillingEvent {
    pub event: String,
    pub order_id: String,
    #[serde(default)]
    pub buyer_email: Option<String>,
    #[serde(default)]
    pub buyer_phone: Option<String>,
    /// Order value in currency units.
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub product_id: Option<String>,
    /// Body-level signature, accepted when the header form is absent.
    #[serde(default)]
    pub signature: Option<String>,
}

fn hmac_hex(secret: &[u8], message: &[u8]) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(message);
    Some(mac.finalize().into_bytes().to_vec())
}

/// Hex HMAC-SHA256 of `raw_body` under `secret`, as expected in
/// the signature header. Exposed for operator tooling and tests.
pub fn sign_body(secret: &str, raw_body: &[u8]) -> Option<String> {
    hmac_hex(secret.as_bytes(), raw_body).map(hex::encode)
}

fn constant_time_eq_hex(expected: &[u8], provided_hex: &str) -> bool {
    match hex::decode(provided_hex.trim()) {
        Ok(provided) if provided.len() == expected.len() => {
            expected.ct_eq(provided.as_slice()).into()
        }
        _ => false,
    }
}

/// Verify a billing webhook signature.
///
/// The preferred form is a hex signature header computed over the raw
/// request bytes. When no header is present, a body-level `signature`
/// field is accepted and verified against the canonical serialization
/// of the body with that field removed.
pub fn verify_signature(secret: &str, raw_body: &[u8], header_signature: Option<&str>) -> bool {
    if secret.is_empty() {
        return false;
    }
    if let Some(signature) = header_signature {
        return match hmac_hex(secret.as_bytes(), raw_body) {
            Some(expected) => constant_time_eq_hex(&expected, signature),
            None => false,
        };
    }

    let mut body: Value = match serde_json::from_slice(raw_body) {
        Ok(body) => body,
        Err(_) => return false,
    };
    let signature = match body
        .as_object_mut()
        .and_then(|map| map.remove("signature"))
        .and_then(|v| v.as_str().map(|s| s.to_string()))
    {
        Some(signature) => signature,
        None => return false,
    };
    let canonical = match serde_json::to_vec(&body) {
        Ok(canonical) => canonical,
        Err(_) => return false,
    };
    match hmac_hex(secret.as_bytes(), &canonical) {
        Some(expected) => constant_time_eq_hex(&expected, &signature),
        None => false,
    }
}

/// What a billing webhook amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingOutcome {
    /// Redelivery of an already-persisted (event, order id); no side
    /// effects performed.
    Duplicate,
    /// A `sale.approved` was finalized.
    SaleProcessed { contact_found: bool },
    /// A `cart.abandonment` was recorded; `scheduled` reports whether a
    /// recovery follow-up was created.
    AbandonmentRecorded { scheduled: bool },
    /// Unknown event kind; persisted and ignored.
    Ignored { event: String },
}

pub struct BillingProcessor {
    store: Arc<Store>,
    processor: Arc<ResponseProcessor>,
    library: Arc<FunnelLibrary>,
    locks: Arc<ThreadLocks>,
    config: Arc<LeadflowConfig>,
}

impl BillingProcessor {
    pub fn new(
        store: Arc<Store>,
        processor: Arc<ResponseProcessor>,
        library: Arc<FunnelLibrary>,
        locks: Arc<ThreadLocks>,
        config: Arc<LeadflowConfig>,
    ) -> Self {
        Self {
            store,
            processor,
            library,
            locks,
            config,
        }
    }

    /// Verify, persist, and act on one billing webhook.
    pub async fn handle(
        &self,
        raw_body: &[u8],
        header_signature: Option<&str>,
    ) -> Result<BillingOutcome, BillingError> {
        if !verify_signature(&self.config.billing_webhook_secret, raw_body, header_signature) {
            log::warn!("Billing webhook rejected: signature mismatch");
            return Err(BillingError::SignatureMismatch);
        }

        let event: BillingEvent = serde_json::from_slice(raw_body)
            .map_err(|e| BillingError::Malformed(e.to_string()))?;
        let raw: Value = serde_json::from_slice(raw_body)
            .map_err(|e| BillingError::Malformed(e.to_string()))?;

        let contact = self.correlate(&event).await;
        let value_cents = (event.value.unwrap_or(0.0) * 100.0).round() as i64;

        let (_, created) = self
            .store
            .record_sale(
                SOURCE,
                &event.event,
                &event.order_id,
                event.buyer_email.as_deref(),
                event.buyer_phone.as_deref(),
                value_cents,
                raw,
                contact.as_ref().map(|c| c.id),
            )
            .await?;
        if !created {
            log::info!(
                "Billing webhook redelivered for order {} ({}); ignoring",
                event.order_id,
                event.event
            );
            return Ok(BillingOutcome::Duplicate);
        }

        match event.event.as_str() {
            "sale.approved" => self.finalize_sale(&event, contact, value_cents).await,
            "cart.abandonment" => self.record_abandonment(contact).await,
            other => Ok(BillingOutcome::Ignored {
                event: other.to_string(),
            }),
        }
    }

    /// Correlate the buyer to a known contact by email, then phone.
    async fn correlate(&self, event: &BillingEvent) -> Option<Contact> {
        if let Some(email) = &event.buyer_email {
            if let Some(contact) = self.store.find_contact_by_email(email).await {
                return Some(contact);
            }
        }
        if let Some(phone) = &event.buyer_phone {
            if let Ok(normalized) = normalize_phone(phone) {
                return self.store.find_contact_by_phone(&normalized).await;
            }
        }
        None
    }

    async fn thread_for(&self, contact: &Contact) -> Option<Thread> {
        self.store.latest_thread_for_contact(contact.id).await
    }

    async fn finalize_sale(
        &self,
        event: &BillingEvent,
        contact: Option<Contact>,
        value_cents: i64,
    ) -> Result<BillingOutcome, BillingError> {
        let contact = match contact {
            Some(contact) => contact,
            None => {
                log::warn!(
                    "sale.approved for order {} matched no contact",
                    event.order_id
                );
                return Ok(BillingOutcome::SaleProcessed {
                    contact_found: false,
                });
            }
        };

        let contact = self
            .store
            .record_purchase(contact.id, value_cents, event.buyer_email.as_deref())
            .await?;

        let thread = match self.thread_for(&contact).await {
            Some(thread) => thread,
            None => {
                return Ok(BillingOutcome::SaleProcessed {
                    contact_found: true,
                })
            }
        };

        let _guard = self.locks.acquire(thread.id).await;
        // Cancel before anything else: the lead converted, recovery
        // nudges must not fire even if the welcome sends fail.
        self.store
            .cancel_jobs(thread.id, CART_RECOVERY_PREFIX)
            .await?;

        let funnel = thread.funnel_id().and_then(|id| self.library.funnel(id));
        let (purchase_stage, welcome) = match funnel {
            Some(funnel) => (
                funnel.post_purchase_stage.clone(),
                funnel.post_purchase_actions.clone(),
            ),
            None => (None, Vec::new()),
        };

        let mut actions = welcome;
        if let Some(stage) = purchase_stage {
            actions.push(Action::SetStage { stage_id: stage });
        }
        if !actions.is_empty() {
            // Re-read under the lock before executing.
            if let Some(thread) = self.store.thread(thread.id).await {
                self.processor
                    .execute(&thread, &contact, &actions)
                    .await?;
            }
        }
        log::info!(
            "Order {} finalized for contact {} (thread {})",
            event.order_id,
            contact.phone,
            thread.id
        );
        Ok(BillingOutcome::SaleProcessed {
            contact_found: true,
        })
    }

    async fn record_abandonment(
        &self,
        contact: Option<Contact>,
    ) -> Result<BillingOutcome, BillingError> {
        let thread = match &contact {
            Some(contact) => self.thread_for(contact).await,
            None => None,
        };
        let thread = match thread {
            Some(thread) => thread,
            None => return Ok(BillingOutcome::AbandonmentRecorded { scheduled: false }),
        };

        let _guard = self.locks.acquire(thread.id).await;
        if self
            .store
            .has_pending_job(thread.id, CART_RECOVERY_PREFIX)
            .await
        {
            return Ok(BillingOutcome::AbandonmentRecorded { scheduled: false });
        }
        let recovery = thread
            .funnel_id()
            .and_then(|id| self.library.funnel(id))
            .and_then(|funnel| funnel.recovery.clone());
        let recovery = match recovery {
            Some(recovery) => recovery,
            None => return Ok(BillingOutcome::AbandonmentRecorded { scheduled: false }),
        };
        self.store
            .schedule_job(
                thread.id,
                NewJob {
                    key: recovery.key.clone(),
                    fire_at: chrono::Utc::now()
                        + chrono::Duration::seconds(recovery.delay_secs as i64),
                    actions: serde_json::to_value(&recovery.actions)
                        .unwrap_or(Value::Null),
                },
            )
            .await?;
        Ok(BillingOutcome::AbandonmentRecorded { scheduled: true })
    }
}
