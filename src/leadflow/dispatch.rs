//! The inbound entry point.
//!
//! [`IngressDispatcher::handle_inbound`] is called once per messaging
//! webhook and owns the decision order:
//!
//! 1. normalize the phone, upsert contact and thread, persist the
//!    inbound user message (nothing is silently dropped after this
//!    point; later failures become system messages);
//! 2. acquire the per-thread lock; every remaining step is serialized
//!    against other inbounds and scheduled jobs on the same thread;
//! 3. cancel pending cart-recovery follow-ups, since the contact is active;
//! 4. stop if a human operator holds the thread;
//! 5. hand off to a human on a support request;
//! 6. seed new threads through the funnel detector and run the
//!    funnel's entry actions;
//! 7. try the deterministic trigger engine; a match never consults
//!    the LLM;
//! 8. otherwise ask the LLM backend, with a bounded history window and
//!    a hard timeout; any failure degrades to the configured fallback
//!    text and never mutates stage.
//!
//! Webhook retries are deduplicated on the provider message id when
//! present, else on a hash of (channel, phone, timestamp, body) over a
//! small sliding window.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::leadflow::config::LeadflowConfig;
use crate::leadflow::detectors::{FunnelDetector, SupportDetector};
use crate::leadflow::error::{DispatchError, LlmError};
use crate::leadflow::funnel::{Action, FunnelLibrary, TextContent};
use crate::leadflow::llm::{parse_reply, ChatTurn, LlmBackend, LlmContext};
use crate::leadflow::locks::ThreadLocks;
use crate::leadflow::processor::ResponseProcessor;
use crate::leadflow::store::{Contact, Role, Store, Thread, TurnEffects};
use crate::leadflow::trigger::TriggerEngine;

const DEDUPE_WINDOW: usize = 512;
const CART_RECOVERY_PREFIX: &str = "cart_recovery_";

/// One inbound webhook event, already decoded from the wire.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Channel origin tag, e.g. `whatsapp`.
    pub channel: String,
    /// Sender as the provider reports it; may be channel-prefixed
    /// (`whatsapp:+15551112222`).
    pub from: String,
    pub body: String,
    pub timestamp: Option<DateTime<Utc>>,
    /// Provider-assigned message id, used for webhook dedupe.
    pub provider_message_id: Option<String>,
    /// Content kinds of attached media; recorded as markers, ignored
    /// for orchestration.
    pub media: Vec<String>,
}

/// What the dispatcher decided for one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Webhook retry of an already-processed message; dropped.
    Duplicate,
    /// Thread is held by a human operator; message recorded, no
    /// automated reply.
    HumanTakeover,
    /// Support request; thread handed to a human.
    SupportHandoff,
    /// New thread seeded into a funnel; entry actions executed.
    FunnelEntry { funnel_id: String },
    /// A deterministic trigger matched and was executed.
    TriggerFired { trigger_id: String },
    /// The LLM produced the reply.
    LlmReplied,
    /// The LLM failed; the generic fallback text was sent.
    LlmFallback,
}

/// Normalize a provider-reported sender into E.164 (`+` and 8 to 15
/// digits). Channel prefixes like `whatsapp:` are stripped.
pub fn normalize_phone(raw: &str) -> Result<String, DispatchError> {
    let tail = raw.rsplit(':').next().unwrap_or(raw);
    let digits: String = tail.chars().filter(|c| c.is_ascii_digit()).collect();
    if !(8..=15).contains(&digits.len()) {
        return Err(DispatchError::InvalidPhone(raw.to_string()));
    }
    Ok(format!("+{}", digits))
}

#[derive(Default)]
struct DedupeWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupeWindow {
    fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    fn insert(&mut self, key: String) {
        if self.seen.insert(key.clone()) {
            self.order.push_back(key);
            while self.order.len() > DEDUPE_WINDOW {
                if let Some(evicted) = self.order.pop_front() {
                    self.seen.remove(&evicted);
                }
            }
        }
    }
}

pub struct IngressDispatcher {
    store: Arc<Store>,
    processor: Arc<ResponseProcessor>,
    engine: TriggerEngine,
    support: SupportDetector,
    funnel_detector: FunnelDetector,
    llm: Arc<dyn LlmBackend>,
    library: Arc<FunnelLibrary>,
    locks: Arc<ThreadLocks>,
    config: Arc<LeadflowConfig>,
    dedupe: Mutex<DedupeWindow>,
}

impl IngressDispatcher {
    pub fn new(
        store: Arc<Store>,
        processor: Arc<ResponseProcessor>,
        llm: Arc<dyn LlmBackend>,
        library: Arc<FunnelLibrary>,
        locks: Arc<ThreadLocks>,
        config: Arc<LeadflowConfig>,
    ) -> Self {
        Self {
            store,
            processor,
            engine: TriggerEngine::new(library.clone()),
            support: SupportDetector::new(),
            funnel_detector: FunnelDetector::new(library.clone()),
            llm,
            library,
            locks,
            config,
            dedupe: Mutex::new(DedupeWindow::default()),
        }
    }

    fn dedupe_key(&self, inbound: &InboundMessage, phone: &str) -> String {
        if let Some(id) = &inbound.provider_message_id {
            return format!("provider:{}", id);
        }
        let mut hasher = Sha256::new();
        hasher.update(inbound.channel.as_bytes());
        hasher.update(b"|");
        hasher.update(phone.as_bytes());
        hasher.update(b"|");
        if let Some(ts) = &inbound.timestamp {
            hasher.update(ts.to_rfc3339().as_bytes());
        }
        hasher.update(b"|");
        hasher.update(inbound.body.as_bytes());
        format!("hash:{:x}", hasher.finalize())
    }

    fn inbound_content(inbound: &InboundMessage) -> String {
        let mut content = inbound.body.clone();
        for kind in &inbound.media {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str(&format!("[Media received: {}]", kind));
        }
        content
    }

    /// Process one inbound message end to end.
    ///
    /// Returns `Err` only when the inbound user message could not be
    /// persisted (the webhook handler surfaces that as a retryable
    /// status); every later failure is recorded on the thread and
    /// reported through the outcome.
    pub async fn handle_inbound(
        &self,
        inbound: InboundMessage,
    ) -> Result<DispatchOutcome, DispatchError> {
        let phone = normalize_phone(&inbound.from)?;

        let dedupe_key = self.dedupe_key(&inbound, &phone);
        if self.dedupe.lock().await.contains(&dedupe_key) {
            log::debug!("Dropping duplicate webhook delivery {}", dedupe_key);
            return Ok(DispatchOutcome::Duplicate);
        }

        let contact = self.store.get_or_create_contact(&phone).await?;
        let thread = self
            .store
            .get_or_create_thread(contact.id, &inbound.channel)
            .await?;

        let content = Self::inbound_content(&inbound);
        self.store
            .append_message(thread.id, Role::User, &content, false)
            .await?;
        self.dedupe.lock().await.insert(dedupe_key);

        let _guard = self.locks.acquire(thread.id).await;

        // Re-read under the lock: another inbound may have mutated the
        // thread while we waited.
        let thread = match self.store.thread(thread.id).await {
            Some(thread) => thread,
            None => return Ok(DispatchOutcome::HumanTakeover),
        };

        // The contact is active again; pending cart recovery is moot.
        self.store
            .cancel_jobs(thread.id, CART_RECOVERY_PREFIX)
            .await?;

        if thread.human_takeover {
            return Ok(DispatchOutcome::HumanTakeover);
        }

        if self.support.is_support(&inbound.body) {
            return self.hand_off(&thread, &contact).await;
        }

        if thread.funnel_id().is_none() {
            return self.enter_funnel(thread, &contact, &inbound.body).await;
        }

        if let Some(matched) = self.engine.matches(
            thread.funnel_id().unwrap_or_default(),
            thread.lead_stage.as_deref(),
            &inbound.body,
        ) {
            log::info!(
                "Trigger {} fired on thread {} (stage {:?})",
                matched.trigger_id,
                thread.id,
                thread.lead_stage
            );
            self.processor
                .execute(&thread, &contact, &matched.actions)
                .await?;
            return Ok(DispatchOutcome::TriggerFired {
                trigger_id: matched.trigger_id,
            });
        }

        self.reply_with_llm(&thread, &contact).await
    }

    async fn hand_off(
        &self,
        thread: &Thread,
        contact: &Contact,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.store.set_human_takeover(thread.id, true).await?;
        self.store
            .append_message(
                thread.id,
                Role::System,
                "[Support request detected: thread handed to a human operator]",
                false,
            )
            .await?;
        self.processor
            .execute(
                thread,
                contact,
                &[Action::SendText {
                    content: TextContent::Literal {
                        literal: self.config.handoff_text.clone(),
                    },
                }],
            )
            .await?;
        Ok(DispatchOutcome::SupportHandoff)
    }

    async fn enter_funnel(
        &self,
        thread: Thread,
        contact: &Contact,
        first_text: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let detection = self.funnel_detector.detect(first_text);

        let mut patch = Map::new();
        patch.insert(
            "funnel_id".to_string(),
            Value::String(detection.funnel_id.clone()),
        );
        patch.insert(
            "tags".to_string(),
            Value::Array(
                detection
                    .tags
                    .iter()
                    .map(|t| Value::String(t.clone()))
                    .collect(),
            ),
        );
        patch.insert("source".to_string(), Value::String(detection.source.clone()));
        self.store
            .update_thread_meta_and_stage(thread.id, None, &patch)
            .await?;
        let thread = self
            .store
            .commit_turn(
                thread.id,
                TurnEffects {
                    stage: Some(detection.initial_stage.clone()),
                    note: Some(format!(
                        "[Funnel detected: {} (source {}); stage -> {}]",
                        detection.funnel_id, detection.source, detection.initial_stage
                    )),
                    ..TurnEffects::default()
                },
            )
            .await?;

        if let Some(funnel) = self.library.funnel(&detection.funnel_id) {
            if !funnel.entry_actions.is_empty() {
                self.processor
                    .execute(&thread, contact, &funnel.entry_actions)
                    .await?;
            }
        }
        Ok(DispatchOutcome::FunnelEntry {
            funnel_id: detection.funnel_id,
        })
    }

    async fn reply_with_llm(
        &self,
        thread: &Thread,
        contact: &Contact,
    ) -> Result<DispatchOutcome, DispatchError> {
        let history: Vec<ChatTurn> = self
            .store
            .list_messages(thread.id, Some(self.config.llm_history_window))
            .await
            .into_iter()
            .filter(|m| m.role != Role::System)
            .map(|m| ChatTurn {
                role: m.role,
                content: m.content,
            })
            .collect();
        let context = LlmContext {
            funnel_id: thread.funnel_id().map(|s| s.to_string()),
            stage: thread.lead_stage.clone(),
            contact_name: contact.name.clone(),
        };

        let completion = timeout(
            self.config.llm_timeout,
            self.llm
                .complete(&self.config.llm_system_prompt, &history, &context),
        )
        .await;

        let reply = match completion {
            Ok(Ok(raw)) => parse_reply(&raw),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(LlmError::Unavailable(format!(
                "no reply within {:?}",
                self.config.llm_timeout
            ))),
        };

        match reply {
            Ok(reply) => {
                self.processor
                    .execute_llm_reply(thread, contact, &reply)
                    .await?;
                Ok(DispatchOutcome::LlmReplied)
            }
            Err(err) => {
                log::warn!("LLM failure on thread {}: {}", thread.id, err);
                self.store
                    .append_message(
                        thread.id,
                        Role::System,
                        &format!("[LLM failure: {}]", err),
                        false,
                    )
                    .await?;
                self.processor
                    .execute(
                        thread,
                        contact,
                        &[Action::SendText {
                            content: TextContent::Literal {
                                literal: self.config.llm_fallback_text.clone(),
                            },
                        }],
                    )
                    .await?;
                Ok(DispatchOutcome::LlmFallback)
            }
        }
    }
}
