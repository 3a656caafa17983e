//! Executes action lists against a thread.
//!
//! The processor is the single choke point for outbound side effects:
//! trigger matches, LLM replies, scheduled follow-ups, and canned
//! handoff texts all flow through [`ResponseProcessor::execute`]. It
//! runs under the per-thread lock held by its caller.
//!
//! Send-type actions resolve their asset, call the outbound sender
//! (media by public URL), and append an audit message: literal text
//! for text sends, a sentinel marker such as `[Audio sent: welcome]`
//! for media, so the message log stays readable without storing blobs.
//! A transient send failure is retried once after a short fixed
//! backoff; a second failure (or any permanent failure) aborts the
//! remaining list, records the partial execution as a system message,
//! and leaves the stage untouched.
//!
//! Stage, schedule, and cancel effects are deferred and committed in
//! one store transaction with the terminating action, so observers
//! never see a stage advance without the message that records it.

use std::sync::Arc;
use std::time::Duration;

use crate::leadflow::assets::{AssetLibrary, MediaKind, TemplateVars};
use crate::leadflow::error::{AssetError, SendError, StoreError};
use crate::leadflow::funnel::{Action, FunnelLibrary, TextContent};
use crate::leadflow::llm::{LlmReply, LlmResponseType};
use crate::leadflow::sender::OutboundSender;
use crate::leadflow::store::{Contact, NewJob, Role, Store, Thread, TurnEffects};

/// How an action list ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Every action ran; deferred effects are committed.
    Completed,
    /// A send failed; remaining actions were skipped and no stage or
    /// scheduling effect was committed.
    Aborted,
}

/// Outcome of executing one action list.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    /// Outbound artifacts actually delivered.
    pub sent: usize,
    /// Stage committed by this list, if any.
    pub stage: Option<String>,
}

pub struct ResponseProcessor {
    store: Arc<Store>,
    assets: Arc<AssetLibrary>,
    sender: Arc<dyn OutboundSender>,
    library: Arc<FunnelLibrary>,
    public_base_url: String,
    retry_backoff: Duration,
}

impl ResponseProcessor {
    pub fn new(
        store: Arc<Store>,
        assets: Arc<AssetLibrary>,
        sender: Arc<dyn OutboundSender>,
        library: Arc<FunnelLibrary>,
        public_base_url: &str,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            store,
            assets,
            sender,
            library,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            retry_backoff,
        }
    }

    fn media_url(&self, path: &str) -> String {
        format!("{}{}", self.public_base_url, path)
    }

    fn template_vars(contact: &Contact) -> TemplateVars {
        TemplateVars {
            name: contact.name.clone(),
        }
    }

    /// One retry after a fixed backoff for transient failures; the
    /// sender itself never retries.
    async fn send_with_retry<F, Fut>(&self, attempt: F) -> Result<String, SendError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<String, SendError>>,
    {
        match attempt().await {
            Err(err) if err.is_transient() => {
                log::warn!("Transient send failure, retrying once: {}", err);
                tokio::time::sleep(self.retry_backoff).await;
                attempt().await
            }
            other => other,
        }
    }

    async fn send_media_asset(
        &self,
        thread: &Thread,
        contact: &Contact,
        asset_id: &str,
        expected: MediaKind,
    ) -> Result<(), AbortReason> {
        let canonical = self.assets.canonical_id(asset_id).to_string();
        let (kind, path) = self
            .assets
            .resolve_media(asset_id)
            .map_err(|err| self.asset_abort(thread, asset_id, err))?;
        if kind != expected {
            return Err(AbortReason::Asset(AssetError::WrongKind {
                id: asset_id.to_string(),
                expected: match expected {
                    MediaKind::Audio => "audio file",
                    MediaKind::Image => "image file",
                },
            }));
        }
        let url = self.media_url(path);
        self.send_with_retry(|| self.sender.send_media(&contact.phone, &url, kind))
            .await
            .map_err(AbortReason::Send)?;
        let marker = match kind {
            MediaKind::Audio => format!("[Audio sent: {}]", canonical),
            MediaKind::Image => format!("[Image sent: {}]", canonical),
        };
        self.store
            .append_message(thread.id, Role::Assistant, &marker, false)
            .await
            .map_err(AbortReason::Store)?;
        Ok(())
    }

    fn asset_abort(&self, thread: &Thread, asset_id: &str, err: AssetError) -> AbortReason {
        // Programmer error: the funnel file referenced an asset the
        // library cannot resolve. Validation catches configured
        // funnels, so this is almost always an LLM-invented id.
        log::error!(
            "Asset resolution failed (thread={}, stage={:?}, asset={}): {}",
            thread.id,
            thread.lead_stage,
            asset_id,
            err
        );
        AbortReason::Asset(err)
    }

    async fn send_text_body(
        &self,
        thread: &Thread,
        contact: &Contact,
        body: &str,
    ) -> Result<(), AbortReason> {
        self.send_with_retry(|| self.sender.send_text(&contact.phone, body))
            .await
            .map_err(AbortReason::Send)?;
        self.store
            .append_message(thread.id, Role::Assistant, body, false)
            .await
            .map_err(AbortReason::Store)?;
        Ok(())
    }

    /// Execute `actions` in order against `thread`.
    ///
    /// Must be called under the thread's lock. Returns `Err` only on
    /// store failure; send failures are reported in the
    /// [`ExecutionReport`] after being recorded as system messages.
    pub async fn execute(
        &self,
        thread: &Thread,
        contact: &Contact,
        actions: &[Action],
    ) -> Result<ExecutionReport, StoreError> {
        let mut effects = TurnEffects::default();
        let mut sent = 0usize;

        for (index, action) in actions.iter().enumerate() {
            let step = match action {
                Action::SendAudio { asset_id } => {
                    let result = self
                        .send_media_asset(thread, contact, asset_id, MediaKind::Audio)
                        .await;
                    if result.is_ok() {
                        sent += 1;
                    }
                    result
                }
                Action::SendImageSequence { asset_ids } => {
                    let mut result = Ok(());
                    for asset_id in asset_ids {
                        result = self
                            .send_media_asset(thread, contact, asset_id, MediaKind::Image)
                            .await;
                        if result.is_err() {
                            break;
                        }
                        sent += 1;
                    }
                    result
                }
                Action::SendText { content } => {
                    let body = match content {
                        TextContent::Literal { literal } => Ok(literal.clone()),
                        TextContent::Template { template_code } => self
                            .assets
                            .render_template(template_code, &Self::template_vars(contact))
                            .map_err(|err| self.asset_abort(thread, template_code, err)),
                    };
                    match body {
                        Ok(body) => {
                            let result = self.send_text_body(thread, contact, &body).await;
                            if result.is_ok() {
                                sent += 1;
                            }
                            result
                        }
                        Err(reason) => Err(reason),
                    }
                }
                Action::SetStage { stage_id } => {
                    effects.stage = Some(stage_id.clone());
                    Ok(())
                }
                Action::Schedule {
                    key,
                    delay_secs,
                    actions: scheduled,
                } => {
                    effects.schedules.push(NewJob {
                        key: key.clone(),
                        fire_at: chrono::Utc::now()
                            + chrono::Duration::seconds(*delay_secs as i64),
                        actions: serde_json::to_value(scheduled)
                            .unwrap_or(serde_json::Value::Null),
                    });
                    Ok(())
                }
                Action::Cancel { key_prefix } => {
                    effects.cancel_prefixes.push(key_prefix.clone());
                    Ok(())
                }
            };

            if let Err(reason) = step {
                match reason {
                    AbortReason::Store(err) => return Err(err),
                    AbortReason::Send(err) => {
                        let note = format!(
                            "[Action list aborted at step {}: {}]",
                            index + 1,
                            err
                        );
                        self.store
                            .append_message(thread.id, Role::System, &note, false)
                            .await?;
                    }
                    AbortReason::Asset(err) => {
                        let note = format!(
                            "[Action list aborted at step {}: {}]",
                            index + 1,
                            err
                        );
                        self.store
                            .append_message(thread.id, Role::System, &note, false)
                            .await?;
                    }
                }
                return Ok(ExecutionReport {
                    status: ExecutionStatus::Aborted,
                    sent,
                    stage: None,
                });
            }
        }

        let stage = effects.stage.clone();
        let has_effects = stage.is_some()
            || !effects.schedules.is_empty()
            || !effects.cancel_prefixes.is_empty();
        if has_effects {
            if let Some(new_stage) = &stage {
                effects.note = Some(format!(
                    "[Stage changed: {} -> {}]",
                    thread.lead_stage.as_deref().unwrap_or("none"),
                    new_stage
                ));
            }
            self.store.commit_turn(thread.id, effects).await?;
        }

        Ok(ExecutionReport {
            status: ExecutionStatus::Completed,
            sent,
            stage,
        })
    }

    /// Execute a structured LLM reply.
    ///
    /// The reply maps onto a one-send action list. A requested
    /// `next_stage` commits only when it is a legal successor of the
    /// thread's current stage in its funnel's state machine; otherwise
    /// the stage is left unchanged and a system message notes the
    /// rejection.
    pub async fn execute_llm_reply(
        &self,
        thread: &Thread,
        contact: &Contact,
        reply: &LlmReply,
    ) -> Result<ExecutionReport, StoreError> {
        let mut actions = Vec::new();
        let mut requested_stage = None;

        match reply {
            LlmReply::Text(text) => actions.push(Action::SendText {
                content: TextContent::Literal {
                    literal: text.clone(),
                },
            }),
            LlmReply::Action(action) => {
                match action.response_type {
                    LlmResponseType::Audio => {
                        if let Some(asset_id) = &action.asset_id {
                            actions.push(Action::SendAudio {
                                asset_id: asset_id.clone(),
                            });
                        }
                    }
                    LlmResponseType::Template => {
                        if let Some(code) = &action.template_code {
                            actions.push(Action::SendText {
                                content: TextContent::Template {
                                    template_code: code.clone(),
                                },
                            });
                        }
                    }
                    LlmResponseType::Text => {
                        if let Some(message) = &action.message {
                            actions.push(Action::SendText {
                                content: TextContent::Literal {
                                    literal: message.clone(),
                                },
                            });
                        }
                    }
                }
                requested_stage = action.next_stage.clone();
            }
        }

        if let Some(next) = requested_stage {
            let legal = thread.funnel_id().map_or(false, |funnel_id| {
                self.library
                    .is_successor(funnel_id, thread.lead_stage.as_deref(), &next)
            });
            if legal {
                actions.push(Action::SetStage { stage_id: next });
            } else {
                let note = format!(
                    "[Stage change rejected: {} is not a successor of {}]",
                    next,
                    thread.lead_stage.as_deref().unwrap_or("none")
                );
                self.store
                    .append_message(thread.id, Role::System, &note, false)
                    .await?;
            }
        }

        self.execute(thread, contact, &actions).await
    }
}

enum AbortReason {
    Send(SendError),
    Asset(AssetError),
    Store(StoreError),
}
