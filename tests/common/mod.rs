//! Shared fixtures: mock provider/LLM backends and a fully wired
//! engine over an in-memory store.
//!
//! Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use leadflow::{
    AssetLibrary, BillingProcessor, ChatTurn, Contact, FunnelLibrary, InboundMessage,
    IngressDispatcher, LeadflowConfig, LlmBackend, LlmContext, LlmError, MediaKind,
    OutboundSender, ResponseProcessor, Scheduler, SendError, Store, Thread, ThreadLocks,
};

pub const TEST_SECRET: &str = "test-secret";

/// One captured outbound artifact.
#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub to: String,
    /// `"text"`, `"audio"`, or `"image"`.
    pub kind: String,
    /// Message body for text, public URL for media.
    pub payload: String,
}

/// Sender double: records every send, optionally failing from a
/// scripted queue first.
#[derive(Default)]
pub struct MockSender {
    pub sent: Mutex<Vec<RecordedSend>>,
    pub failures: Mutex<VecDeque<SendError>>,
    counter: AtomicUsize,
}

impl MockSender {
    pub fn push_failure(&self, err: SendError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn sends(&self) -> Vec<RecordedSend> {
        self.sent.lock().unwrap().clone()
    }

    fn record(&self, to: &str, kind: &str, payload: &str) -> Result<String, SendError> {
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.sent.lock().unwrap().push(RecordedSend {
            to: to.to_string(),
            kind: kind.to_string(),
            payload: payload.to_string(),
        });
        Ok(format!("msg-{}", self.counter.fetch_add(1, Ordering::SeqCst)))
    }
}

#[async_trait]
impl OutboundSender for MockSender {
    async fn send_text(&self, to: &str, body: &str) -> Result<String, SendError> {
        self.record(to, "text", body)
    }

    async fn send_media(&self, to: &str, url: &str, kind: MediaKind) -> Result<String, SendError> {
        let kind = match kind {
            MediaKind::Audio => "audio",
            MediaKind::Image => "image",
        };
        self.record(to, kind, url)
    }
}

/// LLM double: answers from a scripted queue (default: a canned text),
/// optionally after a delay to exercise the dispatcher timeout.
#[derive(Default)]
pub struct MockLlm {
    pub replies: Mutex<VecDeque<Result<String, LlmError>>>,
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl MockLlm {
    pub fn push_reply(&self, reply: Result<String, LlmError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmBackend for MockLlm {
    async fn complete(
        &self,
        _system_prompt: &str,
        _history: &[ChatTurn],
        _context: &LlmContext,
    ) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("Happy to help! What would you like to know?".to_string()))
    }
}

/// The whole engine wired over an in-memory store and the default
/// funnel library.
pub struct Harness {
    pub store: Arc<Store>,
    pub sender: Arc<MockSender>,
    pub llm: Arc<MockLlm>,
    pub library: Arc<FunnelLibrary>,
    pub assets: Arc<AssetLibrary>,
    pub locks: Arc<ThreadLocks>,
    pub processor: Arc<ResponseProcessor>,
    pub dispatcher: Arc<IngressDispatcher>,
    pub billing: Arc<BillingProcessor>,
    pub scheduler: Arc<Scheduler>,
    pub config: Arc<LeadflowConfig>,
}

pub fn harness() -> Harness {
    harness_with(|_| {}, MockLlm::default())
}

pub fn harness_with(
    configure: impl FnOnce(&mut LeadflowConfig),
    llm: MockLlm,
) -> Harness {
    let mut config = LeadflowConfig {
        billing_webhook_secret: TEST_SECRET.to_string(),
        public_base_url: "https://media.test".to_string(),
        send_retry_backoff: Duration::from_millis(5),
        ..LeadflowConfig::default()
    };
    configure(&mut config);
    let config = Arc::new(config);

    let store = Arc::new(Store::in_memory());
    let assets = Arc::new(AssetLibrary::default_library());
    let library = Arc::new(FunnelLibrary::default_library(config.cart_recovery_delay));
    library.validate(&assets).unwrap();

    let sender = Arc::new(MockSender::default());
    let llm = Arc::new(llm);
    let locks = Arc::new(ThreadLocks::new());
    let processor = Arc::new(ResponseProcessor::new(
        store.clone(),
        assets.clone(),
        sender.clone(),
        library.clone(),
        &config.public_base_url,
        config.send_retry_backoff,
    ));
    let dispatcher = Arc::new(IngressDispatcher::new(
        store.clone(),
        processor.clone(),
        llm.clone(),
        library.clone(),
        locks.clone(),
        config.clone(),
    ));
    let billing = Arc::new(BillingProcessor::new(
        store.clone(),
        processor.clone(),
        library.clone(),
        locks.clone(),
        config.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        processor.clone(),
        locks.clone(),
        config.scheduler_tick,
        config.job_lease,
    ));

    Harness {
        store,
        sender,
        llm,
        library,
        assets,
        locks,
        processor,
        dispatcher,
        billing,
        scheduler,
        config,
    }
}

static MESSAGE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// An inbound message with a unique provider id, so tests only hit the
/// dedupe path on purpose.
pub fn inbound(from: &str, body: &str) -> InboundMessage {
    InboundMessage {
        channel: "whatsapp".to_string(),
        from: from.to_string(),
        body: body.to_string(),
        timestamp: Some(chrono::Utc::now()),
        provider_message_id: Some(format!(
            "SM{:08}",
            MESSAGE_COUNTER.fetch_add(1, Ordering::SeqCst)
        )),
        media: Vec::new(),
    }
}

/// Create a contact and a thread already seeded into the primary
/// funnel at `stage`.
pub async fn seed_thread(h: &Harness, phone: &str, stage: &str) -> (Contact, Thread) {
    let contact = h.store.get_or_create_contact(phone).await.unwrap();
    let thread = h
        .store
        .get_or_create_thread(contact.id, "whatsapp")
        .await
        .unwrap();
    let mut patch = Map::new();
    patch.insert(
        "funnel_id".to_string(),
        Value::String("primary".to_string()),
    );
    patch.insert("source".to_string(), Value::String("organic".to_string()));
    let thread = h
        .store
        .update_thread_meta_and_stage(thread.id, Some(stage), &patch)
        .await
        .unwrap();
    (contact, thread)
}
