//! Runtime configuration.
//!
//! [`LeadflowConfig`] is a plain struct users construct however they
//! want; [`LeadflowConfig::from_env`] covers the deployment case. No
//! config-file parsing dependencies are introduced; the funnel
//! definition file (JSON, see [`crate::funnel`]) is the only file read
//! at startup.

use std::path::PathBuf;
use std::time::Duration;

/// Global settings for the orchestration engine.
///
/// # Example
///
/// ```rust
/// use leadflow::LeadflowConfig;
///
/// let config = LeadflowConfig {
///     public_base_url: "https://bot.example.com".to_string(),
///     ..LeadflowConfig::default()
/// };
/// assert_eq!(config.llm_history_window, 20);
/// ```
#[derive(Debug, Clone)]
pub struct LeadflowConfig {
    /// Base URL prepended to asset paths when handing media to the
    /// messaging provider. Must be reachable by the provider.
    pub public_base_url: String,
    /// Shared HMAC-SHA256 key for billing webhook signatures.
    pub billing_webhook_secret: String,
    /// Funnel definition file. `None` loads the built-in default
    /// library.
    pub funnel_file: Option<PathBuf>,
    /// Directory for the store's append-only journal. `None` keeps all
    /// state in memory (tests, dry runs).
    pub journal_dir: Option<PathBuf>,

    /// OpenAI-compatible chat-completions endpoint base, e.g.
    /// `https://api.openai.com/v1`.
    pub llm_base_url: String,
    /// Bearer token for the LLM backend.
    pub llm_api_key: String,
    /// Model identifier sent with every completion request.
    pub llm_model: String,
    /// System prompt, constant per deployment.
    pub llm_system_prompt: String,
    /// How many recent thread messages accompany each LLM request.
    pub llm_history_window: usize,
    /// Token-bucket capacity for LLM requests.
    pub llm_rate_capacity: f64,
    /// Token-bucket refill, requests per second.
    pub llm_rate_refill_per_sec: f64,
    /// Upper bound on a single LLM round trip.
    pub llm_timeout: Duration,

    /// Messaging-provider send endpoint.
    pub sender_endpoint: String,
    /// Bearer token for the messaging provider, if it requires one.
    pub sender_token: Option<String>,
    /// Upper bound on a single outbound send.
    pub sender_timeout: Duration,
    /// Pause before the single retry of a transient send failure.
    pub send_retry_backoff: Duration,

    /// Scheduler polling interval.
    pub scheduler_tick: Duration,
    /// How long a leased job stays ineligible for re-lease.
    pub job_lease: Duration,
    /// Delay before the first cart-recovery follow-up fires.
    pub cart_recovery_delay: Duration,

    /// Text sent when the conversation is handed to a human operator.
    pub handoff_text: String,
    /// Generic reply sent when the LLM backend is unavailable.
    pub llm_fallback_text: String,

    /// Bind address for the HTTP surface.
    pub bind_addr: String,
}

impl Default for LeadflowConfig {
    fn default() -> Self {
        Self {
            public_base_url: "http://localhost:8080".to_string(),
            billing_webhook_secret: String::new(),
            funnel_file: None,
            journal_dir: None,
            llm_base_url: "https://api.openai.com/v1".to_string(),
            llm_api_key: String::new(),
            llm_model: "gpt-4o-mini".to_string(),
            llm_system_prompt: "You are a helpful sales assistant. Answer briefly and \
                                warmly, and never invent prices or links."
                .to_string(),
            llm_history_window: 20,
            llm_rate_capacity: 5.0,
            llm_rate_refill_per_sec: 1.0,
            llm_timeout: Duration::from_secs(30),
            sender_endpoint: "http://localhost:9000/send".to_string(),
            sender_token: None,
            sender_timeout: Duration::from_secs(10),
            send_retry_backoff: Duration::from_millis(500),
            scheduler_tick: Duration::from_secs(10),
            job_lease: Duration::from_secs(60),
            cart_recovery_delay: Duration::from_secs(30 * 60),
            handoff_text: "Got it! A member of our team will continue this conversation \
                           with you shortly."
                .to_string(),
            llm_fallback_text: "Sorry, I could not process that right now. Could you say \
                                it again in a moment?"
                .to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl LeadflowConfig {
    /// Build a config from environment variables, falling back to the
    /// defaults for anything unset.
    ///
    /// Recognized variables: `PUBLIC_BASE_URL`, `BILLING_WEBHOOK_SECRET`,
    /// `FUNNEL_FILE`, `JOURNAL_DIR`, `LLM_BASE_URL`, `LLM_API_KEY`,
    /// `LLM_MODEL`, `LLM_HISTORY_WINDOW`, `SENDER_ENDPOINT`,
    /// `SENDER_TOKEN`, `SCHEDULER_TICK_SECS`, `CART_RECOVERY_SECS`,
    /// `BIND_ADDR`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("PUBLIC_BASE_URL") {
            config.public_base_url = v;
        }
        if let Ok(v) = std::env::var("BILLING_WEBHOOK_SECRET") {
            config.billing_webhook_secret = v;
        }
        if let Ok(v) = std::env::var("FUNNEL_FILE") {
            config.funnel_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("JOURNAL_DIR") {
            config.journal_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("LLM_BASE_URL") {
            config.llm_base_url = v;
        }
        if let Ok(v) = std::env::var("LLM_API_KEY") {
            config.llm_api_key = v;
        }
        if let Ok(v) = std::env::var("LLM_MODEL") {
            config.llm_model = v;
        }
        if let Ok(v) = std::env::var("LLM_HISTORY_WINDOW") {
            if let Ok(n) = v.parse() {
                config.llm_history_window = n;
            }
        }
        if let Ok(v) = std::env::var("SENDER_ENDPOINT") {
            config.sender_endpoint = v;
        }
        if let Ok(v) = std::env::var("SENDER_TOKEN") {
            config.sender_token = Some(v);
        }
        if let Ok(v) = std::env::var("SCHEDULER_TICK_SECS") {
            if let Ok(n) = v.parse() {
                config.scheduler_tick = Duration::from_secs(n);
            }
        }
        if let Ok(v) = std::env::var("CART_RECOVERY_SECS") {
            if let Ok(n) = v.parse() {
                config.cart_recovery_delay = Duration::from_secs(n);
            }
        }
        if let Ok(v) = std::env::var("BIND_ADDR") {
            config.bind_addr = v;
        }
        config
    }
}
