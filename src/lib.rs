// src/lib.rs

// Import the top-level `leadflow` module.
pub mod leadflow;

// Re-exporting key items for easier external access.
pub use leadflow::assets::{AssetEntry, AssetLibrary, MediaKind, TemplateVars};
pub use leadflow::billing::{sign_body, verify_signature, BillingOutcome, BillingProcessor};
pub use leadflow::config::LeadflowConfig;
pub use leadflow::detectors::{FunnelDetection, FunnelDetector, SupportDetector};
pub use leadflow::dispatch::{DispatchOutcome, InboundMessage, IngressDispatcher};
pub use leadflow::error::{
    AssetError, BillingError, DispatchError, FunnelConfigError, LlmError, SendError, StoreError,
};
pub use leadflow::funnel::{Action, FunnelLibrary, KeywordSpec, TextContent, TriggerDef};
pub use leadflow::llm::{
    parse_reply, ChatTurn, LlmAction, LlmBackend, LlmContext, LlmReply, LlmResponseType,
    OpenAiCompatClient, TokenBucket,
};
pub use leadflow::locks::ThreadLocks;
pub use leadflow::processor::{ExecutionStatus, ResponseProcessor};
pub use leadflow::scheduler::Scheduler;
pub use leadflow::sender::{HttpOutboundSender, OutboundSender};
pub use leadflow::server::{build_router, AppState};
pub use leadflow::store::{
    Contact, JobStatus, MessageRecord, NewJob, Role, SalesEvent, ScheduledJob, Store, Thread,
    TurnEffects,
};
pub use leadflow::textmatch;
pub use leadflow::trigger::{TriggerEngine, TriggerMatch};
