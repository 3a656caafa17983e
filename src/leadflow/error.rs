//! Error taxonomy for the orchestration engine.
//!
//! Each subsystem exposes its own small error enum so callers can make
//! policy decisions (retry, abort, fall back) without string matching.
//! The ingress dispatcher is the error boundary: everything that fails
//! after the inbound user message has been persisted is recorded as a
//! system message on the thread instead of being propagated.

use std::error::Error;
use std::fmt;

/// Failure returned by an outbound send attempt.
///
/// The split drives retry policy: transient failures are retried once by
/// the response processor, permanent failures abort the action list
/// immediately.
#[derive(Debug, Clone)]
pub enum SendError {
    /// Provider 5xx or network-level failure. Eligible for one retry.
    Transient(String),
    /// Provider 4xx, or a request the provider can never accept.
    Permanent(String),
}

impl SendError {
    /// Whether the processor may retry this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Transient(msg) => write!(f, "Transient send failure: {}", msg),
            SendError::Permanent(msg) => write!(f, "Permanent send failure: {}", msg),
        }
    }
}

impl Error for SendError {}

/// Failure talking to the LLM backend.
///
/// Both variants are handled identically by the dispatcher (generic
/// fallback text, no stage mutation); they are kept apart for logging.
#[derive(Debug, Clone)]
pub enum LlmError {
    /// Timeout, connection failure, or backend error status.
    Unavailable(String),
    /// The backend answered but the payload could not be interpreted.
    Malformed(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Unavailable(msg) => write!(f, "LLM unavailable: {}", msg),
            LlmError::Malformed(msg) => write!(f, "LLM returned malformed output: {}", msg),
        }
    }
}

impl Error for LlmError {}

/// Failure in the durable store.
#[derive(Debug)]
pub enum StoreError {
    /// Journal file could not be created, read, or appended.
    Io(std::io::Error),
    /// A journal line failed to deserialize during replay.
    Corrupt(String),
    /// A row referenced by id does not exist.
    NotFound(&'static str, String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(err) => write!(f, "Store I/O failure: {}", err),
            StoreError::Corrupt(msg) => write!(f, "Store journal corrupt: {}", msg),
            StoreError::NotFound(kind, id) => write!(f, "{} not found: {}", kind, id),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

/// Failure resolving an asset id in the asset library.
#[derive(Debug, Clone)]
pub enum AssetError {
    /// No asset or alias registered under this id.
    NotFound(String),
    /// The id resolved, but to the wrong kind (e.g. a template where a
    /// media file was expected).
    WrongKind { id: String, expected: &'static str },
}

impl fmt::Display for AssetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetError::NotFound(id) => write!(f, "Asset not found: {}", id),
            AssetError::WrongKind { id, expected } => {
                write!(f, "Asset {} is not a {}", id, expected)
            }
        }
    }
}

impl Error for AssetError {}

/// Fatal funnel-configuration problem detected at load time.
///
/// Any of these refuses startup; a bad configuration must never reach
/// the matching path.
#[derive(Debug)]
pub enum FunnelConfigError {
    Io(std::io::Error),
    Parse(String),
    /// Two funnels share an id.
    DuplicateFunnel(String),
    /// A trigger, action, or entry references a stage the funnel does
    /// not declare.
    UnknownStage { funnel: String, stage: String },
    /// An action references an asset the library cannot resolve.
    UnknownAsset { funnel: String, asset: String },
    /// Two triggers cover the same (stage, keyword) domain, so matching
    /// would be ambiguous.
    ConflictingTriggers {
        funnel: String,
        first: String,
        second: String,
    },
    /// A declared stage can never be entered.
    UnreachableStage { funnel: String, stage: String },
    /// The library declares no default funnel for unmatched first
    /// messages.
    NoDefaultFunnel,
}

impl fmt::Display for FunnelConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunnelConfigError::Io(err) => write!(f, "Funnel file I/O failure: {}", err),
            FunnelConfigError::Parse(msg) => write!(f, "Funnel file parse failure: {}", msg),
            FunnelConfigError::DuplicateFunnel(id) => write!(f, "Duplicate funnel id: {}", id),
            FunnelConfigError::UnknownStage { funnel, stage } => {
                write!(f, "Funnel {} references unknown stage {}", funnel, stage)
            }
            FunnelConfigError::UnknownAsset { funnel, asset } => {
                write!(f, "Funnel {} references unknown asset {}", funnel, asset)
            }
            FunnelConfigError::ConflictingTriggers {
                funnel,
                first,
                second,
            } => write!(
                f,
                "Funnel {} has conflicting triggers {} and {} (same stage and keyword domain)",
                funnel, first, second
            ),
            FunnelConfigError::UnreachableStage { funnel, stage } => {
                write!(f, "Funnel {} declares unreachable stage {}", funnel, stage)
            }
            FunnelConfigError::NoDefaultFunnel => {
                write!(f, "Funnel library declares no default funnel")
            }
        }
    }
}

impl Error for FunnelConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FunnelConfigError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FunnelConfigError {
    fn from(err: std::io::Error) -> Self {
        FunnelConfigError::Io(err)
    }
}

/// Failure in the ingress dispatcher before the inbound message was
/// persisted. Later failures never surface here; they become system
/// messages on the thread.
#[derive(Debug)]
pub enum DispatchError {
    /// The sender phone could not be normalized to E.164.
    InvalidPhone(String),
    Store(StoreError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::InvalidPhone(raw) => write!(f, "Unparseable phone number: {}", raw),
            DispatchError::Store(err) => write!(f, "{}", err),
        }
    }
}

impl Error for DispatchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DispatchError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        DispatchError::Store(err)
    }
}

/// Failure processing a billing webhook.
#[derive(Debug)]
pub enum BillingError {
    /// HMAC verification failed. The caller answers 401 and performs no
    /// side effects.
    SignatureMismatch,
    /// The body was not valid JSON or lacked required fields.
    Malformed(String),
    Store(StoreError),
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BillingError::SignatureMismatch => write!(f, "Billing webhook signature mismatch"),
            BillingError::Malformed(msg) => write!(f, "Malformed billing webhook: {}", msg),
            BillingError::Store(err) => write!(f, "{}", err),
        }
    }
}

impl Error for BillingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BillingError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        BillingError::Store(err)
    }
}
