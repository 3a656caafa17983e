//! Inbound-text classifiers.
//!
//! Two pure classifiers run ahead of the trigger engine:
//!
//! - [`SupportDetector`] flags support/service requests (login trouble,
//!   cancellation, billing, technical errors) so the conversation is
//!   handed to a human instead of the funnel. It fails open: false
//!   positives are acceptable, a missed handoff is not.
//! - [`FunnelDetector`] classifies a brand-new thread into one of the
//!   configured funnels from its first message and seeds the initial
//!   stage, tags, and source attribution.
//!
//! Both operate on [`normalize`]d text, so matching is case- and
//! diacritic-insensitive.

use std::sync::Arc;

use regex::Regex;

use crate::leadflow::funnel::{FunnelDef, FunnelKind, FunnelLibrary};
use crate::leadflow::textmatch::{matches_keyword, normalize};

/// Curated support lexicon. Matched against normalized (lowercased,
/// diacritic-folded) text, so only base-letter forms appear here.
const SUPPORT_MARKERS: &[&str] = &[
    // account access
    "login",
    "log in",
    "log into",
    "sign in",
    "signin",
    "password",
    "senha",
    "acesso",
    "cannot access",
    "can't access",
    "cant access",
    "minha conta",
    "my account",
    // cancellation and billing
    "cancel",
    "cancelar",
    "cancelamento",
    "cancellation",
    "unsubscribe",
    "refund",
    "reembolso",
    "estorno",
    "chargeback",
    "billing",
    "cobranca",
    "fatura",
    "invoice",
    "charged twice",
    // technical trouble
    "error",
    "erro",
    "bug",
    "not working",
    "nao funciona",
    "nao consigo",
    "doesn't work",
    "doesnt work",
    "broken",
    "crash",
    "travando",
    // explicit asks
    "support",
    "suporte",
    "atendimento",
];

/// Classifies inbound text as a support/service request.
pub struct SupportDetector {
    lexicon: Regex,
}

impl SupportDetector {
    pub fn new() -> Self {
        let escaped: Vec<String> = SUPPORT_MARKERS
            .iter()
            .map(|marker| regex::escape(marker))
            .collect();
        let pattern = format!(r"\b(?:{})\b", escaped.join("|"));
        Self {
            // The pattern is built from a fixed, escaped lexicon.
            lexicon: Regex::new(&pattern).expect("support lexicon pattern must compile"),
        }
    }

    /// Whether `text` reads like a support request. Any lexicon hit is
    /// enough.
    pub fn is_support(&self, text: &str) -> bool {
        self.lexicon.is_match(&normalize(text))
    }
}

impl Default for SupportDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// The funnel detector's verdict on a first message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunnelDetection {
    pub funnel_id: String,
    pub initial_stage: String,
    pub tags: Vec<String>,
    pub source: String,
}

/// Classifies a new thread into a funnel from its first message.
///
/// Priority, first match wins: campaign keywords, then product-name
/// keywords, then the default funnel. Tags are extracted by a separate
/// pass over the same text and may multi-match.
pub struct FunnelDetector {
    library: Arc<FunnelLibrary>,
}

impl FunnelDetector {
    pub fn new(library: Arc<FunnelLibrary>) -> Self {
        Self { library }
    }

    /// Deterministic: the same first message always produces the same
    /// detection.
    pub fn detect(&self, first_text: &str) -> FunnelDetection {
        let normalized = normalize(first_text);

        let matched = self
            .funnels_by_priority(FunnelKind::Campaign)
            .chain(self.funnels_by_priority(FunnelKind::Product))
            .find(|funnel| {
                funnel
                    .entry_keywords
                    .iter()
                    .any(|kw| matches_keyword(&normalized, kw))
            });
        let funnel = matched.unwrap_or_else(|| self.library.default_funnel_def());

        let mut tags = funnel.entry_tags.clone();
        for rule in &self.library.tag_rules {
            if rule.keywords.iter().any(|kw| matches_keyword(&normalized, kw))
                && !tags.contains(&rule.tag)
            {
                tags.push(rule.tag.clone());
            }
        }

        FunnelDetection {
            funnel_id: funnel.id.clone(),
            initial_stage: funnel.initial_stage.clone(),
            tags,
            source: funnel
                .source
                .clone()
                .unwrap_or_else(|| "organic".to_string()),
        }
    }

    fn funnels_by_priority(&self, kind: FunnelKind) -> impl Iterator<Item = &FunnelDef> {
        self.library
            .funnels
            .iter()
            .filter(move |funnel| funnel.kind == kind)
    }
}
