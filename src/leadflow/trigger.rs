//! The deterministic trigger engine.
//!
//! Given a thread's funnel, its current stage, and the inbound text,
//! the engine walks the funnel's triggers in declaration order and
//! returns the first whose prior-stage set contains the current stage
//! and whose keyword spec matches. Declaration order is the only
//! priority mechanism: specific triggers are declared ahead of general
//! ones, and load-time validation has already rejected identical
//! domains.
//!
//! The engine is pure. It never executes side effects and cannot fail;
//! it returns the intended action list for the ingress dispatcher to
//! hand to the response processor.

use std::sync::Arc;

use crate::leadflow::funnel::{Action, FunnelLibrary};
use crate::leadflow::textmatch::normalize;

/// A matched trigger: the action list to execute, plus provenance for
/// logging and tests.
#[derive(Debug, Clone)]
pub struct TriggerMatch {
    pub funnel_id: String,
    pub trigger_id: String,
    pub actions: Vec<Action>,
}

/// Stateless matcher over a validated [`FunnelLibrary`].
pub struct TriggerEngine {
    library: Arc<FunnelLibrary>,
}

impl TriggerEngine {
    pub fn new(library: Arc<FunnelLibrary>) -> Self {
        Self { library }
    }

    /// Match the inbound text against the funnel's triggers.
    ///
    /// `current_stage` of `None` never matches: a thread must be seeded
    /// by the funnel detector before triggers apply.
    pub fn matches(
        &self,
        funnel_id: &str,
        current_stage: Option<&str>,
        text: &str,
    ) -> Option<TriggerMatch> {
        let funnel = self.library.funnel(funnel_id)?;
        let stage = current_stage?;
        let normalized = normalize(text);

        funnel
            .triggers
            .iter()
            .find(|trigger| {
                trigger.prior_stages.iter().any(|s| s == stage)
                    && trigger.keywords.matches(&normalized)
            })
            .map(|trigger| TriggerMatch {
                funnel_id: funnel.id.clone(),
                trigger_id: trigger.id.clone(),
                actions: trigger.actions.clone(),
            })
    }
}
