//! Funnel definitions: stages, triggers, and action lists.
//!
//! A [`FunnelLibrary`] is static configuration loaded once at startup,
//! from a JSON file or the built-in default, and never mutated at
//! runtime. Loading validates the whole library (duplicate ids,
//! unknown stages and assets, ambiguous trigger domains, unreachable
//! stages) and refuses to start on any problem: a bad configuration is
//! rejected up front rather than becoming a runtime ambiguity.
//!
//! The library also owns the stage state machine. Edges are derived
//! from the triggers themselves: a trigger allowed in stage `S` whose
//! action list sets stage `T` contributes the edge `S → T` (including
//! stage mutations nested inside scheduled follow-ups), and the
//! post-purchase stage is reachable from every stage via the billing
//! webhook.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::leadflow::assets::AssetLibrary;
use crate::leadflow::error::FunnelConfigError;
use crate::leadflow::textmatch::{matches_keyword, normalize};

/// What produced a funnel: a time-boxed campaign, a product-specific
/// flow, or the always-on primary flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunnelKind {
    Campaign,
    Product,
    Primary,
}

/// Text payload of a `send_text` action: either a literal string or a
/// template code resolved through the asset library.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextContent {
    Literal { literal: String },
    Template { template_code: String },
}

/// One step of a trigger's action list. Executed in order by the
/// response processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    SendAudio {
        asset_id: String,
    },
    SendImageSequence {
        asset_ids: Vec<String>,
    },
    SendText {
        #[serde(flatten)]
        content: TextContent,
    },
    SetStage {
        stage_id: String,
    },
    Schedule {
        key: String,
        delay_secs: u64,
        actions: Vec<Action>,
    },
    Cancel {
        key_prefix: String,
    },
}

/// Keyword matching spec. All matching is case- and
/// diacritic-insensitive on word boundaries; multi-word phrases match
/// as substrings.
///
/// Semantics: at least one `any` hit (when `any` is non-empty), every
/// `all` hit, no `none` hit. A spec with neither `any` nor `all`
/// matches nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeywordSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub none: Vec<String>,
}

impl KeywordSpec {
    /// Test against already-normalized inbound text.
    pub fn matches(&self, normalized_text: &str) -> bool {
        if self.any.is_empty() && self.all.is_empty() {
            return false;
        }
        if !self.any.is_empty()
            && !self
                .any
                .iter()
                .any(|kw| matches_keyword(normalized_text, kw))
        {
            return false;
        }
        if !self
            .all
            .iter()
            .all(|kw| matches_keyword(normalized_text, kw))
        {
            return false;
        }
        !self
            .none
            .iter()
            .any(|kw| matches_keyword(normalized_text, kw))
    }

    /// Canonical form used for the load-time ambiguity check.
    fn domain_fingerprint(&self) -> (Vec<String>, Vec<String>, Vec<String>) {
        let canon = |list: &[String]| {
            let mut out: Vec<String> = list.iter().map(|kw| normalize(kw)).collect();
            out.sort();
            out.dedup();
            out
        };
        (canon(&self.any), canon(&self.all), canon(&self.none))
    }
}

/// A node in the funnel state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDef {
    pub id: String,
    pub order: u32,
    pub phase: String,
}

/// A deterministic (prior stages × keywords) → action-list rule.
/// Triggers are tried in declaration order; the first match wins, which
/// lets specific triggers be declared ahead of general ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDef {
    pub id: String,
    /// Stages in which this trigger may fire.
    pub prior_stages: Vec<String>,
    pub keywords: KeywordSpec,
    pub actions: Vec<Action>,
}

/// Scheduled follow-up fired when a hot lead goes silent, also used
/// when the billing platform reports an abandoned cart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryDef {
    pub key: String,
    pub delay_secs: u64,
    pub actions: Vec<Action>,
}

/// A library-level tag extraction rule: any keyword hit attaches the
/// tag. Multiple rules may match the same text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRule {
    pub tag: String,
    pub keywords: Vec<String>,
}

/// One configured funnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelDef {
    pub id: String,
    pub kind: FunnelKind,
    /// First-message keywords routing a new thread into this funnel.
    /// Ignored for the default funnel.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry_keywords: Vec<String>,
    /// Attribution recorded in thread meta; defaults to `organic` for
    /// the default funnel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub initial_stage: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry_tags: Vec<String>,
    /// Executed once when a new thread is seeded into this funnel.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry_actions: Vec<Action>,
    pub stages: Vec<StageDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<TriggerDef>,
    /// Stage entered on a confirmed purchase, from any prior stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_purchase_stage: Option<String>,
    /// Welcome action list dispatched on a confirmed purchase.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_purchase_actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryDef>,
}

impl FunnelDef {
    pub fn stage(&self, id: &str) -> Option<&StageDef> {
        self.stages.iter().find(|s| s.id == id)
    }
}

/// The full, validated funnel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelLibrary {
    pub funnels: Vec<FunnelDef>,
    /// Funnel used when no entry keyword matches a new thread's first
    /// message.
    pub default_funnel: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_rules: Vec<TagRule>,
}

/// Walk an action list depth-first, descending into scheduled
/// follow-ups.
fn for_each_action<'a>(actions: &'a [Action], f: &mut dyn FnMut(&'a Action)) {
    for action in actions {
        f(action);
        if let Action::Schedule { actions: inner, .. } = action {
            for_each_action(inner, f);
        }
    }
}

impl FunnelLibrary {
    /// Load and validate a library from a JSON file.
    pub fn load(path: &Path, assets: &AssetLibrary) -> Result<Self, FunnelConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw, assets)
    }

    /// Parse and validate a library from a JSON string.
    pub fn from_json(raw: &str, assets: &AssetLibrary) -> Result<Self, FunnelConfigError> {
        let library: FunnelLibrary =
            serde_json::from_str(raw).map_err(|e| FunnelConfigError::Parse(e.to_string()))?;
        library.validate(assets)?;
        Ok(library)
    }

    pub fn funnel(&self, id: &str) -> Option<&FunnelDef> {
        self.funnels.iter().find(|f| f.id == id)
    }

    /// The funnel new threads fall into when nothing else matches.
    /// Validation guarantees it exists.
    pub fn default_funnel_def(&self) -> &FunnelDef {
        self.funnel(&self.default_funnel)
            .expect("validated library declares its default funnel")
    }

    /// Direct edges of a funnel's stage machine: `from → to` for every
    /// stage mutation reachable from a trigger allowed in `from`, plus
    /// the post-purchase stage from everywhere.
    fn edges(funnel: &FunnelDef) -> HashSet<(String, String)> {
        let mut edges = HashSet::new();
        for trigger in &funnel.triggers {
            let mut targets = Vec::new();
            for_each_action(&trigger.actions, &mut |action| {
                if let Action::SetStage { stage_id } = action {
                    targets.push(stage_id.clone());
                }
            });
            for from in &trigger.prior_stages {
                for to in &targets {
                    edges.insert((from.clone(), to.clone()));
                }
            }
        }
        if let Some(purchase_stage) = &funnel.post_purchase_stage {
            for stage in &funnel.stages {
                if &stage.id != purchase_stage {
                    edges.insert((stage.id.clone(), purchase_stage.clone()));
                }
            }
        }
        edges
    }

    /// Whether `next` is a legal successor of `current` in the funnel's
    /// state machine. With no current stage, only the initial stage is
    /// legal.
    pub fn is_successor(&self, funnel_id: &str, current: Option<&str>, next: &str) -> bool {
        let funnel = match self.funnel(funnel_id) {
            Some(funnel) => funnel,
            None => return false,
        };
        match current {
            None => funnel.initial_stage == next,
            Some(current) => Self::edges(funnel)
                .contains(&(current.to_string(), next.to_string())),
        }
    }

    /// Validate the whole library. Any error here is fatal at startup.
    pub fn validate(&self, assets: &AssetLibrary) -> Result<(), FunnelConfigError> {
        if self.funnel(&self.default_funnel).is_none() {
            return Err(FunnelConfigError::NoDefaultFunnel);
        }

        let mut seen_ids = HashSet::new();
        for funnel in &self.funnels {
            if !seen_ids.insert(funnel.id.clone()) {
                return Err(FunnelConfigError::DuplicateFunnel(funnel.id.clone()));
            }
            self.validate_funnel(funnel, assets)?;
        }
        Ok(())
    }

    fn validate_funnel(
        &self,
        funnel: &FunnelDef,
        assets: &AssetLibrary,
    ) -> Result<(), FunnelConfigError> {
        let stage_ids: HashSet<&str> = funnel.stages.iter().map(|s| s.id.as_str()).collect();
        let unknown_stage = |stage: &str| FunnelConfigError::UnknownStage {
            funnel: funnel.id.clone(),
            stage: stage.to_string(),
        };

        if !stage_ids.contains(funnel.initial_stage.as_str()) {
            return Err(unknown_stage(&funnel.initial_stage));
        }
        if let Some(stage) = &funnel.post_purchase_stage {
            if !stage_ids.contains(stage.as_str()) {
                return Err(unknown_stage(stage));
            }
        }

        // Every referenced stage and asset must resolve.
        let mut all_actions: Vec<&[Action]> = vec![
            &funnel.entry_actions,
            &funnel.post_purchase_actions,
        ];
        for trigger in &funnel.triggers {
            for stage in &trigger.prior_stages {
                if !stage_ids.contains(stage.as_str()) {
                    return Err(unknown_stage(stage));
                }
            }
            all_actions.push(&trigger.actions);
        }
        if let Some(recovery) = &funnel.recovery {
            all_actions.push(&recovery.actions);
        }
        for actions in all_actions {
            let mut problem: Option<FunnelConfigError> = None;
            for_each_action(actions, &mut |action| {
                if problem.is_some() {
                    return;
                }
                let asset = match action {
                    Action::SendAudio { asset_id } => Some(asset_id.as_str()),
                    Action::SendText {
                        content: TextContent::Template { template_code },
                    } => Some(template_code.as_str()),
                    _ => None,
                };
                if let Some(asset) = asset {
                    if !assets.contains(asset) {
                        problem = Some(FunnelConfigError::UnknownAsset {
                            funnel: funnel.id.clone(),
                            asset: asset.to_string(),
                        });
                    }
                }
                if let Action::SendImageSequence { asset_ids } = action {
                    for asset in asset_ids {
                        if !assets.contains(asset) && problem.is_none() {
                            problem = Some(FunnelConfigError::UnknownAsset {
                                funnel: funnel.id.clone(),
                                asset: asset.clone(),
                            });
                        }
                    }
                }
                if let Action::SetStage { stage_id } = action {
                    if !stage_ids.contains(stage_id.as_str()) && problem.is_none() {
                        problem = Some(unknown_stage(stage_id));
                    }
                }
            });
            if let Some(problem) = problem {
                return Err(problem);
            }
        }

        // Identical (stage, keyword) domains make matching ambiguous.
        for (i, first) in funnel.triggers.iter().enumerate() {
            for second in &funnel.triggers[i + 1..] {
                let shares_stage = first
                    .prior_stages
                    .iter()
                    .any(|s| second.prior_stages.contains(s));
                if shares_stage
                    && first.keywords.domain_fingerprint()
                        == second.keywords.domain_fingerprint()
                {
                    return Err(FunnelConfigError::ConflictingTriggers {
                        funnel: funnel.id.clone(),
                        first: first.id.clone(),
                        second: second.id.clone(),
                    });
                }
            }
        }

        // Every declared stage must be reachable from the initial one.
        let edges = Self::edges(funnel);
        let mut reachable: HashSet<&str> = HashSet::new();
        reachable.insert(funnel.initial_stage.as_str());
        loop {
            let before = reachable.len();
            for (from, to) in &edges {
                if reachable.contains(from.as_str()) {
                    if let Some(stage) = funnel.stage(to) {
                        reachable.insert(stage.id.as_str());
                    }
                }
            }
            if reachable.len() == before {
                break;
            }
        }
        for stage in &funnel.stages {
            if !reachable.contains(stage.id.as_str()) {
                return Err(FunnelConfigError::UnreachableStage {
                    funnel: funnel.id.clone(),
                    stage: stage.id.clone(),
                });
            }
        }
        Ok(())
    }

    /// The built-in configuration: the primary funnel's canonical stage
    /// machine plus a campaign funnel and a product funnel for the
    /// funnel detector's priority rules.
    ///
    /// `cart_recovery_delay` parameterises the follow-up window.
    pub fn default_library(cart_recovery_delay: Duration) -> Self {
        let delay_secs = cart_recovery_delay.as_secs();
        let recovery_actions = vec![
            Action::SendAudio {
                asset_id: "recovery".to_string(),
            },
            Action::SendText {
                content: TextContent::Template {
                    template_code: "recovery_text".to_string(),
                },
            },
            Action::SetStage {
                stage_id: "cart_recovery".to_string(),
            },
        ];
        let checkout_trigger = |id: &str, keywords: &[&str], template: &str| TriggerDef {
            id: id.to_string(),
            prior_stages: vec!["warm".to_string()],
            keywords: KeywordSpec {
                any: keywords.iter().map(|kw| kw.to_string()).collect(),
                ..KeywordSpec::default()
            },
            actions: vec![
                Action::SendText {
                    content: TextContent::Template {
                        template_code: template.to_string(),
                    },
                },
                Action::SetStage {
                    stage_id: "hot".to_string(),
                },
                Action::Schedule {
                    key: "cart_recovery_30m".to_string(),
                    delay_secs,
                    actions: recovery_actions.clone(),
                },
            ],
        };

        let primary = FunnelDef {
            id: "primary".to_string(),
            kind: FunnelKind::Primary,
            entry_keywords: Vec::new(),
            source: None,
            initial_stage: "cold".to_string(),
            entry_tags: Vec::new(),
            entry_actions: vec![Action::SendAudio {
                asset_id: "welcome".to_string(),
            }],
            stages: vec![
                StageDef {
                    id: "cold".to_string(),
                    order: 1,
                    phase: "awareness".to_string(),
                },
                StageDef {
                    id: "warming".to_string(),
                    order: 2,
                    phase: "pain".to_string(),
                },
                StageDef {
                    id: "warm".to_string(),
                    order: 3,
                    phase: "consideration".to_string(),
                },
                StageDef {
                    id: "hot".to_string(),
                    order: 4,
                    phase: "decision".to_string(),
                },
                StageDef {
                    id: "cart_recovery".to_string(),
                    order: 5,
                    phase: "recovery".to_string(),
                },
                StageDef {
                    id: "customer".to_string(),
                    order: 6,
                    phase: "post_purchase".to_string(),
                },
            ],
            triggers: vec![
                TriggerDef {
                    id: "pain".to_string(),
                    prior_stages: vec!["cold".to_string()],
                    keywords: KeywordSpec {
                        any: [
                            "pain", "hurts", "bothers", "bother", "belly", "stomach",
                            "bloating", "dor", "incomoda", "barriga", "inchaco",
                        ]
                        .iter()
                        .map(|kw| kw.to_string())
                        .collect(),
                        ..KeywordSpec::default()
                    },
                    actions: vec![
                        Action::SendAudio {
                            asset_id: "pain_generic".to_string(),
                        },
                        Action::SendImageSequence {
                            asset_ids: (1..=8u8)
                                .map(|n| format!("results_{:02}", n))
                                .collect(),
                        },
                        Action::SendText {
                            content: TextContent::Literal {
                                literal: "Tell me what's holding you back".to_string(),
                            },
                        },
                        Action::SetStage {
                            stage_id: "warming".to_string(),
                        },
                    ],
                },
                TriggerDef {
                    id: "plans_interest".to_string(),
                    prior_stages: vec!["warming".to_string()],
                    keywords: KeywordSpec {
                        any: [
                            "price", "cost", "how much", "plans", "plan", "preco",
                            "quanto custa", "valor", "plano",
                        ]
                        .iter()
                        .map(|kw| kw.to_string())
                        .collect(),
                        ..KeywordSpec::default()
                    },
                    actions: vec![
                        Action::SendAudio {
                            asset_id: "plans".to_string(),
                        },
                        Action::SendText {
                            content: TextContent::Template {
                                template_code: "plans_description".to_string(),
                            },
                        },
                        Action::SetStage {
                            stage_id: "warm".to_string(),
                        },
                    ],
                },
                checkout_trigger(
                    "plan_choice_monthly",
                    &["monthly", "mensal"],
                    "checkout_monthly",
                ),
                checkout_trigger(
                    "plan_choice_annual",
                    &["annual", "yearly", "anual"],
                    "checkout_annual",
                ),
            ],
            post_purchase_stage: Some("customer".to_string()),
            post_purchase_actions: vec![Action::SendText {
                content: TextContent::Template {
                    template_code: "welcome_customer".to_string(),
                },
            }],
            recovery: Some(RecoveryDef {
                key: "cart_recovery_30m".to_string(),
                delay_secs,
                actions: recovery_actions,
            }),
        };

        let campaign = FunnelDef {
            id: "black_friday".to_string(),
            kind: FunnelKind::Campaign,
            entry_keywords: vec!["black friday".to_string(), "promo 50".to_string()],
            source: Some("campaign:black_friday".to_string()),
            initial_stage: "cold".to_string(),
            entry_tags: vec!["promo".to_string()],
            entry_actions: vec![Action::SendAudio {
                asset_id: "welcome".to_string(),
            }],
            stages: vec![StageDef {
                id: "cold".to_string(),
                order: 1,
                phase: "awareness".to_string(),
            }],
            triggers: Vec::new(),
            post_purchase_stage: None,
            post_purchase_actions: Vec::new(),
            recovery: None,
        };

        let product = FunnelDef {
            id: "gutfit".to_string(),
            kind: FunnelKind::Product,
            entry_keywords: vec!["gutfit".to_string()],
            source: Some("product:gutfit".to_string()),
            initial_stage: "cold".to_string(),
            entry_tags: vec!["gutfit".to_string()],
            entry_actions: vec![Action::SendAudio {
                asset_id: "welcome".to_string(),
            }],
            stages: vec![StageDef {
                id: "cold".to_string(),
                order: 1,
                phase: "awareness".to_string(),
            }],
            triggers: Vec::new(),
            post_purchase_stage: None,
            post_purchase_actions: Vec::new(),
            recovery: None,
        };

        Self {
            funnels: vec![campaign, product, primary],
            default_funnel: "primary".to_string(),
            tag_rules: vec![
                TagRule {
                    tag: "promo".to_string(),
                    keywords: vec![
                        "black friday".to_string(),
                        "promo".to_string(),
                        "discount".to_string(),
                        "desconto".to_string(),
                    ],
                },
                TagRule {
                    tag: "pain_report".to_string(),
                    keywords: vec!["pain".to_string(), "dor".to_string()],
                },
            ],
        }
    }
}
