//! Static asset library: logical asset ids mapped to media paths and
//! text templates.
//!
//! The library is built once at startup and shared immutably. Media
//! assets resolve to paths rooted under the public media tree
//! (`/audios/...`, `/images/...`); the response processor turns those
//! into provider-reachable URLs. Text templates may embed `{name}` and
//! `{link}` placeholders. Short aliases map onto canonical ids so
//! funnel files and LLM action descriptors can use either.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::leadflow::error::AssetError;

/// What a media asset is, which also selects the provider send call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Image,
}

/// One registered asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AssetEntry {
    /// A media file served from the public media tree.
    Media { kind: MediaKind, path: String },
    /// A text template. `link`, when set, fills the `{link}`
    /// placeholder.
    Template {
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        link: Option<String>,
    },
}

/// Values substituted into template placeholders.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    pub name: Option<String>,
}

/// Fixed, process-wide asset lookup.
pub struct AssetLibrary {
    assets: HashMap<String, AssetEntry>,
    aliases: HashMap<String, String>,
}

impl AssetLibrary {
    pub fn new() -> Self {
        Self {
            assets: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Register an asset under its canonical id.
    pub fn insert(&mut self, id: &str, entry: AssetEntry) {
        self.assets.insert(id.to_string(), entry);
    }

    /// Register a short code pointing at a canonical id.
    pub fn alias(&mut self, short: &str, canonical: &str) {
        self.aliases.insert(short.to_string(), canonical.to_string());
    }

    /// Follow at most one alias hop to the canonical id.
    pub fn canonical_id<'a>(&'a self, id: &'a str) -> &'a str {
        self.aliases.get(id).map(String::as_str).unwrap_or(id)
    }

    /// Whether `id` (or an alias of it) is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.assets.contains_key(self.canonical_id(id))
    }

    fn entry(&self, id: &str) -> Result<&AssetEntry, AssetError> {
        self.assets
            .get(self.canonical_id(id))
            .ok_or_else(|| AssetError::NotFound(id.to_string()))
    }

    /// Resolve a media asset to its kind and public-tree path.
    pub fn resolve_media(&self, id: &str) -> Result<(MediaKind, &str), AssetError> {
        match self.entry(id)? {
            AssetEntry::Media { kind, path } => Ok((*kind, path.as_str())),
            AssetEntry::Template { .. } => Err(AssetError::WrongKind {
                id: id.to_string(),
                expected: "media file",
            }),
        }
    }

    /// Render a text template, substituting `{name}` and `{link}`.
    /// Placeholders with no value collapse to an empty string.
    pub fn render_template(&self, id: &str, vars: &TemplateVars) -> Result<String, AssetError> {
        match self.entry(id)? {
            AssetEntry::Template { body, link } => {
                let name = vars.name.as_deref().unwrap_or("");
                let link = link.as_deref().unwrap_or("");
                Ok(body.replace("{name}", name).replace("{link}", link))
            }
            AssetEntry::Media { .. } => Err(AssetError::WrongKind {
                id: id.to_string(),
                expected: "text template",
            }),
        }
    }

    /// The library shipped with the default funnel configuration.
    pub fn default_library() -> Self {
        let mut lib = Self::new();
        lib.insert(
            "welcome",
            AssetEntry::Media {
                kind: MediaKind::Audio,
                path: "/audios/welcome.opus".to_string(),
            },
        );
        lib.insert(
            "pain_generic",
            AssetEntry::Media {
                kind: MediaKind::Audio,
                path: "/audios/pain_generic.opus".to_string(),
            },
        );
        lib.insert(
            "plans",
            AssetEntry::Media {
                kind: MediaKind::Audio,
                path: "/audios/plans.opus".to_string(),
            },
        );
        lib.insert(
            "recovery",
            AssetEntry::Media {
                kind: MediaKind::Audio,
                path: "/audios/recovery.opus".to_string(),
            },
        );
        for n in 1..=8u8 {
            lib.insert(
                &format!("results_{:02}", n),
                AssetEntry::Media {
                    kind: MediaKind::Image,
                    path: format!("/images/results_{:02}.jpg", n),
                },
            );
        }
        lib.insert(
            "plans_description",
            AssetEntry::Template {
                body: "Hey {name}, we have two plans: the monthly at $29/month and the \
                       annual at $228/year ($19/month). Both include the full program and \
                       the support group. Which one works better for you?"
                    .to_string(),
                link: None,
            },
        );
        lib.insert(
            "checkout_monthly",
            AssetEntry::Template {
                body: "Perfect choice! Here is your secure checkout link for the monthly \
                       plan: {link}"
                    .to_string(),
                link: Some("https://pay.example.com/monthly".to_string()),
            },
        );
        lib.insert(
            "checkout_annual",
            AssetEntry::Template {
                body: "Great pick! Here is your secure checkout link for the annual plan: \
                       {link}"
                    .to_string(),
                link: Some("https://pay.example.com/annual".to_string()),
            },
        );
        lib.insert(
            "recovery_text",
            AssetEntry::Template {
                body: "{name}, your spot is still reserved! The checkout link is waiting \
                       for you whenever you are ready."
                    .to_string(),
                link: None,
            },
        );
        lib.insert(
            "welcome_customer",
            AssetEntry::Template {
                body: "Welcome aboard, {name}! Your access details are on the way to your \
                       email. Reply here any time you need help getting started."
                    .to_string(),
                link: None,
            },
        );
        // Short codes kept for funnel files and LLM action descriptors.
        lib.alias("audio1", "welcome");
        lib.alias("audio2", "pain_generic");
        lib.alias("audio3", "plans");
        lib.alias("audio4", "recovery");
        lib
    }
}

impl Default for AssetLibrary {
    fn default() -> Self {
        Self::new()
    }
}
