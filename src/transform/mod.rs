// # Data Transformation Module
//
// Applies ordered, deterministic transformations to structured payloads
// based on the caller's context: consent level, data classification, and
// Indigenous data sovereignty constraints.
//
// ## Precedence
//
// Sovereignty overrides beat compliance overrides beat consent-level rules
// beat defaults. Sacred and cultural fields are all-or-nothing: released in
// full to traditional-owner authority with a community match, dropped for
// everyone else.

pub mod engine;
pub mod rules;

pub use engine::{TransformEngine, TransformOutcome, TransformSummary, TraceRecord};
pub use rules::{RuleKind, RuleSource, RuleTable, TransformRule};

use crate::consent::ConsentLevel;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Data classification resolved per field path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Public,
    Confidential,
    Sensitive,
    Sacred,
}

/// Scope of data custody used to gate cultural data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SovereigntyLevel {
    None,
    Individual,
    Community,
    TraditionalOwner,
}

/// Out-of-band tags attached to field paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldTag {
    IndigenousCultural,
    Sacred,
    PersonalData,
    PersonalIdentifier,
    FinancialData,
    FinancialSummary,
    Marketing,
}

/// Classification and tags for one field path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMeta {
    pub classification: Classification,
    pub tags: Vec<FieldTag>,
    /// Community that owns a cultural field, when scoped.
    pub community_id: Option<String>,
}

impl FieldMeta {
    pub fn new(classification: Classification) -> Self {
        Self {
            classification,
            tags: Vec::new(),
            community_id: None,
        }
    }

    pub fn tagged(mut self, tag: FieldTag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn community(mut self, community_id: impl Into<String>) -> Self {
        self.community_id = Some(community_id.into());
        self
    }

    pub fn has_tag(&self, tag: FieldTag) -> bool {
        self.tags.contains(&tag)
    }
}

/// Caller context a transformation runs under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformContext {
    pub user_id: String,
    pub roles: Vec<String>,
    pub consent_level: ConsentLevel,
    pub sovereignty_level: SovereigntyLevel,
    pub purpose: String,
    pub compliance_frameworks: Vec<String>,
    pub location: Option<String>,
    pub temporal: Option<String>,
    /// Community the caller acts for, when exercising community authority.
    pub community_id: Option<String>,
    /// Elder approval recorded for this access.
    pub elder_approval: bool,
}

impl TransformContext {
    pub fn new(user_id: impl Into<String>, consent_level: ConsentLevel) -> Self {
        Self {
            user_id: user_id.into(),
            roles: Vec::new(),
            consent_level,
            sovereignty_level: SovereigntyLevel::None,
            purpose: String::new(),
            compliance_frameworks: Vec::new(),
            location: None,
            temporal: None,
            community_id: None,
            elder_approval: false,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Stable digest over every attribute that can change an outcome.
    pub fn digest(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or_default();
        let canonical = crate::audit::canonical_string(&value);
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}
