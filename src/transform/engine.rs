// # Transformation Engine
//
// Pure, deterministic payload transformation: the same payload, context, and
// rule table always produce byte-identical output and trace. A result cache
// keyed by payload and context digests may short-circuit; eviction only ever
// forces a recompute, never a different answer.

use crate::audit::canonical_string;
use crate::consent::ConsentLevel;
use crate::error::{Result, VaultError};
use crate::keys::KeyManager;
use crate::transform::rules::{RuleKind, RuleSource, RuleTable};
use crate::transform::{FieldMeta, FieldTag, SovereigntyLevel, TransformContext};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

const REDACTED: &str = "[REDACTED]";

/// Trace of one applied rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub path: String,
    pub rule: String,
    pub reason: String,
}

/// Counts for the transformation summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformSummary {
    pub fields_transformed: usize,
    pub fields_dropped: usize,
    pub fields_tokenized: usize,
}

/// Transformed payload plus evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformOutcome {
    pub payload: Value,
    pub summary: TransformSummary,
    pub trace: Vec<TraceRecord>,
}

/// The transformation engine.
pub struct TransformEngine {
    classifications: HashMap<String, FieldMeta>,
    rules: RuleTable,
    key_manager: Option<Arc<KeyManager>>,
    /// Key used for consent-level tokenization when a rule names none.
    tokenization_key_id: Option<String>,
    cache: DashMap<String, TransformOutcome>,
    cache_capacity: usize,
}

impl TransformEngine {
    pub fn new(classifications: HashMap<String, FieldMeta>, rules: RuleTable) -> Self {
        Self {
            classifications,
            rules,
            key_manager: None,
            tokenization_key_id: None,
            cache: DashMap::new(),
            cache_capacity: 1024,
        }
    }

    pub fn with_key_manager(
        mut self,
        key_manager: Arc<KeyManager>,
        tokenization_key_id: impl Into<String>,
    ) -> Self {
        self.key_manager = Some(key_manager);
        self.tokenization_key_id = Some(tokenization_key_id.into());
        self
    }

    /// Transform a payload under a context.
    pub fn transform(&self, payload: &Value, context: &TransformContext) -> Result<TransformOutcome> {
        let cache_key = self.cache_key(payload, context);
        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(cached.clone());
        }

        let mut leaves = Vec::new();
        flatten("", payload, &mut leaves);

        let mut output = payload.clone();
        let mut summary = TransformSummary::default();
        let mut trace = Vec::new();
        // Default token key resolved once, on the first tokenize rule, so
        // every tokenized field in one payload uses the same material.
        let mut default_token_key: Option<Vec<u8>> = None;

        for (path, value) in &leaves {
            let meta = self.classify(path);
            let (kind, reason) = self.decide(path, &meta, context);
            match kind {
                RuleKind::Pass => {
                    trace.push(TraceRecord {
                        path: path.clone(),
                        rule: "pass".to_string(),
                        reason,
                    });
                }
                RuleKind::Drop => {
                    remove_path(&mut output, path);
                    summary.fields_dropped += 1;
                    trace.push(TraceRecord {
                        path: path.clone(),
                        rule: "drop".to_string(),
                        reason,
                    });
                }
                RuleKind::Redact => {
                    set_path(&mut output, path, Value::String(REDACTED.to_string()));
                    summary.fields_transformed += 1;
                    trace.push(TraceRecord {
                        path: path.clone(),
                        rule: "redact".to_string(),
                        reason,
                    });
                }
                RuleKind::Mask { show_last } => {
                    let masked = mask_value(value, show_last);
                    set_path(&mut output, path, Value::String(masked));
                    summary.fields_transformed += 1;
                    trace.push(TraceRecord {
                        path: path.clone(),
                        rule: "mask".to_string(),
                        reason,
                    });
                }
                RuleKind::Tokenize { ref key_id } => {
                    let material = match key_id {
                        Some(id) => self.resolve_token_key(Some(id))?,
                        None => match default_token_key {
                            Some(ref key) => key.clone(),
                            None => {
                                let key = self.resolve_token_key(None)?;
                                default_token_key = Some(key.clone());
                                key
                            }
                        },
                    };
                    let token = tokenize_value(path, value, &material);
                    set_path(&mut output, path, Value::String(token));
                    summary.fields_tokenized += 1;
                    trace.push(TraceRecord {
                        path: path.clone(),
                        rule: "tokenize".to_string(),
                        reason,
                    });
                }
            }
        }

        let outcome = TransformOutcome {
            payload: output,
            summary,
            trace,
        };

        if self.cache.len() >= self.cache_capacity {
            self.cache.clear();
        }
        self.cache.insert(cache_key, outcome.clone());
        Ok(outcome)
    }

    fn classify(&self, path: &str) -> FieldMeta {
        self.classifications
            .get(path)
            .cloned()
            .unwrap_or_else(|| FieldMeta::new(crate::transform::Classification::Public))
    }

    /// Strongest applicable rule for a field: sovereignty override, then the
    /// explicit rule table, then the consent mapping, then pass-through.
    fn decide(
        &self,
        path: &str,
        meta: &FieldMeta,
        context: &TransformContext,
    ) -> (RuleKind, String) {
        // Sovereignty override: cultural data is all-or-nothing
        if meta.has_tag(FieldTag::IndigenousCultural) || meta.has_tag(FieldTag::Sacred) {
            if self.sovereignty_authorized(meta, context) {
                return (
                    RuleKind::Pass,
                    "traditional owner authority with community match".to_string(),
                );
            }
            return (
                RuleKind::Drop,
                "cultural data requires traditional owner authority and elder approval"
                    .to_string(),
            );
        }

        if let Some(rule) = self.rules.resolve(path) {
            // Explicit sovereignty and compliance rules outrank the consent
            // mapping; consent and default table rules yield to it only when
            // the mapping is stricter than pass-through.
            match rule.source {
                RuleSource::Sovereignty | RuleSource::Compliance => {
                    return (rule.kind.clone(), rule.reason.clone());
                }
                RuleSource::Consent | RuleSource::Default => {
                    if let Some((kind, reason)) = self.consent_rule(meta, context) {
                        return (kind, reason);
                    }
                    return (rule.kind.clone(), rule.reason.clone());
                }
            }
        }

        if let Some((kind, reason)) = self.consent_rule(meta, context) {
            return (kind, reason);
        }

        (RuleKind::Pass, "no applicable rule".to_string())
    }

    fn sovereignty_authorized(&self, meta: &FieldMeta, context: &TransformContext) -> bool {
        let has_authority = context.sovereignty_level == SovereigntyLevel::TraditionalOwner
            || context.has_role("traditional_owner");
        let community_match = match (&meta.community_id, &context.community_id) {
            (Some(owner), Some(caller)) => owner == caller,
            (Some(_), None) => false,
            (None, _) => true,
        };
        has_authority && context.elder_approval && community_match
    }

    fn consent_rule(
        &self,
        meta: &FieldMeta,
        context: &TransformContext,
    ) -> Option<(RuleKind, String)> {
        let personal = meta.has_tag(FieldTag::PersonalData)
            || meta.has_tag(FieldTag::PersonalIdentifier);
        let financial = meta.has_tag(FieldTag::FinancialData)
            || meta.has_tag(FieldTag::FinancialSummary);

        match context.consent_level {
            ConsentLevel::NoConsent => {
                if personal || financial {
                    return Some((
                        RuleKind::Drop,
                        "no consent recorded for personal or financial data".to_string(),
                    ));
                }
                if meta.has_tag(FieldTag::Marketing) {
                    return Some((
                        RuleKind::Drop,
                        "no consent recorded for marketing use".to_string(),
                    ));
                }
                None
            }
            ConsentLevel::ManualOnly => {
                if meta.has_tag(FieldTag::Marketing) {
                    return Some((
                        RuleKind::Drop,
                        "manual-only consent excludes marketing fields".to_string(),
                    ));
                }
                if meta.has_tag(FieldTag::PersonalIdentifier) {
                    return Some((
                        RuleKind::Mask { show_last: 4 },
                        "manual-only consent masks personal identifiers".to_string(),
                    ));
                }
                None
            }
            ConsentLevel::PartialAutomation => {
                if meta.has_tag(FieldTag::Marketing) {
                    return Some((
                        RuleKind::Drop,
                        "partial automation excludes marketing fields".to_string(),
                    ));
                }
                if meta.has_tag(FieldTag::PersonalIdentifier) {
                    return Some((
                        RuleKind::Tokenize { key_id: None },
                        "partial automation tokenizes personal identifiers".to_string(),
                    ));
                }
                None
            }
            ConsentLevel::FullAutomation => None,
        }
    }

    /// Resolve tokenization key material, failing closed: a missing key
    /// manager, an unconfigured key id, or an unusable key aborts the
    /// transformation rather than weakening the token.
    fn resolve_token_key(&self, key_id: Option<&str>) -> Result<Vec<u8>> {
        let id = key_id
            .map(str::to_string)
            .or_else(|| self.tokenization_key_id.clone())
            .ok_or_else(|| {
                VaultError::Crypto("no tokenization key configured".to_string())
            })?;
        let manager = self.key_manager.as_ref().ok_or_else(|| {
            VaultError::Crypto(format!(
                "tokenization key '{}' requires a key manager",
                id
            ))
        })?;
        Ok(manager.get(&id)?.material)
    }

    fn cache_key(&self, payload: &Value, context: &TransformContext) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical_string(payload).as_bytes());
        hasher.update(context.digest().as_bytes());
        hasher.update(self.rules.version().to_le_bytes());
        hex::encode(hasher.finalize())
    }
}

fn tokenize_value(path: &str, value: &Value, key: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(path.as_bytes());
    mac.update(canonical_string(value).as_bytes());
    let digest = hex::encode(mac.finalize().into_bytes());
    format!("tok_{}", &digest[..32])
}

fn mask_value(value: &Value, show_last: usize) -> String {
    let rendered = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let chars: Vec<char> = rendered.chars().collect();
    if chars.len() <= show_last {
        "*".repeat(chars.len())
    } else {
        let prefix = chars.len() - show_last;
        let suffix: String = chars[prefix..].iter().collect();
        format!("{}{}", "*".repeat(prefix), suffix)
    }
}

/// Collect leaf paths in deterministic order. Objects iterate key-sorted;
/// arrays index with `[i]`.
fn flatten(prefix: &str, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&path, child, out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten(&format!("{}[{}]", prefix, index), child, out);
            }
        }
        leaf => out.push((prefix.to_string(), leaf.clone())),
    }
}

// Path segment: object key or array index
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let mut rest = part;
        if let Some(bracket) = rest.find('[') {
            if bracket > 0 {
                segments.push(Segment::Key(rest[..bracket].to_string()));
            }
            rest = &rest[bracket..];
            while let Some(close) = rest.find(']') {
                if let Ok(index) = rest[1..close].parse::<usize>() {
                    segments.push(Segment::Index(index));
                }
                rest = &rest[close + 1..];
                if !rest.starts_with('[') {
                    break;
                }
            }
        } else {
            segments.push(Segment::Key(part.to_string()));
        }
    }
    segments
}

fn set_path(root: &mut Value, path: &str, new_value: Value) {
    let segments = parse_path(path);
    let mut current = root;
    for (position, segment) in segments.iter().enumerate() {
        let last = position == segments.len() - 1;
        match segment {
            Segment::Key(key) => {
                let Some(map) = current.as_object_mut() else {
                    return;
                };
                if last {
                    map.insert(key.clone(), new_value);
                    return;
                }
                let Some(next) = map.get_mut(key) else {
                    return;
                };
                current = next;
            }
            Segment::Index(index) => {
                let Some(items) = current.as_array_mut() else {
                    return;
                };
                if last {
                    if *index < items.len() {
                        items[*index] = new_value;
                    }
                    return;
                }
                let Some(next) = items.get_mut(*index) else {
                    return;
                };
                current = next;
            }
        }
    }
}

fn remove_path(root: &mut Value, path: &str) {
    let segments = parse_path(path);
    if segments.is_empty() {
        return;
    }
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        match segment {
            Segment::Key(key) => {
                let Some(next) = current.as_object_mut().and_then(|m| m.get_mut(key)) else {
                    return;
                };
                current = next;
            }
            Segment::Index(index) => {
                let Some(next) = current.as_array_mut().and_then(|a| a.get_mut(*index)) else {
                    return;
                };
                current = next;
            }
        }
    }
    match &segments[segments.len() - 1] {
        Segment::Key(key) => {
            if let Some(map) = current.as_object_mut() {
                map.remove(key);
            }
        }
        Segment::Index(index) => {
            if let Some(items) = current.as_array_mut() {
                if *index < items.len() {
                    // Null out rather than shift sibling indices
                    items[*index] = Value::Null;
                }
            }
        }
    }
}
