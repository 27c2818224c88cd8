// # Transformation Rules
//
// The rule table maps field-path patterns to transformation kinds, each rule
// carrying the source that gives it precedence. Resolution picks the
// strongest applicable rule: sovereignty > compliance > consent > default.

use crate::error::{Result, VaultError};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// What a rule does to a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RuleKind {
    /// Replace the value with a fixed marker.
    Redact,
    /// Replace the value with a deterministic keyed token.
    Tokenize { key_id: Option<String> },
    /// Keep only the last `show_last` characters.
    Mask { show_last: usize },
    /// Remove the field from the output entirely.
    Drop,
    /// Release the field unchanged.
    Pass,
}

/// Where a rule comes from, in descending precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    Default,
    Consent,
    Compliance,
    Sovereignty,
}

/// One entry in the rule table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformRule {
    /// Regex over dot-separated field paths.
    pub path_pattern: String,
    pub kind: RuleKind,
    pub source: RuleSource,
    pub reason: String,
}

impl TransformRule {
    pub fn new(
        path_pattern: impl Into<String>,
        kind: RuleKind,
        source: RuleSource,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            path_pattern: path_pattern.into(),
            kind,
            source,
            reason: reason.into(),
        }
    }
}

// Compiled rule, pattern validated at table build time
struct CompiledRule {
    pattern: Regex,
    rule: TransformRule,
    index: usize,
}

/// Ordered rule table with precedence resolution.
pub struct RuleTable {
    compiled: Vec<CompiledRule>,
    /// Version folded into cache digests; bump on any rule change.
    version: u64,
}

impl RuleTable {
    pub fn new(rules: Vec<TransformRule>) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for (index, rule) in rules.into_iter().enumerate() {
            let pattern = Regex::new(&rule.path_pattern).map_err(|e| {
                VaultError::InvalidInput(format!(
                    "invalid rule pattern '{}': {}",
                    rule.path_pattern, e
                ))
            })?;
            compiled.push(CompiledRule {
                pattern,
                rule,
                index,
            });
        }
        Ok(Self {
            compiled,
            version: 1,
        })
    }

    pub fn empty() -> Self {
        Self {
            compiled: Vec::new(),
            version: 1,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Strongest applicable rule for a path: highest source precedence,
    /// ties broken by table order.
    pub fn resolve(&self, path: &str) -> Option<&TransformRule> {
        self.compiled
            .iter()
            .filter(|c| c.pattern.is_match(path))
            .max_by(|a, b| {
                a.rule
                    .source
                    .cmp(&b.rule.source)
                    // Earlier rules win ties
                    .then(b.index.cmp(&a.index))
            })
            .map(|c| &c.rule)
    }

    /// Rules from one source that apply to a path, in table order.
    pub fn applicable_from(&self, path: &str, source: RuleSource) -> Vec<&TransformRule> {
        self.compiled
            .iter()
            .filter(|c| c.rule.source == source && c.pattern.is_match(path))
            .map(|c| &c.rule)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RuleTable {
        RuleTable::new(vec![
            TransformRule::new(
                r"^customer\.ssn$",
                RuleKind::Mask { show_last: 4 },
                RuleSource::Default,
                "default identifier masking",
            ),
            TransformRule::new(
                r"^customer\.",
                RuleKind::Redact,
                RuleSource::Compliance,
                "privacy act hold",
            ),
            TransformRule::new(
                r"^customer\.heritage$",
                RuleKind::Drop,
                RuleSource::Sovereignty,
                "cultural custody",
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_sovereignty_beats_compliance() {
        let table = table();
        let rule = table.resolve("customer.heritage").unwrap();
        assert_eq!(rule.kind, RuleKind::Drop);
        assert_eq!(rule.source, RuleSource::Sovereignty);
    }

    #[test]
    fn test_compliance_beats_default() {
        let table = table();
        let rule = table.resolve("customer.ssn").unwrap();
        assert_eq!(rule.kind, RuleKind::Redact);
    }

    #[test]
    fn test_no_match() {
        let table = table();
        assert!(table.resolve("account.balance").is_none());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = RuleTable::new(vec![TransformRule::new(
            "([unclosed",
            RuleKind::Pass,
            RuleSource::Default,
            "broken",
        )]);
        assert!(result.is_err());
    }

    #[test]
    fn test_tie_broken_by_table_order() {
        let table = RuleTable::new(vec![
            TransformRule::new(
                r"^a\.",
                RuleKind::Redact,
                RuleSource::Consent,
                "first",
            ),
            TransformRule::new(
                r"^a\.b$",
                RuleKind::Drop,
                RuleSource::Consent,
                "second",
            ),
        ])
        .unwrap();
        let rule = table.resolve("a.b").unwrap();
        assert_eq!(rule.kind, RuleKind::Redact);
    }
}
