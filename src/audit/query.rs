// # Audit Query
//
// Filtering, pagination, and aggregate reporting over committed entries.

use crate::audit::{AuditAction, AuditEntry, AuditResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Filter over the committed ledger. All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub target: Option<String>,
    pub user_id: Option<String>,
    pub action: Option<AuditAction>,
    pub result: Option<AuditResult>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub retention_years: Option<u32>,
    pub compliance_framework: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn result(mut self, result: AuditResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn retention(mut self, years: u32) -> Self {
        self.retention_years = Some(years);
        self
    }

    pub fn framework(mut self, framework: impl Into<String>) -> Self {
        self.compliance_framework = Some(framework.into());
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(ref target) = self.target {
            if &entry.target != target {
                return false;
            }
        }
        if let Some(ref user_id) = self.user_id {
            if &entry.user_id != user_id {
                return false;
            }
        }
        if let Some(ref action) = self.action {
            if &entry.action != action {
                return false;
            }
        }
        if let Some(result) = self.result {
            if entry.result != result {
                return false;
            }
        }
        if let Some(from) = self.from {
            if entry.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if entry.timestamp > to {
                return false;
            }
        }
        if let Some(retention) = self.retention_years {
            if entry.retention_years != retention {
                return false;
            }
        }
        if let Some(ref framework) = self.compliance_framework {
            if !entry_frameworks(entry).iter().any(|f| f == framework) {
                return false;
            }
        }
        true
    }
}

fn entry_frameworks(entry: &AuditEntry) -> Vec<String> {
    entry
        .details
        .get("complianceFrameworks")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Aggregate counts for compliance reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStats {
    pub total: usize,
    pub by_action: HashMap<String, usize>,
    pub by_result: HashMap<String, usize>,
    pub by_user: HashMap<String, usize>,
    pub by_retention: HashMap<u32, usize>,
    pub failures: usize,
}

impl AuditStats {
    pub fn aggregate<'a>(entries: impl Iterator<Item = &'a AuditEntry>) -> Self {
        let mut stats = AuditStats::default();
        for entry in entries {
            stats.total += 1;
            *stats
                .by_action
                .entry(entry.action.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_result
                .entry(format!("{:?}", entry.result).to_uppercase())
                .or_insert(0) += 1;
            *stats.by_user.entry(entry.user_id.clone()).or_insert(0) += 1;
            *stats.by_retention.entry(entry.retention_years).or_insert(0) += 1;
            if entry.result == AuditResult::Failure {
                stats.failures += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ledger::AuditLedger;
    use crate::audit::AuditMeta;
    use serde_json::json;

    fn populated_ledger() -> AuditLedger {
        let ledger = AuditLedger::new(b"test-integrity-key-32-bytes-long".to_vec());
        ledger
            .record(
                "alice",
                AuditAction::EvaluatePolicy,
                "payments",
                json!({"complianceFrameworks": ["AUSTRAC"]}),
                AuditResult::Success,
                AuditMeta::default(),
            )
            .unwrap();
        ledger
            .record(
                "bob",
                AuditAction::EvaluatePolicy,
                "payments",
                json!({}),
                AuditResult::Failure,
                AuditMeta::default(),
            )
            .unwrap();
        ledger
            .record(
                "alice",
                AuditAction::DeployPolicy,
                "spend-limit",
                json!({}),
                AuditResult::Success,
                AuditMeta::default(),
            )
            .unwrap();
        ledger
    }

    #[test]
    fn test_filter_by_user_and_action() {
        let ledger = populated_ledger();
        let results = ledger.query(
            &AuditQuery::new()
                .user("alice")
                .action(AuditAction::EvaluatePolicy),
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].user_id, "alice");
    }

    #[test]
    fn test_filter_by_result() {
        let ledger = populated_ledger();
        let failures = ledger.query(&AuditQuery::new().result(AuditResult::Failure));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].user_id, "bob");
    }

    #[test]
    fn test_filter_by_framework() {
        let ledger = populated_ledger();
        let regulated = ledger.query(&AuditQuery::new().framework("AUSTRAC"));
        assert_eq!(regulated.len(), 1);
        assert_eq!(regulated[0].retention_years, 10);
    }

    #[test]
    fn test_pagination() {
        let ledger = populated_ledger();
        let page = ledger.query(&AuditQuery::new().page(1, 1));
        assert_eq!(page.len(), 1);
        let all = ledger.query(&AuditQuery::new());
        assert_eq!(page[0].id, all[1].id);
    }

    #[test]
    fn test_stats() {
        let ledger = populated_ledger();
        let stats = ledger.stats(
            Utc::now() - chrono::Duration::hours(1),
            Utc::now() + chrono::Duration::hours(1),
        );
        assert_eq!(stats.total, 3);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.by_action["EVALUATE_POLICY"], 2);
        assert_eq!(stats.by_user["alice"], 2);
    }
}
