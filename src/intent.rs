// # Intents and Decisions
//
// An `Intent` is the structured description of a requested action plus its
// context. It is built by the caller, validated on submission, consumed once
// by the decision point, and discarded. A `Decision` is the tagged outcome
// with its evidence.

use crate::error::{Result, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Operation requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    ViewBalance,
    CreatePayment,
    GenerateReport,
    ViewTransactions,
    ExportData,
    ModifyPolicy,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ViewBalance => "VIEW_BALANCE",
            Operation::CreatePayment => "CREATE_PAYMENT",
            Operation::GenerateReport => "GENERATE_REPORT",
            Operation::ViewTransactions => "VIEW_TRANSACTIONS",
            Operation::ExportData => "EXPORT_DATA",
            Operation::ModifyPolicy => "MODIFY_POLICY",
        }
    }
}

/// Caller identity and authentication state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub id: String,
    pub roles: Vec<String>,
    pub consent_levels: Vec<String>,
    pub auth_verified: bool,
    pub mfa: bool,
    pub location: Option<String>,
    pub network: Option<String>,
}

impl UserContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
            consent_levels: Vec::new(),
            auth_verified: false,
            mfa: false,
            location: None,
            network: None,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Indigenous data context attached to an intent.
///
/// When present, the traditional-owner set must be non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndigenousDataContext {
    pub traditional_owners: Vec<String>,
    pub community_id: Option<String>,
    pub cultural_sensitivity: Option<String>,
}

/// Financial details of the requested action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialDetails {
    pub amount: f64,
    pub currency: String,
    pub categories: Vec<String>,
    pub sensitivity: String,
    pub contains_personal_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indigenous_data: Option<IndigenousDataContext>,
}

/// Request transport metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMeta {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub session_id: String,
    pub endpoint: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

/// Compliance posture declared with the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceMeta {
    pub privacy_act: bool,
    pub data_residency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indigenous_protocols: Option<bool>,
}

/// A requested action with its full evaluation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub id: String,
    pub operation: Operation,
    pub user: UserContext,
    pub financial: FinancialDetails,
    pub request: RequestMeta,
    pub compliance: ComplianceMeta,
}

impl Intent {
    /// Validate structural invariants before evaluation.
    ///
    /// Amount must be non-negative, the currency an ISO-4217 code, and an
    /// indigenous data context must carry at least one traditional owner.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(VaultError::InvalidInput("intent id is empty".to_string()));
        }
        if self.financial.amount < 0.0 || !self.financial.amount.is_finite() {
            return Err(VaultError::InvalidInput(format!(
                "amount must be non-negative, got {}",
                self.financial.amount
            )));
        }
        let currency = &self.financial.currency;
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(VaultError::InvalidInput(format!(
                "currency must be an ISO-4217 code, got '{}'",
                currency
            )));
        }
        if let Some(ref indigenous) = self.financial.indigenous_data {
            if indigenous.traditional_owners.is_empty() {
                return Err(VaultError::InvalidInput(
                    "indigenous data requires a non-empty traditional-owner set".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Whether this intent touches indigenous data.
    pub fn touches_indigenous_data(&self) -> bool {
        self.financial.indigenous_data.is_some()
    }

    /// Render the intent as a JSON value for rule-path addressing.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(VaultError::from)
    }
}

/// A condition attached to a conditional decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionCondition {
    pub kind: String,
    pub description: String,
}

/// An obligation the caller must discharge after an allow/conditional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obligation {
    pub kind: String,
    pub parameters: HashMap<String, Value>,
}

/// Evaluation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Outcome {
    Allow,
    Deny { reason: String },
    Conditional { conditions: Vec<DecisionCondition> },
}

impl Outcome {
    pub fn is_deny(&self) -> bool {
        matches!(self, Outcome::Deny { .. })
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Outcome::Allow)
    }
}

/// Timing and cache evidence attached to a decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionMetrics {
    pub evaluation_time_micros: u64,
    pub cache_hit: bool,
}

/// The decision point's answer for a single intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub outcome: Outcome,
    pub evaluated_policies: Vec<String>,
    pub obligations: Vec<Obligation>,
    pub metrics: DecisionMetrics,
}

impl Decision {
    pub fn allow(evaluated_policies: Vec<String>) -> Self {
        Self {
            outcome: Outcome::Allow,
            evaluated_policies,
            obligations: Vec::new(),
            metrics: DecisionMetrics::default(),
        }
    }

    pub fn deny(reason: impl Into<String>, evaluated_policies: Vec<String>) -> Self {
        Self {
            outcome: Outcome::Deny {
                reason: reason.into(),
            },
            evaluated_policies,
            obligations: Vec::new(),
            metrics: DecisionMetrics::default(),
        }
    }

    /// Validate the outcome invariants: deny carries a reason, conditional
    /// carries at least one condition.
    pub fn validate(&self) -> Result<()> {
        match &self.outcome {
            Outcome::Deny { reason } if reason.is_empty() => Err(VaultError::InvalidInput(
                "deny decision requires a reason".to_string(),
            )),
            Outcome::Conditional { conditions } if conditions.is_empty() => {
                Err(VaultError::InvalidInput(
                    "conditional decision requires conditions".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}
