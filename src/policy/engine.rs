// # Policy Decision Point
//
// Evaluates intents against the active policy set. Evaluation is fail
// closed: any fault becomes a deny with reason "evaluation_error" rather
// than an error surfaced to the caller. Every call emits exactly one
// EVALUATE_POLICY audit entry.

use crate::audit::{AuditAction, AuditLedger, AuditMeta, AuditResult};
use crate::error::{Result, VaultError};
use crate::intent::{Decision, DecisionCondition, Intent, Obligation, Outcome};
use crate::policy::{Enforcement, PolicyRuleKind, PolicyVersion, PolicyVersionStore};
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CacheEntry {
    decision: Decision,
    inserted_at: Instant,
    generation: u64,
}

/// The decision point.
pub struct PolicyDecisionPoint {
    store: Arc<PolicyVersionStore>,
    audit: Arc<AuditLedger>,
    cache: DashMap<String, CacheEntry>,
    cache_ttl: Duration,
    cache_capacity: usize,
}

// Outcome of one policy before aggregation
enum PolicyOutcome {
    Allow,
    Deny { reason: String },
    Conditional {
        conditions: Vec<DecisionCondition>,
        obligations: Vec<Obligation>,
    },
}

impl PolicyDecisionPoint {
    pub fn new(store: Arc<PolicyVersionStore>, audit: Arc<AuditLedger>) -> Self {
        Self {
            store,
            audit,
            cache: DashMap::new(),
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 4096,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Evaluate an intent against named policies, or against every ACTIVE
    /// policy in scope for the operation when no names are given.
    ///
    /// Never returns an error: faults are denied with reason
    /// "evaluation_error" and audited as failures.
    pub fn evaluate(&self, intent: &Intent, policy_names: &[String]) -> Decision {
        let started = Instant::now();
        let generation = self.store.activation_generation();

        let mut decision = match self.try_evaluate(intent, policy_names, generation, started) {
            Ok(decision) => decision,
            Err(error) => {
                tracing::warn!(error = %error, intent = %intent.id, "evaluation fault, failing closed");
                let mut denied = Decision::deny("evaluation_error", Vec::new());
                denied.metrics.evaluation_time_micros = started.elapsed().as_micros().max(1) as u64;
                denied
            }
        };
        if decision.metrics.evaluation_time_micros == 0 {
            decision.metrics.evaluation_time_micros = started.elapsed().as_micros().max(1) as u64;
        }

        self.audit_decision(intent, &decision);
        decision
    }

    /// Drop every cached decision. Rollback execution calls this in its
    /// cache-clearing phase.
    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    fn try_evaluate(
        &self,
        intent: &Intent,
        policy_names: &[String],
        generation: u64,
        started: Instant,
    ) -> Result<Decision> {
        intent.validate()?;
        let policies = self.load_policies(intent, policy_names)?;

        let cache_key = self.cache_key(intent, &policies, generation)?;
        if let Some(entry) = self.cache.get(&cache_key) {
            if entry.generation == generation && entry.inserted_at.elapsed() < self.cache_ttl {
                let mut decision = entry.decision.clone();
                decision.metrics.cache_hit = true;
                decision.metrics.evaluation_time_micros = started.elapsed().as_micros() as u64;
                return Ok(decision);
            }
            drop(entry);
            self.cache.remove(&cache_key);
        }

        let decision = self.evaluate_policies(intent, &policies)?;

        if self.cache.len() >= self.cache_capacity {
            self.cache.clear();
        }
        self.cache.insert(
            cache_key,
            CacheEntry {
                decision: decision.clone(),
                inserted_at: Instant::now(),
                generation,
            },
        );
        Ok(decision)
    }

    fn load_policies(
        &self,
        intent: &Intent,
        policy_names: &[String],
    ) -> Result<Vec<PolicyVersion>> {
        let mut policies = if policy_names.is_empty() {
            self.store
                .list_active()
                .into_iter()
                .filter(|p| p.in_scope(intent.operation.as_str()))
                .collect::<Vec<_>>()
        } else {
            let mut named = Vec::with_capacity(policy_names.len());
            for name in policy_names {
                let active = self.store.get_active(name).ok_or_else(|| {
                    VaultError::NotFound(format!("no active version for policy {}", name))
                })?;
                named.push(active);
            }
            named
        };

        // Priority first, policy id breaks ties
        policies.sort_by(|a, b| {
            b.content
                .config
                .priority
                .cmp(&a.content.config.priority)
                .then_with(|| a.policy_id.cmp(&b.policy_id))
        });
        Ok(policies)
    }

    fn evaluate_policies(
        &self,
        intent: &Intent,
        policies: &[PolicyVersion],
    ) -> Result<Decision> {
        let intent_value = intent.to_value()?;
        let evaluated: Vec<String> = policies
            .iter()
            .map(|p| format!("{}@{}", p.policy_id, p.version))
            .collect();

        let mut conditions: Vec<DecisionCondition> = Vec::new();
        let mut obligations: Vec<Obligation> = Vec::new();

        for policy in policies {
            match evaluate_policy(policy, &intent_value)? {
                PolicyOutcome::Allow => {}
                PolicyOutcome::Deny { reason } => match policy.content.config.enforcement {
                    Enforcement::Blocking => {
                        return Ok(Decision::deny(
                            format!("{}: {}", policy.policy_id, reason),
                            evaluated,
                        ));
                    }
                    // Non-blocking denials surface as conditions
                    Enforcement::Warning | Enforcement::Advisory => {
                        conditions.push(DecisionCondition {
                            kind: "warning".to_string(),
                            description: format!("{}: {}", policy.policy_id, reason),
                        });
                    }
                },
                PolicyOutcome::Conditional {
                    conditions: more_conditions,
                    obligations: more_obligations,
                } => {
                    conditions.extend(more_conditions);
                    obligations.extend(more_obligations);
                }
            }
        }

        let decision = if conditions.is_empty() {
            let mut allow = Decision::allow(evaluated);
            allow.obligations = obligations;
            allow
        } else {
            Decision {
                outcome: Outcome::Conditional { conditions },
                evaluated_policies: evaluated,
                obligations,
                metrics: Default::default(),
            }
        };
        Ok(decision)
    }

    fn cache_key(
        &self,
        intent: &Intent,
        policies: &[PolicyVersion],
        generation: u64,
    ) -> Result<String> {
        let intent_value = intent.to_value()?;
        let mut hasher = Sha256::new();
        hasher.update(crate::audit::canonical_string(&intent_value).as_bytes());
        for policy in policies {
            hasher.update(policy.policy_id.as_bytes());
            hasher.update(policy.version.as_bytes());
            hasher.update(policy.hash.as_bytes());
        }
        hasher.update(generation.to_le_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    fn audit_decision(&self, intent: &Intent, decision: &Decision) {
        let result = match decision.outcome {
            Outcome::Allow | Outcome::Conditional { .. } => AuditResult::Success,
            Outcome::Deny { .. } => AuditResult::Failure,
        };

        let mut details = serde_json::json!({
            "operation": intent.operation.as_str(),
            "policies": decision.evaluated_policies,
            "evaluationTimeMicros": decision.metrics.evaluation_time_micros,
            "cacheHit": decision.metrics.cache_hit,
        });
        if let Outcome::Deny { ref reason } = decision.outcome {
            details["reason"] = Value::String(reason.clone());
        }
        // Indigenous intents carry their markers into the entry so the
        // ledger assigns the 50-year retention class.
        if let Some(ref indigenous) = intent.financial.indigenous_data {
            details["traditionalOwners"] =
                serde_json::to_value(&indigenous.traditional_owners).unwrap_or(Value::Null);
        }
        if intent.compliance.privacy_act {
            details["complianceFrameworks"] = serde_json::json!(["Privacy Act"]);
        }

        let _ = self.audit.record(
            &intent.user.id,
            AuditAction::EvaluatePolicy,
            intent.operation.as_str(),
            details,
            result,
            AuditMeta {
                session_id: intent.request.session_id.clone(),
                request_id: intent.request.request_id.clone(),
                ip_address: String::new(),
            },
        );
    }
}

// First deny rule wins; a failed Allow requirement denies; Conditional rules
// accumulate.
fn evaluate_policy(policy: &PolicyVersion, intent_value: &Value) -> Result<PolicyOutcome> {
    let mut conditions = Vec::new();
    let mut obligations = Vec::new();

    for rule in &policy.content.rules {
        let matched = rule.condition.evaluate(intent_value)?;
        match rule.kind {
            PolicyRuleKind::Deny => {
                if matched {
                    return Ok(PolicyOutcome::Deny {
                        reason: rule.reason.clone(),
                    });
                }
            }
            PolicyRuleKind::Allow => {
                if !matched {
                    return Ok(PolicyOutcome::Deny {
                        reason: rule.reason.clone(),
                    });
                }
            }
            PolicyRuleKind::Conditional => {
                if matched {
                    conditions.extend(rule.conditions.clone());
                    obligations.extend(rule.obligations.clone());
                }
            }
        }
    }

    if conditions.is_empty() && obligations.is_empty() {
        Ok(PolicyOutcome::Allow)
    } else {
        Ok(PolicyOutcome::Conditional {
            conditions,
            obligations,
        })
    }
}
