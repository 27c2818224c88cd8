// # Consent Registry
//
// Graded consent records per (user, purpose). Exactly one active record per
// pair; granting a new record withdraws the previous one. Community key
// custody and automated-processing gates both resolve through this registry.

use crate::error::{Result, VaultError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Graded user permission for automated processing.
///
/// Ordering is significant: a stricter level never releases more than a
/// looser one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsentLevel {
    NoConsent,
    ManualOnly,
    PartialAutomation,
    FullAutomation,
}

/// How consent was collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentMethod {
    Explicit,
    Implied,
    OptIn,
    OptOut,
    ParentalExplicit,
    TraditionalOwnerAuthority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentStatus {
    Active,
    Withdrawn,
    Expired,
}

/// A single consent grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub id: String,
    pub user_id: String,
    pub purpose: String,
    pub level: ConsentLevel,
    pub scope: Vec<String>,
    pub granted_at: DateTime<Utc>,
    pub withdrawn_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ConsentStatus,
    pub lawful_basis: Vec<String>,
    pub method: ConsentMethod,
}

impl ConsentRecord {
    /// Effective status at `now`, accounting for expiry.
    pub fn status_at(&self, now: DateTime<Utc>) -> ConsentStatus {
        if self.status == ConsentStatus::Withdrawn {
            return ConsentStatus::Withdrawn;
        }
        match self.expires_at {
            Some(expiry) if expiry <= now => ConsentStatus::Expired,
            _ => self.status,
        }
    }
}

/// Registry of consent records, keyed by (user, purpose).
///
/// History is retained; only the newest record per pair can be active.
pub struct ConsentRegistry {
    records: RwLock<HashMap<(String, String), Vec<ConsentRecord>>>,
}

impl ConsentRegistry {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Grant consent, withdrawing any prior active record for the pair.
    pub fn grant(
        &self,
        user_id: &str,
        purpose: &str,
        level: ConsentLevel,
        method: ConsentMethod,
        expires_at: Option<DateTime<Utc>>,
    ) -> ConsentRecord {
        let now = Utc::now();
        let record = ConsentRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            purpose: purpose.to_string(),
            level,
            scope: Vec::new(),
            granted_at: now,
            withdrawn_at: None,
            expires_at,
            status: ConsentStatus::Active,
            lawful_basis: Vec::new(),
            method,
        };

        let key = (user_id.to_string(), purpose.to_string());
        let mut records = self.records.write();
        let history = records.entry(key).or_default();
        for prior in history.iter_mut() {
            if prior.status == ConsentStatus::Active {
                prior.status = ConsentStatus::Withdrawn;
                prior.withdrawn_at = Some(now);
            }
        }
        history.push(record.clone());
        record
    }

    /// Withdraw the active record for (user, purpose), if any.
    pub fn withdraw(&self, user_id: &str, purpose: &str) -> Result<()> {
        let key = (user_id.to_string(), purpose.to_string());
        let mut records = self.records.write();
        let history = records
            .get_mut(&key)
            .ok_or_else(|| VaultError::NotFound(format!("no consent for {}/{}", user_id, purpose)))?;

        let now = Utc::now();
        let mut withdrew = false;
        for record in history.iter_mut() {
            if record.status_at(now) == ConsentStatus::Active {
                record.status = ConsentStatus::Withdrawn;
                record.withdrawn_at = Some(now);
                withdrew = true;
            }
        }
        if withdrew {
            Ok(())
        } else {
            Err(VaultError::NotFound(format!(
                "no active consent for {}/{}",
                user_id, purpose
            )))
        }
    }

    /// The active record for (user, purpose), if one exists and is unexpired.
    pub fn active(&self, user_id: &str, purpose: &str) -> Option<ConsentRecord> {
        let key = (user_id.to_string(), purpose.to_string());
        let now = Utc::now();
        self.records.read().get(&key).and_then(|history| {
            history
                .iter()
                .find(|r| r.status_at(now) == ConsentStatus::Active)
                .cloned()
        })
    }

    /// Effective consent level for (user, purpose). No record means no consent.
    pub fn level(&self, user_id: &str, purpose: &str) -> ConsentLevel {
        self.active(user_id, purpose)
            .map(|r| r.level)
            .unwrap_or(ConsentLevel::NoConsent)
    }

    /// Require at least `minimum` consent for (user, purpose).
    pub fn require(&self, user_id: &str, purpose: &str, minimum: ConsentLevel) -> Result<()> {
        let effective = self.level(user_id, purpose);
        if effective >= minimum {
            Ok(())
        } else {
            Err(VaultError::ConsentInsufficient(format!(
                "purpose '{}' requires {:?}, user '{}' holds {:?}",
                purpose, minimum, user_id, effective
            )))
        }
    }

    /// Whether a community has recorded custody consent for its keys.
    pub fn community_key_custody(&self, community_id: &str) -> bool {
        self.active(community_id, "key_custody")
            .map(|r| r.method == ConsentMethod::TraditionalOwnerAuthority)
            .unwrap_or(false)
    }

    /// Full history for a pair, newest last.
    pub fn history(&self, user_id: &str, purpose: &str) -> Vec<ConsentRecord> {
        let key = (user_id.to_string(), purpose.to_string());
        self.records.read().get(&key).cloned().unwrap_or_default()
    }
}

impl Default for ConsentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_grant_and_level() {
        let registry = ConsentRegistry::new();
        assert_eq!(registry.level("u1", "marketing"), ConsentLevel::NoConsent);

        registry.grant(
            "u1",
            "marketing",
            ConsentLevel::FullAutomation,
            ConsentMethod::Explicit,
            None,
        );
        assert_eq!(
            registry.level("u1", "marketing"),
            ConsentLevel::FullAutomation
        );
    }

    #[test]
    fn test_single_active_record_per_pair() {
        let registry = ConsentRegistry::new();
        registry.grant(
            "u1",
            "marketing",
            ConsentLevel::ManualOnly,
            ConsentMethod::OptIn,
            None,
        );
        registry.grant(
            "u1",
            "marketing",
            ConsentLevel::FullAutomation,
            ConsentMethod::Explicit,
            None,
        );

        let history = registry.history("u1", "marketing");
        assert_eq!(history.len(), 2);
        let active: Vec<_> = history
            .iter()
            .filter(|r| r.status == ConsentStatus::Active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].level, ConsentLevel::FullAutomation);
    }

    #[test]
    fn test_withdrawal_blocks_requirement() {
        let registry = ConsentRegistry::new();
        registry.grant(
            "u1",
            "marketing",
            ConsentLevel::FullAutomation,
            ConsentMethod::Explicit,
            None,
        );
        assert!(registry
            .require("u1", "marketing", ConsentLevel::FullAutomation)
            .is_ok());

        registry.withdraw("u1", "marketing").unwrap();
        let err = registry
            .require("u1", "marketing", ConsentLevel::FullAutomation)
            .unwrap_err();
        assert!(matches!(err, VaultError::ConsentInsufficient(_)));
    }

    #[test]
    fn test_expiry() {
        let registry = ConsentRegistry::new();
        registry.grant(
            "u1",
            "reports",
            ConsentLevel::PartialAutomation,
            ConsentMethod::OptIn,
            Some(Utc::now() - Duration::hours(1)),
        );
        assert_eq!(registry.level("u1", "reports"), ConsentLevel::NoConsent);
    }

    #[test]
    fn test_community_key_custody() {
        let registry = ConsentRegistry::new();
        assert!(!registry.community_key_custody("community-1"));

        registry.grant(
            "community-1",
            "key_custody",
            ConsentLevel::FullAutomation,
            ConsentMethod::TraditionalOwnerAuthority,
            None,
        );
        assert!(registry.community_key_custody("community-1"));
    }
}
