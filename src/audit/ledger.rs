// # Audit Ledger
//
// Append-only, hash-chained event log. Appends are globally serialized so
// the chain has a total order; readers see committed entries only. The
// integrity hash is keyed, so an attacker without the integrity key cannot
// forge a consistent chain.

use crate::audit::canonical::{canonical_bytes, truncate_to_millis};
use crate::audit::query::{AuditQuery, AuditStats};
use crate::audit::{classify_retention, AuditAction, AuditEntry, AuditMeta, AuditResult};
use crate::error::{Result, VaultError};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use sha2::Sha256;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Chain anchor for the first entry.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Subscriber notified of security-relevant failures and tamper detection.
pub trait AlertSubscriber: Send + Sync {
    fn on_alert(&self, entry: &AuditEntry);
}

/// The tamper-evident audit ledger.
pub struct AuditLedger {
    // Committed entries, chain order
    entries: RwLock<Vec<AuditEntry>>,
    // Serializes appends; the chain tail lives under this lock
    append_lock: Mutex<String>,
    // Keyed hash material, owned by the key manager
    integrity_key: Vec<u8>,
    // Optional JSONL persistence target
    log_path: Option<PathBuf>,
    // Set when chain corruption is detected; blocks further appends
    halted: AtomicBool,
    // Active preservation holds from rollback plans
    preservation_holds: AtomicUsize,
    alert_subscribers: RwLock<Vec<Arc<dyn AlertSubscriber>>>,
}

impl AuditLedger {
    /// Create an in-memory ledger sealed by `integrity_key`.
    pub fn new(integrity_key: Vec<u8>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            append_lock: Mutex::new(GENESIS_HASH.to_string()),
            integrity_key,
            log_path: None,
            halted: AtomicBool::new(false),
            preservation_holds: AtomicUsize::new(0),
            alert_subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Create a ledger that also appends each entry to a JSONL file.
    pub fn with_log_file(integrity_key: Vec<u8>, log_path: PathBuf) -> Result<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VaultError::Storage(format!("create audit dir: {}", e)))?;
        }
        let mut ledger = Self::new(integrity_key);
        ledger.log_path = Some(log_path);
        Ok(ledger)
    }

    pub fn subscribe(&self, subscriber: Arc<dyn AlertSubscriber>) {
        self.alert_subscribers.write().push(subscriber);
    }

    /// Append an entry and return its id.
    ///
    /// Retention is classified here from the details content; compliance
    /// frameworks are read from a `complianceFrameworks` array when present.
    pub fn record(
        &self,
        user_id: &str,
        action: AuditAction,
        target: &str,
        details: Value,
        result: AuditResult,
        metadata: AuditMeta,
    ) -> Result<String> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(VaultError::Storage(
                "audit ledger halted after integrity failure".to_string(),
            ));
        }

        let frameworks = extract_frameworks(&details);
        let retention_years = classify_retention(&details, &frameworks);

        // The tail hash is owned by the append lock; holding it for the
        // whole append gives the chain its total order.
        let mut tail = self.append_lock.lock();

        let mut entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: truncate_to_millis(Utc::now()),
            user_id: user_id.to_string(),
            action,
            target: target.to_string(),
            result,
            details,
            metadata,
            retention_years,
            prev_hash: tail.clone(),
            integrity_hash: String::new(),
        };
        entry.integrity_hash = self.compute_integrity_hash(&entry)?;

        if let Some(ref path) = self.log_path {
            self.append_to_file(path, &entry)?;
        }

        *tail = entry.integrity_hash.clone();
        let entry_id = entry.id.clone();

        if entry.result == AuditResult::Failure {
            self.notify_alert(&entry);
        }

        tracing::debug!(
            action = entry.action.as_str(),
            target = %entry.target,
            result = ?entry.result,
            retention_years = entry.retention_years,
            "audit entry recorded"
        );

        self.entries.write().push(entry);
        Ok(entry_id)
    }

    /// Recompute the integrity hash of a single entry against its stored
    /// previous hash.
    pub fn verify(&self, entry_id: &str) -> Result<bool> {
        let entries = self.entries.read();
        let entry = entries
            .iter()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| VaultError::NotFound(format!("audit entry {}", entry_id)))?;
        let expected = self.compute_integrity_hash(entry)?;
        Ok(expected == entry.integrity_hash)
    }

    /// Walk from the named entry back to genesis, verifying every hash and
    /// every chain link on the way.
    pub fn verify_chain(&self, entry_id: &str) -> Result<bool> {
        let entries = self.entries.read();
        let position = entries
            .iter()
            .position(|e| e.id == entry_id)
            .ok_or_else(|| VaultError::NotFound(format!("audit entry {}", entry_id)))?;

        let mut expected_prev = GENESIS_HASH.to_string();
        for entry in entries.iter().take(position + 1) {
            if entry.prev_hash != expected_prev {
                return Ok(false);
            }
            if self.compute_integrity_hash(entry)? != entry.integrity_hash {
                return Ok(false);
            }
            expected_prev = entry.integrity_hash.clone();
        }
        Ok(true)
    }

    /// Verify the entire chain. Corruption halts the ledger.
    pub fn verify_all(&self) -> Result<bool> {
        let last_id = match self.entries.read().last() {
            Some(entry) => entry.id.clone(),
            None => return Ok(true),
        };
        let intact = self.verify_chain(&last_id)?;
        if !intact {
            self.halt();
        }
        Ok(intact)
    }

    /// Halt appends; administrative surfaces go read-only until repaired.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        tracing::error!("audit chain integrity failure, ledger halted");
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Query committed entries with filters and pagination.
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let entries = self.entries.read();
        let mut matched: Vec<AuditEntry> = entries
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        if let Some(offset) = query.offset {
            matched = matched.into_iter().skip(offset).collect();
        }
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        matched
    }

    /// Aggregate counts for a date range.
    pub fn stats(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> AuditStats {
        let entries = self.entries.read();
        AuditStats::aggregate(entries.iter().filter(|e| {
            e.timestamp >= from && e.timestamp <= to
        }))
    }

    /// Take a preservation hold on behalf of an active rollback plan.
    pub fn take_preservation_hold(&self) {
        self.preservation_holds.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release_preservation_hold(&self) {
        self.preservation_holds.fetch_sub(1, Ordering::SeqCst);
    }

    /// Delete entries past their retention class. Returns the number purged,
    /// or zero while any rollback plan holds the trail.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        if self.preservation_holds.load(Ordering::SeqCst) > 0 {
            tracing::info!("audit purge skipped, preservation hold active");
            return 0;
        }
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| {
            let expiry = e.timestamp + Duration::days(365 * e.retention_years as i64);
            expiry > now
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn get(&self, entry_id: &str) -> Option<AuditEntry> {
        self.entries.read().iter().find(|e| e.id == entry_id).cloned()
    }

    pub fn last(&self) -> Option<AuditEntry> {
        self.entries.read().last().cloned()
    }

    /// Test hook for tamper scenarios: mutate a committed entry in place.
    #[doc(hidden)]
    pub fn mutate_entry_for_test(&self, entry_id: &str, f: impl FnOnce(&mut AuditEntry)) -> bool {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|e| e.id == entry_id) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    fn compute_integrity_hash(&self, entry: &AuditEntry) -> Result<String> {
        let mut value = serde_json::to_value(entry)?;
        if let Value::Object(ref mut map) = value {
            map.remove("integrity_hash");
        }
        let mut mac = HmacSha256::new_from_slice(&self.integrity_key)
            .map_err(|e| VaultError::Crypto(format!("integrity key rejected: {}", e)))?;
        mac.update(&canonical_bytes(&value));
        mac.update(entry.prev_hash.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn append_to_file(&self, path: &PathBuf, entry: &AuditEntry) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| VaultError::Storage(format!("open audit log: {}", e)))?;
        writeln!(file, "{}", json)
            .map_err(|e| VaultError::Storage(format!("write audit log: {}", e)))?;
        Ok(())
    }

    fn notify_alert(&self, entry: &AuditEntry) {
        for subscriber in self.alert_subscribers.read().iter() {
            subscriber.on_alert(entry);
        }
    }
}

fn extract_frameworks(details: &Value) -> Vec<String> {
    details
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
