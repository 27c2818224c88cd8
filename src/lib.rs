// PolicyVault - policy, audit, and key-management core for a financial
// intelligence platform.
//
// Five subsystems composed by `VaultManager`:
// - `policy`: versioned policy artifacts, the decision point, and atomic
//   multi-policy transactions
// - `audit`: hash-chained, tamper-evident ledger with differentiated
//   retention (7 / 10 / 50 years)
// - `transform`: consent- and sovereignty-aware payload transformation
// - `keys`: symmetric key lifecycle, sealed at rest under a master key
// - `rollback`: planned, validated, approved multi-policy restoration

pub mod admin;
pub mod audit;
pub mod consent;
pub mod error;
pub mod intent;
pub mod keys;
pub mod manager;
pub mod policy;
pub mod rollback;
pub mod transform;

pub use admin::{AdminContext, AdminOperation};
pub use audit::{AuditAction, AuditEntry, AuditLedger, AuditQuery, AuditResult, AuditStats};
pub use consent::{ConsentLevel, ConsentMethod, ConsentRecord, ConsentRegistry};
pub use error::{Result, VaultError};
pub use intent::{Decision, Intent, Operation, Outcome};
pub use keys::{EncryptionKey, KeyManager, KeyManagerConfig, KeyPurpose, KeyStatus};
pub use manager::{VaultConfig, VaultManager};
pub use policy::{
    AtomicPolicyExecutor, AtomicTransaction, PolicyDecisionPoint, PolicyOperation,
    PolicyVersion, PolicyVersionStore,
};
pub use rollback::{RollbackExecutor, RollbackPlan, RollbackPlanner};
pub use transform::{TransformContext, TransformEngine, TransformOutcome};
