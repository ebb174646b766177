//! Audit trail collection and comparison for lab runs (§4.10).

pub mod collector;
pub mod diff;
pub mod events;

pub use collector::{AuditCollector, AuditSummary};
pub use diff::{AuditDiff, ClassificationChange, CountDelta, DiffResult, ResponseDiff};
pub use events::AuditEvent;
