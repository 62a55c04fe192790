pub mod audit;
pub mod policy;
pub mod record;

pub use audit::AuditEntry;
pub use policy::{pattern_matches, IdempotencyPolicy, KeyStrategy, TargetKind};
pub use record::{ExecutionState, IdempotencyRecord};
