pub mod codec;
pub mod executor;
pub mod key_generator;
pub mod outcome;
pub mod policy_resolver;
pub mod request;

pub use codec::PayloadCodec;
pub use executor::{
    CleanupJob, ExecutionMetrics, IdempotencyEngine, MetricsSnapshot, DIRECT_EXECUTION_KEY,
};
pub use key_generator::KeyGenerator;
pub use outcome::{ExecutionOutcome, ExecutionStatus};
pub use policy_resolver::PolicyResolver;
pub use request::{ExecutionRequest, ValidationError};
