pub mod audit_store;
pub mod memory;
pub mod policy_store;
pub mod postgres;
pub mod state_store;

pub use audit_store::AuditStore;
pub use memory::{InMemoryAuditStore, InMemoryPolicyStore, InMemoryStateStore};
pub use policy_store::PolicyStore;
pub use postgres::{PostgresAuditStore, PostgresPolicyStore, PostgresStateStore};
pub use state_store::StateStore;

#[cfg(test)]
pub use audit_store::MockAuditStore;
#[cfg(test)]
pub use policy_store::MockPolicyStore;
#[cfg(test)]
pub use state_store::MockStateStore;
