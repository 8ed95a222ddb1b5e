pub mod error;
pub mod lock_store;
pub mod models;
pub mod repository;
pub mod schema;
pub mod sequence;
pub mod store;

// Re-exports
pub use lock_store::PgLockStore;
pub use models::{ExecutionRow, LockRow};
pub use repository::PgExecutionRepository;
pub use schema::{schema_statements, SchemaInitializer};
pub use sequence::PgSequenceGenerator;
pub use store::TaskStore;
