pub mod clock;
pub mod config;
pub mod error;
pub mod execution;
pub mod lifecycle;
pub mod lock;
pub mod memory;
pub mod registry;
pub mod repository;
pub mod sequence;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CollectionNames, StoreBackend, TaskConfig, SEQUENCE_KEY};
pub use error::{Error, Result};
pub use execution::{validate_task_name, ExecutionRecord, NewExecution, Page, PageRequest};
pub use lifecycle::TaskLifecycle;
pub use lock::{InsertOutcome, LeaseLock, LeaseSettings, LockRecord, LockStore};
pub use memory::{MemoryExecutionRepository, MemoryLockStore, MemorySequence};
pub use registry::LockRegistry;
pub use repository::ExecutionRepository;
pub use sequence::SequenceGenerator;
