//! Durable job state: models, store, and usage accounting.

pub mod item;
pub mod job;
pub mod store;
pub mod testing;
pub mod usage;

pub use item::{DraftView, ItemDraft, ItemSpec, ItemStatus, JobItem, PublishStatus, TargetType};
pub use job::{Job, JobPhase, JobSpec, JobStatus, JobType, ERROR_MAX_CHARS};
pub use store::{CounterDeltas, JobFilter, JobPage, JobStore, PageRequest, PgJobStore, WorkPhase};
pub use usage::{month_key, MemoryUsageLedger, PgUsageLedger, Reservation, UsageLedger};
