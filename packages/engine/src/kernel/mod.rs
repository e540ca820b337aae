// Kernel - engine infrastructure with dependency injection
//
// The EngineKernel holds every dependency the worker needs (stores, locks,
// broker, external clients) behind seam traits so tests can swap in
// in-memory doubles. Infrastructure only; the phase semantics live in
// `phases/` and the routing in `dispatcher.rs`.

pub mod broker;
pub mod classify;
pub mod dispatcher;
pub mod engine;
pub mod generator;
pub mod jobs;
pub mod lease;
pub mod phases;
pub mod producer;
pub mod recovery;
pub mod store_api;
pub mod telemetry;
pub mod tenant_lock;
pub mod tenants;

pub use broker::{Broker, BrokerPolicy, Consumer, Delivery, MemoryBroker, MessageKind, PgBroker, QueueMessage};
pub use classify::{classify, classify_graphql_messages, Classification};
pub use dispatcher::Dispatcher;
pub use engine::{EngineKernel, EngineSettings};
pub use generator::{
    FieldLimits, GeneratedFields, GenerationHints, Generator, GeneratorConfig, TargetPayload,
    TextCompleter,
};
pub use jobs::{
    CounterDeltas, ItemDraft, ItemSpec, ItemStatus, Job, JobItem, JobPhase, JobSpec, JobStatus,
    JobStore, JobType, MemoryUsageLedger, PgJobStore, PgUsageLedger, PublishStatus, Reservation,
    TargetType, UsageLedger, WorkPhase,
};
pub use lease::LeaseHandle;
pub use producer::Producer;
pub use store_api::{
    HttpStoreApiFactory, LiveSeo, SeoFlags, StoreApi, StoreApiClient, StoreApiConfig,
    StoreApiFactory, StoreCallError,
};
pub use telemetry::{CallObserver, ItemTelemetry, NoopObserver};
pub use tenant_lock::{MemoryTenantLocks, RedisTenantLocks, TenantLocks};
pub use tenants::{MemoryTenantDirectory, PgTenantDirectory, Plan, TenantDirectory, TenantRecord};
