//! Scheduler core: the affinity scheduler, the per-consumer task queue façade
//! and the factory that hands queues out before the affinity thread exists.

pub mod affinity;
pub mod cancel;
pub mod factory;
pub mod queue;
pub mod task;
pub mod tracker;

pub use affinity::AffinityScheduler;
pub use cancel::Cancellation;
pub use factory::SchedulerFactory;
pub use queue::TaskQueue;
pub use task::TaskHandle;
pub use tracker::OperationTracker;
