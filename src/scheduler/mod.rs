pub mod job;
pub mod queue;
pub mod registry;
pub mod target;

pub use job::{JobDefinition, JobInstance, JobStatus, TargetSpec};
pub use queue::JobQueue;
pub use registry::NodeRegistry;
pub use target::resolve_target;
