pub mod workload;

pub use workload::{EventType, ReachabilityResult, Runtime, Workload, WorkloadType};
