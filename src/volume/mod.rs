//! External volumes and the workloads that bind them

pub mod backend;
pub mod manager;
pub mod workload;

pub use backend::{InMemoryBackend, StorageBackend};
pub use manager::{Volume, VolumeManager, VolumeState};
pub use workload::{Task, WorkloadInstance, WorkloadManager, WorkloadSpec};
