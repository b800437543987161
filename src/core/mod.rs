pub mod backup;
pub mod console;
pub mod container_config;
pub mod docker;
pub mod jobs;
pub mod locks;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;
pub mod registry;
pub mod tasks;

pub use backup::{BackupArtifact, BackupManager};
pub use console::{ConsoleClient, ConsoleError, ConsoleTarget, PlayerList};
pub use container_config::{ServerProperties, ServerSpec};
pub use docker::{ContainerInfo, ContainerStats, DockerManager};
pub use locks::InstanceLocks;
pub use metrics::{MetricSample, MetricsCollector};
pub use monitor::{next_update, MetricsScheduler, MetricsUpdate};
pub use orchestrator::Orchestrator;
pub use registry::{FileRegistry, InstanceRegistry, InstanceStatus, ManagedInstance};
pub use tasks::TaskQueue;
