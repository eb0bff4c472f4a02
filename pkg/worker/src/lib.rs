pub mod agent;
pub mod bollard_runtime;
pub mod error;
pub mod health;
pub mod runtime;
pub mod secrets;

pub use agent::{Agent, AgentConfig};
pub use bollard_runtime::BollardRuntime;
pub use error::WorkerError;
pub use health::{HealthCheckSpec, HealthChecker};
pub use runtime::{
    ContainerRuntime, ContainerSpec, MountSpec, PortBinding, ResourceLimits, RuntimeState, RuntimeStatus,
};
pub use secrets::SecretMount;
