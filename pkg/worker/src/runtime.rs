//! The boundary to the external container runtime. Every worker operation
//! against a container goes through this trait; the production
//! implementation speaks to a local runtime over a Unix socket via
//! `bollard`, tests use an in-memory fake.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::WorkerError;

#[derive(Debug, Clone)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: Option<u16>,
    pub protocol: String,
}

#[derive(Debug, Clone)]
pub struct MountSpec {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub cpu_cores: f64,
    pub mem_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub mounts: Vec<MountSpec>,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Running,
    Exited,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub state: RuntimeState,
    pub exit_code: Option<i32>,
}

/// Every method is keyed by the runtime-assigned container id except
/// `create`, which allocates one. Callers must serialize calls per container
/// id themselves (the runtime does not).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<(), WorkerError>;
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, WorkerError>;
    async fn start_container(&self, runtime_id: &str) -> Result<(), WorkerError>;
    async fn signal_container(&self, runtime_id: &str, signal: &str) -> Result<(), WorkerError>;
    async fn wait_container(&self, runtime_id: &str) -> Result<RuntimeStatus, WorkerError>;
    async fn status(&self, runtime_id: &str) -> Result<RuntimeStatus, WorkerError>;
    async fn delete_container(&self, runtime_id: &str) -> Result<(), WorkerError>;

    /// Runs `cmd` inside the container and returns its exit code, for Exec
    /// health checks.
    async fn exec(&self, runtime_id: &str, cmd: Vec<String>) -> Result<i64, WorkerError>;
}
