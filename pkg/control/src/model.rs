//! Record types stored in the KV. Every record is keyed by `id` within its
//! bucket; uniqueness constraints on `name` are enforced by the command
//! layer, not the store itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Id = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Manager,
    Worker,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Ready,
    Down,
    Draining,
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_cores: f64,
    pub mem_bytes: u64,
    pub disk_bytes: u64,
    pub cpu_alloc: f64,
    pub mem_alloc: u64,
    pub disk_alloc: u64,
}

impl Resources {
    pub fn free_cpu(&self) -> f64 {
        self.cpu_cores - self.cpu_alloc
    }

    pub fn free_mem(&self) -> u64 {
        self.mem_bytes.saturating_sub(self.mem_alloc)
    }

    pub fn free_disk(&self) -> u64 {
        self.disk_bytes.saturating_sub(self.disk_alloc)
    }

    pub fn allocation_ratio(&self) -> f64 {
        if self.cpu_cores <= 0.0 {
            return 1.0;
        }
        self.cpu_alloc / self.cpu_cores
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Id,
    pub role: NodeRole,
    pub address: String,
    pub overlay_ip: Option<String>,
    pub hostname: String,
    pub labels: BTreeMap<String, String>,
    pub resources: Resources,
    pub status: NodeStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Node {
    pub fn is_worker_capable(&self) -> bool {
        matches!(self.role, NodeRole::Worker | NodeRole::Hybrid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceMode {
    Replicated,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthCheckKind {
    None,
    Http,
    Tcp,
    Exec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub kind: HealthCheckKind,
    pub target: String,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub failure_threshold: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        HealthCheck {
            kind: HealthCheckKind::None,
            target: String::new(),
            interval_secs: 5,
            timeout_secs: 3,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub restart_on_failure: bool,
    pub max_attempts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy { restart_on_failure: true, max_attempts: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: Option<u16>,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    pub volume_name: String,
    pub mount_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub limits: Resources,
    pub reservations: Resources,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        ResourceSpec { limits: Resources::default(), reservations: Resources::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: Id,
    pub name: String,
    pub image: String,
    pub replicas: u32,
    pub mode: ServiceMode,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub secret_refs: Vec<String>,
    pub volume_mounts: Vec<VolumeMount>,
    pub labels: BTreeMap<String, String>,
    pub health_check: HealthCheck,
    pub restart_policy: RestartPolicy,
    pub resources: ResourceSpec,
    pub stop_timeout_secs: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Service {
    /// `warren.priority` label, lower-number-first; services without the
    /// label sort after all labelled ones.
    pub fn priority(&self) -> i64 {
        self.labels
            .get("warren.priority")
            .and_then(|v| v.parse().ok())
            .unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesiredState {
    Running,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActualState {
    Pending,
    Running,
    Failed,
    Complete,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInstance {
    pub id: Id,
    pub service_id: Id,
    pub service_name: String,
    pub node_id: Option<Id>,
    pub runtime_id: Option<String>,
    pub desired_state: DesiredState,
    pub actual_state: ActualState,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub mounts: Vec<VolumeMount>,
    pub secret_refs: Vec<String>,
    pub health_check: HealthCheck,
    pub health_status: HealthStatus,
    pub consecutive_health_failures: u32,
    pub restart_policy: RestartPolicy,
    pub restart_attempts: u32,
    pub resources: ResourceSpec,
    pub stop_timeout_secs: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub id: Id,
    pub name: String,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: Id,
    pub name: String,
    pub driver: String,
    pub node_id: Option<Id>,
    pub mount_path: String,
    pub options: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathType {
    Prefix,
    Exact,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests_per_second: f64,
    pub burst: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessControl {
    pub allow_cidrs: Vec<String>,
    pub deny_cidrs: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderOps {
    pub add: BTreeMap<String, String>,
    pub set: BTreeMap<String, String>,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressPath {
    pub path: String,
    pub path_type: PathType,
    pub backend_service: String,
    pub backend_port: u16,
    pub strip_prefix: Option<String>,
    pub replace_path: Option<String>,
    pub headers: HeaderOps,
    pub rate_limit: Option<RateLimit>,
    pub access_control: Option<AccessControl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressRule {
    pub host: String,
    pub paths: Vec<IngressPath>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressTls {
    pub enabled: bool,
    pub secret_name: Option<String>,
    pub hosts: Vec<String>,
    pub auto_tls: bool,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ingress {
    pub id: Id,
    pub name: String,
    pub rules: Vec<IngressRule>,
    pub tls: Option<IngressTls>,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsCertificate {
    pub id: Id,
    pub name: String,
    pub hosts: Vec<String>,
    pub cert_pem: String,
    pub key_pem: Vec<u8>,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub auto_renew: bool,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenRole {
    Worker,
    Manager,
    Cli,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinToken {
    pub hash: String,
    pub role: TokenRole,
    pub created_at: DateTime<Utc>,
    pub used: bool,
}
