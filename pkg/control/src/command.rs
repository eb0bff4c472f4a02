//! Commands are the only way cluster state changes. Each variant is
//! serialized into the Raft log; `apply` executes deterministically against
//! a single KV transaction and either fully succeeds or leaves no trace.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::ControlError;
use crate::kv::Store;
use crate::model::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    RegisterNode {
        id: Id,
        role: NodeRole,
        address: String,
        overlay_ip: Option<String>,
        hostname: String,
        labels: std::collections::BTreeMap<String, String>,
        resources: Resources,
    },
    HeartbeatNode {
        id: Id,
        available_resources: Resources,
    },
    SetNodeStatus {
        id: Id,
        status: NodeStatus,
    },
    RemoveNode {
        id: Id,
    },

    CreateService {
        id: Id,
        name: String,
        image: String,
        replicas: u32,
        mode: ServiceMode,
        env: std::collections::BTreeMap<String, String>,
        ports: Vec<PortMapping>,
        secret_refs: Vec<String>,
        volume_mounts: Vec<VolumeMount>,
        labels: std::collections::BTreeMap<String, String>,
        health_check: HealthCheck,
        restart_policy: RestartPolicy,
        resources: ResourceSpec,
        stop_timeout_secs: u32,
    },
    UpdateService {
        id: Id,
        replicas: Option<u32>,
        image: Option<String>,
    },
    DeleteService {
        id: Id,
    },

    CreatePendingContainer {
        id: Id,
        service_id: Id,
        /// Carried over from the container this one replaces after a
        /// restart; 0 for a fresh replica.
        restart_attempts: u32,
    },
    /// Used for global-service coverage: creates the container and assigns
    /// it to `node_id` atomically, so a gap is never observable as pending.
    CreateAndAssignContainer {
        id: Id,
        service_id: Id,
        node_id: Id,
    },
    AssignContainer {
        id: Id,
        node_id: Id,
    },
    UpdateContainerStatus {
        id: Id,
        actual_state: ActualState,
        runtime_id: Option<String>,
        exit_code: Option<i32>,
        error: Option<String>,
    },
    ReportContainerHealth {
        id: Id,
        status: HealthStatus,
    },
    SetContainerDesiredState {
        id: Id,
        desired_state: DesiredState,
    },
    DeleteContainer {
        id: Id,
    },

    CreateSecret {
        id: Id,
        name: String,
        data: Vec<u8>,
    },
    DeleteSecret {
        id: Id,
    },

    CreateVolume {
        id: Id,
        name: String,
        driver: String,
        node_id: Option<Id>,
        mount_path: String,
        options: std::collections::BTreeMap<String, String>,
    },
    DeleteVolume {
        id: Id,
    },

    CreateIngress {
        id: Id,
        name: String,
        rules: Vec<IngressRule>,
        tls: Option<IngressTls>,
        labels: std::collections::BTreeMap<String, String>,
    },
    UpdateIngress {
        id: Id,
        rules: Vec<IngressRule>,
    },
    DeleteIngress {
        id: Id,
    },

    PutTlsCertificate {
        id: Id,
        name: String,
        hosts: Vec<String>,
        cert_pem: String,
        key_pem: Vec<u8>,
        issuer: String,
        not_before: chrono::DateTime<Utc>,
        not_after: chrono::DateTime<Utc>,
        auto_renew: bool,
    },
    DeleteTlsCertificate {
        id: Id,
    },

    IssueToken {
        hash: String,
        role: TokenRole,
    },
    RedeemToken {
        hash: String,
    },
}

/// What a successful command produced, carried back to the submitter on the
/// leader. Followers discard this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Outcome {
    Unit,
    Id(Id),
}

pub fn apply(store: &Store, cmd: Command) -> Result<Outcome, ControlError> {
    match cmd {
        Command::RegisterNode { id, role, address, overlay_ip, hostname, labels, resources } => {
            let now = Utc::now();
            let existing = store.get_node(&id);
            let created_at = existing.as_ref().map(|n| n.created_at).unwrap_or(now);
            store.put_node(Node {
                id: id.clone(),
                role,
                address,
                overlay_ip,
                hostname,
                labels,
                resources,
                status: NodeStatus::Ready,
                last_heartbeat: now,
                created_at,
            });
            Ok(Outcome::Id(id))
        }

        Command::HeartbeatNode { id, available_resources } => {
            let mut node = store.get_node(&id).ok_or_else(|| ControlError::NotFound(format!("node {id}")))?;
            node.last_heartbeat = Utc::now();
            node.status = NodeStatus::Ready;
            node.resources = available_resources;
            store.put_node(node);
            Ok(Outcome::Unit)
        }

        Command::SetNodeStatus { id, status } => {
            let mut node = store.get_node(&id).ok_or_else(|| ControlError::NotFound(format!("node {id}")))?;
            node.status = status;
            store.put_node(node);
            Ok(Outcome::Unit)
        }

        Command::RemoveNode { id } => {
            if !store.containers_for_node(&id).is_empty() {
                return Err(ControlError::FailedPrecondition(format!("node {id} still has containers")));
            }
            store.remove_node(&id).ok_or_else(|| ControlError::NotFound(format!("node {id}")))?;
            Ok(Outcome::Unit)
        }

        Command::CreateService {
            id,
            name,
            image,
            replicas,
            mode,
            env,
            ports,
            secret_refs,
            volume_mounts,
            labels,
            health_check,
            restart_policy,
            resources,
            stop_timeout_secs,
        } => {
            if store.find_service_by_name(&name).is_some() {
                return Err(ControlError::AlreadyExists(format!("service {name}")));
            }
            let now = Utc::now();
            store.put_service(Service {
                id: id.clone(),
                name,
                image,
                replicas,
                mode,
                env,
                ports,
                secret_refs,
                volume_mounts,
                labels,
                health_check,
                restart_policy,
                resources,
                stop_timeout_secs,
                created_at: now,
                updated_at: now,
            });
            Ok(Outcome::Id(id))
        }

        Command::UpdateService { id, replicas, image } => {
            let mut svc = store.get_service(&id).ok_or_else(|| ControlError::NotFound(format!("service {id}")))?;
            let unchanged = replicas.map(|r| r == svc.replicas).unwrap_or(true)
                && image.as_ref().map(|i| i == &svc.image).unwrap_or(true);
            if unchanged {
                return Ok(Outcome::Unit);
            }
            if let Some(r) = replicas {
                svc.replicas = r;
            }
            if let Some(img) = image {
                svc.image = img;
            }
            svc.updated_at = Utc::now();
            store.put_service(svc);
            Ok(Outcome::Unit)
        }

        Command::DeleteService { id } => {
            store.remove_service(&id).ok_or_else(|| ControlError::NotFound(format!("service {id}")))?;
            for c in store.containers_for_service(&id) {
                store.remove_container(&c.id);
            }
            Ok(Outcome::Unit)
        }

        Command::CreatePendingContainer { id, service_id, restart_attempts } => {
            let svc = store
                .get_service(&service_id)
                .ok_or_else(|| ControlError::NotFound(format!("service {service_id}")))?;
            let now = Utc::now();
            store.put_container(ContainerInstance {
                id: id.clone(),
                service_id: svc.id.clone(),
                service_name: svc.name.clone(),
                node_id: None,
                runtime_id: None,
                desired_state: DesiredState::Running,
                actual_state: ActualState::Pending,
                image: svc.image.clone(),
                env: svc.env.clone(),
                ports: svc.ports.clone(),
                mounts: svc.volume_mounts.clone(),
                secret_refs: svc.secret_refs.clone(),
                health_check: svc.health_check.clone(),
                health_status: HealthStatus::Unknown,
                consecutive_health_failures: 0,
                restart_policy: svc.restart_policy,
                restart_attempts,
                resources: svc.resources.clone(),
                stop_timeout_secs: svc.stop_timeout_secs,
                created_at: now,
                started_at: None,
                finished_at: None,
                exit_code: None,
                error: None,
            });
            Ok(Outcome::Id(id))
        }

        Command::CreateAndAssignContainer { id, service_id, node_id } => {
            let svc = store
                .get_service(&service_id)
                .ok_or_else(|| ControlError::NotFound(format!("service {service_id}")))?;
            let node = store.get_node(&node_id).ok_or_else(|| ControlError::NotFound(format!("node {node_id}")))?;
            if node.status != NodeStatus::Ready {
                return Err(ControlError::FailedPrecondition(format!("node {node_id} not ready")));
            }
            let now = Utc::now();
            store.put_container(ContainerInstance {
                id: id.clone(),
                service_id: svc.id.clone(),
                service_name: svc.name.clone(),
                node_id: Some(node_id),
                runtime_id: None,
                desired_state: DesiredState::Running,
                actual_state: ActualState::Pending,
                image: svc.image.clone(),
                env: svc.env.clone(),
                ports: svc.ports.clone(),
                mounts: svc.volume_mounts.clone(),
                secret_refs: svc.secret_refs.clone(),
                health_check: svc.health_check.clone(),
                health_status: HealthStatus::Unknown,
                consecutive_health_failures: 0,
                restart_policy: svc.restart_policy,
                restart_attempts: 0,
                resources: svc.resources.clone(),
                stop_timeout_secs: svc.stop_timeout_secs,
                created_at: now,
                started_at: None,
                finished_at: None,
                exit_code: None,
                error: None,
            });
            Ok(Outcome::Id(id))
        }

        Command::AssignContainer { id, node_id } => {
            let mut container =
                store.get_container(&id).ok_or_else(|| ControlError::NotFound(format!("container {id}")))?;
            let node = store.get_node(&node_id).ok_or_else(|| ControlError::NotFound(format!("node {node_id}")))?;
            if node.status != NodeStatus::Ready {
                return Err(ControlError::FailedPrecondition(format!("node {node_id} not ready")));
            }
            container.node_id = Some(node_id);
            store.put_container(container);
            Ok(Outcome::Unit)
        }

        Command::UpdateContainerStatus { id, actual_state, runtime_id, exit_code, error } => {
            let mut container =
                store.get_container(&id).ok_or_else(|| ControlError::NotFound(format!("container {id}")))?;
            if actual_state == ActualState::Running {
                if container.node_id.is_none() {
                    return Err(ControlError::FailedPrecondition(format!(
                        "container {id} cannot be running without a node assignment"
                    )));
                }
                if container.started_at.is_none() {
                    container.started_at = Some(Utc::now());
                }
            }
            if matches!(actual_state, ActualState::Complete | ActualState::Shutdown | ActualState::Failed) {
                container.finished_at = Some(Utc::now());
            }
            container.actual_state = actual_state;
            if runtime_id.is_some() {
                container.runtime_id = runtime_id;
            }
            container.exit_code = exit_code;
            container.error = error;
            store.put_container(container);
            Ok(Outcome::Unit)
        }

        Command::ReportContainerHealth { id, status } => {
            let mut container =
                store.get_container(&id).ok_or_else(|| ControlError::NotFound(format!("container {id}")))?;
            if status == HealthStatus::Unhealthy {
                container.consecutive_health_failures += 1;
            } else {
                container.consecutive_health_failures = 0;
            }
            container.health_status = status;
            store.put_container(container);
            Ok(Outcome::Unit)
        }

        Command::SetContainerDesiredState { id, desired_state } => {
            let mut container =
                store.get_container(&id).ok_or_else(|| ControlError::NotFound(format!("container {id}")))?;
            container.desired_state = desired_state;
            store.put_container(container);
            Ok(Outcome::Unit)
        }

        Command::DeleteContainer { id } => {
            store.remove_container(&id).ok_or_else(|| ControlError::NotFound(format!("container {id}")))?;
            Ok(Outcome::Unit)
        }

        Command::CreateSecret { id, name, data } => {
            if store.find_secret_by_name(&name).is_some() {
                return Err(ControlError::AlreadyExists(format!("secret {name}")));
            }
            let now = Utc::now();
            store.put_secret(Secret { id: id.clone(), name, data, created_at: now, updated_at: now });
            Ok(Outcome::Id(id))
        }

        Command::DeleteSecret { id } => {
            store.remove_secret(&id).ok_or_else(|| ControlError::NotFound(format!("secret {id}")))?;
            Ok(Outcome::Unit)
        }

        Command::CreateVolume { id, name, driver, node_id, mount_path, options } => {
            if store.find_volume_by_name(&name).is_some() {
                return Err(ControlError::AlreadyExists(format!("volume {name}")));
            }
            store.put_volume(Volume {
                id: id.clone(),
                name,
                driver,
                node_id,
                mount_path,
                options,
                created_at: Utc::now(),
            });
            Ok(Outcome::Id(id))
        }

        Command::DeleteVolume { id } => {
            store.remove_volume(&id).ok_or_else(|| ControlError::NotFound(format!("volume {id}")))?;
            Ok(Outcome::Unit)
        }

        Command::CreateIngress { id, name, rules, tls, labels } => {
            for rule in &rules {
                for path in &rule.paths {
                    if store.find_ingress_host_path(&rule.host, &path.path) {
                        return Err(ControlError::AlreadyExists(format!(
                            "ingress path {}{}",
                            rule.host, path.path
                        )));
                    }
                }
            }
            let now = Utc::now();
            store.put_ingress(Ingress {
                id: id.clone(),
                name,
                rules,
                tls,
                labels,
                created_at: now,
                updated_at: now,
            });
            Ok(Outcome::Id(id))
        }

        Command::UpdateIngress { id, rules } => {
            let mut ingress =
                store.get_ingress(&id).ok_or_else(|| ControlError::NotFound(format!("ingress {id}")))?;
            ingress.rules = rules;
            ingress.updated_at = Utc::now();
            store.put_ingress(ingress);
            Ok(Outcome::Unit)
        }

        Command::DeleteIngress { id } => {
            store.remove_ingress(&id).ok_or_else(|| ControlError::NotFound(format!("ingress {id}")))?;
            Ok(Outcome::Unit)
        }

        Command::PutTlsCertificate { id, name, hosts, cert_pem, key_pem, issuer, not_before, not_after, auto_renew } => {
            let now = Utc::now();
            store.put_tls_certificate(TlsCertificate {
                id: id.clone(),
                name,
                hosts,
                cert_pem,
                key_pem,
                issuer,
                not_before,
                not_after,
                auto_renew,
                labels: Default::default(),
                created_at: now,
                updated_at: now,
            });
            Ok(Outcome::Id(id))
        }

        Command::DeleteTlsCertificate { id } => {
            store
                .remove_tls_certificate(&id)
                .ok_or_else(|| ControlError::NotFound(format!("tls certificate {id}")))?;
            Ok(Outcome::Unit)
        }

        Command::IssueToken { hash, role } => {
            if store.get_token(&hash).is_some() {
                return Err(ControlError::AlreadyExists("token".into()));
            }
            store.put_token(JoinToken { hash, role, created_at: Utc::now(), used: false });
            Ok(Outcome::Unit)
        }

        Command::RedeemToken { hash } => {
            let token = store.get_token(&hash).ok_or_else(|| ControlError::Unauthenticated("unknown token".into()))?;
            if token.used {
                return Err(ControlError::Unauthenticated("token already used".into()));
            }
            if !store.mark_token_used(&hash) {
                return Err(ControlError::Unauthenticated("token already used".into()));
            }
            Ok(Outcome::Unit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_service_name_rejected() {
        let store = Store::new();
        let create = |id: &str| Command::CreateService {
            id: id.into(),
            name: "nginx".into(),
            image: "nginx:latest".into(),
            replicas: 1,
            mode: ServiceMode::Replicated,
            env: Default::default(),
            ports: vec![],
            secret_refs: vec![],
            volume_mounts: vec![],
            labels: Default::default(),
            health_check: HealthCheck::default(),
            restart_policy: RestartPolicy::default(),
            resources: ResourceSpec::default(),
            stop_timeout_secs: 10,
        };
        assert!(apply(&store, create("s1")).is_ok());
        assert_eq!(apply(&store, create("s2")), Err(ControlError::AlreadyExists("service nginx".into())));
    }

    #[test]
    fn delete_service_cascades_to_containers() {
        let store = Store::new();
        apply(
            &store,
            Command::CreateService {
                id: "s1".into(),
                name: "web".into(),
                image: "web:latest".into(),
                replicas: 1,
                mode: ServiceMode::Replicated,
                env: Default::default(),
                ports: vec![],
                secret_refs: vec![],
                volume_mounts: vec![],
                labels: Default::default(),
                health_check: HealthCheck::default(),
                restart_policy: RestartPolicy::default(),
                resources: ResourceSpec::default(),
                stop_timeout_secs: 10,
            },
        )
        .unwrap();
        apply(&store, Command::CreatePendingContainer { id: "c1".into(), service_id: "s1".into(), restart_attempts: 0 }).unwrap();
        assert_eq!(store.containers_for_service("s1").len(), 1);

        apply(&store, Command::DeleteService { id: "s1".into() }).unwrap();
        assert!(store.containers_for_service("s1").is_empty());
    }

    #[test]
    fn token_redeems_once() {
        let store = Store::new();
        apply(&store, Command::IssueToken { hash: "h".into(), role: TokenRole::Worker }).unwrap();
        assert!(apply(&store, Command::RedeemToken { hash: "h".into() }).is_ok());
        assert!(apply(&store, Command::RedeemToken { hash: "h".into() }).is_err());
    }

    #[test]
    fn update_service_same_replicas_is_noop_after_first() {
        let store = Store::new();
        apply(
            &store,
            Command::CreateService {
                id: "s1".into(),
                name: "api".into(),
                image: "api:latest".into(),
                replicas: 2,
                mode: ServiceMode::Replicated,
                env: Default::default(),
                ports: vec![],
                secret_refs: vec![],
                volume_mounts: vec![],
                labels: Default::default(),
                health_check: HealthCheck::default(),
                restart_policy: RestartPolicy::default(),
                resources: ResourceSpec::default(),
                stop_timeout_secs: 10,
            },
        )
        .unwrap();
        let first = apply(&store, Command::UpdateService { id: "s1".into(), replicas: Some(3), image: None }).unwrap();
        assert!(matches!(first, Outcome::Unit));
        let svc = store.get_service("s1").unwrap();
        let updated_at = svc.updated_at;
        apply(&store, Command::UpdateService { id: "s1".into(), replicas: Some(3), image: None }).unwrap();
        assert_eq!(store.get_service("s1").unwrap().updated_at, updated_at);
    }
}
