//! Conversions between the wire (`warren_proto::cluster`) and domain
//! (`warren_control::model`) types. Kept in one place so a field rename on
//! either side only needs fixing here.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use warren_control::model as m;
use warren_proto::cluster as pb;

pub fn millis_to_time(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

pub fn time_to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub fn resources_to_pb(r: &m::Resources) -> pb::Resources {
    pb::Resources {
        cpu_cores_milli: (r.cpu_cores * 1000.0).round() as u64,
        mem_bytes: r.mem_bytes,
        disk_bytes: r.disk_bytes,
    }
}

pub fn resources_alloc_to_pb(r: &m::Resources) -> pb::Resources {
    pb::Resources {
        cpu_cores_milli: (r.cpu_alloc * 1000.0).round() as u64,
        mem_bytes: r.mem_alloc,
        disk_bytes: r.disk_alloc,
    }
}

pub fn resources_from_pb(r: &pb::Resources) -> m::Resources {
    m::Resources {
        cpu_cores: r.cpu_cores_milli as f64 / 1000.0,
        mem_bytes: r.mem_bytes,
        disk_bytes: r.disk_bytes,
        cpu_alloc: 0.0,
        mem_alloc: 0,
        disk_alloc: 0,
    }
}

pub fn node_role_to_pb(r: m::NodeRole) -> i32 {
    match r {
        m::NodeRole::Manager => pb::NodeRole::Manager as i32,
        m::NodeRole::Worker => pb::NodeRole::Worker as i32,
        m::NodeRole::Hybrid => pb::NodeRole::Hybrid as i32,
    }
}

pub fn node_role_from_pb(v: i32) -> m::NodeRole {
    match pb::NodeRole::try_from(v).unwrap_or(pb::NodeRole::Worker) {
        pb::NodeRole::Manager => m::NodeRole::Manager,
        pb::NodeRole::Worker => m::NodeRole::Worker,
        pb::NodeRole::Hybrid => m::NodeRole::Hybrid,
    }
}

pub fn node_status_to_pb(s: m::NodeStatus) -> i32 {
    match s {
        m::NodeStatus::Ready => pb::NodeStatus::Ready as i32,
        m::NodeStatus::Down => pb::NodeStatus::Down as i32,
        m::NodeStatus::Draining => pb::NodeStatus::Draining as i32,
        m::NodeStatus::Unknown => pb::NodeStatus::Unknown as i32,
    }
}

pub fn node_to_pb(n: &m::Node) -> pb::Node {
    pb::Node {
        id: n.id.clone(),
        role: node_role_to_pb(n.role),
        address: n.address.clone(),
        overlay_ip: n.overlay_ip.clone().unwrap_or_default(),
        hostname: n.hostname.clone(),
        labels: n.labels.clone().into_iter().collect(),
        resources: Some(resources_to_pb(&n.resources)),
        resources_allocated: Some(resources_alloc_to_pb(&n.resources)),
        status: node_status_to_pb(n.status),
        last_heartbeat_unix_millis: time_to_millis(n.last_heartbeat),
        created_at_unix_millis: time_to_millis(n.created_at),
    }
}

pub fn health_check_kind_to_pb(k: m::HealthCheckKind) -> i32 {
    match k {
        m::HealthCheckKind::None => pb::health_check::Kind::None as i32,
        m::HealthCheckKind::Http => pb::health_check::Kind::Http as i32,
        m::HealthCheckKind::Tcp => pb::health_check::Kind::Tcp as i32,
        m::HealthCheckKind::Exec => pb::health_check::Kind::Exec as i32,
    }
}

pub fn health_check_to_pb(h: &m::HealthCheck) -> pb::HealthCheck {
    let (http_path, port, exec_command) = match h.kind {
        m::HealthCheckKind::Http => (h.target.clone(), 0, vec![]),
        m::HealthCheckKind::Tcp => (String::new(), h.target.parse().unwrap_or(0), vec![]),
        m::HealthCheckKind::Exec => (String::new(), 0, h.target.split(' ').map(String::from).collect()),
        m::HealthCheckKind::None => (String::new(), 0, vec![]),
    };
    pb::HealthCheck {
        kind: health_check_kind_to_pb(h.kind),
        http_path,
        port,
        exec_command,
        interval_seconds: h.interval_secs,
        timeout_seconds: h.timeout_secs,
        failure_threshold: h.failure_threshold,
    }
}

pub fn health_check_from_pb(h: &pb::HealthCheck) -> m::HealthCheck {
    let kind = pb::health_check::Kind::try_from(h.kind).unwrap_or(pb::health_check::Kind::None);
    let (kind, target) = match kind {
        pb::health_check::Kind::Http => (m::HealthCheckKind::Http, h.http_path.clone()),
        pb::health_check::Kind::Tcp => (m::HealthCheckKind::Tcp, h.port.to_string()),
        pb::health_check::Kind::Exec => (m::HealthCheckKind::Exec, h.exec_command.join(" ")),
        pb::health_check::Kind::None => (m::HealthCheckKind::None, String::new()),
    };
    m::HealthCheck {
        kind,
        target,
        interval_secs: h.interval_seconds,
        timeout_secs: h.timeout_seconds,
        failure_threshold: h.failure_threshold,
    }
}

pub fn restart_policy_to_pb(p: &m::RestartPolicy) -> pb::RestartPolicy {
    pb::RestartPolicy {
        condition: if p.restart_on_failure {
            pb::restart_policy::Condition::OnFailure as i32
        } else {
            pb::restart_policy::Condition::Never as i32
        },
        max_attempts: p.max_attempts,
    }
}

pub fn restart_policy_from_pb(p: &pb::RestartPolicy) -> m::RestartPolicy {
    let condition = pb::restart_policy::Condition::try_from(p.condition).unwrap_or(pb::restart_policy::Condition::Never);
    m::RestartPolicy { restart_on_failure: condition != pb::restart_policy::Condition::Never, max_attempts: p.max_attempts }
}

pub fn port_to_pb(p: &m::PortMapping) -> pb::PortMapping {
    pb::PortMapping {
        container_port: p.container_port as u32,
        published_port: p.host_port.unwrap_or(0) as u32,
        protocol: p.protocol.clone(),
    }
}

pub fn port_from_pb(p: &pb::PortMapping) -> m::PortMapping {
    m::PortMapping {
        container_port: p.container_port as u16,
        host_port: if p.published_port == 0 { None } else { Some(p.published_port as u16) },
        protocol: p.protocol.clone(),
    }
}

/// Volume mounts travel over the wire as `name:mount_path[:ro]` strings
/// (the proto's `ServiceSpec.volume_mounts` is `repeated string`); this is
/// the one place that format is parsed or produced.
pub fn volume_mount_to_wire(v: &m::VolumeMount) -> String {
    let suffix = if v.read_only { ":ro" } else { "" };
    format!("{}:{}{}", v.volume_name, v.mount_path, suffix)
}

pub fn volume_mount_from_wire(s: &str) -> Option<m::VolumeMount> {
    let mut parts = s.splitn(3, ':');
    let name = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let read_only = parts.next() == Some("ro");
    Some(m::VolumeMount { volume_name: name, mount_path: path, read_only })
}

pub fn service_to_pb(s: &m::Service) -> pb::ServiceSpec {
    pb::ServiceSpec {
        id: s.id.clone(),
        name: s.name.clone(),
        image: s.image.clone(),
        replicas: s.replicas,
        mode: match s.mode {
            m::ServiceMode::Replicated => pb::ServiceMode::Replicated as i32,
            m::ServiceMode::Global => pb::ServiceMode::Global as i32,
        },
        env: s.env.clone().into_iter().collect(),
        ports: s.ports.iter().map(port_to_pb).collect(),
        networks: vec![],
        secret_refs: s.secret_refs.clone(),
        volume_mounts: s.volume_mounts.iter().map(volume_mount_to_wire).collect(),
        labels: s.labels.clone().into_iter().collect(),
        health_check: Some(health_check_to_pb(&s.health_check)),
        restart_policy: Some(restart_policy_to_pb(&s.restart_policy)),
        resource_limits: Some(resources_to_pb(&s.resources.limits)),
        resource_reservations: Some(resources_to_pb(&s.resources.reservations)),
        stop_timeout_seconds: s.stop_timeout_secs,
        created_at_unix_millis: time_to_millis(s.created_at),
        updated_at_unix_millis: time_to_millis(s.updated_at),
    }
}

pub struct ServiceCreateFields {
    pub name: String,
    pub image: String,
    pub replicas: u32,
    pub mode: m::ServiceMode,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<m::PortMapping>,
    pub secret_refs: Vec<String>,
    pub volume_mounts: Vec<m::VolumeMount>,
    pub labels: BTreeMap<String, String>,
    pub health_check: m::HealthCheck,
    pub restart_policy: m::RestartPolicy,
    pub resources: m::ResourceSpec,
    pub stop_timeout_secs: u32,
}

pub fn service_from_pb(s: &pb::ServiceSpec) -> ServiceCreateFields {
    ServiceCreateFields {
        name: s.name.clone(),
        image: s.image.clone(),
        replicas: s.replicas,
        mode: if s.mode == pb::ServiceMode::Global as i32 { m::ServiceMode::Global } else { m::ServiceMode::Replicated },
        env: s.env.clone().into_iter().collect(),
        ports: s.ports.iter().map(port_from_pb).collect(),
        secret_refs: s.secret_refs.clone(),
        volume_mounts: s.volume_mounts.iter().filter_map(|v| volume_mount_from_wire(v)).collect(),
        labels: s.labels.clone().into_iter().collect(),
        health_check: s.health_check.as_ref().map(health_check_from_pb).unwrap_or_default(),
        restart_policy: s.restart_policy.as_ref().map(restart_policy_from_pb).unwrap_or_default(),
        resources: m::ResourceSpec {
            limits: s.resource_limits.as_ref().map(resources_from_pb).unwrap_or_default(),
            reservations: s.resource_reservations.as_ref().map(resources_from_pb).unwrap_or_default(),
        },
        stop_timeout_secs: s.stop_timeout_seconds,
    }
}

pub fn container_to_pb(c: &m::ContainerInstance) -> pb::ContainerInstance {
    pb::ContainerInstance {
        id: c.id.clone(),
        service_id: c.service_id.clone(),
        service_name: c.service_name.clone(),
        node_id: c.node_id.clone().unwrap_or_default(),
        runtime_id: c.runtime_id.clone().unwrap_or_default(),
        desired_state: match c.desired_state {
            m::DesiredState::Running => "running".to_string(),
            m::DesiredState::Shutdown => "shutdown".to_string(),
        },
        actual_state: match c.actual_state {
            m::ActualState::Pending => "pending".to_string(),
            m::ActualState::Running => "running".to_string(),
            m::ActualState::Failed => "failed".to_string(),
            m::ActualState::Complete => "complete".to_string(),
            m::ActualState::Shutdown => "shutdown".to_string(),
        },
        image: c.image.clone(),
        env: c.env.clone().into_iter().collect(),
        ports: c.ports.iter().map(port_to_pb).collect(),
        secret_refs: c.secret_refs.clone(),
        health_check: Some(health_check_to_pb(&c.health_check)),
        health_status: match c.health_status {
            m::HealthStatus::Unknown => "unknown".to_string(),
            m::HealthStatus::Healthy => "healthy".to_string(),
            m::HealthStatus::Unhealthy => "unhealthy".to_string(),
        },
        restart_policy: Some(restart_policy_to_pb(&c.restart_policy)),
        resources: Some(resources_to_pb(&c.resources.limits)),
        stop_timeout_seconds: c.stop_timeout_secs,
        created_at_unix_millis: time_to_millis(c.created_at),
        started_at_unix_millis: c.started_at.map(time_to_millis).unwrap_or(0),
        finished_at_unix_millis: c.finished_at.map(time_to_millis).unwrap_or(0),
        exit_code: c.exit_code,
        error: c.error.clone().unwrap_or_default(),
    }
}

pub fn actual_state_from_wire(s: &str) -> m::ActualState {
    match s {
        "running" => m::ActualState::Running,
        "failed" => m::ActualState::Failed,
        "complete" => m::ActualState::Complete,
        "shutdown" => m::ActualState::Shutdown,
        _ => m::ActualState::Pending,
    }
}

pub fn health_status_from_wire(s: &str) -> m::HealthStatus {
    match s {
        "healthy" => m::HealthStatus::Healthy,
        "unhealthy" => m::HealthStatus::Unhealthy,
        _ => m::HealthStatus::Unknown,
    }
}

pub fn volume_to_pb(v: &m::Volume) -> pb::Volume {
    pb::Volume {
        id: v.id.clone(),
        name: v.name.clone(),
        driver: v.driver.clone(),
        node_id: v.node_id.clone().unwrap_or_default(),
        mount_path: v.mount_path.clone(),
        options: v.options.clone().into_iter().collect(),
        created_at_unix_millis: time_to_millis(v.created_at),
    }
}

pub fn secret_to_pb(s: &m::Secret, data: Vec<u8>) -> pb::Secret {
    pb::Secret {
        id: s.id.clone(),
        name: s.name.clone(),
        encrypted_data: data,
        created_at_unix_millis: time_to_millis(s.created_at),
        updated_at_unix_millis: time_to_millis(s.updated_at),
    }
}

pub fn path_type_to_pb(t: m::PathType) -> i32 {
    match t {
        m::PathType::Prefix => pb::ingress_path::PathType::Prefix as i32,
        m::PathType::Exact => pb::ingress_path::PathType::Exact as i32,
    }
}

pub fn ingress_path_to_pb(p: &m::IngressPath) -> pb::IngressPath {
    pb::IngressPath {
        path: p.path.clone(),
        path_type: path_type_to_pb(p.path_type),
        backend: Some(pb::IngressPathBackend { service_name: p.backend_service.clone(), port: p.backend_port as u32 }),
        rewrite_strip_prefix: p.strip_prefix.clone().unwrap_or_default(),
        rewrite_replace_path: p.replace_path.clone().unwrap_or_default(),
        set_headers: p.headers.set.clone().into_iter().chain(p.headers.add.clone()).collect(),
        remove_headers: p.headers.remove.clone(),
        rate_limit_rps: p.rate_limit.as_ref().map(|r| r.requests_per_second as u32).unwrap_or(0),
        rate_limit_burst: p.rate_limit.as_ref().map(|r| r.burst).unwrap_or(0),
        access_control_allow_cidrs: p.access_control.as_ref().map(|a| a.allow_cidrs.clone()).unwrap_or_default(),
        access_control_deny_cidrs: p.access_control.as_ref().map(|a| a.deny_cidrs.clone()).unwrap_or_default(),
    }
}

pub fn ingress_path_from_pb(p: &pb::IngressPath) -> m::IngressPath {
    let path_type = if p.path_type == pb::ingress_path::PathType::Exact as i32 { m::PathType::Exact } else { m::PathType::Prefix };
    let backend = p.backend.clone().unwrap_or(pb::IngressPathBackend { service_name: String::new(), port: 0 });
    let rate_limit = if p.rate_limit_rps > 0 {
        Some(m::RateLimit { requests_per_second: p.rate_limit_rps as f64, burst: p.rate_limit_burst })
    } else {
        None
    };
    let access_control = if !p.access_control_allow_cidrs.is_empty() || !p.access_control_deny_cidrs.is_empty() {
        Some(m::AccessControl { allow_cidrs: p.access_control_allow_cidrs.clone(), deny_cidrs: p.access_control_deny_cidrs.clone() })
    } else {
        None
    };
    m::IngressPath {
        path: p.path.clone(),
        path_type,
        backend_service: backend.service_name,
        backend_port: backend.port as u16,
        strip_prefix: if p.rewrite_strip_prefix.is_empty() { None } else { Some(p.rewrite_strip_prefix.clone()) },
        replace_path: if p.rewrite_replace_path.is_empty() { None } else { Some(p.rewrite_replace_path.clone()) },
        headers: m::HeaderOps { add: BTreeMap::new(), set: p.set_headers.clone().into_iter().collect(), remove: p.remove_headers.clone() },
        rate_limit,
        access_control,
    }
}

pub fn ingress_rule_to_pb(r: &m::IngressRule) -> pb::IngressRule {
    pb::IngressRule { host: r.host.clone(), paths: r.paths.iter().map(ingress_path_to_pb).collect() }
}

pub fn ingress_rule_from_pb(r: &pb::IngressRule) -> m::IngressRule {
    m::IngressRule { host: r.host.clone(), paths: r.paths.iter().map(ingress_path_from_pb).collect() }
}

pub fn ingress_tls_to_pb(t: &m::IngressTls) -> pb::IngressTls {
    pb::IngressTls {
        enabled: t.enabled,
        secret_name: t.secret_name.clone().unwrap_or_default(),
        hosts: t.hosts.clone(),
        auto_tls: t.auto_tls,
        email: t.email.clone().unwrap_or_default(),
    }
}

pub fn ingress_tls_from_pb(t: &pb::IngressTls) -> m::IngressTls {
    m::IngressTls {
        enabled: t.enabled,
        secret_name: if t.secret_name.is_empty() { None } else { Some(t.secret_name.clone()) },
        hosts: t.hosts.clone(),
        auto_tls: t.auto_tls,
        email: if t.email.is_empty() { None } else { Some(t.email.clone()) },
    }
}

pub fn ingress_to_pb(i: &m::Ingress) -> pb::Ingress {
    pb::Ingress {
        id: i.id.clone(),
        name: i.name.clone(),
        rules: i.rules.iter().map(ingress_rule_to_pb).collect(),
        tls: i.tls.as_ref().map(ingress_tls_to_pb),
        labels: i.labels.clone().into_iter().collect(),
        created_at_unix_millis: time_to_millis(i.created_at),
        updated_at_unix_millis: time_to_millis(i.updated_at),
    }
}

pub fn tls_certificate_to_pb(t: &m::TlsCertificate) -> pb::TlsCertificate {
    pb::TlsCertificate {
        id: t.id.clone(),
        name: t.name.clone(),
        hosts: t.hosts.clone(),
        cert_pem: t.cert_pem.clone(),
        encrypted_key: t.key_pem.clone(),
        issuer: t.issuer.clone(),
        not_before_unix_millis: time_to_millis(t.not_before),
        not_after_unix_millis: time_to_millis(t.not_after),
        auto_renew: t.auto_renew,
    }
}
