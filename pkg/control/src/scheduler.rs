//! Placement of pending container instances onto ready nodes. Runs as a
//! single pass every 5s on the leader (see `pkg/server`'s tick loop); the
//! pass itself is pure and synchronous so it is cheap to unit test, with the
//! caller responsible for submitting the resulting commands through Raft.

use std::collections::BTreeMap;

use crate::command::Command;
use crate::kv::Store;
use crate::model::{ActualState, Id, Node, NodeStatus, Resources};

pub struct Scheduler;

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler
    }
}

/// A single pending container that could not be placed, with the reason,
/// for surfacing as an event per the "never aborts the pass" failure rule.
pub struct Unplaced {
    pub container_id: Id,
    pub reason: &'static str,
}

pub struct Plan {
    pub assignments: Vec<Command>,
    pub unplaced: Vec<Unplaced>,
}

fn labels_match(node_labels: &BTreeMap<String, String>, required: &BTreeMap<String, String>) -> bool {
    required.iter().all(|(k, v)| node_labels.get(k) == Some(v))
}

fn free_cpu(node: &Node, extra: &Resources) -> f64 {
    node.resources.cpu_cores - node.resources.cpu_alloc - extra.cpu_alloc
}
fn free_mem(node: &Node, extra: &Resources) -> i64 {
    node.resources.mem_bytes as i64 - node.resources.mem_alloc as i64 - extra.mem_alloc as i64
}
fn free_disk(node: &Node, extra: &Resources) -> i64 {
    node.resources.disk_bytes as i64 - node.resources.disk_alloc as i64 - extra.disk_alloc as i64
}
fn allocation_ratio(node: &Node, extra: &Resources) -> f64 {
    if node.resources.cpu_cores <= 0.0 {
        return 1.0;
    }
    (node.resources.cpu_alloc + extra.cpu_alloc) / node.resources.cpu_cores
}

impl Scheduler {
    /// Plans one scheduling pass: orders the pending set by
    /// `(service priority, created_at)`, and for each container ranks ready,
    /// resource-and-label-matching nodes by spread-within-service then
    /// bin-packing, tracking a local allocation ledger so later decisions in
    /// the same pass see earlier ones.
    pub fn plan(&self, store: &Store) -> Plan {
        let mut ready_nodes: Vec<Node> = store
            .list_nodes()
            .into_iter()
            .filter(|n| n.status == NodeStatus::Ready && n.is_worker_capable())
            .collect();
        ready_nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut extra_alloc: BTreeMap<Id, Resources> =
            ready_nodes.iter().map(|n| (n.id.clone(), Resources::default())).collect();

        let mut replica_count: BTreeMap<(Id, Id), u32> = BTreeMap::new();
        for c in store.list_containers() {
            if let Some(node_id) = &c.node_id {
                if matches!(c.actual_state, ActualState::Running | ActualState::Pending) {
                    *replica_count.entry((c.service_id.clone(), node_id.clone())).or_insert(0) += 1;
                }
            }
        }

        let volumes = store.list_volumes();

        let mut pending: Vec<_> = store
            .list_containers()
            .into_iter()
            .filter(|c| c.node_id.is_none() && c.actual_state == ActualState::Pending)
            .collect();
        pending.sort_by(|a, b| {
            let pa = store.get_service(&a.service_id).map(|s| s.priority()).unwrap_or(i64::MAX);
            let pb = store.get_service(&b.service_id).map(|s| s.priority()).unwrap_or(i64::MAX);
            pa.cmp(&pb).then(a.created_at.cmp(&b.created_at)).then(a.id.cmp(&b.id))
        });

        let mut assignments = Vec::new();
        let mut unplaced = Vec::new();

        for container in pending {
            let service = match store.get_service(&container.service_id) {
                Some(s) => s,
                None => continue,
            };

            let pinned_node = container.mounts.iter().find_map(|m| {
                volumes.iter().find(|v| v.name == m.volume_name).and_then(|v| v.node_id.clone())
            });

            let reservation = &container.resources.reservations;
            let mut candidates: Vec<&Node> = ready_nodes
                .iter()
                .filter(|n| {
                    if let Some(pin) = &pinned_node {
                        if &n.id != pin {
                            return false;
                        }
                    }
                    if !labels_match(&n.labels, &service.labels) {
                        return false;
                    }
                    let extra = &extra_alloc[&n.id];
                    free_cpu(n, extra) >= reservation.cpu_cores
                        && free_mem(n, extra) >= reservation.mem_bytes as i64
                        && free_disk(n, extra) >= reservation.disk_bytes as i64
                })
                .collect();

            candidates.sort_by(|a, b| {
                let ra = *replica_count.get(&(service.id.clone(), a.id.clone())).unwrap_or(&0);
                let rb = *replica_count.get(&(service.id.clone(), b.id.clone())).unwrap_or(&0);
                ra.cmp(&rb)
                    .then_with(|| {
                        allocation_ratio(a, &extra_alloc[&a.id])
                            .partial_cmp(&allocation_ratio(b, &extra_alloc[&b.id]))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| a.id.cmp(&b.id))
            });

            match candidates.first() {
                Some(chosen) => {
                    assignments.push(Command::AssignContainer {
                        id: container.id.clone(),
                        node_id: chosen.id.clone(),
                    });
                    let entry = extra_alloc.get_mut(&chosen.id).unwrap();
                    entry.cpu_alloc += reservation.cpu_cores;
                    entry.mem_alloc += reservation.mem_bytes;
                    entry.disk_alloc += reservation.disk_bytes;
                    *replica_count.entry((service.id.clone(), chosen.id.clone())).or_insert(0) += 1;
                }
                None => {
                    let reason = if pinned_node.is_some() {
                        "volume pinned to a node that is down or missing"
                    } else if ready_nodes.iter().any(|n| labels_match(&n.labels, &service.labels)) {
                        "no node with sufficient free capacity"
                    } else {
                        "no node matches required labels"
                    };
                    unplaced.push(Unplaced { container_id: container.id.clone(), reason });
                }
            }
        }

        Plan { assignments, unplaced }
    }

    /// Global services: one container per ready, worker-capable node lacking
    /// one. Handled outside the pending queue since there is no "pending"
    /// container until this creates it.
    pub fn plan_global_coverage(&self, store: &Store) -> Vec<Command> {
        let ready_nodes: Vec<Node> = store
            .list_nodes()
            .into_iter()
            .filter(|n| n.status == NodeStatus::Ready && n.is_worker_capable())
            .collect();

        let mut commands = Vec::new();
        for service in store.list_services() {
            if service.mode != crate::model::ServiceMode::Global {
                continue;
            }
            let existing = store.containers_for_service(&service.id);
            for node in &ready_nodes {
                if !labels_match(&node.labels, &service.labels) {
                    continue;
                }
                let covered = existing.iter().any(|c| {
                    c.node_id.as_deref() == Some(node.id.as_str())
                        && c.desired_state == crate::model::DesiredState::Running
                });
                if !covered {
                    commands.push(Command::CreateAndAssignContainer {
                        id: uuid::Uuid::new_v4().to_string(),
                        service_id: service.id.clone(),
                        node_id: node.id.clone(),
                    });
                }
            }
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::apply;
    use crate::model::*;
    use chrono::Utc;

    fn node(id: &str, cpu: f64, mem: u64) -> Node {
        Node {
            id: id.into(),
            role: NodeRole::Worker,
            address: format!("{id}:8080"),
            overlay_ip: None,
            hostname: id.into(),
            labels: Default::default(),
            resources: Resources { cpu_cores: cpu, mem_bytes: mem, disk_bytes: mem, ..Default::default() },
            status: NodeStatus::Ready,
            last_heartbeat: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn assigns_pending_container_to_lone_ready_node() {
        let store = Store::new();
        store.put_node(node("w1", 4.0, 4_000_000_000));
        apply(
            &store,
            Command::CreateService {
                id: "s1".into(),
                name: "nginx".into(),
                image: "nginx".into(),
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

        let plan = Scheduler.plan(&store);
        assert_eq!(plan.unplaced.len(), 0);
        assert_eq!(plan.assignments.len(), 1);
        match &plan.assignments[0] {
            Command::AssignContainer { id, node_id } => {
                assert_eq!(id, "c1");
                assert_eq!(node_id, "w1");
            }
            _ => panic!("expected AssignContainer"),
        }
    }

    #[test]
    fn spreads_across_nodes_before_bin_packing() {
        let store = Store::new();
        store.put_node(node("w1", 8.0, 8_000_000_000));
        store.put_node(node("w2", 8.0, 8_000_000_000));
        apply(
            &store,
            Command::CreateService {
                id: "s1".into(),
                name: "web".into(),
                image: "web".into(),
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
        apply(&store, Command::CreatePendingContainer { id: "c1".into(), service_id: "s1".into(), restart_attempts: 0 }).unwrap();
        apply(&store, Command::CreatePendingContainer { id: "c2".into(), service_id: "s1".into(), restart_attempts: 0 }).unwrap();

        let plan = Scheduler.plan(&store);
        let nodes: Vec<_> = plan
            .assignments
            .iter()
            .map(|cmd| match cmd {
                Command::AssignContainer { node_id, .. } => node_id.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(nodes.len(), 2);
        assert_ne!(nodes[0], nodes[1]);
    }

    #[test]
    fn leaves_container_pending_when_no_capacity() {
        let store = Store::new();
        store.put_node(node("w1", 1.0, 1_000_000));
        apply(
            &store,
            Command::CreateService {
                id: "s1".into(),
                name: "big".into(),
                image: "big".into(),
                replicas: 1,
                mode: ServiceMode::Replicated,
                env: Default::default(),
                ports: vec![],
                secret_refs: vec![],
                volume_mounts: vec![],
                labels: Default::default(),
                health_check: HealthCheck::default(),
                restart_policy: RestartPolicy::default(),
                resources: ResourceSpec {
                    limits: Resources::default(),
                    reservations: Resources { cpu_cores: 4.0, ..Default::default() },
                },
                stop_timeout_secs: 10,
            },
        )
        .unwrap();
        apply(&store, Command::CreatePendingContainer { id: "c1".into(), service_id: "s1".into(), restart_attempts: 0 }).unwrap();

        let plan = Scheduler.plan(&store);
        assert!(plan.assignments.is_empty());
        assert_eq!(plan.unplaced.len(), 1);
    }

    #[test]
    fn global_service_covers_every_ready_node() {
        let store = Store::new();
        store.put_node(node("w1", 4.0, 4_000_000_000));
        store.put_node(node("w2", 4.0, 4_000_000_000));
        apply(
            &store,
            Command::CreateService {
                id: "s1".into(),
                name: "agent".into(),
                image: "agent".into(),
                replicas: 0,
                mode: ServiceMode::Global,
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

        let commands = Scheduler.plan_global_coverage(&store);
        assert_eq!(commands.len(), 2);
    }
}
