//! The bucketed, single-writer KV store backing the state machine. A
//! replica's store is a pure materialized view of its committed log: there
//! is no direct write path into it other than `apply`, which is why it can
//! be a concrete `RwLock`-guarded structure rather than an interface.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::model::*;

#[derive(Default, Serialize, Deserialize)]
struct Buckets {
    nodes: BTreeMap<Id, Node>,
    services: BTreeMap<Id, Service>,
    containers: BTreeMap<Id, ContainerInstance>,
    secrets: BTreeMap<Id, Secret>,
    volumes: BTreeMap<Id, Volume>,
    ingresses: BTreeMap<Id, Ingress>,
    tls_certificates: BTreeMap<Id, TlsCertificate>,
    tokens: BTreeMap<String, JoinToken>,
}

macro_rules! bucket_methods {
    ($bucket:ident, $ty:ty, $get:ident, $put:ident, $remove:ident, $list:ident) => {
        pub fn $get(&self, id: &str) -> Option<$ty> {
            self.inner.read().unwrap().$bucket.get(id).cloned()
        }

        pub fn $put(&self, value: $ty) {
            let mut guard = self.inner.write().unwrap();
            let id = value_id(&value);
            guard.$bucket.insert(id, value);
        }

        pub fn $remove(&self, id: &str) -> Option<$ty> {
            self.inner.write().unwrap().$bucket.remove(id)
        }

        pub fn $list(&self) -> Vec<$ty> {
            self.inner.read().unwrap().$bucket.values().cloned().collect()
        }
    };
}

fn value_id<T: HasId>(v: &T) -> Id {
    v.id().to_string()
}

trait HasId {
    fn id(&self) -> &str;
}

impl HasId for Node {
    fn id(&self) -> &str {
        &self.id
    }
}
impl HasId for Service {
    fn id(&self) -> &str {
        &self.id
    }
}
impl HasId for ContainerInstance {
    fn id(&self) -> &str {
        &self.id
    }
}
impl HasId for Secret {
    fn id(&self) -> &str {
        &self.id
    }
}
impl HasId for Volume {
    fn id(&self) -> &str {
        &self.id
    }
}
impl HasId for Ingress {
    fn id(&self) -> &str {
        &self.id
    }
}
impl HasId for TlsCertificate {
    fn id(&self) -> &str {
        &self.id
    }
}

pub struct Store {
    inner: RwLock<Buckets>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Store { inner: RwLock::new(Buckets::default()) }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        let guard = self.inner.read().unwrap();
        serde_json::to_vec(&*guard).expect("buckets always serialize")
    }

    pub fn restore(&self, bytes: &[u8]) {
        let buckets: Buckets = if bytes.is_empty() {
            Buckets::default()
        } else {
            serde_json::from_slice(bytes).expect("corrupt snapshot")
        };
        *self.inner.write().unwrap() = buckets;
    }

    bucket_methods!(nodes, Node, get_node, put_node, remove_node, list_nodes);
    bucket_methods!(services, Service, get_service, put_service, remove_service, list_services);
    bucket_methods!(
        containers,
        ContainerInstance,
        get_container,
        put_container,
        remove_container,
        list_containers
    );
    bucket_methods!(secrets, Secret, get_secret, put_secret, remove_secret, list_secrets);
    bucket_methods!(volumes, Volume, get_volume, put_volume, remove_volume, list_volumes);
    bucket_methods!(ingresses, Ingress, get_ingress, put_ingress, remove_ingress, list_ingresses);
    bucket_methods!(
        tls_certificates,
        TlsCertificate,
        get_tls_certificate,
        put_tls_certificate,
        remove_tls_certificate,
        list_tls_certificates
    );

    pub fn find_service_by_name(&self, name: &str) -> Option<Service> {
        self.inner.read().unwrap().services.values().find(|s| s.name == name).cloned()
    }

    pub fn find_secret_by_name(&self, name: &str) -> Option<Secret> {
        self.inner.read().unwrap().secrets.values().find(|s| s.name == name).cloned()
    }

    pub fn find_volume_by_name(&self, name: &str) -> Option<Volume> {
        self.inner.read().unwrap().volumes.values().find(|v| v.name == name).cloned()
    }

    pub fn find_ingress_host_path(&self, host: &str, path: &str) -> bool {
        self.inner.read().unwrap().ingresses.values().any(|ing| {
            ing.rules.iter().any(|r| r.host == host && r.paths.iter().any(|p| p.path == path))
        })
    }

    pub fn containers_for_service(&self, service_id: &str) -> Vec<ContainerInstance> {
        self.inner
            .read()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.service_id == service_id)
            .cloned()
            .collect()
    }

    pub fn containers_for_node(&self, node_id: &str) -> Vec<ContainerInstance> {
        self.inner
            .read()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.node_id.as_deref() == Some(node_id))
            .cloned()
            .collect()
    }

    pub fn get_token(&self, hash: &str) -> Option<JoinToken> {
        self.inner.read().unwrap().tokens.get(hash).cloned()
    }

    pub fn put_token(&self, token: JoinToken) {
        self.inner.write().unwrap().tokens.insert(token.hash.clone(), token);
    }

    pub fn mark_token_used(&self, hash: &str) -> bool {
        let mut guard = self.inner.write().unwrap();
        match guard.tokens.get_mut(hash) {
            Some(t) if !t.used => {
                t.used = true;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            role: NodeRole::Worker,
            address: "10.0.0.1:8080".into(),
            overlay_ip: None,
            hostname: "h1".into(),
            labels: Default::default(),
            resources: Resources::default(),
            status: NodeStatus::Ready,
            last_heartbeat: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn snapshot_round_trips() {
        let store = Store::new();
        store.put_node(sample_node("n1"));
        let bytes = store.snapshot();

        let restored = Store::new();
        restored.restore(&bytes);
        assert!(restored.get_node("n1").is_some());
    }

    #[test]
    fn empty_snapshot_restores_to_empty_store() {
        let store = Store::new();
        store.restore(&[]);
        assert!(store.list_nodes().is_empty());
    }
}
