//! The routing table: a read-only snapshot rebuilt whenever an `Ingress`,
//! `TlsCertificate` or backend container changes, and swapped in as a whole
//! so a request never observes a partially-updated table.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use warren_control::kv::Store;
use warren_control::model::{ActualState, HealthStatus, IngressPath, PathType};
use warren_crypto::secrets::SecretsEngine;

#[derive(Debug, Clone)]
pub struct Backend {
    pub host: String,
    pub port: u16,
}

struct RoundRobin(AtomicUsize);

impl Clone for RoundRobin {
    fn clone(&self) -> Self {
        RoundRobin(AtomicUsize::new(self.0.load(Ordering::Relaxed)))
    }
}

#[derive(Clone)]
pub struct MatchedRoute {
    pub path: IngressPath,
    pub host: String,
}

/// One host's routes, sorted so matching can walk them in priority order:
/// `Exact` paths before `Prefix` paths, longest prefix first within a kind.
struct HostRoutes {
    exact: BTreeMap<String, IngressPath>,
    prefixes: Vec<IngressPath>,
}

pub struct RoutingTable {
    hosts: BTreeMap<String, HostRoutes>,
    wildcard_hosts: BTreeMap<String, HostRoutes>,
    backends: BTreeMap<String, Vec<Backend>>,
    cursors: BTreeMap<String, RoundRobin>,
    /// host -> (cert PEM, decrypted private key DER).
    pub cert_pems: BTreeMap<String, (String, Vec<u8>)>,
}

impl RoutingTable {
    pub fn build(store: &Store, secrets: &SecretsEngine) -> Self {
        let mut hosts: BTreeMap<String, HostRoutes> = BTreeMap::new();
        let mut wildcard_hosts: BTreeMap<String, HostRoutes> = BTreeMap::new();

        for ingress in store.list_ingresses() {
            for rule in &ingress.rules {
                let table = if let Some(suffix) = rule.host.strip_prefix("*.") {
                    wildcard_hosts.entry(suffix.to_string()).or_insert_with(|| HostRoutes {
                        exact: BTreeMap::new(),
                        prefixes: Vec::new(),
                    })
                } else {
                    hosts.entry(rule.host.clone()).or_insert_with(|| HostRoutes {
                        exact: BTreeMap::new(),
                        prefixes: Vec::new(),
                    })
                };

                for path in &rule.paths {
                    match path.path_type {
                        PathType::Exact => {
                            table.exact.insert(path.path.clone(), path.clone());
                        }
                        PathType::Prefix => {
                            table.prefixes.push(path.clone());
                        }
                    }
                }
            }
        }

        for table in hosts.values_mut().chain(wildcard_hosts.values_mut()) {
            table.prefixes.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        }

        let mut backends: BTreeMap<String, Vec<Backend>> = BTreeMap::new();
        for service in store.list_services() {
            let mut live = Vec::new();
            for container in store.containers_for_service(&service.id) {
                if container.actual_state != ActualState::Running {
                    continue;
                }
                if container.health_status == HealthStatus::Unhealthy {
                    continue;
                }
                let Some(node_id) = &container.node_id else { continue };
                let Some(node) = store.get_node(node_id) else { continue };
                let host = node_host(&node.address);
                let port = container
                    .ports
                    .iter()
                    .find_map(|p| p.host_port)
                    .unwrap_or_else(|| container.ports.first().map(|p| p.container_port).unwrap_or(0));
                if port == 0 {
                    continue;
                }
                live.push(Backend { host: host.to_string(), port });
            }
            backends.insert(service.name.clone(), live);
        }

        let mut cert_pems = BTreeMap::new();
        for cert in store.list_tls_certificates() {
            let Ok(key_der) = secrets.decrypt(&cert.key_pem) else { continue };
            for host in &cert.hosts {
                cert_pems.insert(host.clone(), (cert.cert_pem.clone(), key_der.clone()));
            }
        }

        let cursors = backends.keys().map(|k| (k.clone(), RoundRobin(AtomicUsize::new(0)))).collect();

        RoutingTable { hosts, wildcard_hosts, backends, cursors, cert_pems }
    }

    /// Host first by exact match, then wildcard suffix; within a host, Exact
    /// paths before Prefix, longest prefix wins.
    pub fn match_route(&self, host: &str, path: &str) -> Option<MatchedRoute> {
        let host_key = host.split(':').next().unwrap_or(host);

        let table = self.hosts.get(host_key).or_else(|| {
            self.wildcard_hosts.iter().find(|(suffix, _)| host_key.ends_with(suffix.as_str())).map(|(_, t)| t)
        })?;

        if let Some(exact) = table.exact.get(path) {
            return Some(MatchedRoute { path: exact.clone(), host: host_key.to_string() });
        }
        table
            .prefixes
            .iter()
            .find(|p| path.starts_with(p.path.as_str()))
            .map(|p| MatchedRoute { path: p.clone(), host: host_key.to_string() })
    }

    pub fn next_backend(&self, service_name: &str) -> Option<Backend> {
        let backends = self.backends.get(service_name)?;
        if backends.is_empty() {
            return None;
        }
        let cursor = self.cursors.get(service_name)?;
        let i = cursor.0.fetch_add(1, Ordering::Relaxed) % backends.len();
        Some(backends[i].clone())
    }
}

fn node_host(address: &str) -> &str {
    address.rsplit_once(':').map(|(host, _)| host).unwrap_or(address)
}

/// Publish cell for the routing table: a whole new snapshot is swapped in
/// under a write lock, but every request only ever holds one `Arc` it read
/// once, so it sees either the old table or the new one, never a partial
/// update from a table being mutated mid-request.
pub struct RoutingCell {
    inner: std::sync::RwLock<Arc<RoutingTable>>,
}

impl RoutingCell {
    pub fn new(table: RoutingTable) -> Self {
        RoutingCell { inner: std::sync::RwLock::new(Arc::new(table)) }
    }

    pub fn load(&self) -> Arc<RoutingTable> {
        self.inner.read().unwrap().clone()
    }

    pub fn store(&self, table: RoutingTable) {
        *self.inner.write().unwrap() = Arc::new(table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use warren_control::model::{HeaderOps, Ingress, IngressRule};

    fn path(p: &str, path_type: PathType, service: &str) -> IngressPath {
        IngressPath {
            path: p.to_string(),
            path_type,
            backend_service: service.to_string(),
            backend_port: 80,
            strip_prefix: None,
            replace_path: None,
            headers: HeaderOps::default(),
            rate_limit: None,
            access_control: None,
        }
    }

    fn store_with_ingress(ingress: Ingress) -> Store {
        let store = Store::new();
        store.put_ingress(ingress);
        store
    }

    #[test]
    fn exact_path_wins_over_prefix() {
        let ingress = Ingress {
            id: "i1".into(),
            name: "test".into(),
            rules: vec![IngressRule {
                host: "a.example".into(),
                paths: vec![
                    path("/api", PathType::Prefix, "api"),
                    path("/api", PathType::Exact, "api-exact"),
                ],
            }],
            tls: None,
            labels: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let store = store_with_ingress(ingress);
        let secrets = SecretsEngine::from_cluster_id("c1");
        let table = RoutingTable::build(&store, &secrets);

        let matched = table.match_route("a.example", "/api").unwrap();
        assert_eq!(matched.path.backend_service, "api-exact");
    }

    #[test]
    fn longest_prefix_wins() {
        let ingress = Ingress {
            id: "i1".into(),
            name: "test".into(),
            rules: vec![IngressRule {
                host: "a.example".into(),
                paths: vec![path("/", PathType::Prefix, "web"), path("/api", PathType::Prefix, "api")],
            }],
            tls: None,
            labels: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let store = store_with_ingress(ingress);
        let secrets = SecretsEngine::from_cluster_id("c1");
        let table = RoutingTable::build(&store, &secrets);

        assert_eq!(table.match_route("a.example", "/api/v1/users").unwrap().path.backend_service, "api");
        assert_eq!(table.match_route("a.example", "/docs").unwrap().path.backend_service, "web");
    }

    #[test]
    fn wildcard_host_matches_subdomain() {
        let ingress = Ingress {
            id: "i1".into(),
            name: "test".into(),
            rules: vec![IngressRule { host: "*.example".into(), paths: vec![path("/", PathType::Prefix, "web")] }],
            tls: None,
            labels: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let store = store_with_ingress(ingress);
        let secrets = SecretsEngine::from_cluster_id("c1");
        let table = RoutingTable::build(&store, &secrets);

        assert!(table.match_route("foo.example", "/").is_some());
        assert!(table.match_route("unrelated.com", "/").is_none());
    }
}
