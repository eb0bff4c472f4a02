//! Local health probes against running containers. Workers only report
//! results; they never act on them directly — the reconciler decides what
//! to do with a container that fails enough consecutive checks.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::runtime::ContainerRuntime;

#[derive(Debug, Clone)]
pub enum HealthCheckSpec {
    None,
    Http { url: String },
    Tcp { address: String },
    Exec { command: Vec<String> },
}

pub struct HealthChecker {
    runtime: Arc<dyn ContainerRuntime>,
    http: hyper::Client<hyper::client::HttpConnector>,
}

impl HealthChecker {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        HealthChecker { runtime, http: hyper::Client::new() }
    }

    pub async fn check(&self, runtime_id: &str, spec: &HealthCheckSpec, timeout_secs: u32) -> bool {
        let budget = Duration::from_secs(timeout_secs.max(1) as u64);
        match spec {
            HealthCheckSpec::None => true,
            HealthCheckSpec::Http { url } => self.check_http(url, budget).await,
            HealthCheckSpec::Tcp { address } => self.check_tcp(address, budget).await,
            HealthCheckSpec::Exec { command } => self.check_exec(runtime_id, command, budget).await,
        }
    }

    async fn check_http(&self, url: &str, budget: Duration) -> bool {
        let uri: hyper::Uri = match url.parse() {
            Ok(u) => u,
            Err(_) => return false,
        };
        match timeout(budget, self.http.get(uri)).await {
            Ok(Ok(resp)) => resp.status().is_success(),
            _ => false,
        }
    }

    async fn check_tcp(&self, address: &str, budget: Duration) -> bool {
        matches!(timeout(budget, TcpStream::connect(address)).await, Ok(Ok(_)))
    }

    async fn check_exec(&self, runtime_id: &str, command: &[String], budget: Duration) -> bool {
        let fut = self.runtime.exec(runtime_id, command.to_vec());
        matches!(timeout(budget, fut).await, Ok(Ok(0)))
    }
}
