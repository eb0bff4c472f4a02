//! Per-service tonic handlers. Every write RPC follows the same shape:
//! translate the request into a `Command`, submit it through raft, translate
//! the `Outcome`/error back. Reads go straight to the local `Store` — they
//! don't need to cross raft, since every replica's store is caught up to at
//! least what it has applied from its own log.

pub mod cluster;
pub mod container;
pub mod ingress;
pub mod node;
pub mod secret;
pub mod service;
pub mod tls;
pub mod volume;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use warren_control::state_machine::{ApplyResult, ClusterStateMachine};
use warren_control::{Command, Outcome};
use warren_crypto::ca::CertificateAuthority;
use warren_crypto::secrets::SecretsEngine;
use warren_raft::{Node, ServerId};

use crate::error_map::{control_error_to_status, deserialize_error, raft_error_to_status};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared dependencies every gRPC service handler needs.
pub struct Ctx {
    pub node: Node<ClusterStateMachine>,
    pub state: Arc<ClusterStateMachine>,
    pub secrets: SecretsEngine,
    pub peers: HashMap<ServerId, String>,
    pub cluster_id: String,
    pub cluster_name: String,
    pub bind: String,
    /// Every node can hand out the root cert; only the node holding the
    /// private key can sign new leaves with it.
    pub ca_cert_pem: String,
    pub ca: Option<Arc<CertificateAuthority>>,
}

impl Ctx {
    pub async fn submit(&self, cmd: Command) -> Result<Outcome, tonic::Status> {
        let bytes = serde_json::to_vec(&cmd).expect("Command always serializes");
        let applied =
            self.node.execute(bytes, COMMAND_TIMEOUT).await.map_err(|e| raft_error_to_status(e, &self.peers))?;
        let result: ApplyResult = serde_json::from_slice(&applied).map_err(deserialize_error)?;
        result.0.map_err(control_error_to_status)
    }

    pub fn store(&self) -> &warren_control::kv::Store {
        &self.state.store
    }
}
