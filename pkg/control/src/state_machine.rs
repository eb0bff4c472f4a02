//! Wires `Store` + `command::apply` into `warren_raft::StateMachine`, and
//! fans out watch-stream notifications after every successful apply.

use std::sync::Arc;

use warren_raft::StateMachine;

use crate::command::{self, Command, Outcome};
use crate::error::ControlError;
use crate::events::{Event, EventBus};
use crate::kv::Store;

#[derive(serde::Serialize, serde::Deserialize)]
pub struct ApplyResult(pub Result<Outcome, ControlError>);

pub struct ClusterStateMachine {
    /// Shared so the ingress server can hold its own handle to the exact
    /// same materialized view without going through raft for reads.
    pub store: Arc<Store>,
    pub events: EventBus,
}

impl Default for ClusterStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStateMachine {
    pub fn new() -> Self {
        ClusterStateMachine { store: Arc::new(Store::new()), events: EventBus::new() }
    }

    fn notify(&self, cmd: &Command) {
        match cmd {
            Command::CreatePendingContainer { id, .. }
            | Command::CreateAndAssignContainer { id, .. }
            | Command::AssignContainer { id, .. }
            | Command::UpdateContainerStatus { id, .. }
            | Command::ReportContainerHealth { id, .. }
            | Command::SetContainerDesiredState { id, .. } => {
                if let Some(c) = self.store.get_container(id) {
                    self.events.publish(Event::ContainerChanged(c));
                }
            }
            Command::DeleteContainer { id } => {
                self.events.publish(Event::ContainerDeleted(id.clone()));
            }
            Command::RegisterNode { id, .. } | Command::HeartbeatNode { id, .. } | Command::SetNodeStatus { id, .. } => {
                if let Some(n) = self.store.get_node(id) {
                    self.events.publish(Event::NodeChanged(n));
                }
            }
            Command::CreateIngress { id, .. } | Command::UpdateIngress { id, .. } => {
                if let Some(i) = self.store.get_ingress(id) {
                    self.events.publish(Event::IngressChanged(i));
                }
            }
            Command::DeleteIngress { id } => {
                self.events.publish(Event::IngressDeleted(id.clone()));
            }
            Command::PutTlsCertificate { id, .. } => {
                if let Some(t) = self.store.get_tls_certificate(id) {
                    self.events.publish(Event::TlsCertificateChanged(t));
                }
            }
            _ => {}
        }
    }
}

impl StateMachine for ClusterStateMachine {
    fn apply(&self, command: &[u8]) -> Vec<u8> {
        let cmd: Command = match serde_json::from_slice(command) {
            Ok(cmd) => cmd,
            Err(e) => {
                let result = ApplyResult(Err(ControlError::InvalidArgument(format!("malformed command: {e}"))));
                return serde_json::to_vec(&result).expect("ApplyResult always serializes");
            }
        };
        let result = command::apply(&self.store, cmd.clone());
        if result.is_ok() {
            self.notify(&cmd);
        }
        serde_json::to_vec(&ApplyResult(result)).expect("ApplyResult always serializes")
    }

    fn snapshot(&self) -> Vec<u8> {
        self.store.snapshot()
    }

    fn restore(&self, snapshot: &[u8]) {
        self.store.restore(snapshot);
    }
}
