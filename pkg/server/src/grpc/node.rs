use std::sync::Arc;

use tonic::{Request, Response, Status};

use warren_control::model::Resources;
use warren_control::{Command, Outcome};
use warren_proto::cluster::node_service_server::NodeService;
use warren_proto::cluster::{
    GetNodeRequest, HeartbeatRequest, HeartbeatResponse, ListNodesRequest, ListNodesResponse, Node,
    RegisterNodeRequest, RegisterNodeResponse, RemoveNodeRequest, RemoveNodeResponse,
};

use crate::mapping::{self, node_role_from_pb, node_to_pb};
use crate::grpc::Ctx;

pub struct NodeServiceImpl(pub Arc<Ctx>);

#[tonic::async_trait]
impl NodeService for NodeServiceImpl {
    async fn register(&self, request: Request<RegisterNodeRequest>) -> Result<Response<RegisterNodeResponse>, Status> {
        let req = request.into_inner();
        let resources: Resources = req.resources.as_ref().map(mapping::resources_from_pb).unwrap_or_default();
        let id = uuid::Uuid::new_v4().to_string();
        let cmd = Command::RegisterNode {
            id: id.clone(),
            role: node_role_from_pb(req.role),
            address: req.address,
            overlay_ip: None,
            hostname: req.hostname,
            labels: req.labels.into_iter().collect(),
            resources,
        };
        self.0.submit(cmd).await?;
        let node = self.0.store().get_node(&id).ok_or_else(|| Status::internal("node vanished after registration"))?;
        Ok(Response::new(RegisterNodeResponse { node: Some(node_to_pb(&node)) }))
    }

    async fn heartbeat(&self, request: Request<HeartbeatRequest>) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        let available = req.available_resources.as_ref().map(mapping::resources_from_pb).unwrap_or_default();
        self.0
            .submit(Command::HeartbeatNode { id: req.node_id.clone(), available_resources: available })
            .await?;

        for delta in req.container_statuses {
            let cmd = Command::UpdateContainerStatus {
                id: delta.container_id,
                actual_state: mapping::actual_state_from_wire(&delta.actual_state),
                runtime_id: if delta.runtime_id.is_empty() { None } else { Some(delta.runtime_id) },
                exit_code: delta.exit_code,
                error: if delta.error.is_empty() { None } else { Some(delta.error) },
            };
            // A stale or already-deleted container in a heartbeat batch must
            // not fail the whole heartbeat; log and move on.
            if let Err(status) = self.0.submit(cmd).await {
                tracing::debug!(node = %req.node_id, error = %status, "dropping stale container status in heartbeat");
            }
        }

        Ok(Response::new(HeartbeatResponse { server_time_unix_millis: chrono::Utc::now().timestamp_millis() }))
    }

    async fn list(&self, _request: Request<ListNodesRequest>) -> Result<Response<ListNodesResponse>, Status> {
        let nodes = self.0.store().list_nodes().iter().map(node_to_pb).collect();
        Ok(Response::new(ListNodesResponse { nodes }))
    }

    async fn get(&self, request: Request<GetNodeRequest>) -> Result<Response<Node>, Status> {
        let id = request.into_inner().id;
        let node = self.0.store().get_node(&id).ok_or_else(|| Status::not_found(format!("node {id}")))?;
        Ok(Response::new(node_to_pb(&node)))
    }

    async fn remove(&self, request: Request<RemoveNodeRequest>) -> Result<Response<RemoveNodeResponse>, Status> {
        let id = request.into_inner().id;
        match self.0.submit(Command::RemoveNode { id }).await? {
            Outcome::Unit | Outcome::Id(_) => Ok(Response::new(RemoveNodeResponse {})),
        }
    }
}
