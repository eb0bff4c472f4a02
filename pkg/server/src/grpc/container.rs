use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};

use warren_control::{Command, Event};
use warren_proto::cluster::container_service_server::ContainerService;
use warren_proto::cluster::{
    container_event, ContainerEvent, ContainerInstance, GetContainerRequest, ListContainersRequest,
    ListContainersResponse, ReportContainerHealthRequest, ReportContainerHealthResponse, UpdateContainerStatusRequest,
    UpdateContainerStatusResponse, WatchContainersRequest,
};

use crate::grpc::Ctx;
use crate::mapping::{self, container_to_pb};

pub struct ContainerServiceImpl(pub Arc<Ctx>);

#[tonic::async_trait]
impl ContainerService for ContainerServiceImpl {
    async fn update_status(
        &self,
        request: Request<UpdateContainerStatusRequest>,
    ) -> Result<Response<UpdateContainerStatusResponse>, Status> {
        let delta = request.into_inner().delta.ok_or_else(|| Status::invalid_argument("missing delta"))?;
        let cmd = Command::UpdateContainerStatus {
            id: delta.container_id,
            actual_state: mapping::actual_state_from_wire(&delta.actual_state),
            runtime_id: if delta.runtime_id.is_empty() { None } else { Some(delta.runtime_id) },
            exit_code: delta.exit_code,
            error: if delta.error.is_empty() { None } else { Some(delta.error) },
        };
        self.0.submit(cmd).await?;
        Ok(Response::new(UpdateContainerStatusResponse {}))
    }

    async fn list(&self, request: Request<ListContainersRequest>) -> Result<Response<ListContainersResponse>, Status> {
        let req = request.into_inner();
        let mut containers = if !req.service_id.is_empty() {
            self.0.store().containers_for_service(&req.service_id)
        } else if !req.node_id.is_empty() {
            self.0.store().containers_for_node(&req.node_id)
        } else {
            self.0.store().list_containers()
        };
        if !req.service_id.is_empty() && !req.node_id.is_empty() {
            containers.retain(|c| c.node_id.as_deref() == Some(req.node_id.as_str()));
        }
        Ok(Response::new(ListContainersResponse { containers: containers.iter().map(container_to_pb).collect() }))
    }

    async fn get(&self, request: Request<GetContainerRequest>) -> Result<Response<ContainerInstance>, Status> {
        let id = request.into_inner().id;
        let container = self.0.store().get_container(&id).ok_or_else(|| Status::not_found(format!("container {id}")))?;
        Ok(Response::new(container_to_pb(&container)))
    }

    type WatchStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<ContainerEvent, Status>> + Send + 'static>>;

    async fn watch(&self, request: Request<WatchContainersRequest>) -> Result<Response<Self::WatchStream>, Status> {
        let node_id = request.into_inner().node_id;
        let rx = self.0.state.events.subscribe();

        // The bus doesn't distinguish a container's first change from a
        // later one, so every live update is reported as `UPDATED`; only a
        // removal gets its own `DELETED` kind.
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let event = item.ok()?;
            let (kind, container) = match event {
                Event::ContainerChanged(c) => {
                    if !node_id.is_empty() && c.node_id.as_deref() != Some(node_id.as_str()) {
                        return None;
                    }
                    (container_event::Kind::Updated, container_to_pb(&c))
                }
                Event::ContainerDeleted(id) => {
                    (container_event::Kind::Deleted, ContainerInstance { id, ..Default::default() })
                }
                _ => return None,
            };
            Some(Ok(ContainerEvent { kind: kind as i32, container: Some(container) }))
        });

        Ok(Response::new(Box::pin(stream)))
    }

    async fn report_health(
        &self,
        request: Request<ReportContainerHealthRequest>,
    ) -> Result<Response<ReportContainerHealthResponse>, Status> {
        let req = request.into_inner();
        let cmd = Command::ReportContainerHealth {
            id: req.container_id,
            status: mapping::health_status_from_wire(&req.health_status),
        };
        self.0.submit(cmd).await?;
        Ok(Response::new(ReportContainerHealthResponse {}))
    }
}
