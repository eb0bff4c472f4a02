use std::sync::Arc;

use tonic::{Request, Response, Status};

use warren_control::Command;
use warren_proto::cluster::volume_service_server::VolumeService;
use warren_proto::cluster::{
    CreateVolumeRequest, DeleteVolumeRequest, DeleteVolumeResponse, GetVolumeRequest, ListVolumesRequest,
    ListVolumesResponse, Volume,
};

use crate::grpc::Ctx;
use crate::mapping::volume_to_pb;

pub struct VolumeServiceImpl(pub Arc<Ctx>);

#[tonic::async_trait]
impl VolumeService for VolumeServiceImpl {
    async fn create(&self, request: Request<CreateVolumeRequest>) -> Result<Response<Volume>, Status> {
        let v = request.into_inner().volume.ok_or_else(|| Status::invalid_argument("missing volume"))?;
        let id = uuid::Uuid::new_v4().to_string();
        let cmd = Command::CreateVolume {
            id: id.clone(),
            name: v.name,
            driver: v.driver,
            node_id: if v.node_id.is_empty() { None } else { Some(v.node_id) },
            mount_path: v.mount_path,
            options: v.options.into_iter().collect(),
        };
        self.0.submit(cmd).await?;
        let volume = self.0.store().get_volume(&id).ok_or_else(|| Status::internal("volume vanished after create"))?;
        Ok(Response::new(volume_to_pb(&volume)))
    }

    async fn get(&self, request: Request<GetVolumeRequest>) -> Result<Response<Volume>, Status> {
        let id = request.into_inner().id;
        let volume = self.0.store().get_volume(&id).ok_or_else(|| Status::not_found(format!("volume {id}")))?;
        Ok(Response::new(volume_to_pb(&volume)))
    }

    async fn list(&self, _request: Request<ListVolumesRequest>) -> Result<Response<ListVolumesResponse>, Status> {
        let volumes = self.0.store().list_volumes().iter().map(volume_to_pb).collect();
        Ok(Response::new(ListVolumesResponse { volumes }))
    }

    async fn delete(&self, request: Request<DeleteVolumeRequest>) -> Result<Response<DeleteVolumeResponse>, Status> {
        let id = request.into_inner().id;
        self.0.submit(Command::DeleteVolume { id }).await?;
        Ok(Response::new(DeleteVolumeResponse {}))
    }
}
