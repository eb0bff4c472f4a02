use std::sync::Arc;

use tonic::{Request, Response, Status};

use warren_control::Command;
use warren_proto::cluster::service_service_server::ServiceService;
use warren_proto::cluster::{
    CreateServiceRequest, DeleteServiceRequest, DeleteServiceResponse, GetServiceRequest, ListServicesRequest,
    ListServicesResponse, ServiceResponse, UpdateServiceRequest,
};

use crate::grpc::Ctx;
use crate::mapping::{self, service_to_pb};

pub struct ServiceServiceImpl(pub Arc<Ctx>);

#[tonic::async_trait]
impl ServiceService for ServiceServiceImpl {
    async fn create(&self, request: Request<CreateServiceRequest>) -> Result<Response<ServiceResponse>, Status> {
        let spec = request.into_inner().service.ok_or_else(|| Status::invalid_argument("missing service"))?;
        let fields = mapping::service_from_pb(&spec);
        let id = uuid::Uuid::new_v4().to_string();
        let cmd = Command::CreateService {
            id: id.clone(),
            name: fields.name,
            image: fields.image,
            replicas: fields.replicas,
            mode: fields.mode,
            env: fields.env,
            ports: fields.ports,
            secret_refs: fields.secret_refs,
            volume_mounts: fields.volume_mounts,
            labels: fields.labels,
            health_check: fields.health_check,
            restart_policy: fields.restart_policy,
            resources: fields.resources,
            stop_timeout_secs: fields.stop_timeout_secs,
        };
        self.0.submit(cmd).await?;
        let svc = self.0.store().get_service(&id).ok_or_else(|| Status::internal("service vanished after create"))?;
        Ok(Response::new(ServiceResponse { service: Some(service_to_pb(&svc)) }))
    }

    async fn update(&self, request: Request<UpdateServiceRequest>) -> Result<Response<ServiceResponse>, Status> {
        let spec = request.into_inner().service.ok_or_else(|| Status::invalid_argument("missing service"))?;
        let id = spec.id.clone();
        let cmd = Command::UpdateService {
            id: id.clone(),
            replicas: Some(spec.replicas),
            image: if spec.image.is_empty() { None } else { Some(spec.image.clone()) },
        };
        self.0.submit(cmd).await?;
        let svc = self.0.store().get_service(&id).ok_or_else(|| Status::not_found(format!("service {id}")))?;
        Ok(Response::new(ServiceResponse { service: Some(service_to_pb(&svc)) }))
    }

    async fn delete(&self, request: Request<DeleteServiceRequest>) -> Result<Response<DeleteServiceResponse>, Status> {
        let id = request.into_inner().id;
        self.0.submit(Command::DeleteService { id }).await?;
        Ok(Response::new(DeleteServiceResponse {}))
    }

    async fn get(&self, request: Request<GetServiceRequest>) -> Result<Response<ServiceResponse>, Status> {
        let id = request.into_inner().id;
        let svc = self.0.store().get_service(&id).ok_or_else(|| Status::not_found(format!("service {id}")))?;
        Ok(Response::new(ServiceResponse { service: Some(service_to_pb(&svc)) }))
    }

    async fn list(&self, _request: Request<ListServicesRequest>) -> Result<Response<ListServicesResponse>, Status> {
        let services = self.0.store().list_services().iter().map(service_to_pb).collect();
        Ok(Response::new(ListServicesResponse { services }))
    }
}
