use std::sync::Arc;

use tonic::{Request, Response, Status};

use warren_control::Command;
use warren_proto::cluster::ingress_service_server::IngressService;
use warren_proto::cluster::{
    CreateIngressRequest, DeleteIngressRequest, DeleteIngressResponse, GetIngressRequest, Ingress,
    ListIngressesRequest, ListIngressesResponse, UpdateIngressRequest,
};

use crate::grpc::Ctx;
use crate::mapping::{self, ingress_to_pb};

pub struct IngressServiceImpl(pub Arc<Ctx>);

#[tonic::async_trait]
impl IngressService for IngressServiceImpl {
    async fn create(&self, request: Request<CreateIngressRequest>) -> Result<Response<Ingress>, Status> {
        let pb = request.into_inner().ingress.ok_or_else(|| Status::invalid_argument("missing ingress"))?;
        let id = uuid::Uuid::new_v4().to_string();
        let cmd = Command::CreateIngress {
            id: id.clone(),
            name: pb.name,
            rules: pb.rules.iter().map(mapping::ingress_rule_from_pb).collect(),
            tls: pb.tls.as_ref().map(mapping::ingress_tls_from_pb),
            labels: pb.labels.into_iter().collect(),
        };
        self.0.submit(cmd).await?;
        let ingress = self.0.store().get_ingress(&id).ok_or_else(|| Status::internal("ingress vanished after create"))?;
        Ok(Response::new(ingress_to_pb(&ingress)))
    }

    async fn update(&self, request: Request<UpdateIngressRequest>) -> Result<Response<Ingress>, Status> {
        let pb = request.into_inner().ingress.ok_or_else(|| Status::invalid_argument("missing ingress"))?;
        let id = pb.id.clone();
        let cmd = Command::UpdateIngress {
            id: id.clone(),
            rules: pb.rules.iter().map(mapping::ingress_rule_from_pb).collect(),
        };
        self.0.submit(cmd).await?;
        let ingress = self.0.store().get_ingress(&id).ok_or_else(|| Status::not_found(format!("ingress {id}")))?;
        Ok(Response::new(ingress_to_pb(&ingress)))
    }

    async fn get(&self, request: Request<GetIngressRequest>) -> Result<Response<Ingress>, Status> {
        let id = request.into_inner().id;
        let ingress = self.0.store().get_ingress(&id).ok_or_else(|| Status::not_found(format!("ingress {id}")))?;
        Ok(Response::new(ingress_to_pb(&ingress)))
    }

    async fn list(&self, _request: Request<ListIngressesRequest>) -> Result<Response<ListIngressesResponse>, Status> {
        let ingresses = self.0.store().list_ingresses().iter().map(ingress_to_pb).collect();
        Ok(Response::new(ListIngressesResponse { ingresses }))
    }

    async fn delete(&self, request: Request<DeleteIngressRequest>) -> Result<Response<DeleteIngressResponse>, Status> {
        let id = request.into_inner().id;
        self.0.submit(Command::DeleteIngress { id }).await?;
        Ok(Response::new(DeleteIngressResponse {}))
    }
}
