use std::sync::Arc;

use tonic::{Request, Response, Status};

use warren_control::Command;
use warren_proto::cluster::tls_certificate_service_server::TlsCertificateService;
use warren_proto::cluster::{
    DeleteTlsCertificateRequest, DeleteTlsCertificateResponse, GetTlsCertificateRequest, ListTlsCertificatesRequest,
    ListTlsCertificatesResponse, TlsCertificate,
};

use crate::grpc::Ctx;
use crate::mapping::tls_certificate_to_pb;

/// Certificates are never created or updated directly by a client: they
/// come from ACME issuance or `PutTlsCertificate` submitted internally by
/// the ingress renewal loop. This service is read/delete only.
pub struct TlsCertificateServiceImpl(pub Arc<Ctx>);

#[tonic::async_trait]
impl TlsCertificateService for TlsCertificateServiceImpl {
    async fn get(&self, request: Request<GetTlsCertificateRequest>) -> Result<Response<TlsCertificate>, Status> {
        let id = request.into_inner().id;
        let cert = self.0.store().get_tls_certificate(&id).ok_or_else(|| Status::not_found(format!("tls certificate {id}")))?;
        Ok(Response::new(tls_certificate_to_pb(&cert)))
    }

    async fn list(
        &self,
        _request: Request<ListTlsCertificatesRequest>,
    ) -> Result<Response<ListTlsCertificatesResponse>, Status> {
        let certificates = self.0.store().list_tls_certificates().iter().map(tls_certificate_to_pb).collect();
        Ok(Response::new(ListTlsCertificatesResponse { certificates }))
    }

    async fn delete(
        &self,
        request: Request<DeleteTlsCertificateRequest>,
    ) -> Result<Response<DeleteTlsCertificateResponse>, Status> {
        let id = request.into_inner().id;
        self.0.submit(Command::DeleteTlsCertificate { id }).await?;
        Ok(Response::new(DeleteTlsCertificateResponse {}))
    }
}
