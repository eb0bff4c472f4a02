use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};

use warren_control::model::{NodeRole, TokenRole};
use warren_control::{bootstrap, Command, Event};
use warren_crypto::{format_not_after, SanType, SubjectClass};
use warren_proto::cluster::cluster_service_server::ClusterService;
use warren_proto::cluster::{
    Event as PbEvent, GenerateJoinTokenRequest, GenerateJoinTokenResponse, GetClusterInfoRequest,
    GetClusterInfoResponse, JoinClusterRequest, JoinClusterResponse, RenewCertificateRequest,
    RequestCertificateRequest, RequestCertificateResponse, StreamEventsRequest,
};

use crate::grpc::Ctx;
use crate::mapping::{node_role_from_pb, node_to_pb};

pub struct ClusterServiceImpl(pub Arc<Ctx>);

fn token_role_from_node_role(role: NodeRole) -> TokenRole {
    match role {
        NodeRole::Manager => TokenRole::Manager,
        NodeRole::Worker => TokenRole::Worker,
        NodeRole::Hybrid => TokenRole::Worker,
    }
}

fn subject_class_from_node_role(role: NodeRole) -> SubjectClass {
    match role {
        NodeRole::Manager => SubjectClass::Manager,
        NodeRole::Worker | NodeRole::Hybrid => SubjectClass::Worker,
    }
}

#[tonic::async_trait]
impl ClusterService for ClusterServiceImpl {
    async fn generate_join_token(
        &self,
        request: Request<GenerateJoinTokenRequest>,
    ) -> Result<Response<GenerateJoinTokenResponse>, Status> {
        let role = node_role_from_pb(request.into_inner().role);
        let minted = bootstrap::mint(token_role_from_node_role(role));
        self.0.submit(minted.issue_command).await?;
        Ok(Response::new(GenerateJoinTokenResponse { token: minted.raw }))
    }

    async fn join_cluster(&self, request: Request<JoinClusterRequest>) -> Result<Response<JoinClusterResponse>, Status> {
        let req = request.into_inner();
        let hash = bootstrap::hash_token(&req.token);
        let token = self.0.store().get_token(&hash).ok_or_else(|| Status::unauthenticated("unknown token"))?;
        if token.used {
            return Err(Status::unauthenticated("token already used"));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let node_role = match token.role {
            TokenRole::Manager => NodeRole::Manager,
            TokenRole::Worker => NodeRole::Worker,
            TokenRole::Cli => return Err(Status::permission_denied("a CLI token cannot join a node")),
        };
        self.0
            .submit(Command::RegisterNode {
                id: id.clone(),
                role: node_role,
                address: req.address,
                overlay_ip: None,
                hostname: id.clone(),
                labels: Default::default(),
                resources: Default::default(),
            })
            .await?;
        self.0.submit(Command::RedeemToken { hash }).await?;

        let node = self.0.store().get_node(&id).ok_or_else(|| Status::internal("node vanished after join"))?;
        Ok(Response::new(JoinClusterResponse { node: Some(node_to_pb(&node)) }))
    }

    async fn get_cluster_info(
        &self,
        _request: Request<GetClusterInfoRequest>,
    ) -> Result<Response<GetClusterInfoResponse>, Status> {
        let managers = self
            .0
            .store()
            .list_nodes()
            .into_iter()
            .filter(|n| matches!(n.role, NodeRole::Manager | NodeRole::Hybrid))
            .collect::<Vec<_>>();
        let leader_address = self
            .0
            .node
            .leader_hint()
            .and_then(|id| self.0.peers.get(&id).cloned())
            .or_else(|| self.0.node.is_leader().then(|| self.0.bind.clone()));
        Ok(Response::new(GetClusterInfoResponse {
            cluster_id: self.0.cluster_id.clone(),
            leader_address: leader_address.unwrap_or_default(),
            managers: managers.iter().map(node_to_pb).collect(),
            ca_cert_pem: self.0.ca_cert_pem.clone(),
        }))
    }

    /// Served under server-auth-only TLS: the caller has only a join token,
    /// not a client certificate yet. Only verifies the token; `join_cluster`
    /// (called next, over the mTLS connection this certificate unlocks) is
    /// what actually consumes it, so a node that gets a certificate but
    /// never completes the join can retry with the same token.
    async fn request_certificate(
        &self,
        request: Request<RequestCertificateRequest>,
    ) -> Result<Response<RequestCertificateResponse>, Status> {
        let req = request.into_inner();
        let role = node_role_from_pb(req.role);
        bootstrap::verify(self.0.store(), &req.token, token_role_from_node_role(role))
            .map_err(crate::error_map::control_error_to_status)?;

        let ca = self.0.ca.as_ref().ok_or_else(|| {
            Status::failed_precondition("this node doesn't hold the cluster CA key; retry against a manager that does")
        })?;
        let host = req.address.rsplit_once(':').map(|(h, _)| h).unwrap_or(&req.address);
        let sans = vec![SanType::DnsName(host.to_string())];
        let issued = ca
            .issue(subject_class_from_node_role(role), &req.node_id, &sans)
            .map_err(|e| Status::internal(format!("issuing certificate: {e}")))?;

        Ok(Response::new(RequestCertificateResponse {
            not_after: format_not_after(issued.not_after),
            leaf_cert_pem: issued.cert_pem,
            leaf_key_pem: issued.key_pem,
            ca_cert_pem: self.0.ca_cert_pem.clone(),
        }))
    }

    /// Served over the caller's existing mTLS connection, so unlike
    /// `request_certificate` there's no join token to verify: reaching this
    /// handler at all already proves the caller presented a cert this CA
    /// signed. Used only to refresh a leaf nearing expiry.
    async fn renew_certificate(
        &self,
        request: Request<RenewCertificateRequest>,
    ) -> Result<Response<RequestCertificateResponse>, Status> {
        let req = request.into_inner();
        let role = node_role_from_pb(req.role);

        let ca = self.0.ca.as_ref().ok_or_else(|| {
            Status::failed_precondition("this node doesn't hold the cluster CA key; retry against a manager that does")
        })?;
        let host = req.address.rsplit_once(':').map(|(h, _)| h).unwrap_or(&req.address);
        let sans = vec![SanType::DnsName(host.to_string())];
        let issued = ca
            .issue(subject_class_from_node_role(role), &req.node_id, &sans)
            .map_err(|e| Status::internal(format!("issuing certificate: {e}")))?;

        Ok(Response::new(RequestCertificateResponse {
            not_after: format_not_after(issued.not_after),
            leaf_cert_pem: issued.cert_pem,
            leaf_key_pem: issued.key_pem,
            ca_cert_pem: self.0.ca_cert_pem.clone(),
        }))
    }

    type StreamEventsStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<PbEvent, Status>> + Send + 'static>>;

    async fn stream_events(
        &self,
        _request: Request<StreamEventsRequest>,
    ) -> Result<Response<Self::StreamEventsStream>, Status> {
        let rx = self.0.state.events.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|item| {
            let event = item.ok()?;
            let (kind, entity_id) = match event {
                Event::ContainerChanged(c) => ("container_changed", c.id),
                Event::ContainerDeleted(id) => ("container_deleted", id),
                Event::NodeChanged(n) => ("node_changed", n.id),
                Event::IngressChanged(i) => ("ingress_changed", i.id),
                Event::IngressDeleted(id) => ("ingress_deleted", id),
                Event::TlsCertificateChanged(t) => ("tls_certificate_changed", t.id),
            };
            Some(Ok(PbEvent { kind: kind.to_string(), entity_id, at_unix_millis: chrono::Utc::now().timestamp_millis() }))
        });
        Ok(Response::new(Box::pin(stream)))
    }
}
