//! Thin tonic client wrapper used by the join/bootstrap flow and by any
//! future CLI subcommands. Deliberately small: most callers inside this
//! binary talk to the local `Node`/`Store` directly, this is only for
//! talking to a *different* manager over the network.

use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};

use warren_proto::cluster::cluster_service_client::ClusterServiceClient;
use warren_proto::cluster::{
    GenerateJoinTokenRequest, GenerateJoinTokenResponse, GetClusterInfoRequest, GetClusterInfoResponse,
    JoinClusterRequest, JoinClusterResponse, RenewCertificateRequest, RequestCertificateRequest,
    RequestCertificateResponse,
};

/// Dials a manager for the `RequestCertificate` RPC, which per the wire
/// contract is served under server-auth-only TLS: the joining node has no
/// client certificate yet, only the CA pem of the cluster it wants to join.
pub async fn connect_server_auth_only(addr: &str, ca_cert_pem: &str) -> anyhow::Result<ClusterServiceClient<Channel>> {
    let tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca_cert_pem));
    let channel = Channel::from_shared(format!("https://{addr}"))?.tls_config(tls)?.connect().await?;
    Ok(ClusterServiceClient::new(channel))
}

/// Dials a manager with a full mTLS identity, for use once this node has
/// its own leaf certificate.
pub async fn connect_mtls(
    addr: &str,
    ca_cert_pem: &str,
    client_cert_pem: &str,
    client_key_pem: &str,
) -> anyhow::Result<ClusterServiceClient<Channel>> {
    let identity = Identity::from_pem(client_cert_pem, client_key_pem);
    let tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca_cert_pem)).identity(identity);
    let channel = Channel::from_shared(format!("https://{addr}"))?.tls_config(tls)?.connect().await?;
    Ok(ClusterServiceClient::new(channel))
}

pub async fn request_certificate(
    client: &mut ClusterServiceClient<Channel>,
    token: String,
    node_id: String,
    role: i32,
    address: String,
) -> Result<RequestCertificateResponse, tonic::Status> {
    let req = RequestCertificateRequest { token, node_id, role, address };
    Ok(client.request_certificate(req).await?.into_inner())
}

/// Refreshes a leaf certificate nearing expiry, over the node's existing
/// mTLS identity rather than a join token.
pub async fn renew_certificate(
    client: &mut ClusterServiceClient<Channel>,
    node_id: String,
    role: i32,
    address: String,
) -> Result<RequestCertificateResponse, tonic::Status> {
    let req = RenewCertificateRequest { node_id, role, address };
    Ok(client.renew_certificate(req).await?.into_inner())
}

pub async fn get_cluster_info(
    client: &mut ClusterServiceClient<Channel>,
) -> Result<GetClusterInfoResponse, tonic::Status> {
    Ok(client.get_cluster_info(GetClusterInfoRequest {}).await?.into_inner())
}

pub async fn generate_join_token(
    client: &mut ClusterServiceClient<Channel>,
    role: i32,
) -> Result<GenerateJoinTokenResponse, tonic::Status> {
    Ok(client.generate_join_token(GenerateJoinTokenRequest { role }).await?.into_inner())
}

pub async fn join_cluster(
    client: &mut ClusterServiceClient<Channel>,
    token: String,
    address: String,
) -> Result<JoinClusterResponse, tonic::Status> {
    Ok(client.join_cluster(JoinClusterRequest { token, address }).await?.into_inner())
}
