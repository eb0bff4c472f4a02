//! Top-level wiring: resolves this node's identity, starts the raft node,
//! serves every gRPC service over mTLS, and spawns whichever background
//! loops this node's role calls for.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity as TlsIdentity, Server, ServerTlsConfig};
use tracing::info;

use warren_control::state_machine::ClusterStateMachine;
use warren_control::Command;
use warren_crypto::{install_default_crypto_provider, CertificateAuthority, SecretsEngine};
use warren_ingress::{AcmeClient, IngressServer};
use warren_proto::cluster::cluster_service_server::ClusterServiceServer;
use warren_proto::cluster::container_service_server::ContainerServiceServer;
use warren_proto::cluster::ingress_service_server::IngressServiceServer;
use warren_proto::cluster::node_service_server::NodeServiceServer;
use warren_proto::cluster::secret_service_server::SecretServiceServer;
use warren_proto::cluster::service_service_server::ServiceServiceServer;
use warren_proto::cluster::tls_certificate_service_server::TlsCertificateServiceServer;
use warren_proto::cluster::volume_service_server::VolumeServiceServer;
use warren_proto::raft::raft_transport_server::RaftTransportServer;
use warren_raft::{Node, NodeConfig, RaftTransportService};
use warren_worker::{Agent, AgentConfig, BollardRuntime, SecretMount};

use crate::background;
use crate::bootstrap::{self, Identity};
use crate::config::ResolvedConfig;
use crate::grpc::{cluster, container, ingress, node, secret, service, tls as tls_service, volume, Ctx};

pub async fn run(config: ResolvedConfig) -> anyhow::Result<()> {
    install_default_crypto_provider();
    std::fs::create_dir_all(&config.dir)?;

    let identity = bootstrap::resolve_identity(&config).await?;
    let cancel = CancellationToken::new();

    let state = Arc::new(ClusterStateMachine::new());
    if config.bootstrap {
        seed_bootstrap_node(&state, &config, &identity);
    }

    let node_config = NodeConfig {
        id: config.raft_id,
        dir: config.dir.join("raft"),
        initial_members: std::iter::once(config.raft_id).chain(config.peers.keys().copied()).collect(),
        peer_addresses: config.peers.iter().map(|(id, addr)| (*id, addr.clone())).collect(),
    };
    let raft_node = Node::start(node_config, state.clone(), cancel.clone())?;

    let secrets = SecretsEngine::from_cluster_id(&config.cluster_name);
    let ca = identity
        .ca_key_pem
        .as_deref()
        .map(|key| CertificateAuthority::load(&identity.ca_cert_pem, key))
        .transpose()?
        .map(Arc::new);

    let peers: HashMap<_, _> = config.peers.iter().map(|(id, addr)| (*id, addr.clone())).collect();
    let ctx = Arc::new(Ctx {
        node: raft_node.clone(),
        state: state.clone(),
        secrets: secrets.clone(),
        peers,
        cluster_id: config.cluster_name.clone(),
        cluster_name: config.cluster_name.clone(),
        bind: config.bind.clone(),
        ca_cert_pem: identity.ca_cert_pem.clone(),
        ca,
    });

    let mut tasks = Vec::new();

    if config.role.runs_raft() {
        tasks.push(tokio::spawn(background::run_scheduler_loop(ctx.clone(), cancel.clone())));
        tasks.push(tokio::spawn(background::run_reconciler_loop(ctx.clone(), cancel.clone())));

        let acme = match &config.acme_email {
            Some(email) => {
                let challenges = Default::default();
                Some(Arc::new(AcmeClient::new(email, challenges).await?))
            }
            None => None,
        };
        let ingress_server = Arc::new(IngressServer::new(state.store.clone(), secrets.clone(), acme));
        tasks.push(tokio::spawn(background::run_cert_renewal_loop(ctx.clone(), ingress_server.clone(), cancel.clone())));
        tasks.push(tokio::spawn(ingress_server.clone().rebuild_loop(state.events.subscribe(), cancel.clone())));
        tasks.push(tokio::spawn(ingress_server.clone().run_http(config.http_port, cancel.clone())));
        tasks.push(tokio::spawn(ingress_server.run_https(config.https_port, cancel.clone())));

        let (grpc_ctx, grpc_node, grpc_identity, grpc_cancel) = (ctx.clone(), raft_node.clone(), identity.clone(), cancel.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_grpc_server(grpc_ctx, grpc_node, grpc_identity, grpc_cancel).await {
                tracing::error!(error = %e, "gRPC server exited with error");
            }
        }));
    }

    if config.role.runs_agent() {
        tasks.push(tokio::spawn(run_agent(config.clone(), identity.clone(), cancel.clone())));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

/// The very first node of a new cluster has no `RegisterNode` to apply from
/// anyone else, so it registers itself directly before raft even starts:
/// a single-node raft cluster commits its own first proposal to itself, but
/// that still requires dialing its own gRPC server, which isn't listening
/// yet. Writing the KV bucket straight through `command::apply` sidesteps
/// that chicken-and-egg without weakening the single-writer invariant,
/// since no other replica exists yet to diverge from this one.
fn seed_bootstrap_node(state: &ClusterStateMachine, config: &ResolvedConfig, identity: &Identity) {
    let cmd = Command::RegisterNode {
        id: identity.node_id.clone(),
        role: config.role.to_model(),
        address: config.bind.clone(),
        overlay_ip: None,
        hostname: identity.node_id.clone(),
        labels: Default::default(),
        resources: warren_control::model::Resources {
            cpu_cores: config.cpu_cores,
            mem_bytes: config.mem_bytes,
            disk_bytes: config.disk_bytes,
            ..Default::default()
        },
    };
    let _ = warren_control::command::apply(&state.store, cmd);
}

async fn run_grpc_server(
    ctx: Arc<Ctx>,
    raft_node: Node<ClusterStateMachine>,
    identity: Identity,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let tls = ServerTlsConfig::new()
        .identity(TlsIdentity::from_pem(&identity.leaf_cert_pem, &identity.leaf_key_pem))
        .client_ca_root(Certificate::from_pem(&identity.ca_cert_pem));

    let addr = ctx.bind.parse()?;
    info!(%addr, "gRPC server starting");

    Server::builder()
        .tls_config(tls)?
        .add_service(RaftTransportServer::new(RaftTransportService::new(raft_node)))
        .add_service(ClusterServiceServer::new(cluster::ClusterServiceImpl(ctx.clone())))
        .add_service(NodeServiceServer::new(node::NodeServiceImpl(ctx.clone())))
        .add_service(ServiceServiceServer::new(service::ServiceServiceImpl(ctx.clone())))
        .add_service(ContainerServiceServer::new(container::ContainerServiceImpl(ctx.clone())))
        .add_service(SecretServiceServer::new(secret::SecretServiceImpl(ctx.clone())))
        .add_service(VolumeServiceServer::new(volume::VolumeServiceImpl(ctx.clone())))
        .add_service(IngressServiceServer::new(ingress::IngressServiceImpl(ctx.clone())))
        .add_service(TlsCertificateServiceServer::new(tls_service::TlsCertificateServiceImpl(ctx)))
        .serve_with_shutdown(addr, cancel.cancelled())
        .await?;
    Ok(())
}

async fn run_agent(config: ResolvedConfig, identity: Identity, cancel: CancellationToken) {
    let runtime = match BollardRuntime::connect_local() {
        Ok(r) => Arc::new(r),
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to the local container runtime, agent not starting");
            return;
        }
    };
    let secret_mount = SecretMount::new(config.dir.join("secrets"));
    let agent_config = AgentConfig {
        node_id: identity.node_id,
        manager_endpoint: format!("https://{}", config.join_manager.as_deref().unwrap_or(&config.bind)),
        resources: warren_proto::cluster::Resources {
            cpu_cores: config.cpu_cores,
            mem_bytes: config.mem_bytes,
            disk_bytes: config.disk_bytes,
            ..Default::default()
        },
    };
    Arc::new(Agent::new(agent_config, runtime, secret_mount)).run(cancel).await;
}
