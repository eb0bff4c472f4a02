//! Cluster identity acquisition: either mint a brand new CA (`--bootstrap`)
//! or join an existing one through a manager's `ClusterService`
//! (`--join-manager`/`--join-token`). Either way this produces the CA cert,
//! a leaf cert/key for this node, and this node's control-plane id, all
//! persisted under the data directory so a restart doesn't redo any of it.

use std::path::{Path, PathBuf};

use warren_control::model::NodeRole;
use warren_core::fs::write_atomic;
use warren_crypto::{needs_rotation_at, CertificateAuthority, SanType, SubjectClass};

use crate::client;
use crate::config::ResolvedConfig;
use crate::mapping::node_role_to_pb;

/// This node's durable identity: a CA it trusts, a leaf cert/key it
/// presents, and the control-plane id it's known by.
#[derive(Clone)]
pub struct Identity {
    pub node_id: String,
    pub ca_cert_pem: String,
    pub leaf_cert_pem: String,
    pub leaf_key_pem: String,
    /// Only `Some` for the node that minted the CA: no other node ever
    /// holds the root key.
    pub ca_key_pem: Option<String>,
}

fn ca_cert_path(dir: &Path) -> PathBuf {
    dir.join("ca.pem")
}
fn ca_key_path(dir: &Path) -> PathBuf {
    dir.join("ca-key.pem")
}
fn leaf_cert_path(dir: &Path) -> PathBuf {
    dir.join("server.pem")
}
fn leaf_key_path(dir: &Path) -> PathBuf {
    dir.join("server-key.pem")
}
fn node_id_path(dir: &Path) -> PathBuf {
    dir.join("node-id")
}
fn leaf_expiry_path(dir: &Path) -> PathBuf {
    dir.join("server-expiry")
}

/// RFC3339 expiry of the cached leaf cert, if one was persisted alongside it.
/// Absent on identities persisted before rotation tracking existed, in which
/// case the cert is treated as due for renewal next restart.
fn load_leaf_expiry(dir: &Path) -> Option<String> {
    std::fs::read_to_string(leaf_expiry_path(dir)).ok().map(|s| s.trim().to_string())
}

fn subject_class(role: NodeRole) -> SubjectClass {
    match role {
        NodeRole::Manager => SubjectClass::Manager,
        NodeRole::Worker | NodeRole::Hybrid => SubjectClass::Worker,
    }
}

fn host_of(address: &str) -> &str {
    address.rsplit_once(':').map(|(h, _)| h).unwrap_or(address)
}

/// Loads a previously persisted identity from `dir`, if a prior bootstrap
/// or join already wrote one.
fn load_cached(dir: &Path) -> Option<Identity> {
    let ca_cert_pem = std::fs::read_to_string(ca_cert_path(dir)).ok()?;
    let leaf_cert_pem = std::fs::read_to_string(leaf_cert_path(dir)).ok()?;
    let leaf_key_pem = std::fs::read_to_string(leaf_key_path(dir)).ok()?;
    let node_id = std::fs::read_to_string(node_id_path(dir)).ok()?.trim().to_string();
    let ca_key_pem = std::fs::read_to_string(ca_key_path(dir)).ok();
    Some(Identity { node_id, ca_cert_pem, leaf_cert_pem, leaf_key_pem, ca_key_pem })
}

/// Generates a fresh root CA and issues this node its own leaf cert. Used
/// only by the very first manager of a new cluster.
fn bootstrap_new_cluster(config: &ResolvedConfig) -> anyhow::Result<Identity> {
    let ca = CertificateAuthority::generate(&config.cluster_name)?;
    let node_id = uuid::Uuid::new_v4().to_string();
    let sans = vec![SanType::DnsName(host_of(&config.bind).to_string())];
    let issued = ca.issue(subject_class(config.role.to_model()), &node_id, &sans)?;

    let ca_cert_pem = ca.root_cert_pem()?;
    let ca_key_pem = ca.root_key_pem();
    let not_after = warren_crypto::format_not_after(issued.not_after);
    persist(config, &ca_cert_pem, Some(&ca_key_pem), &issued.cert_pem, &issued.key_pem, &node_id, &not_after)?;

    Ok(Identity {
        node_id,
        ca_cert_pem,
        leaf_cert_pem: issued.cert_pem,
        leaf_key_pem: issued.key_pem,
        ca_key_pem: Some(ca_key_pem),
    })
}

/// Obtains a leaf certificate from an existing manager and registers this
/// node with the cluster. The CA cert must already be trusted out of band
/// (`--ca-cert-file`); there is no trust-on-first-use fetch, since a node
/// with no trusted root has no way to tell the real manager's cert from an
/// impostor's.
async fn join_existing_cluster(config: &ResolvedConfig) -> anyhow::Result<Identity> {
    let manager = config.join_manager.as_deref().expect("join requires --join-manager");
    let token = config.join_token.clone().expect("join requires --join-token");

    let ca_cert_pem = match &config.ca_cert_file {
        Some(path) => std::fs::read_to_string(path)?,
        None => std::fs::read_to_string(ca_cert_path(&config.dir))
            .map_err(|_| anyhow::anyhow!("joining a cluster requires --ca-cert-file (or a cached ca.pem from a prior join)"))?,
    };

    let node_id = uuid::Uuid::new_v4().to_string();
    let role = config.role.to_model();

    let mut client = client::connect_server_auth_only(manager, &ca_cert_pem).await?;
    let cert_response = client::request_certificate(
        &mut client,
        token.clone(),
        node_id.clone(),
        node_role_to_pb(role),
        config.bind.clone(),
    )
    .await?;

    let mut mtls_client =
        client::connect_mtls(manager, &ca_cert_pem, &cert_response.leaf_cert_pem, &cert_response.leaf_key_pem).await?;
    let join_response = client::join_cluster(&mut mtls_client, token, config.bind.clone()).await?;
    let node = join_response.node.ok_or_else(|| anyhow::anyhow!("join_cluster returned no node"))?;

    persist(
        config,
        &ca_cert_pem,
        None,
        &cert_response.leaf_cert_pem,
        &cert_response.leaf_key_pem,
        &node.id,
        &cert_response.not_after,
    )?;

    Ok(Identity {
        node_id: node.id,
        ca_cert_pem,
        leaf_cert_pem: cert_response.leaf_cert_pem,
        leaf_key_pem: cert_response.leaf_key_pem,
        ca_key_pem: None,
    })
}

fn persist(
    config: &ResolvedConfig,
    ca_cert_pem: &str,
    ca_key_pem: Option<&str>,
    leaf_cert_pem: &str,
    leaf_key_pem: &str,
    node_id: &str,
    leaf_not_after: &str,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.dir)?;
    write_atomic(&ca_cert_path(&config.dir), ca_cert_pem.as_bytes())?;
    if let Some(key) = ca_key_pem {
        write_atomic(&ca_key_path(&config.dir), key.as_bytes())?;
    }
    write_atomic(&leaf_cert_path(&config.dir), leaf_cert_pem.as_bytes())?;
    write_atomic(&leaf_key_path(&config.dir), leaf_key_pem.as_bytes())?;
    write_atomic(&node_id_path(&config.dir), node_id.as_bytes())?;
    write_atomic(&leaf_expiry_path(&config.dir), leaf_not_after.as_bytes())?;
    Ok(())
}

/// Refreshes a leaf nearing expiry. A node holding the CA key (the cluster's
/// first manager) reissues locally; any other node asks a manager over its
/// still-valid cached mTLS identity.
async fn renew_identity(config: &ResolvedConfig, cached: Identity) -> anyhow::Result<Identity> {
    let role = config.role.to_model();

    let (leaf_cert_pem, leaf_key_pem, not_after) = if let Some(ca_key_pem) = &cached.ca_key_pem {
        let ca = CertificateAuthority::load(&cached.ca_cert_pem, ca_key_pem)?;
        let sans = vec![SanType::DnsName(host_of(&config.bind).to_string())];
        let issued = ca.issue(subject_class(role), &cached.node_id, &sans)?;
        (issued.cert_pem, issued.key_pem, warren_crypto::format_not_after(issued.not_after))
    } else {
        let manager = config
            .join_manager
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no --join-manager configured to renew certificate against"))?;
        let mut mtls_client =
            client::connect_mtls(manager, &cached.ca_cert_pem, &cached.leaf_cert_pem, &cached.leaf_key_pem).await?;
        let resp = client::renew_certificate(
            &mut mtls_client,
            cached.node_id.clone(),
            node_role_to_pb(role),
            config.bind.clone(),
        )
        .await?;
        (resp.leaf_cert_pem, resp.leaf_key_pem, resp.not_after)
    };

    persist(config, &cached.ca_cert_pem, cached.ca_key_pem.as_deref(), &leaf_cert_pem, &leaf_key_pem, &cached.node_id, &not_after)?;

    Ok(Identity { leaf_cert_pem, leaf_key_pem, ..cached })
}

/// Resolves this node's identity: reuse what's cached on disk, otherwise
/// bootstrap a new cluster or join an existing one per `config`.
pub async fn resolve_identity(config: &ResolvedConfig) -> anyhow::Result<Identity> {
    if let Some(cached) = load_cached(&config.dir) {
        let due = match load_leaf_expiry(&config.dir) {
            Some(not_after) => needs_rotation_at(&not_after),
            None => true,
        };
        if !due {
            return Ok(cached);
        }
        return renew_identity(config, cached).await;
    }
    if config.bootstrap {
        bootstrap_new_cluster(config)
    } else {
        join_existing_cluster(config).await
    }
}
