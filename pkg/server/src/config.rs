//! CLI flags plus an optional TOML config file, built on clap's derive API
//! with a config-file layer underneath it. Flags always win over the file
//! so a one-off override never requires editing it.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleArg {
    Manager,
    Worker,
    Hybrid,
}

impl RoleArg {
    pub fn to_model(self) -> warren_control::model::NodeRole {
        match self {
            RoleArg::Manager => warren_control::model::NodeRole::Manager,
            RoleArg::Worker => warren_control::model::NodeRole::Worker,
            RoleArg::Hybrid => warren_control::model::NodeRole::Hybrid,
        }
    }

    pub fn runs_raft(self) -> bool {
        matches!(self, RoleArg::Manager | RoleArg::Hybrid)
    }

    pub fn runs_agent(self) -> bool {
        matches!(self, RoleArg::Worker | RoleArg::Hybrid)
    }
}

#[derive(Parser, Debug)]
#[command(name = "warren", about = "Warren container orchestration control plane")]
pub struct Cli {
    /// Path to a TOML config file; CLI flags override anything it sets.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Data directory: raft log, KV snapshots, CA material, join state.
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Address this node advertises to peers and clients.
    #[arg(long)]
    pub bind: Option<String>,

    /// Numeric raft server id. Required for manager/hybrid roles.
    #[arg(long)]
    pub raft_id: Option<u64>,

    #[arg(long, value_enum)]
    pub role: Option<RoleArg>,

    /// Starts a brand new cluster instead of joining one.
    #[arg(long)]
    pub bootstrap: bool,

    #[arg(long)]
    pub cluster_name: Option<String>,

    /// Address of an existing manager to join through.
    #[arg(long)]
    pub join_manager: Option<String>,

    #[arg(long, env = "WARREN_JOIN_TOKEN")]
    pub join_token: Option<String>,

    /// CA cert PEM of the cluster being joined, obtained out of band. Not
    /// needed once a previous join cached it under `dir/ca.pem`.
    #[arg(long)]
    pub ca_cert_file: Option<PathBuf>,

    #[arg(long)]
    pub http_port: Option<u16>,

    #[arg(long)]
    pub https_port: Option<u16>,

    /// Contact email for ACME registration. Ingress auto-TLS is disabled
    /// without one.
    #[arg(long)]
    pub acme_email: Option<String>,

    /// Capacity this node advertises to the scheduler. There's no portable
    /// way to auto-detect "how much of this machine is ours to use" across
    /// every deployment target, so an operator states it explicitly.
    #[arg(long)]
    pub cpu_cores: Option<f64>,
    #[arg(long)]
    pub mem_bytes: Option<u64>,
    #[arg(long)]
    pub disk_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub dir: Option<PathBuf>,
    pub bind: Option<String>,
    pub raft_id: Option<u64>,
    pub role: Option<RoleArg>,
    pub cluster_name: Option<String>,
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
    pub acme_email: Option<String>,
    pub cpu_cores: Option<f64>,
    pub mem_bytes: Option<u64>,
    pub disk_bytes: Option<u64>,
    /// Other raft members known at startup: raft id -> advertised address.
    #[serde(default)]
    pub peers: HashMap<u64, String>,
}

/// Fully resolved configuration: CLI flags over file values over hardcoded
/// defaults.
#[derive(Clone)]
pub struct ResolvedConfig {
    pub dir: PathBuf,
    pub bind: String,
    pub raft_id: u64,
    pub role: RoleArg,
    pub bootstrap: bool,
    pub cluster_name: String,
    pub join_manager: Option<String>,
    pub join_token: Option<String>,
    pub ca_cert_file: Option<PathBuf>,
    pub http_port: u16,
    pub https_port: u16,
    pub acme_email: Option<String>,
    pub cpu_cores: f64,
    pub mem_bytes: u64,
    pub disk_bytes: u64,
    pub peers: HashMap<u64, String>,
}

pub const DEFAULT_RAFT_ID: u64 = 1;
pub const DEFAULT_CPU_CORES: f64 = 4.0;
pub const DEFAULT_MEM_BYTES: u64 = 8 * 1024 * 1024 * 1024;
pub const DEFAULT_DISK_BYTES: u64 = 50 * 1024 * 1024 * 1024;

impl ResolvedConfig {
    pub fn load(cli: Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text)?
            }
            None => FileConfig::default(),
        };

        let role = cli.role.or(file.role).unwrap_or(RoleArg::Manager);
        Ok(ResolvedConfig {
            dir: cli.dir.or(file.dir).unwrap_or_else(|| PathBuf::from("./warren-data")),
            bind: cli.bind.or(file.bind).unwrap_or_else(|| "0.0.0.0:7443".to_string()),
            raft_id: cli.raft_id.or(file.raft_id).unwrap_or(DEFAULT_RAFT_ID),
            role,
            bootstrap: cli.bootstrap,
            cluster_name: cli.cluster_name.or(file.cluster_name).unwrap_or_else(|| "warren".to_string()),
            join_manager: cli.join_manager,
            join_token: cli.join_token,
            ca_cert_file: cli.ca_cert_file,
            http_port: cli.http_port.or(file.http_port).unwrap_or(warren_ingress::DEFAULT_HTTP_PORT),
            https_port: cli.https_port.or(file.https_port).unwrap_or(warren_ingress::DEFAULT_HTTPS_PORT),
            acme_email: cli.acme_email.or(file.acme_email),
            cpu_cores: cli.cpu_cores.or(file.cpu_cores).unwrap_or(DEFAULT_CPU_CORES),
            mem_bytes: cli.mem_bytes.or(file.mem_bytes).unwrap_or(DEFAULT_MEM_BYTES),
            disk_bytes: cli.disk_bytes.or(file.disk_bytes).unwrap_or(DEFAULT_DISK_BYTES),
            peers: file.peers,
        })
    }
}
