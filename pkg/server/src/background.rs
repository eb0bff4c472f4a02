//! Leader-only control loops: scheduling, reconciliation, and certificate
//! renewal. Every pass is a pure plan followed by submitting the resulting
//! commands through raft, so a pass that runs on a node that loses
//! leadership mid-flight just has its submissions rejected with `NotLeader`
//! and retried next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use warren_control::{Command, Reconciler, Scheduler};
use warren_ingress::IngressServer;

use crate::grpc::Ctx;

const SCHEDULE_INTERVAL: Duration = Duration::from_secs(5);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);
const CERT_RENEWAL_INTERVAL: Duration = Duration::from_secs(3600);

async fn submit_best_effort(ctx: &Ctx, commands: Vec<Command>) {
    for cmd in commands {
        if let Err(status) = ctx.submit(cmd).await {
            tracing::debug!(error = %status, "background command rejected, will retry next tick");
        }
    }
}

pub async fn run_scheduler_loop(ctx: Arc<Ctx>, cancel: CancellationToken) {
    let scheduler = Scheduler::default();
    loop {
        if ctx.node.is_leader() {
            let plan = scheduler.plan(ctx.store());
            for unplaced in &plan.unplaced {
                tracing::debug!(container_id = %unplaced.container_id, reason = unplaced.reason, "container not placed this pass");
            }
            submit_best_effort(&ctx, plan.assignments).await;
            submit_best_effort(&ctx, scheduler.plan_global_coverage(ctx.store())).await;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(SCHEDULE_INTERVAL) => {}
        }
    }
}

pub async fn run_reconciler_loop(ctx: Arc<Ctx>, cancel: CancellationToken) {
    let reconciler = Reconciler::default();
    loop {
        if ctx.node.is_leader() {
            let commands = reconciler.tick(ctx.store(), Utc::now());
            submit_best_effort(&ctx, commands).await;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONCILE_INTERVAL) => {}
        }
    }
}

/// Finds ingress hosts wanting a certificate they don't have (or are about
/// to lose), issues one through ACME, and submits it as `PutTlsCertificate`
/// so every replica's store picks it up the same way any other command does.
pub async fn run_cert_renewal_loop(ctx: Arc<Ctx>, ingress: Arc<IngressServer>, cancel: CancellationToken) {
    loop {
        if ctx.node.is_leader() {
            if let Some(acme) = ingress.acme_client() {
                for host in ingress.hosts_needing_certificates() {
                    match acme.issue(&host).await {
                        Ok(issued) => match ctx.secrets.encrypt(&issued.key_der) {
                            Ok(key_pem) => {
                                let cmd = Command::PutTlsCertificate {
                                    id: uuid::Uuid::new_v4().to_string(),
                                    name: host.clone(),
                                    hosts: vec![host.clone()],
                                    cert_pem: issued.cert_pem,
                                    key_pem,
                                    issuer: "acme".to_string(),
                                    not_before: Utc::now(),
                                    not_after: issued.not_after,
                                    auto_renew: true,
                                };
                                submit_best_effort(&ctx, vec![cmd]).await;
                            }
                            Err(e) => tracing::warn!(host = %host, error = %e, "encrypting acme key failed"),
                        },
                        Err(e) => tracing::warn!(host = %host, error = %e, "ACME issuance failed, will retry next pass"),
                    }
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(CERT_RENEWAL_INTERVAL) => {}
        }
    }
}
