//! HTTP and HTTPS listeners. The routing table is rebuilt from the event
//! bus and swapped in as a whole; request handling never holds a lock
//! across backend I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use hyper::server::conn::{AddrStream, Http};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Request, Response, Server, StatusCode};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use warren_control::events::Event;
use warren_control::kv::Store;
use warren_crypto::secrets::SecretsEngine;

use crate::access;
use crate::acme::{AcmeClient, ChallengeStore};
use crate::proxy;
use crate::ratelimit::RateLimiter;
use crate::route::{RoutingCell, RoutingTable};
use crate::tls_resolver::SniCertResolver;

pub const DEFAULT_HTTP_PORT: u16 = 8000;
pub const DEFAULT_HTTPS_PORT: u16 = 8443;
const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

pub struct IngressServer {
    store: Arc<Store>,
    secrets: SecretsEngine,
    table: Arc<RoutingCell>,
    client: Client<hyper::client::HttpConnector>,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
    challenges: ChallengeStore,
    acme: Option<Arc<AcmeClient>>,
}

impl IngressServer {
    pub fn new(store: Arc<Store>, secrets: SecretsEngine, acme: Option<Arc<AcmeClient>>) -> Self {
        let table = RoutingTable::build(&store, &secrets);
        // Share the ACME client's challenge store rather than starting a
        // second, disconnected one: HTTP-01 key authorizations the client
        // writes must be visible to the listener serving them back out.
        let challenges = acme.as_ref().map(|a| a.challenges()).unwrap_or_default();
        IngressServer {
            store,
            secrets,
            table: Arc::new(RoutingCell::new(table)),
            client: Client::new(),
            limiters: Mutex::new(HashMap::new()),
            challenges,
            acme,
        }
    }

    pub fn challenges(&self) -> ChallengeStore {
        self.challenges.clone()
    }

    pub fn acme_client(&self) -> Option<Arc<AcmeClient>> {
        self.acme.clone()
    }

    /// Ingresses with `auto_tls=true` whose hosts have no valid, unexpired
    /// certificate yet, or whose existing certificate is within the
    /// renewal window. The caller (which owns the raft submission path)
    /// drives actual issuance.
    pub fn hosts_needing_certificates(&self) -> Vec<String> {
        let now = chrono::Utc::now();
        let certs = self.store.list_tls_certificates();
        let mut due = Vec::new();
        for ingress in self.store.list_ingresses() {
            let Some(tls) = &ingress.tls else { continue };
            if !tls.enabled || !tls.auto_tls {
                continue;
            }
            for host in &tls.hosts {
                let covered = certs.iter().any(|c| c.hosts.iter().any(|h| h == host) && !crate::acme::needs_renewal(c.not_after, now));
                if !covered {
                    due.push(host.clone());
                }
            }
        }
        due
    }

    /// Consumes ingress/tls-certificate/container change events and
    /// republishes the routing table. Runs for the lifetime of the process.
    pub async fn rebuild_loop(self: Arc<Self>, mut events: tokio::sync::broadcast::Receiver<Event>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => {
                    match event {
                        Ok(Event::IngressChanged(_))
                        | Ok(Event::IngressDeleted(_))
                        | Ok(Event::TlsCertificateChanged(_))
                        | Ok(Event::ContainerChanged(_))
                        | Ok(Event::ContainerDeleted(_))
                        | Ok(Event::NodeChanged(_)) => {
                            self.table.store(RoutingTable::build(&self.store, &self.secrets));
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            warn!("ingress event bus lagged, rebuilding routing table from scratch");
                            self.table.store(RoutingTable::build(&self.store, &self.secrets));
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    pub async fn run_http(self: Arc<Self>, port: u16, cancel: CancellationToken) {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let this = self.clone();
        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let this = this.clone();
            let remote = conn.remote_addr();
            async move {
                Ok::<_, std::convert::Infallible>(service_fn(move |mut req| {
                    req.extensions_mut().insert(remote);
                    this.clone().handle(req, false)
                }))
            }
        });

        info!(%addr, "ingress http listener starting");
        let server = Server::bind(&addr).serve(make_svc);
        let graceful = server.with_graceful_shutdown(cancel.cancelled());
        if let Err(e) = graceful.await {
            warn!(error = %e, "ingress http listener exited with error");
        }
    }

    /// TLS-terminated listener. Hyper's `Server::bind` only speaks plain TCP,
    /// so HTTPS accepts connections manually: each socket is upgraded via
    /// `tokio-rustls` (SNI resolved per-connection from the live routing
    /// table) before being handed to `hyper::server::conn::Http`.
    pub async fn run_https(self: Arc<Self>, port: u16, cancel: CancellationToken) {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let Ok(listener) = TcpListener::bind(addr).await else {
            warn!(%addr, "ingress https listener failed to bind");
            return;
        };

        let mut tls_config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SniCertResolver::new(self.table.clone())));
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

        info!(%addr, "ingress https listener starting");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => {
                    let Ok((stream, remote)) = accepted else { continue };
                    let acceptor = acceptor.clone();
                    let this = self.clone();
                    tokio::spawn(async move {
                        let Ok(tls_stream) = acceptor.accept(stream).await else { return };
                        let service = service_fn(move |mut req: Request<Body>| {
                            req.extensions_mut().insert(remote);
                            this.clone().handle(req, true)
                        });
                        let _ = Http::new().serve_connection(tls_stream, service).await;
                    });
                }
            }
        }
    }

    async fn handle(self: Arc<Self>, req: Request<Body>, https: bool) -> Result<Response<Body>, std::convert::Infallible> {
        if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
            if let Some(key_auth) = self.challenges.get(token) {
                return Ok(Response::new(Body::from(key_auth)));
            }
        }

        Ok(self.proxy_request(req, https).await.unwrap_or_else(error_response))
    }

    async fn proxy_request(&self, mut req: Request<Body>, https: bool) -> Result<Response<Body>, crate::error::IngressError> {
        use crate::error::IngressError;

        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let remote = extract_remote_ip(&req);

        let table = self.table.load();
        let matched = table.match_route(&host, req.uri().path()).ok_or_else(|| IngressError::NoRoute(host.clone()))?;

        if let Some(ac) = &matched.path.access_control {
            if !access::is_allowed(remote, ac) {
                return Err(IngressError::AccessDenied);
            }
        }

        if let Some(rl) = &matched.path.rate_limit {
            let key = format!("{}|{}", matched.host, matched.path.path);
            let limiter = {
                let mut limiters = self.limiters.lock().unwrap();
                limiters
                    .entry(key)
                    .or_insert_with(|| Arc::new(RateLimiter::new(rl.requests_per_second, rl.burst)))
                    .clone()
            };
            if !limiter.allow(remote) {
                return Err(IngressError::RateLimited);
            }
        }

        let rewritten = proxy::rewrite_path(&matched.path, req.uri().path());
        proxy::apply_header_ops(req.headers_mut(), &matched.path);
        proxy::apply_forwarded_headers(req.headers_mut(), remote, &host, https);

        let backend = table
            .next_backend(&matched.path.backend_service)
            .ok_or_else(|| IngressError::NoBackend(matched.path.backend_service.clone()))?;

        proxy::forward(&self.client, req, &backend, &rewritten).await
    }
}

fn extract_remote_ip(req: &Request<Body>) -> std::net::IpAddr {
    req.extensions()
        .get::<SocketAddr>()
        .map(|a| a.ip())
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
}

fn error_response(err: crate::error::IngressError) -> Response<Body> {
    use crate::error::IngressError::*;
    let status = match err {
        NoRoute(_) => StatusCode::NOT_FOUND,
        AccessDenied => StatusCode::FORBIDDEN,
        RateLimited => StatusCode::TOO_MANY_REQUESTS,
        NoBackend(_) => StatusCode::SERVICE_UNAVAILABLE,
        Backend(_) => StatusCode::BAD_GATEWAY,
        Tls(_) | Acme(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Response::builder().status(status).body(Body::empty()).unwrap()
}
