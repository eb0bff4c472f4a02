pub mod access;
pub mod acme;
pub mod error;
pub mod proxy;
pub mod ratelimit;
pub mod route;
pub mod server;
pub mod tls_resolver;

pub use acme::{AcmeClient, ChallengeStore, IssuedCertificate};
pub use error::IngressError;
pub use route::{RoutingCell, RoutingTable};
pub use server::{IngressServer, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
