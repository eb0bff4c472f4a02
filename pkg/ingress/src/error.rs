#[derive(thiserror::Error, Debug)]
pub enum IngressError {
    #[error("no route matches host {0}")]
    NoRoute(String),

    #[error("remote address rejected by access control")]
    AccessDenied,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("no healthy backend for service {0}")]
    NoBackend(String),

    #[error("backend request failed: {0}")]
    Backend(#[from] hyper::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("acme error: {0}")]
    Acme(String),
}
