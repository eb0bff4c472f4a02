#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),

    #[error("container {0} not found")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("health check failed: {0}")]
    HealthCheck(String),
}
