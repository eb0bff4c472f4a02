/// Typed outcomes of applying a command. These map onto the gRPC status
/// codes named in the wire spec but stay transport-agnostic here so the
/// state machine itself never depends on tonic.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ControlError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
}
