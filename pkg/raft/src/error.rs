#[derive(thiserror::Error, Debug)]
pub enum RaftError {
    #[error("not the leader; last known leader is {leader_hint:?}")]
    NotLeader { leader_hint: Option<crate::types::ServerId> },

    #[error("proposal must be retried after {0:?} resolves")]
    RetryAfter(crate::types::LogIndex),

    #[error("lost quorum, cluster is unavailable")]
    Unavailable,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
