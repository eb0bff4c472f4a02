//! Translates `ControlError` (state machine) and `RaftError` (consensus)
//! into the `tonic::Status` codes clients see.

use std::collections::HashMap;

use warren_control::ControlError;
use warren_raft::{RaftError, ServerId};

pub fn control_error_to_status(err: ControlError) -> tonic::Status {
    match err {
        ControlError::InvalidArgument(msg) => tonic::Status::invalid_argument(msg),
        ControlError::NotFound(msg) => tonic::Status::not_found(msg),
        ControlError::AlreadyExists(msg) => tonic::Status::already_exists(msg),
        ControlError::PermissionDenied(msg) => tonic::Status::permission_denied(msg),
        ControlError::Unauthenticated(msg) => tonic::Status::unauthenticated(msg),
        ControlError::FailedPrecondition(msg) => tonic::Status::failed_precondition(msg),
    }
}

/// `peers` maps raft server ids to the address clients should redirect to;
/// without an entry the hint is surfaced without an address.
pub fn raft_error_to_status(err: RaftError, peers: &HashMap<ServerId, String>) -> tonic::Status {
    match err {
        RaftError::NotLeader { leader_hint } => {
            let msg = match leader_hint.and_then(|id| peers.get(&id)) {
                Some(addr) => format!("not the leader; current leader is at {addr}"),
                None => "not the leader; leader unknown".to_string(),
            };
            tonic::Status::failed_precondition(msg)
        }
        RaftError::RetryAfter(_) => tonic::Status::unavailable("proposal not yet committed, retry"),
        RaftError::Unavailable => tonic::Status::unavailable("raft cluster unavailable"),
        RaftError::Io(e) => tonic::Status::internal(format!("io error: {e}")),
        RaftError::Serde(e) => tonic::Status::internal(format!("serialization error: {e}")),
    }
}

pub fn deserialize_error(e: serde_json::Error) -> tonic::Status {
    tonic::Status::internal(format!("malformed applied result: {e}"))
}
