//! Generated gRPC types and service stubs for the control-plane wire protocol.
//!
//! Two protobuf packages are built: `warren.raft` (the replicated-log transport
//! consumed by `warren-raft`) and `warren.cluster` (the client/worker-facing API
//! consumed by `warren-control`, `warren-worker` and the
//! `warren` binary).

pub mod raft {
    tonic::include_proto!("warren.raft");
}

pub mod cluster {
    tonic::include_proto!("warren.cluster");
}
