//! The tonic service exposed to peers: thin glue between `warren-proto`'s
//! `RaftTransport` and `Node::handle_*`.

use tonic::{Request, Response, Status};
use warren_proto::raft::raft_transport_server::RaftTransport;
use warren_proto::raft::{
    AppendEntriesRequest as PbAppendEntriesRequest, AppendEntriesResponse as PbAppendEntriesResponse,
    InstallSnapshotRequest, InstallSnapshotResponse, RequestVoteRequest as PbRequestVoteRequest,
    RequestVoteResponse as PbRequestVoteResponse,
};

use crate::node::Node;
use crate::state_machine::StateMachine;

pub struct RaftTransportService<S: StateMachine + 'static> {
    node: Node<S>,
}

impl<S: StateMachine + 'static> RaftTransportService<S> {
    pub fn new(node: Node<S>) -> Self {
        RaftTransportService { node }
    }
}

#[tonic::async_trait]
impl<S: StateMachine + 'static> RaftTransport for RaftTransportService<S> {
    async fn append_entries(
        &self,
        request: Request<PbAppendEntriesRequest>,
    ) -> Result<Response<PbAppendEntriesResponse>, Status> {
        let req = request.into_inner().into();
        let resp = self.node.handle_append_entries(req);
        Ok(Response::new(resp.into()))
    }

    async fn request_vote(
        &self,
        request: Request<PbRequestVoteRequest>,
    ) -> Result<Response<PbRequestVoteResponse>, Status> {
        let req = request.into_inner().into();
        let resp = self.node.handle_request_vote(req);
        Ok(Response::new(resp.into()))
    }

    async fn install_snapshot(
        &self,
        request: Request<InstallSnapshotRequest>,
    ) -> Result<Response<InstallSnapshotResponse>, Status> {
        let req = request.into_inner();
        self.node.restore_snapshot(req.last_included_index, req.last_included_term, &req.data);
        Ok(Response::new(InstallSnapshotResponse { term: req.term }))
    }
}
