//! Bridges the pure `ConsensusModule` types to the generated `warren-proto`
//! gRPC types, and provides a lazily-connecting client used to reach peers.

use warren_proto::raft as pb;

use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, ConfigChange, LogEntry, LogEntryData,
    RequestVoteRequest, RequestVoteResponse,
};

impl From<&LogEntry> for pb::LogEntry {
    fn from(e: &LogEntry) -> Self {
        let data = match &e.data {
            LogEntryData::Noop => Some(pb::log_entry::Data::Noop(true)),
            LogEntryData::Config(c) => {
                let (kind, server_id) = match c {
                    ConfigChange::AddMember(id) => (pb::config_change::Kind::AddMember, *id),
                    ConfigChange::AddLearner(id) => (pb::config_change::Kind::AddLearner, *id),
                    ConfigChange::RemoveServer(id) => (pb::config_change::Kind::RemoveServer, *id),
                };
                Some(pb::log_entry::Data::Config(pb::ConfigChange {
                    kind: kind as i32,
                    server_id,
                }))
            }
            LogEntryData::Command(bytes) => Some(pb::log_entry::Data::Command(bytes.clone())),
        };
        pb::LogEntry {
            index: e.index,
            term: e.term,
            data,
        }
    }
}

impl From<pb::LogEntry> for LogEntry {
    fn from(e: pb::LogEntry) -> Self {
        let data = match e.data {
            Some(pb::log_entry::Data::Noop(_)) => LogEntryData::Noop,
            Some(pb::log_entry::Data::Config(c)) => {
                let change = match pb::config_change::Kind::try_from(c.kind)
                    .unwrap_or(pb::config_change::Kind::AddMember)
                {
                    pb::config_change::Kind::AddMember => ConfigChange::AddMember(c.server_id),
                    pb::config_change::Kind::AddLearner => ConfigChange::AddLearner(c.server_id),
                    pb::config_change::Kind::RemoveServer => ConfigChange::RemoveServer(c.server_id),
                };
                LogEntryData::Config(change)
            }
            Some(pb::log_entry::Data::Command(bytes)) => LogEntryData::Command(bytes),
            None => LogEntryData::Noop,
        };
        LogEntry {
            index: e.index,
            term: e.term,
            data,
        }
    }
}

impl From<&AppendEntriesRequest> for pb::AppendEntriesRequest {
    fn from(r: &AppendEntriesRequest) -> Self {
        pb::AppendEntriesRequest {
            term: r.term,
            leader_id: r.leader_id,
            prev_log_index: r.prev_log_index,
            prev_log_term: r.prev_log_term,
            entries: r.entries.iter().map(pb::LogEntry::from).collect(),
            leader_commit: r.leader_commit,
        }
    }
}

impl From<pb::AppendEntriesRequest> for AppendEntriesRequest {
    fn from(r: pb::AppendEntriesRequest) -> Self {
        AppendEntriesRequest {
            term: r.term,
            leader_id: r.leader_id,
            prev_log_index: r.prev_log_index,
            prev_log_term: r.prev_log_term,
            entries: r.entries.into_iter().map(LogEntry::from).collect(),
            leader_commit: r.leader_commit,
        }
    }
}

impl From<AppendEntriesResponse> for pb::AppendEntriesResponse {
    fn from(r: AppendEntriesResponse) -> Self {
        pb::AppendEntriesResponse {
            term: r.term,
            success: r.success,
            last_log_index: r.last_log_index,
        }
    }
}

impl From<pb::AppendEntriesResponse> for AppendEntriesResponse {
    fn from(r: pb::AppendEntriesResponse) -> Self {
        AppendEntriesResponse {
            term: r.term,
            success: r.success,
            last_log_index: r.last_log_index,
        }
    }
}

impl From<&RequestVoteRequest> for pb::RequestVoteRequest {
    fn from(r: &RequestVoteRequest) -> Self {
        pb::RequestVoteRequest {
            term: r.term,
            candidate_id: r.candidate_id,
            last_log_index: r.last_log_index,
            last_log_term: r.last_log_term,
            pre_vote: false,
        }
    }
}

impl From<pb::RequestVoteRequest> for RequestVoteRequest {
    fn from(r: pb::RequestVoteRequest) -> Self {
        RequestVoteRequest {
            term: r.term,
            candidate_id: r.candidate_id,
            last_log_index: r.last_log_index,
            last_log_term: r.last_log_term,
        }
    }
}

impl From<RequestVoteResponse> for pb::RequestVoteResponse {
    fn from(r: RequestVoteResponse) -> Self {
        pb::RequestVoteResponse {
            term: r.term,
            vote_granted: r.vote_granted,
        }
    }
}

impl From<pb::RequestVoteResponse> for RequestVoteResponse {
    fn from(r: pb::RequestVoteResponse) -> Self {
        RequestVoteResponse {
            term: r.term,
            vote_granted: r.vote_granted,
        }
    }
}

/// A lazily-connecting handle to one peer's raft transport endpoint. Built on
/// `tonic::transport::Channel::connect_lazy`, so constructing one never blocks
/// and a peer that's currently down just fails the next call.
#[derive(Clone)]
pub struct PeerClient {
    inner: pb::raft_transport_client::RaftTransportClient<tonic::transport::Channel>,
}

impl PeerClient {
    pub fn connect_lazy(endpoint: tonic::transport::Endpoint) -> Self {
        let channel = endpoint.connect_lazy();
        PeerClient {
            inner: pb::raft_transport_client::RaftTransportClient::new(channel),
        }
    }

    pub async fn append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, tonic::Status> {
        let mut client = self.inner.clone();
        let resp = client.append_entries(pb::AppendEntriesRequest::from(&req)).await?;
        Ok(resp.into_inner().into())
    }

    pub async fn request_vote(
        &self,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, tonic::Status> {
        let mut client = self.inner.clone();
        let resp = client.request_vote(pb::RequestVoteRequest::from(&req)).await?;
        Ok(resp.into_inner().into())
    }

    pub async fn install_snapshot(
        &self,
        req: pb::InstallSnapshotRequest,
    ) -> Result<pb::InstallSnapshotResponse, tonic::Status> {
        let mut client = self.inner.clone();
        Ok(client.install_snapshot(req).await?.into_inner())
    }
}
