use std::collections::HashSet;

/// Uniquely identifies a server. Assigned once at enrollment and never reused.
pub type ServerId = u64;
pub type Term = u64;
pub type LogIndex = u64;

/// Persistent per-server bookkeeping that must survive a restart.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Metadata {
    pub current_term: Term,
    pub voted_for: Option<ServerId>,
    pub commit_index: LogIndex,
}

/// All servers in the cluster, split into full voting members and learners
/// (caught-up-but-not-yet-voting servers, used while a new manager joins).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Configuration {
    pub members: HashSet<ServerId>,
    pub learners: HashSet<ServerId>,
}

impl Configuration {
    pub fn iter(&self) -> impl Iterator<Item = &ServerId> {
        self.members.iter().chain(self.learners.iter())
    }

    pub fn apply(&mut self, change: &ConfigChange) {
        match change {
            ConfigChange::AddLearner(s) => {
                self.learners.insert(*s);
            }
            ConfigChange::AddMember(s) => {
                self.learners.remove(s);
                self.members.insert(*s);
            }
            ConfigChange::RemoveServer(s) => {
                self.learners.remove(s);
                self.members.remove(s);
            }
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ConfigChange {
    AddMember(ServerId),
    AddLearner(ServerId),
    RemoveServer(ServerId),
}

/// A configuration as of some applied log index, durable alongside snapshots.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ConfigurationSnapshot {
    pub last_applied: LogIndex,
    pub data: Configuration,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum LogEntryData {
    /// Occupies a log index without changing any state; used by a fresh leader
    /// to commit entries left uncommitted by the previous leader.
    Noop,
    Config(ConfigChange),
    /// Opaque bytes interpreted only by the state machine's `apply`.
    Command(Vec<u8>),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub data: LogEntryData,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: ServerId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub last_log_index: Option<LogIndex>,
}

#[derive(Debug, Clone)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: ServerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// A message the consensus core wants sent to one or more peers. Produced as a
/// side effect of a `cycle()`; the owning `Node` is responsible for actually
/// dispatching it over the network.
pub struct Message {
    pub to: Vec<ServerId>,
    pub body: MessageBody,
}

pub enum MessageBody {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest, LogIndex),
    /// Sent instead of `AppendEntries` when a follower's next index falls
    /// before the leader's compaction point; the `Node` fetches the actual
    /// snapshot bytes at send time rather than carrying them here.
    InstallSnapshot,
}
