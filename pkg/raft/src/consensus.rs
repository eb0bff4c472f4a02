//! The deterministic core of Raft: given the current persistent state and a
//! point in time, decides what (if anything) changes and what messages need to
//! go out. A plain synchronous core that an async `Node` (see `node.rs`)
//! drives on a timer and feeds network replies.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::log::LogStorage;
use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, ConfigChange, Configuration,
    ConfigurationSnapshot, LogEntry, LogEntryData, Message, MessageBody, Metadata,
    RequestVoteRequest, RequestVoteResponse, ServerId, Term,
};

const ELECTION_TIMEOUT: (u64, u64) = (400, 800);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(150);

pub type Proposal = LogPosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    pub term: Term,
    pub index: u64,
}

pub type ProposeResult = Result<Proposal, ProposeError>;

#[derive(Debug)]
pub enum ProposeError {
    RetryAfter(Proposal),
    NotLeader { leader_hint: Option<ServerId> },
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProposalStatus {
    Committed,
    Failed,
    Pending,
    Missing,
    Unavailable,
}

/// Side effects requested by the consensus core during a single operation: what
/// must be persisted, and what must be sent over the network. The `Node` owns
/// actually doing either.
pub struct Tick {
    pub time: Instant,
    pub must_persist_meta: bool,
    pub new_entries: bool,
    pub messages: Vec<Message>,
    pub next_tick: Option<Duration>,
}

impl Tick {
    pub fn empty() -> Self {
        Tick {
            time: Instant::now(),
            must_persist_meta: false,
            new_entries: false,
            messages: vec![],
            next_tick: None,
        }
    }

    pub fn write_meta(&mut self) {
        self.must_persist_meta = true;
    }

    pub fn send(&mut self, msg: Message) {
        self.messages.push(msg);
    }
}

struct FollowerState {
    last_heartbeat: Instant,
    election_timeout: Duration,
    last_leader_id: Option<ServerId>,
}

struct CandidateState {
    election_start: Instant,
    election_timeout: Duration,
    votes_received: HashSet<ServerId>,
    some_rejected: bool,
}

struct ServerProgress {
    next_index: u64,
    match_index: u64,
    request_pending: bool,
    last_sent: Option<Instant>,
}

impl ServerProgress {
    fn new(last_log_index: u64) -> Self {
        ServerProgress {
            next_index: last_log_index + 1,
            match_index: 0,
            request_pending: false,
            last_sent: None,
        }
    }
}

struct LeaderState {
    servers: HashMap<ServerId, ServerProgress>,
}

enum ServerState {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

/// A configuration together with any not-yet-committed change in flight.
struct ConfigurationStateMachine {
    value: Configuration,
    last_applied: u64,
    pending: Option<PendingConfigChange>,
}

struct PendingConfigChange {
    last_change: u64,
}

impl ConfigurationStateMachine {
    fn from_snapshot(snapshot: ConfigurationSnapshot) -> Self {
        ConfigurationStateMachine {
            value: snapshot.data,
            last_applied: snapshot.last_applied,
            pending: None,
        }
    }

    fn apply(&mut self, entry: &LogEntry, commit_index: u64) {
        if let LogEntryData::Config(change) = &entry.data {
            self.value.apply(change);
            self.pending = Some(PendingConfigChange {
                last_change: entry.index,
            });
        }
        self.last_applied = entry.index;
        if let Some(p) = &self.pending {
            if p.last_change <= commit_index {
                self.pending = None;
            }
        }
    }

    fn snapshot(&self) -> ConfigurationSnapshot {
        ConfigurationSnapshot {
            last_applied: self.last_applied,
            data: self.value.clone(),
        }
    }
}

/// A single node's view of the replicated log: elections, replication and
/// commit-index advancement. Does no I/O of its own beyond reading the log
/// storage handle it was given; everything else is returned via `Tick`.
pub struct ConsensusModule {
    id: ServerId,
    meta: Metadata,
    config: ConfigurationStateMachine,
    log: Arc<dyn LogStorage>,
    state: ServerState,
}

impl ConsensusModule {
    pub fn new(
        id: ServerId,
        mut meta: Metadata,
        config_snapshot: ConfigurationSnapshot,
        log: Arc<dyn LogStorage>,
    ) -> Self {
        let last_log_term = log.term(log.last_index().unwrap_or(0)).unwrap_or(0);
        if last_log_term > meta.current_term {
            meta.current_term = last_log_term;
            meta.voted_for = None;
        }
        if config_snapshot.last_applied > meta.commit_index {
            meta.commit_index = config_snapshot.last_applied;
        }

        let mut config = ConfigurationStateMachine::from_snapshot(config_snapshot);
        let last_log_index = log.last_index().unwrap_or(0);
        for i in (config.last_applied + 1)..(last_log_index + 1) {
            if let Some(e) = log.entry(i) {
                config.apply(&e, meta.commit_index);
            }
        }

        ConsensusModule {
            id,
            meta,
            config,
            log,
            state: Self::new_follower(Instant::now()),
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.state, ServerState::Leader(_))
    }

    pub fn current_leader_hint(&self) -> Option<ServerId> {
        match &self.state {
            ServerState::Leader(_) => Some(self.id),
            ServerState::Follower(s) => s.last_leader_id,
            ServerState::Candidate(_) => None,
        }
    }

    pub fn config_snapshot(&self) -> ConfigurationSnapshot {
        self.config.snapshot()
    }

    fn new_follower(now: Instant) -> ServerState {
        ServerState::Follower(FollowerState {
            last_heartbeat: now,
            election_timeout: Self::new_election_timeout(),
            last_leader_id: None,
        })
    }

    fn new_election_timeout() -> Duration {
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(ELECTION_TIMEOUT.0..=ELECTION_TIMEOUT.1))
    }

    fn majority_size(&self) -> usize {
        self.config.value.members.len() / 2 + 1
    }

    fn can_be_leader(&self) -> bool {
        self.log.last_index().unwrap_or(0) >= self.meta.commit_index
    }

    pub fn propose_command(&mut self, data: Vec<u8>, out: &mut Tick) -> ProposeResult {
        self.propose_entry(LogEntryData::Command(data), out)
    }

    pub fn propose_noop(&mut self, out: &mut Tick) -> ProposeResult {
        self.propose_entry(LogEntryData::Noop, out)
    }

    pub fn propose_config_change(&mut self, change: ConfigChange, out: &mut Tick) -> ProposeResult {
        self.propose_entry(LogEntryData::Config(change), out)
    }

    pub fn propose_entry(&mut self, data: LogEntryData, out: &mut Tick) -> ProposeResult {
        if let ServerState::Leader(_) = self.state {
            let index = self.log.last_index().unwrap_or(0) + 1;
            let term = self.meta.current_term;
            assert!(term > 0);

            if let LogEntryData::Config(_) = data {
                if let Some(pending) = &self.config.pending {
                    let pending_term = self.log.term(pending.last_change).unwrap_or(term);
                    return Err(ProposeError::RetryAfter(Proposal {
                        index: pending.last_change,
                        term: pending_term,
                    }));
                }
            }

            out.new_entries = true;
            let entry = LogEntry { term, index, data };
            self.log.append(entry.clone());
            self.config.apply(&entry, self.meta.commit_index);

            self.cycle(out);
            Ok(Proposal { term, index })
        } else if let ServerState::Follower(s) = &self.state {
            Err(ProposeError::NotLeader {
                leader_hint: s.last_leader_id,
            })
        } else {
            Err(ProposeError::NotLeader { leader_hint: None })
        }
    }

    pub fn proposal_status(&self, prop: &Proposal) -> ProposalStatus {
        let last_log_index = self.log.last_index().unwrap_or(0);
        let last_log_term = self.log.term(last_log_index).unwrap_or(0);

        if prop.term > last_log_term || prop.index > last_log_index {
            return ProposalStatus::Missing;
        }

        let cur_term = match self.log.term(prop.index) {
            Some(v) => v,
            None => return ProposalStatus::Unavailable,
        };

        if cur_term > prop.term {
            ProposalStatus::Failed
        } else if cur_term < prop.term {
            if self.meta.commit_index >= prop.index {
                ProposalStatus::Failed
            } else {
                ProposalStatus::Missing
            }
        } else if self.meta.commit_index >= prop.index {
            ProposalStatus::Committed
        } else {
            ProposalStatus::Pending
        }
    }

    /// Advances state by `tick.time`: starts/continues an election, or (as
    /// leader) advances the commit index and replicates to followers. May
    /// recurse once (e.g. winning an election immediately issues heartbeats).
    pub fn cycle(&mut self, tick: &mut Tick) {
        if self.config.value.members.is_empty() || !self.config.value.members.contains(&self.id) {
            tick.next_tick = Some(Duration::from_secs(1));
            return;
        }

        enum Summary {
            Follower { elapsed: Duration, timeout: Duration },
            Candidate { votes: usize, elapsed: Duration, timeout: Duration },
            Leader,
        }

        let summary = match &self.state {
            ServerState::Follower(s) => Summary::Follower {
                elapsed: tick.time.saturating_duration_since(s.last_heartbeat),
                timeout: s.election_timeout,
            },
            ServerState::Candidate(s) => Summary::Candidate {
                votes: 1 + s.votes_received.len(),
                elapsed: tick.time.saturating_duration_since(s.election_start),
                timeout: s.election_timeout,
            },
            ServerState::Leader(_) => Summary::Leader,
        };

        match summary {
            Summary::Follower { elapsed, timeout } => {
                if !self.can_be_leader() {
                    self.state = Self::new_follower(tick.time);
                } else if elapsed >= timeout || self.config.value.members.len() == 1 {
                    self.start_election(tick);
                } else {
                    tick.next_tick = Some(timeout - elapsed);
                }
            }
            Summary::Candidate { votes, elapsed, timeout } => {
                let majority = self.majority_size();
                if votes >= majority {
                    let last_log_index = self.log.last_index().unwrap_or(0);
                    let servers = self
                        .config
                        .value
                        .iter()
                        .filter(|s| **s != self.id)
                        .map(|s| (*s, ServerProgress::new(last_log_index)))
                        .collect();
                    self.state = ServerState::Leader(LeaderState { servers });
                    tracing::info!(server_id = self.id, term = self.meta.current_term, "became raft leader");

                    if self.meta.commit_index < last_log_index {
                        let _ = self.propose_noop(tick);
                        return;
                    }
                    self.cycle(tick);
                } else if elapsed >= timeout {
                    self.start_election(tick);
                } else {
                    tick.next_tick = Some(timeout - elapsed);
                }
            }
            Summary::Leader => {
                if let Some(ci) = self.find_next_commit_index() {
                    self.meta.commit_index = ci;
                    tick.write_meta();
                }
                let mut next_heartbeat = self.replicate_entries(tick);
                if self.config.value.members.len() + self.config.value.learners.len() == 1 {
                    next_heartbeat = Duration::from_secs(2);
                }
                tick.next_tick = Some(next_heartbeat);
            }
        }
    }

    fn find_next_commit_index(&self) -> Option<u64> {
        let servers = match &self.state {
            ServerState::Leader(s) => &s.servers,
            _ => return None,
        };

        let mut ci = self.log.last_index().unwrap_or(0);
        let majority = self.majority_size();
        while ci > self.meta.commit_index {
            let term = match self.log.term(ci) {
                Some(t) => t,
                None => break,
            };
            if term < self.meta.current_term {
                break;
            } else if term == self.meta.current_term {
                let mut count = 1; // the leader itself
                for (id, progress) in servers.iter() {
                    if !self.config.value.members.contains(id) {
                        continue;
                    }
                    if progress.match_index >= ci {
                        count += 1;
                    }
                }
                if count >= majority {
                    return Some(ci);
                }
            }
            ci -= 1;
        }
        None
    }

    fn replicate_entries(&mut self, tick: &mut Tick) -> Duration {
        let id = self.id;
        let term = self.meta.current_term;
        let leader_commit = self.meta.commit_index;
        let log = self.log.clone();
        let last_log_index = log.last_index().unwrap_or(0);
        let members: Vec<ServerId> = self.config.value.iter().copied().collect();

        let state = match &mut self.state {
            ServerState::Leader(s) => s,
            _ => unreachable!("replicate_entries called while not leader"),
        };

        let mut since_last_heartbeat = Duration::from_millis(0);
        let mut to_send: Vec<(ServerId, u64, Term)> = Vec::new();
        let mut needs_snapshot: Vec<ServerId> = Vec::new();

        for server_id in members {
            if server_id == id {
                continue;
            }
            let progress = state
                .servers
                .entry(server_id)
                .or_insert_with(|| ServerProgress::new(last_log_index));

            if progress.request_pending {
                continue;
            }

            if progress.match_index >= last_log_index {
                if let Some(last_sent) = progress.last_sent {
                    let elapsed = tick.time.saturating_duration_since(last_sent);
                    if elapsed < HEARTBEAT_TIMEOUT {
                        since_last_heartbeat = since_last_heartbeat.max(elapsed);
                        continue;
                    }
                }
            }

            let prev_log_index = progress.next_index.saturating_sub(1);
            progress.request_pending = true;
            progress.last_sent = Some(tick.time);
            // A follower this far behind needs the entries the leader already
            // folded into its own snapshot and dropped from the log.
            match log.term(prev_log_index) {
                Some(prev_log_term) => to_send.push((server_id, prev_log_index, prev_log_term)),
                None => needs_snapshot.push(server_id),
            }
        }

        let mut by_prev_index: HashMap<u64, Message> = HashMap::new();
        for (server_id, prev_log_index, prev_log_term) in to_send {
            if let Some(msg) = by_prev_index.get_mut(&prev_log_index) {
                msg.to.push(server_id);
                continue;
            }
            let mut entries = Vec::new();
            for i in (prev_log_index + 1)..=last_log_index {
                if let Some(e) = log.entry(i) {
                    entries.push(e);
                }
            }
            let req = AppendEntriesRequest {
                term,
                leader_id: id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            };
            by_prev_index.insert(
                prev_log_index,
                Message {
                    to: vec![server_id],
                    body: MessageBody::AppendEntries(req, last_log_index),
                },
            );
        }

        for (_, msg) in by_prev_index {
            tick.send(msg);
        }

        if !needs_snapshot.is_empty() {
            tick.send(Message {
                to: needs_snapshot,
                body: MessageBody::InstallSnapshot,
            });
        }

        HEARTBEAT_TIMEOUT.saturating_sub(since_last_heartbeat)
    }

    fn start_election(&mut self, tick: &mut Tick) {
        if !self.can_be_leader() {
            tracing::warn!(server_id = self.id, "cannot start election: log behind commit index");
            tick.next_tick = Some(Duration::from_secs(1));
            return;
        }

        let must_increment = match &self.state {
            ServerState::Candidate(s) => s.some_rejected,
            _ => true,
        };
        if must_increment {
            self.meta.current_term += 1;
            self.meta.voted_for = Some(self.id);
            tick.write_meta();
        }

        tracing::info!(server_id = self.id, term = self.meta.current_term, "starting election");

        self.state = ServerState::Candidate(CandidateState {
            election_start: tick.time,
            election_timeout: Self::new_election_timeout(),
            votes_received: HashSet::new(),
            some_rejected: false,
        });

        let last_log_index = self.log.last_index().unwrap_or(0);
        let last_log_term = self.log.term(last_log_index).unwrap_or(0);
        let req = RequestVoteRequest {
            term: self.meta.current_term,
            candidate_id: self.id,
            last_log_index,
            last_log_term,
        };
        let peers: Vec<ServerId> = self
            .config
            .value
            .members
            .iter()
            .filter(|id| **id != self.id)
            .copied()
            .collect();
        if !peers.is_empty() {
            tick.send(Message {
                to: peers,
                body: MessageBody::RequestVote(req),
            });
        }
        tick.next_tick = Some(match &self.state {
            ServerState::Candidate(s) => s.election_timeout,
            _ => unreachable!(),
        });
    }

    /// Handles an incoming `RequestVote` RPC, returning the reply and updating
    /// local state (term, vote) as a side effect.
    pub fn handle_request_vote(&mut self, req: RequestVoteRequest, tick: &mut Tick) -> RequestVoteResponse {
        if req.term < self.meta.current_term {
            return RequestVoteResponse {
                term: self.meta.current_term,
                vote_granted: false,
            };
        }
        if req.term > self.meta.current_term {
            self.meta.current_term = req.term;
            self.meta.voted_for = None;
            self.state = Self::new_follower(tick.time);
            tick.write_meta();
        }

        let last_log_index = self.log.last_index().unwrap_or(0);
        let last_log_term = self.log.term(last_log_index).unwrap_or(0);
        let log_ok = req.last_log_term > last_log_term
            || (req.last_log_term == last_log_term && req.last_log_index >= last_log_index);

        let can_vote = match self.meta.voted_for {
            None => true,
            Some(candidate) => candidate == req.candidate_id,
        };

        if can_vote && log_ok {
            self.meta.voted_for = Some(req.candidate_id);
            tick.write_meta();
            if let ServerState::Follower(s) = &mut self.state {
                s.last_heartbeat = tick.time;
            }
            RequestVoteResponse {
                term: self.meta.current_term,
                vote_granted: true,
            }
        } else {
            RequestVoteResponse {
                term: self.meta.current_term,
                vote_granted: false,
            }
        }
    }

    /// Records the outcome of a `RequestVote` RPC we sent out while a candidate.
    pub fn record_vote_response(&mut self, voter: ServerId, resp: RequestVoteResponse, tick: &mut Tick) {
        if resp.term > self.meta.current_term {
            self.meta.current_term = resp.term;
            self.meta.voted_for = None;
            self.state = Self::new_follower(tick.time);
            tick.write_meta();
            return;
        }
        if let ServerState::Candidate(s) = &mut self.state {
            if resp.vote_granted {
                s.votes_received.insert(voter);
            } else {
                s.some_rejected = true;
            }
        }
        self.cycle(tick);
    }

    /// Handles an incoming `AppendEntries` RPC (heartbeat or replication).
    pub fn handle_append_entries(
        &mut self,
        req: AppendEntriesRequest,
        tick: &mut Tick,
    ) -> AppendEntriesResponse {
        if req.term < self.meta.current_term {
            return AppendEntriesResponse {
                term: self.meta.current_term,
                success: false,
                last_log_index: self.log.last_index(),
            };
        }

        if req.term > self.meta.current_term {
            self.meta.current_term = req.term;
            self.meta.voted_for = None;
            tick.write_meta();
        }

        self.state = ServerState::Follower(FollowerState {
            last_heartbeat: tick.time,
            election_timeout: Self::new_election_timeout(),
            last_leader_id: Some(req.leader_id),
        });

        let prev_ok = req.prev_log_index == 0
            || self.log.term(req.prev_log_index) == Some(req.prev_log_term);
        if !prev_ok {
            return AppendEntriesResponse {
                term: self.meta.current_term,
                success: false,
                last_log_index: self.log.last_index(),
            };
        }

        for entry in req.entries {
            self.log.append(entry.clone());
            self.config.apply(&entry, self.meta.commit_index);
        }

        if req.leader_commit > self.meta.commit_index {
            self.meta.commit_index = req.leader_commit.min(self.log.last_index().unwrap_or(0));
            tick.write_meta();
        }

        AppendEntriesResponse {
            term: self.meta.current_term,
            success: true,
            last_log_index: self.log.last_index(),
        }
    }

    /// Records the outcome of an `AppendEntries` RPC we sent as leader.
    pub fn record_append_entries_response(
        &mut self,
        follower: ServerId,
        sent_last_index: u64,
        resp: AppendEntriesResponse,
        tick: &mut Tick,
    ) {
        if resp.term > self.meta.current_term {
            self.meta.current_term = resp.term;
            self.meta.voted_for = None;
            self.state = Self::new_follower(tick.time);
            tick.write_meta();
            return;
        }

        if let ServerState::Leader(s) = &mut self.state {
            if let Some(progress) = s.servers.get_mut(&follower) {
                progress.request_pending = false;
                if resp.success {
                    progress.match_index = sent_last_index;
                    progress.next_index = sent_last_index + 1;
                } else {
                    progress.next_index = resp
                        .last_log_index
                        .unwrap_or(progress.next_index.saturating_sub(1))
                        .max(1);
                }
            }
        }
        self.cycle(tick);
    }

    /// Records the outcome of an `InstallSnapshot` RPC we sent as leader.
    pub fn record_install_snapshot_response(
        &mut self,
        follower: ServerId,
        last_included_index: u64,
        resp_term: Term,
        tick: &mut Tick,
    ) {
        if resp_term > self.meta.current_term {
            self.meta.current_term = resp_term;
            self.meta.voted_for = None;
            self.state = Self::new_follower(tick.time);
            tick.write_meta();
            return;
        }
        if let ServerState::Leader(s) = &mut self.state {
            if let Some(progress) = s.servers.get_mut(&follower) {
                progress.request_pending = false;
                progress.match_index = progress.match_index.max(last_included_index);
                progress.next_index = last_included_index + 1;
            }
        }
        self.cycle(tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::FileLog;
    use std::collections::HashSet as Set;

    fn single_node_module(dir: &std::path::Path, id: ServerId) -> ConsensusModule {
        let log = Arc::new(FileLog::open(dir).unwrap());
        let mut members = Set::new();
        members.insert(id);
        ConsensusModule::new(
            id,
            Metadata::default(),
            ConfigurationSnapshot {
                last_applied: 0,
                data: Configuration {
                    members,
                    learners: Set::new(),
                },
            },
            log,
        )
    }

    #[test]
    fn single_node_cluster_elects_itself_leader() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = single_node_module(dir.path(), 1);
        let mut tick = Tick::empty();
        m.cycle(&mut tick);
        assert!(m.is_leader());
    }

    #[test]
    fn single_node_cluster_commits_proposals() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = single_node_module(dir.path(), 1);
        let mut tick = Tick::empty();
        m.cycle(&mut tick);
        assert!(m.is_leader());

        let mut tick = Tick::empty();
        let proposal = m.propose_command(b"hello".to_vec(), &mut tick).unwrap();
        // find_next_commit_index runs on the next cycle and should commit
        // immediately since we are the sole voting member.
        let mut tick2 = Tick::empty();
        m.cycle(&mut tick2);
        assert_eq!(m.proposal_status(&proposal), ProposalStatus::Committed);
    }

    #[test]
    fn non_leader_rejects_proposals_with_leader_hint() {
        let dir = tempfile::tempdir().unwrap();
        let mut members = Set::new();
        members.insert(1);
        members.insert(2);
        let log = Arc::new(FileLog::open(dir.path()).unwrap());
        let mut m = ConsensusModule::new(
            2,
            Metadata::default(),
            ConfigurationSnapshot {
                last_applied: 0,
                data: Configuration {
                    members,
                    learners: Set::new(),
                },
            },
            log,
        );
        let mut tick = Tick::empty();
        match m.propose_noop(&mut tick) {
            Err(ProposeError::NotLeader { .. }) => {}
            other => panic!("expected NotLeader, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn stale_request_vote_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = single_node_module(dir.path(), 1);
        m.meta.current_term = 5;
        let mut tick = Tick::empty();
        let resp = m.handle_request_vote(
            RequestVoteRequest {
                term: 3,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            },
            &mut tick,
        );
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 5);
    }
}
