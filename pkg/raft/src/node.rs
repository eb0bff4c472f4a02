//! The async driver around `ConsensusModule`: owns the ticker loop, dispatches
//! outgoing messages over `PeerClient`s, persists metadata, and applies newly
//! committed entries to the caller's `StateMachine`, as a single tokio task
//! plus a tonic service.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::consensus::{ConsensusModule, ProposalStatus, Proposal, ProposeError, Tick};
use crate::error::RaftError;
use crate::log::{FileLog, LogStorage};
use crate::state_machine::StateMachine;
use crate::transport::PeerClient;
use crate::types::{
    Configuration, ConfigurationSnapshot, LogEntryData, LogIndex, Message, MessageBody, Metadata,
    ServerId, Term,
};

const MAX_APPLIED_RESULTS_CACHED: usize = 4096;

/// Entries applied since the last snapshot before a new one is taken and the
/// log compacted. Matches the default retention a restart or a caught-up
/// follower needs to replay.
const SNAPSHOT_THRESHOLD: LogIndex = 10_000;

pub struct NodeConfig {
    pub id: ServerId,
    pub dir: PathBuf,
    pub initial_members: Vec<ServerId>,
    pub peer_addresses: HashMap<ServerId, String>,
}

struct Shared<S: StateMachine> {
    consensus: Mutex<ConsensusModule>,
    log: Arc<dyn LogStorage>,
    state_machine: Arc<S>,
    dir: PathBuf,
    peers: Mutex<HashMap<ServerId, PeerClient>>,
    last_applied: Mutex<LogIndex>,
    applied_results: Mutex<HashMap<LogIndex, Vec<u8>>>,
    commit_notify: Notify,
    leader_watch: watch::Sender<Option<ServerId>>,
}

/// A running raft node. Cloning shares the same underlying state; the ticker
/// task and the tonic service both hold a clone.
pub struct Node<S: StateMachine> {
    shared: Arc<Shared<S>>,
}

impl<S: StateMachine> Clone for Node<S> {
    fn clone(&self) -> Self {
        Node {
            shared: self.shared.clone(),
        }
    }
}

fn load_metadata(dir: &Path) -> Metadata {
    let path = dir.join("meta.json");
    std::fs::read(&path)
        .ok()
        .and_then(|b| serde_json::from_slice(&b).ok())
        .unwrap_or_default()
}

fn save_metadata(dir: &Path, meta: &Metadata) {
    let path = dir.join("meta.json");
    if let Ok(bytes) = serde_json::to_vec(meta) {
        let _ = warren_core::fs::write_atomic(&path, &bytes);
    }
}

fn load_config_snapshot(dir: &Path, initial_members: &[ServerId]) -> ConfigurationSnapshot {
    let path = dir.join("config.json");
    if let Ok(bytes) = std::fs::read(&path) {
        if let Ok(snap) = serde_json::from_slice(&bytes) {
            return snap;
        }
    }
    ConfigurationSnapshot {
        last_applied: 0,
        data: Configuration {
            members: initial_members.iter().copied().collect(),
            learners: Default::default(),
        },
    }
}

fn save_config_snapshot(dir: &Path, snap: &ConfigurationSnapshot) {
    let path = dir.join("config.json");
    if let Ok(bytes) = serde_json::to_vec(snap) {
        let _ = warren_core::fs::write_atomic(&path, &bytes);
    }
}

fn load_snapshot(dir: &Path) -> Option<Vec<u8>> {
    std::fs::read(dir.join("snapshot.bin")).ok()
}

fn save_snapshot(dir: &Path, data: &[u8]) {
    let _ = warren_core::fs::write_atomic(&dir.join("snapshot.bin"), data);
}

impl<S: StateMachine + 'static> Node<S> {
    pub fn start(config: NodeConfig, state_machine: Arc<S>, cancel: CancellationToken) -> std::io::Result<Self> {
        let log: Arc<dyn LogStorage> = Arc::new(FileLog::open(&config.dir)?);
        let meta = load_metadata(&config.dir);
        let config_snapshot = load_config_snapshot(&config.dir, &config.initial_members);

        // A snapshot on disk means the log was already compacted up through
        // its index; restore the state machine from it and only replay the
        // tail the log actually still holds.
        let initial_applied = if let Some(data) = load_snapshot(&config.dir) {
            state_machine.restore(&data);
            log.snapshot_point().0
        } else {
            0
        };

        let consensus = ConsensusModule::new(config.id, meta, config_snapshot, log.clone());
        let (leader_watch, _) = watch::channel(None);

        let mut peers = HashMap::new();
        for (id, addr) in &config.peer_addresses {
            if *id == config.id {
                continue;
            }
            if let Ok(endpoint) = tonic::transport::Endpoint::from_shared(addr.clone()) {
                peers.insert(*id, PeerClient::connect_lazy(endpoint));
            }
        }

        let node = Node {
            shared: Arc::new(Shared {
                consensus: Mutex::new(consensus),
                log,
                state_machine,
                dir: config.dir,
                peers: Mutex::new(peers),
                last_applied: Mutex::new(initial_applied),
                applied_results: Mutex::new(HashMap::new()),
                commit_notify: Notify::new(),
                leader_watch,
            }),
        };

        let driver = node.clone();
        tokio::spawn(async move { driver.run_ticker(cancel).await });

        Ok(node)
    }

    pub fn id(&self) -> ServerId {
        let consensus = self.shared.consensus.lock().unwrap();
        consensus.id()
    }

    pub fn is_leader(&self) -> bool {
        self.shared.consensus.lock().unwrap().is_leader()
    }

    pub fn leader_hint(&self) -> Option<ServerId> {
        self.shared.consensus.lock().unwrap().current_leader_hint()
    }

    /// Subscribes to leader-identity changes, used by the API server to know
    /// when to stop rejecting writes with `NotLeader`.
    pub fn watch_leader(&self) -> watch::Receiver<Option<ServerId>> {
        self.shared.leader_watch.subscribe()
    }

    pub fn add_peer(&self, id: ServerId, addr: &str) {
        if let Ok(endpoint) = tonic::transport::Endpoint::from_shared(addr.to_string()) {
            self.shared
                .peers
                .lock()
                .unwrap()
                .insert(id, PeerClient::connect_lazy(endpoint));
        }
    }

    /// Proposes `command` to the cluster and waits (up to `timeout`) for it to
    /// commit and apply, returning the state machine's result bytes.
    pub async fn execute(&self, command: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, RaftError> {
        let proposal = {
            let mut consensus = self.shared.consensus.lock().unwrap();
            let mut tick = Tick::empty();
            let result = consensus.propose_command(command, &mut tick);
            self.apply_tick_side_effects(&consensus, &tick);
            self.dispatch_tick(tick.messages);
            result
        };

        let proposal = match proposal {
            Ok(p) => p,
            Err(ProposeError::NotLeader { leader_hint }) => {
                return Err(RaftError::NotLeader { leader_hint })
            }
            Err(ProposeError::RetryAfter(p)) => p,
        };

        self.await_proposal(proposal, timeout).await
    }

    async fn await_proposal(&self, proposal: Proposal, timeout: Duration) -> Result<Vec<u8>, RaftError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let status = self.shared.consensus.lock().unwrap().proposal_status(&proposal);
                match status {
                    ProposalStatus::Committed => {
                        if let Some(result) = self.take_applied_result(proposal.index) {
                            return Ok(result);
                        }
                        // Committed but not yet applied locally; fall through to wait.
                    }
                    ProposalStatus::Failed | ProposalStatus::Unavailable => {
                        return Err(RaftError::Unavailable);
                    }
                    ProposalStatus::Pending | ProposalStatus::Missing => {}
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RaftError::Unavailable);
            }
            let _ = tokio::time::timeout(Duration::from_millis(25), self.shared.commit_notify.notified()).await;
        }
    }

    fn take_applied_result(&self, index: LogIndex) -> Option<Vec<u8>> {
        self.shared.applied_results.lock().unwrap().remove(&index)
    }

    async fn run_ticker(&self, cancel: CancellationToken) {
        loop {
            let wait = {
                let mut consensus = self.shared.consensus.lock().unwrap();
                let mut tick = Tick::empty();
                consensus.cycle(&mut tick);
                self.apply_tick_side_effects(&consensus, &tick);
                self.dispatch_tick(tick.messages);
                tick.next_tick.unwrap_or(Duration::from_millis(100))
            };
            self.apply_committed_entries();

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn apply_tick_side_effects(&self, consensus: &ConsensusModule, tick: &Tick) {
        if tick.must_persist_meta {
            save_metadata(&self.shared.dir, consensus.meta());
        }
        if tick.new_entries {
            save_config_snapshot(&self.shared.dir, &consensus.config_snapshot());
        }
        let _ = self.shared.leader_watch.send(consensus.current_leader_hint());
    }

    fn dispatch_tick(&self, messages: Vec<Message>) {
        for msg in messages {
            let peers: Vec<(ServerId, PeerClient)> = {
                let guard = self.shared.peers.lock().unwrap();
                msg.to
                    .iter()
                    .filter_map(|id| guard.get(id).map(|c| (*id, c.clone())))
                    .collect()
            };
            match msg.body {
                MessageBody::RequestVote(req) => {
                    for (peer_id, client) in peers {
                        let this = self.clone();
                        let req = req.clone();
                        tokio::spawn(async move {
                            if let Ok(resp) = client.request_vote(req).await {
                                let mut consensus = this.shared.consensus.lock().unwrap();
                                let mut tick = Tick::empty();
                                consensus.record_vote_response(peer_id, resp, &mut tick);
                                this.apply_tick_side_effects(&consensus, &tick);
                                drop(consensus);
                                this.dispatch_tick(tick.messages);
                            }
                        });
                    }
                }
                MessageBody::AppendEntries(req, last_index) => {
                    for (peer_id, client) in peers {
                        let this = self.clone();
                        let req = req.clone();
                        tokio::spawn(async move {
                            if let Ok(resp) = client.append_entries(req).await {
                                let mut consensus = this.shared.consensus.lock().unwrap();
                                let mut tick = Tick::empty();
                                consensus.record_append_entries_response(peer_id, last_index, resp, &mut tick);
                                this.apply_tick_side_effects(&consensus, &tick);
                                drop(consensus);
                                this.dispatch_tick(tick.messages);
                                this.shared.commit_notify.notify_waiters();
                            }
                            this.apply_committed_entries();
                        });
                    }
                }
                MessageBody::InstallSnapshot => {
                    for (peer_id, client) in peers {
                        let this = self.clone();
                        tokio::spawn(async move {
                            let (last_included_index, last_included_term) = this.shared.log.snapshot_point();
                            if last_included_index == 0 {
                                return;
                            }
                            let data = this.shared.state_machine.snapshot();
                            let term = this.shared.consensus.lock().unwrap().meta().current_term;
                            let req = warren_proto::raft::InstallSnapshotRequest {
                                term,
                                leader_id: this.id(),
                                last_included_index,
                                last_included_term,
                                data,
                            };
                            if let Ok(resp) = client.install_snapshot(req).await {
                                let mut consensus = this.shared.consensus.lock().unwrap();
                                let mut tick = Tick::empty();
                                consensus.record_install_snapshot_response(
                                    peer_id,
                                    last_included_index,
                                    resp.term,
                                    &mut tick,
                                );
                                this.apply_tick_side_effects(&consensus, &tick);
                                drop(consensus);
                                this.dispatch_tick(tick.messages);
                                this.shared.commit_notify.notify_waiters();
                            }
                        });
                    }
                }
            }
        }
    }

    fn apply_committed_entries(&self) {
        let commit_index = self.shared.consensus.lock().unwrap().meta().commit_index;
        let mut last_applied = self.shared.last_applied.lock().unwrap();
        while *last_applied < commit_index {
            let next = *last_applied + 1;
            let Some(entry) = self.shared.log.entry(next) else {
                break;
            };
            if let LogEntryData::Command(data) = entry.data {
                let result = self.shared.state_machine.apply(&data);
                let mut cache = self.shared.applied_results.lock().unwrap();
                if cache.len() >= MAX_APPLIED_RESULTS_CACHED {
                    cache.clear();
                }
                cache.insert(next, result);
            }
            *last_applied = next;
        }
        let applied = *last_applied;
        drop(last_applied);
        self.shared.commit_notify.notify_waiters();
        self.maybe_snapshot(applied);
    }

    /// Folds the state machine into a snapshot and compacts the log once
    /// `SNAPSHOT_THRESHOLD` entries have been applied since the last one.
    /// Runs on every replica, not just the leader: taking a local snapshot
    /// doesn't require being leader, only replicating one to a lagging
    /// follower does.
    fn maybe_snapshot(&self, applied: LogIndex) {
        let (last_snapshot_index, _) = self.shared.log.snapshot_point();
        if applied < last_snapshot_index + SNAPSHOT_THRESHOLD {
            return;
        }
        let Some(term) = self.shared.log.term(applied) else {
            return;
        };
        let data = self.shared.state_machine.snapshot();
        self.shared.log.compact(applied, term);
        save_snapshot(&self.shared.dir, &data);
    }

    /// Entry point for the gRPC server side: handles an inbound `AppendEntries`.
    pub fn handle_append_entries(
        &self,
        req: crate::types::AppendEntriesRequest,
    ) -> crate::types::AppendEntriesResponse {
        let mut consensus = self.shared.consensus.lock().unwrap();
        let mut tick = Tick::empty();
        let resp = consensus.handle_append_entries(req, &mut tick);
        self.apply_tick_side_effects(&consensus, &tick);
        drop(consensus);
        self.dispatch_tick(tick.messages);
        self.apply_committed_entries();
        resp
    }

    /// Entry point for the gRPC server side: handles an inbound `RequestVote`.
    pub fn handle_request_vote(
        &self,
        req: crate::types::RequestVoteRequest,
    ) -> crate::types::RequestVoteResponse {
        let mut consensus = self.shared.consensus.lock().unwrap();
        let mut tick = Tick::empty();
        let resp = consensus.handle_request_vote(req, &mut tick);
        self.apply_tick_side_effects(&consensus, &tick);
        drop(consensus);
        self.dispatch_tick(tick.messages);
        resp
    }

    /// Installs a snapshot received from the leader when this replica has
    /// fallen far enough behind that the leader has already compacted the
    /// entries it would need to catch up incrementally.
    pub fn restore_snapshot(&self, last_included_index: LogIndex, last_included_term: Term, data: &[u8]) {
        self.shared.state_machine.restore(data);
        self.shared.log.compact(last_included_index, last_included_term);
        save_snapshot(&self.shared.dir, data);
        let mut last_applied = self.shared.last_applied.lock().unwrap();
        *last_applied = last_included_index.max(*last_applied);
    }
}
