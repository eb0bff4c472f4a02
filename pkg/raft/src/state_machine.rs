/// The deterministic machine a committed command is applied to. Implemented by
/// `warren-control`'s cluster state machine; kept generic here so `warren-raft`
/// never needs to know about buckets, services or containers.
///
/// `apply` must be total and must not perform I/O beyond whatever local
/// storage the implementation owns — no network calls, no image pulls.
/// Non-deterministic work happens elsewhere and comes back as a new command.
pub trait StateMachine: Send + Sync {
    /// Applies one committed command, returning an opaque result that the
    /// submitter on the leader receives back. Must be called with log entries
    /// in index order and exactly once per index.
    fn apply(&self, command: &[u8]) -> Vec<u8>;

    /// Serializes the entire current state for a snapshot.
    fn snapshot(&self) -> Vec<u8>;

    /// Replaces current state with a previously produced snapshot, used when a
    /// replica is too far behind the leader's log to catch up incrementally.
    fn restore(&self, snapshot: &[u8]);
}
