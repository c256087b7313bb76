//! Consensus engine: a single-leader replicated log specialised for a
//! central-authority cluster.
//!
//! One node is the permanent authority leader. Financial-organisation peers
//! are followers; they elect a temporary leader among themselves only while
//! the authority is unreachable, and surrender leadership on the first
//! authority heartbeat. A temporary leader appends log entries for incoming
//! blocks but never replicates them; the authority drains the backlog after
//! recovery.
//!
//! Votes and replication acknowledgements towards remote peers are simulated
//! draws behind [`SimulatedRpc`]; a real transport replaces the draws while
//! keeping the same return contracts.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::registry::{NodeId, NodeRole, NodeStatus};
use crate::store::{PeerDirectory, Store};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Fixed heartbeat cadence of the consensus loop.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Election timeout bounds; each node draws its own value once.
pub const ELECTION_TIMEOUT_MIN: Duration = Duration::from_millis(1500);
pub const ELECTION_TIMEOUT_MAX: Duration = Duration::from_millis(3000);

/// Role of a node in the replicated-log protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            RaftRole::Follower => "FOLLOWER",
            RaftRole::Candidate => "CANDIDATE",
            RaftRole::Leader => "LEADER",
        };
        f.write_str(tag)
    }
}

/// Replicated-log entry; keyed `(term, index)`, indices strictly increasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub block_hash: String,
    pub timestamp: DateTime<Utc>,
}

/// Audit tag of a consensus event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventState {
    TxReceived,
    CandidateAnalysis,
    NotBestCandidate,
    ElectionStart,
    VoteRequest,
    VoteGranted,
    VoteDenied,
    LeaderElected,
    ElectionFailed,
    AppendEntries,
    EntryApplied,
    LeaderAppend,
    BlockStored,
    Replication,
    Committed,
    ReplicationIncomplete,
    QuorumReached,
    QuorumFailed,
    LeaderRestored,
    LeadershipTransferred,
    FailureSimulated,
    Recovered,
    BlocksReceptionStart,
    ReplicationStart,
    NormalOperationResumed,
}

/// Append-only audit record; observability only, never read by the state
/// machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusEvent {
    /// Block hash or a `term-N` tag for election-scoped events.
    pub subject: String,
    pub detail: String,
    pub actor: NodeId,
    pub state: EventState,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of consensus progress for operators.
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusStats {
    pub rounds: usize,
    pub last_block: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub current_term: u64,
    pub role: RaftRole,
    pub leader: Option<NodeId>,
}

/// Outcome probabilities of the simulated peer RPCs.
///
/// The defaults mirror the reference behaviour; [`SimulatedRpc::reliable`]
/// removes the randomness for deterministic tests. A real transport replaces
/// the draws with actual RPC outcomes.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedRpc {
    pub election_vote: f64,
    pub block_vote: f64,
    pub replication: f64,
}

impl Default for SimulatedRpc {
    fn default() -> Self {
        Self {
            election_vote: 0.8,
            block_vote: 0.9,
            replication: 0.9,
        }
    }
}

impl SimulatedRpc {
    pub fn reliable() -> Self {
        Self {
            election_vote: 1.0,
            block_vote: 1.0,
            replication: 1.0,
        }
    }

    fn draw(&self, probability: f64) -> bool {
        if probability >= 1.0 {
            return true;
        }
        rand::rng().random_bool(probability)
    }
}

/// Per-node consensus state machine.
pub struct RaftConsensus {
    node_id: NodeId,
    is_authority: bool,
    store: Arc<Store>,
    peers: PeerDirectory,
    clock: Arc<dyn Clock>,
    rpc: SimulatedRpc,
    role: RaftRole,
    leader_id: Option<NodeId>,
    current_term: u64,
    voted_for: Option<NodeId>,
    last_heartbeat: Duration,
    election_timeout: Duration,
    heartbeat_interval: Duration,
    commit_index: u64,
    last_applied: u64,
}

impl RaftConsensus {
    pub fn new(
        node_id: NodeId,
        is_authority: bool,
        store: Arc<Store>,
        peers: PeerDirectory,
        clock: Arc<dyn Clock>,
    ) -> RaftConsensus {
        let current_term = store.read(|t| t.raft.current_term);
        let (role, leader_id) = if is_authority {
            (RaftRole::Leader, Some(node_id.clone()))
        } else {
            (RaftRole::Follower, None)
        };
        let timeout_ms = rand::rng().random_range(
            ELECTION_TIMEOUT_MIN.as_millis() as u64..=ELECTION_TIMEOUT_MAX.as_millis() as u64,
        );
        let last_heartbeat = clock.monotonic();
        RaftConsensus {
            node_id,
            is_authority,
            store,
            peers,
            clock,
            rpc: SimulatedRpc::default(),
            role,
            leader_id,
            current_term,
            voted_for: None,
            last_heartbeat,
            election_timeout: Duration::from_millis(timeout_ms),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            commit_index: 0,
            last_applied: 0,
        }
    }

    /// Replace the simulated transport, e.g. with [`SimulatedRpc::reliable`].
    pub fn set_rpc(&mut self, rpc: SimulatedRpc) {
        self.rpc = rpc;
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn is_authority(&self) -> bool {
        self.is_authority
    }

    pub fn role(&self) -> RaftRole {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    pub fn leader_id(&self) -> Option<&NodeId> {
        self.leader_id.as_ref()
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn last_log_index(&self) -> u64 {
        self.store.read(|t| t.last_log_index())
    }

    pub fn last_log_term(&self) -> u64 {
        self.store.read(|t| t.last_log_term())
    }

    /// Active cluster members from the registry; falls back to this node
    /// alone before any registration has happened.
    fn cluster_nodes(&self) -> Vec<(NodeId, NodeRole)> {
        let nodes = self.store.read(|t| {
            t.nodes
                .values()
                .filter(|n| n.status == NodeStatus::Active)
                .map(|n| (n.node_id.clone(), n.role))
                .collect::<Vec<_>>()
        });
        if nodes.is_empty() {
            let role = if self.is_authority {
                NodeRole::Authority
            } else {
                NodeRole::FinancialOrg
            };
            vec![(self.node_id.clone(), role)]
        } else {
            nodes
        }
    }

    /// Voting peers: active, non-authority nodes.
    fn voting_nodes(&self) -> Vec<NodeId> {
        self.cluster_nodes()
            .into_iter()
            .filter(|(_, role)| *role != NodeRole::Authority)
            .map(|(id, _)| id)
            .collect()
    }

    fn majority(&self) -> usize {
        let voting = self.voting_nodes().len();
        if voting == 0 { 1 } else { voting / 2 + 1 }
    }

    fn authority_failed(&self) -> bool {
        self.clock.monotonic().saturating_sub(self.last_heartbeat) > self.election_timeout
    }

    fn refresh_heartbeat(&mut self) {
        self.last_heartbeat = self.clock.monotonic();
    }

    fn bump_term(&mut self, new_term: u64) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = None;
            if !self.is_authority && self.role != RaftRole::Follower {
                self.role = RaftRole::Follower;
            }
            self.store.write(|t| t.raft.current_term = new_term);
        }
    }

    fn append_log_entry(&self, block_hash: &str) -> u64 {
        let now = self.clock.now();
        let term = self.current_term;
        self.store.write(|t| {
            let index = t.last_log_index() + 1;
            t.raft_log.insert(
                index,
                LogEntry {
                    term,
                    index,
                    block_hash: block_hash.to_string(),
                    timestamp: now,
                },
            );
            index
        })
    }

    /// Last log index of a peer, read through its store handle.
    fn peer_log_index(&self, node: &NodeId) -> u64 {
        if *node == self.node_id {
            return self.last_log_index();
        }
        self.peers
            .open(node)
            .map(|store| store.read(|t| t.last_log_index()))
            .unwrap_or(0)
    }

    pub fn record_event(
        &self,
        subject: impl Into<String>,
        detail: impl Into<String>,
        actor: NodeId,
        state: EventState,
    ) {
        let event = ConsensusEvent {
            subject: subject.into(),
            detail: detail.into(),
            actor,
            state,
            created_at: self.clock.now(),
        };
        self.store.write(|t| t.consensus_events.push(event));
    }

    /// Note an observed transaction hash in the audit trail.
    pub fn log_transaction(&self, tx_hash: &str) {
        self.record_event(
            tx_hash,
            "transaction hash received",
            self.node_id.clone(),
            EventState::TxReceived,
        );
    }

    /// Most recent events, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<ConsensusEvent> {
        self.store.read(|t| {
            t.consensus_events
                .iter()
                .rev()
                .take(limit)
                .cloned()
                .collect()
        })
    }

    pub fn stats(&self) -> ConsensusStats {
        self.store.read(|t| {
            let rounds = t
                .consensus_events
                .iter()
                .map(|e| e.subject.as_str())
                .collect::<std::collections::HashSet<_>>()
                .len();
            let last = t.consensus_events.last();
            ConsensusStats {
                rounds,
                last_block: last.map(|e| e.subject.clone()),
                last_activity: last.map(|e| e.created_at),
                current_term: self.current_term,
                role: self.role,
                leader: self.leader_id.clone(),
            }
        })
    }

    /// Candidate set for an election: active non-authority nodes except self.
    fn candidate_nodes(&self) -> Vec<NodeId> {
        self.voting_nodes()
            .into_iter()
            .filter(|id| *id != self.node_id)
            .collect()
    }

    /// The unique election initiator is the candidate with the maximum log
    /// index; ties break by node-id order. Split votes are eliminated by
    /// construction.
    fn best_candidate(&self, candidates: &[NodeId]) -> NodeId {
        let mut all: Vec<NodeId> = candidates.to_vec();
        if !self.is_authority && !all.contains(&self.node_id) {
            all.push(self.node_id.clone());
        }
        all.sort();
        let mut best = self.node_id.clone();
        let mut best_index: Option<u64> = None;
        for candidate in all {
            let index = self.peer_log_index(&candidate);
            if best_index.map(|b| index > b).unwrap_or(true) {
                best_index = Some(index);
                best = candidate;
            }
        }
        best
    }

    /// Run an election for temporary leadership. Returns whether this node
    /// became the leader.
    pub fn start_election(&mut self) -> bool {
        if self.is_authority {
            return false;
        }
        if self.is_leader() {
            return true;
        }
        if !self.authority_failed() {
            return false;
        }
        let candidates = self.candidate_nodes();
        if candidates.is_empty() {
            return false;
        }

        let indices: Vec<String> = candidates
            .iter()
            .map(|c| format!("{}(log_index={})", c, self.peer_log_index(c)))
            .collect();
        self.record_event(
            format!("term-{}", self.current_term),
            format!("candidate analysis across peers: {}", indices.join(", ")),
            self.node_id.clone(),
            EventState::CandidateAnalysis,
        );

        let best = self.best_candidate(&candidates);
        if best != self.node_id {
            self.record_event(
                format!("term-{}", self.current_term),
                format!(
                    "{} is not the best candidate; deferring to {} (log_index={})",
                    self.node_id,
                    best,
                    self.peer_log_index(&best)
                ),
                self.node_id.clone(),
                EventState::NotBestCandidate,
            );
            return false;
        }

        self.bump_term(self.current_term + 1);
        self.role = RaftRole::Candidate;
        self.voted_for = Some(self.node_id.clone());
        info!(node = %self.node_id, term = self.current_term, "starting temporary-leader election");
        self.record_event(
            format!("term-{}", self.current_term),
            format!(
                "{} becomes candidate with the highest log index ({})",
                self.node_id,
                self.last_log_index()
            ),
            self.node_id.clone(),
            EventState::ElectionStart,
        );

        let voting = self.voting_nodes();
        let majority = self.majority();
        let mut votes = 1usize; // own vote

        for node in &voting {
            if *node == self.node_id {
                continue;
            }
            if self.request_election_vote(node) {
                votes += 1;
                self.record_event(
                    format!("term-{}", self.current_term),
                    format!(
                        "vote received from {} ({}/{} votes, need {})",
                        node,
                        votes,
                        voting.len(),
                        majority
                    ),
                    node.clone(),
                    EventState::VoteGranted,
                );
            } else {
                self.record_event(
                    format!("term-{}", self.current_term),
                    format!("vote denied by {}", node),
                    node.clone(),
                    EventState::VoteDenied,
                );
            }

            if votes >= majority {
                self.role = RaftRole::Leader;
                self.leader_id = Some(self.node_id.clone());
                self.refresh_heartbeat();
                info!(node = %self.node_id, term = self.current_term, "elected temporary leader");
                self.record_event(
                    format!("term-{}", self.current_term),
                    format!(
                        "{} elected temporary leader ({}/{} votes, need {})",
                        self.node_id,
                        votes,
                        voting.len(),
                        majority
                    ),
                    self.node_id.clone(),
                    EventState::LeaderElected,
                );
                return true;
            }
        }

        self.role = RaftRole::Follower;
        self.record_event(
            format!("term-{}", self.current_term),
            format!(
                "{} not elected ({}/{} votes, need {})",
                self.node_id,
                votes,
                voting.len(),
                majority
            ),
            self.node_id.clone(),
            EventState::ElectionFailed,
        );
        false
    }

    /// Simulated election-vote RPC; granted votes are persisted.
    fn request_election_vote(&self, node: &NodeId) -> bool {
        let granted = self.rpc.draw(self.rpc.election_vote);
        if granted {
            let key = (self.current_term, self.node_id.clone(), node.clone());
            self.store.write(|t| {
                t.raft_votes.insert(key);
            });
        }
        granted
    }

    /// Heartbeat-and-append from a leader.
    ///
    /// Rejects stale terms; otherwise adopts the leader's term, refreshes the
    /// heartbeat, downgrades a candidate (or a temporary leader contacted by
    /// the authority), appends the entry and advances the commit index
    /// monotonically.
    pub fn append_entries(
        &mut self,
        block_hash: &str,
        leader_id: &NodeId,
        leader_term: u64,
    ) -> Result<()> {
        if self.is_leader() && !self.is_authority {
            let leader_is_authority = self.store.read(|t| {
                t.nodes
                    .get(leader_id)
                    .map(|n| n.role == NodeRole::Authority)
                    .unwrap_or(false)
            });
            if leader_is_authority {
                self.transfer_leadership();
            }
        }

        if leader_term < self.current_term {
            return Err(Error::StaleTerm {
                leader_term,
                current_term: self.current_term,
            });
        }

        self.bump_term(leader_term);
        self.leader_id = Some(leader_id.clone());
        self.refresh_heartbeat();
        if self.role == RaftRole::Candidate {
            self.role = RaftRole::Follower;
        }

        let index = self.append_log_entry(block_hash);
        self.record_event(
            block_hash,
            format!("entry appended at index {index}, term {leader_term}"),
            leader_id.clone(),
            EventState::AppendEntries,
        );
        if index > self.commit_index {
            self.commit_index = index;
            self.apply_committed();
        }
        Ok(())
    }

    /// Surrender temporary leadership back to the authority.
    fn transfer_leadership(&mut self) {
        if !self.is_authority && self.is_leader() {
            self.role = RaftRole::Follower;
            info!(node = %self.node_id, "temporary leader surrendering to authority");
            self.record_event(
                "leadership-transfer",
                format!(
                    "{} hands leadership and accumulated blocks back to the authority",
                    self.node_id
                ),
                self.node_id.clone(),
                EventState::LeadershipTransferred,
            );
        }
    }

    /// Apply entries up to the commit index; applying is an audit event.
    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let hash = self
                .store
                .read(|t| t.raft_log.get(&self.last_applied).map(|e| e.block_hash.clone()));
            if let Some(hash) = hash {
                self.record_event(
                    hash,
                    format!("entry applied at index {}", self.last_applied),
                    self.node_id.clone(),
                    EventState::EntryApplied,
                );
            }
        }
    }

    /// Acceptance-vote phase over the voting peers.
    fn request_block_votes(&self, block_hash: &str) -> (usize, usize) {
        if !self.is_leader() {
            return (0, 0);
        }
        let nodes: Vec<NodeId> = self.cluster_nodes().into_iter().map(|(id, _)| id).collect();
        let majority = self.majority();
        let mut successful = 0usize;
        let mut failed = 0usize;

        for node in &nodes {
            if *node == self.node_id {
                successful += 1;
                continue;
            }
            self.record_event(
                block_hash,
                format!("block acceptance vote requested from {}", node),
                self.node_id.clone(),
                EventState::VoteRequest,
            );
            if self.rpc.draw(self.rpc.block_vote) {
                successful += 1;
                self.record_event(
                    block_hash,
                    format!("block acceptance vote received from {}", node),
                    node.clone(),
                    EventState::VoteGranted,
                );
            } else {
                failed += 1;
                self.record_event(
                    block_hash,
                    format!("block acceptance vote denied by {}", node),
                    node.clone(),
                    EventState::VoteDenied,
                );
            }
        }

        if successful >= majority {
            self.record_event(
                block_hash,
                format!("quorum reached: {successful} acceptance votes (need {majority})"),
                self.node_id.clone(),
                EventState::QuorumReached,
            );
        } else {
            self.record_event(
                block_hash,
                format!("quorum failed: {successful} acceptance votes (need {majority})"),
                self.node_id.clone(),
                EventState::QuorumFailed,
            );
        }
        (successful, failed)
    }

    /// Replication accounting towards followers; on majority the commit index
    /// advances and committed entries are applied.
    pub fn replicate_to_followers(&mut self, block_hash: &str) -> (usize, usize) {
        if !self.is_leader() {
            return (0, 0);
        }
        let nodes: Vec<NodeId> = self.cluster_nodes().into_iter().map(|(id, _)| id).collect();
        let mut successful = 0usize;
        let mut failed = 0usize;

        for node in &nodes {
            if *node == self.node_id {
                successful += 1;
                continue;
            }
            if self.rpc.draw(self.rpc.replication) {
                successful += 1;
                self.record_event(
                    block_hash,
                    format!("block replicated to {}", node),
                    node.clone(),
                    EventState::Replication,
                );
            } else {
                failed += 1;
                self.record_event(
                    block_hash,
                    format!("replication to {} failed", node),
                    node.clone(),
                    EventState::Replication,
                );
            }
        }

        let majority = self.majority();
        if successful >= majority {
            self.commit_index = self.last_log_index();
            self.apply_committed();
            self.record_event(
                block_hash,
                format!(
                    "block committed: {}/{} nodes acknowledged replication",
                    successful,
                    nodes.len()
                ),
                self.node_id.clone(),
                EventState::Committed,
            );
        } else {
            warn!(node = %self.node_id, successful, majority, "replication incomplete");
            self.record_event(
                block_hash,
                format!(
                    "replication incomplete: {}/{} acknowledged (need {})",
                    successful,
                    nodes.len(),
                    majority
                ),
                self.node_id.clone(),
                EventState::ReplicationIncomplete,
            );
        }
        (successful, failed)
    }

    /// One consensus round for a freshly sealed block.
    ///
    /// Authority: append to the log, gather acceptance votes, replicate and
    /// commit. Financial organisation: run an election when the authority is
    /// silent; as temporary leader, append and store locally without
    /// replication.
    pub fn run_round(&mut self, block_hash: &str) -> Vec<ConsensusEvent> {
        if self.is_authority {
            if !self.is_leader() {
                self.role = RaftRole::Leader;
                self.leader_id = Some(self.node_id.clone());
                self.refresh_heartbeat();
                self.record_event(
                    block_hash,
                    "authority recovered and resumed leadership",
                    self.node_id.clone(),
                    EventState::LeaderRestored,
                );
            }

            let index = self.append_log_entry(block_hash);
            self.record_event(
                block_hash,
                format!("leader appended entry at index {index}"),
                self.node_id.clone(),
                EventState::LeaderAppend,
            );

            let (accepted, _) = self.request_block_votes(block_hash);
            if accepted > 0 {
                self.replicate_to_followers(block_hash);
            }
            return self.recent_events(20);
        }

        // Financial-organisation path. Leadership is only surrendered on an
        // actual authority heartbeat (append_entries / recovery), never on
        // this node's own timer.
        if !self.is_leader() {
            if !self.authority_failed() {
                return Vec::new();
            }
            if self.start_election() {
                debug!(node = %self.node_id, "election finished during round");
            }
        }

        if self.is_leader() {
            let index = self.append_log_entry(block_hash);
            self.record_event(
                block_hash,
                format!("temporary leader appended entry at index {index}"),
                self.node_id.clone(),
                EventState::LeaderAppend,
            );
            self.record_event(
                block_hash,
                "temporary leader stores the block until authority recovery (no replication)",
                self.node_id.clone(),
                EventState::BlockStored,
            );
        }
        self.recent_events(20)
    }

    /// Follower election check; called by the heartbeat loop.
    pub fn tick(&mut self) -> bool {
        if self.is_authority || self.is_leader() {
            return false;
        }
        if self.authority_failed() {
            self.start_election()
        } else {
            false
        }
    }

    /// Test and demo hook: make this node consider the authority failed.
    ///
    /// On the authority itself, demote to follower so the cluster observes a
    /// silent leader.
    pub fn simulate_failure(&mut self) {
        let rewound = self
            .clock
            .monotonic()
            .saturating_sub(self.election_timeout + Duration::from_secs(1));
        self.last_heartbeat = rewound;
        if self.is_authority {
            self.role = RaftRole::Follower;
            self.leader_id = None;
            let already_recorded = self.store.read(|t| {
                t.consensus_events
                    .iter()
                    .any(|e| e.state == EventState::FailureSimulated && e.actor == self.node_id)
            });
            if !already_recorded {
                self.record_event(
                    "cbr-failure-simulation",
                    format!("simulated authority failure: {} demoted to follower", self.node_id),
                    self.node_id.clone(),
                    EventState::FailureSimulated,
                );
            }
        }
    }

    /// Test and demo hook: bring the authority back (or deliver its heartbeat
    /// to a follower, transferring temporary leadership back).
    pub fn simulate_recovery(&mut self) {
        if self.is_authority {
            self.role = RaftRole::Leader;
            self.leader_id = Some(self.node_id.clone());
            self.refresh_heartbeat();
            self.record_event(
                "cbr-recovery-simulation",
                "authority recovered and resumed leadership",
                self.node_id.clone(),
                EventState::Recovered,
            );
            self.record_event(
                "cbr-recovery-simulation",
                "authority accepts accumulated blocks from the temporary leader",
                self.node_id.clone(),
                EventState::BlocksReceptionStart,
            );
            self.record_event(
                "cbr-recovery-simulation",
                "authority replicates adopted blocks across the cluster",
                self.node_id.clone(),
                EventState::ReplicationStart,
            );
            self.record_event(
                "cbr-recovery-simulation",
                "authority back to normal operation",
                self.node_id.clone(),
                EventState::NormalOperationResumed,
            );
        } else {
            self.refresh_heartbeat();
            if self.is_leader() {
                self.transfer_leadership();
            }
            self.record_event(
                "cbr-recovery-simulation",
                "authority heartbeat observed; control handed back",
                self.node_id.clone(),
                EventState::Recovered,
            );
        }
    }
}

/// Periodic follower tick at the heartbeat interval. The lock is released
/// before every sleep so storage work never spans an await.
pub async fn run_heartbeat_loop(consensus: Arc<AsyncMutex<RaftConsensus>>) {
    let interval = consensus.lock().await.heartbeat_interval();
    loop {
        sleep(interval).await;
        let mut guard = consensus.lock().await;
        if guard.tick() {
            info!(node = %guard.node_id(), "follower won a temporary-leader election");
        }
    }
}
