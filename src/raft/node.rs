use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
// Use external log crate, not our own log module
use ::log::{debug, info};

use super::persister::{encode_state, PersistentState, Persister};
use super::{
    AppendEntriesArgs, AppendEntriesReply, Log, LogEntry, NodeId, NodeRole, NodeState,
    RaftConfig, RaftError, RequestVoteArgs, RequestVoteReply, StartOutcome,
};

/// Upper bounds on one AppendEntries batch. A follower that is far behind
/// catches up over several rounds instead of one oversized frame.
const MAX_BATCH_ENTRIES: usize = 512;
const MAX_BATCH_BYTES: usize = 1024 * 1024;

/// Replication cursors, reinitialized on every election win.
#[derive(Debug)]
struct LeaderState {
    next_index: Vec<u64>,
    match_index: Vec<u64>,
}

#[derive(Debug)]
enum RoleState {
    Follower,
    Candidate { votes: HashSet<NodeId> },
    Leader(LeaderState),
}

impl RoleState {
    fn role(&self) -> NodeRole {
        match self {
            RoleState::Follower => NodeRole::Follower,
            RoleState::Candidate { .. } => NodeRole::Candidate,
            RoleState::Leader(_) => NodeRole::Leader,
        }
    }
}

/// All mutable state of one server. `Raft` keeps it behind a single lock;
/// every method here runs inside that critical section and never blocks on
/// the network.
///
/// Field groups:
/// - persistent (`current_term`, `voted_for`, `log`): written through
///   `persist()` before any reply or broadcast that depends on them
/// - volatile (`commit_index`, `last_applied`): both only ever grow
/// - role: leader cursors exist only inside `RoleState::Leader`
/// - timers: deadlines read by the ticker task
pub struct RaftNode {
    id: NodeId,
    config: RaftConfig,
    persister: Arc<dyn Persister>,

    current_term: u64,
    voted_for: Option<NodeId>,
    log: Log,

    commit_index: u64,
    last_applied: u64,

    role: RoleState,
    leader_id: Option<NodeId>,

    election_deadline: Instant,
    heartbeat_deadline: Instant,
}

impl RaftNode {
    /// Creates a follower and rehydrates whatever the persister holds.
    pub fn new(config: RaftConfig, persister: Arc<dyn Persister>) -> Result<Self, RaftError> {
        config.validate()?;

        let now = Instant::now();
        let mut node = Self {
            id: config.me,
            config,
            persister,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            commit_index: 0,
            last_applied: 0,
            role: RoleState::Follower,
            leader_id: None,
            election_deadline: now,
            heartbeat_deadline: now,
        };

        let blob = node.persister.load()?;
        node.restore(&blob)?;
        node.reset_election_timer();

        Ok(node)
    }

    fn restore(&mut self, blob: &[u8]) -> Result<(), RaftError> {
        let Some(state) = PersistentState::decode(blob)? else {
            return Ok(());
        };

        if let Some(vote) = state.voted_for {
            if vote >= self.cluster_size() {
                return Err(RaftError::CorruptState(format!(
                    "vote recorded for unknown peer {vote}"
                )));
            }
        }

        self.current_term = state.current_term;
        self.voted_for = state.voted_for;
        self.log = Log::from_entries(state.log)?;

        info!(
            "Node {} restored term {} with {} log entries",
            self.id,
            self.current_term,
            self.log.last_index()
        );
        Ok(())
    }

    fn persist(&self) -> Result<(), RaftError> {
        let blob = encode_state(self.current_term, self.voted_for, self.log.entries())?;
        self.persister.save(&blob)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn cluster_size(&self) -> usize {
        self.config.cluster_size()
    }

    /// Every server except this one.
    pub fn peers(&self) -> Vec<NodeId> {
        (0..self.cluster_size()).filter(|&p| p != self.id).collect()
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn role(&self) -> NodeRole {
        self.role.role()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, RoleState::Leader(_))
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn next_index(&self, peer: NodeId) -> Option<u64> {
        match &self.role {
            RoleState::Leader(leader) => leader.next_index.get(peer).copied(),
            _ => None,
        }
    }

    pub fn match_index(&self, peer: NodeId) -> Option<u64> {
        match &self.role {
            RoleState::Leader(leader) => leader.match_index.get(peer).copied(),
            _ => None,
        }
    }

    pub fn status(&self) -> NodeState {
        NodeState {
            id: self.id,
            current_term: self.current_term,
            voted_for: self.voted_for,
            role: self.role(),
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
        }
    }

    // ---- timers ----

    fn random_election_timeout(&self) -> Duration {
        let mut rng = rand::rng();
        let timeout_ms = rng.random_range(
            self.config.election_timeout_min_ms..=self.config.election_timeout_max_ms,
        );
        Duration::from_millis(timeout_ms)
    }

    pub fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.random_election_timeout();
    }

    pub fn reset_heartbeat_timer(&mut self) {
        self.heartbeat_deadline = Instant::now() + self.config.heartbeat_interval();
    }

    /// Makes the next heartbeat due immediately.
    pub fn trigger_replication(&mut self) {
        if self.is_leader() {
            self.heartbeat_deadline = Instant::now();
        }
    }

    /// The deadline the ticker should sleep until for the current role.
    pub fn next_deadline(&self) -> Instant {
        if self.is_leader() {
            self.heartbeat_deadline
        } else {
            self.election_deadline
        }
    }

    pub fn election_timeout_elapsed(&self, now: Instant) -> bool {
        !self.is_leader() && now >= self.election_deadline
    }

    pub fn heartbeat_due(&self, now: Instant) -> bool {
        self.is_leader() && now >= self.heartbeat_deadline
    }

    // ---- role transitions ----

    fn has_majority(&self, count: usize) -> bool {
        count > self.cluster_size() / 2
    }

    /// Adopts `term` if it is newer and falls back to follower. Callers
    /// persist afterwards when the term changed.
    fn step_down(&mut self, term: u64) -> bool {
        let term_changed = term > self.current_term;
        if term_changed {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        if !matches!(self.role, RoleState::Follower) {
            info!(
                "Node {} stepping down from {:?} in term {}",
                self.id,
                self.role(),
                self.current_term
            );
            self.role = RoleState::Follower;
        }
        term_changed
    }

    /// Begins a new term as candidate and returns the RequestVote to
    /// broadcast. A single-server cluster wins on the spot.
    pub fn start_election(&mut self) -> Result<RequestVoteArgs, RaftError> {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.role = RoleState::Candidate {
            votes: HashSet::from([self.id]),
        };
        self.persist()?;
        self.reset_election_timer();

        info!(
            "Node {} starting election for term {}",
            self.id, self.current_term
        );

        let args = RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };

        if self.has_majority(1) {
            self.become_leader();
        }

        Ok(args)
    }

    /// Tallies a RequestVote reply. Returns true if this reply won the
    /// election.
    pub fn handle_vote_reply(
        &mut self,
        from: NodeId,
        request_term: u64,
        reply: &RequestVoteReply,
    ) -> Result<bool, RaftError> {
        if reply.term > self.current_term {
            self.step_down(reply.term);
            self.persist()?;
            self.reset_election_timer();
            return Ok(false);
        }

        if request_term != self.current_term || !reply.vote_granted {
            return Ok(false);
        }

        let RoleState::Candidate { votes } = &mut self.role else {
            return Ok(false);
        };
        votes.insert(from);
        let count = votes.len();

        debug!(
            "Node {} received vote from {} ({} of {}) in term {}",
            self.id,
            from,
            count,
            self.cluster_size(),
            self.current_term
        );

        if self.has_majority(count) {
            self.become_leader();
            return Ok(true);
        }
        Ok(false)
    }

    fn become_leader(&mut self) {
        if !matches!(self.role, RoleState::Candidate { .. }) {
            return;
        }

        info!(
            "Node {} becoming leader for term {}",
            self.id, self.current_term
        );

        let next = self.log.last_index() + 1;
        let size = self.cluster_size();
        self.role = RoleState::Leader(LeaderState {
            next_index: vec![next; size],
            match_index: vec![0; size],
        });
        self.leader_id = Some(self.id);
        // The caller broadcasts the first round right away.
        self.reset_heartbeat_timer();
    }

    // ---- inbound RPCs ----

    pub fn handle_request_vote(
        &mut self,
        args: &RequestVoteArgs,
    ) -> Result<RequestVoteReply, RaftError> {
        if args.term < self.current_term {
            debug!(
                "Node {} rejecting stale vote request from {} (term {} < {})",
                self.id, args.candidate_id, args.term, self.current_term
            );
            return Ok(RequestVoteReply {
                term: self.current_term,
                vote_granted: false,
            });
        }

        if args.term > self.current_term {
            self.step_down(args.term);
            self.persist()?;
        }

        // Check if candidate's log is at least as up-to-date as ours
        let up_to_date = args.last_log_term > self.log.last_term()
            || (args.last_log_term == self.log.last_term()
                && args.last_log_index >= self.log.last_index());
        let free_to_vote = self
            .voted_for
            .map_or(true, |vote| vote == args.candidate_id);

        let vote_granted = free_to_vote && up_to_date;
        if vote_granted {
            if self.voted_for != Some(args.candidate_id) {
                self.voted_for = Some(args.candidate_id);
                self.persist()?;
            }
            self.reset_election_timer();
        }

        debug!(
            "Node {} vote for {} in term {}: {}",
            self.id, args.candidate_id, self.current_term, vote_granted
        );

        Ok(RequestVoteReply {
            term: self.current_term,
            vote_granted,
        })
    }

    pub fn handle_append_entries(
        &mut self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError> {
        // Reply false if term < currentTerm
        if args.term < self.current_term {
            return Ok(AppendEntriesReply::rejected(self.current_term));
        }

        // A valid leader for this term: adopt it and stay a follower.
        if self.step_down(args.term) {
            self.persist()?;
        }
        self.leader_id = Some(args.leader_id);
        self.reset_election_timer();

        // Our log is too short
        if args.prev_log_index >= self.log.len() {
            return Ok(AppendEntriesReply {
                term: self.current_term,
                success: false,
                conflict_index: self.log.len(),
                conflict_term: None,
            });
        }

        let local_term = self.log.term_at(args.prev_log_index).unwrap_or(0);
        if local_term != args.prev_log_term {
            return Ok(AppendEntriesReply {
                term: self.current_term,
                success: false,
                conflict_index: self.log.first_index_of_term(args.prev_log_index),
                conflict_term: Some(local_term),
            });
        }

        let base = args.prev_log_index + 1;
        let last_new_index = args.prev_log_index + args.entries.len() as u64;

        // Find the first supplied entry we do not already hold.
        let first_new = args.entries.iter().enumerate().find_map(|(offset, entry)| {
            match self.log.term_at(base + offset as u64) {
                Some(term) if term == entry.term => None,
                _ => Some(offset),
            }
        });

        if let Some(offset) = first_new {
            let index = base + offset as u64;
            let mut displaced = Vec::new();
            if index <= self.log.last_index() {
                if index <= self.commit_index {
                    panic!(
                        "node {} asked to overwrite committed entry {} (commit index {})",
                        self.id, index, self.commit_index
                    );
                }
                debug!("Node {} truncating conflicting suffix from index {}", self.id, index);
                displaced = self.log.entries_from(index, usize::MAX, usize::MAX);
                self.log.truncate_from(index)?;
            }
            self.log.extend(args.entries.into_iter().skip(offset));

            // An unpersisted suffix must not be acknowledged by a later call.
            if let Err(e) = self.persist() {
                self.log.truncate_from(index)?;
                self.log.extend(displaced);
                return Err(e);
            }
        }

        if args.leader_commit > self.commit_index {
            let new_commit = args.leader_commit.min(last_new_index);
            if new_commit > self.commit_index {
                debug!(
                    "Node {} advancing commit index {} -> {}",
                    self.id, self.commit_index, new_commit
                );
                self.commit_index = new_commit;
            }
        }

        Ok(AppendEntriesReply {
            term: self.current_term,
            success: true,
            conflict_index: 0,
            conflict_term: None,
        })
    }

    // ---- replication (leader only) ----

    /// Builds the next AppendEntries for `peer`; `None` unless leader.
    pub fn append_entries_args(&self, peer: NodeId) -> Option<AppendEntriesArgs> {
        let RoleState::Leader(leader) = &self.role else {
            return None;
        };

        let next = leader
            .next_index
            .get(peer)
            .copied()?
            .clamp(1, self.log.last_index() + 1);
        let prev_log_index = next - 1;

        Some(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self.log.entries_from(next, MAX_BATCH_ENTRIES, MAX_BATCH_BYTES),
            leader_commit: self.commit_index,
        })
    }

    /// Applies an AppendEntries reply from `peer` to the request that was
    /// sent in `request_term` with the given `prev_log_index` and number of
    /// entries.
    pub fn handle_append_reply(
        &mut self,
        peer: NodeId,
        request_term: u64,
        prev_log_index: u64,
        sent: u64,
        reply: &AppendEntriesReply,
    ) -> Result<(), RaftError> {
        if reply.term > self.current_term {
            self.step_down(reply.term);
            self.persist()?;
            self.reset_election_timer();
            return Ok(());
        }

        if request_term != self.current_term {
            return Ok(());
        }

        let RoleState::Leader(leader) = &mut self.role else {
            return Ok(());
        };
        if peer >= leader.next_index.len() {
            return Ok(());
        }

        if reply.success {
            let matched = prev_log_index + sent;
            if matched > leader.match_index[peer] {
                leader.match_index[peer] = matched;
            }
            leader.next_index[peer] = leader.match_index[peer] + 1;
            self.update_commit_index();
        } else {
            // Fast backup: skip the whole conflicting term in one round trip.
            let next = match reply.conflict_term {
                Some(term) => self
                    .log
                    .last_index_of_term(term)
                    .map(|index| index + 1)
                    .unwrap_or(reply.conflict_index),
                None => reply.conflict_index,
            };
            leader.next_index[peer] = next.max(1);
            debug!(
                "Node {} backing up next index for {} to {}",
                self.id, peer, leader.next_index[peer]
            );
        }

        Ok(())
    }

    /// Commits the highest index replicated on a majority whose entry is from
    /// the current term. Prior-term entries commit only underneath it.
    fn update_commit_index(&mut self) {
        let RoleState::Leader(leader) = &self.role else {
            return;
        };

        let mut new_commit = self.commit_index;
        for n in ((self.commit_index + 1)..=self.log.last_index()).rev() {
            let term = self.log.term_at(n).unwrap_or(0);
            if term < self.current_term {
                // Terms never increase going backwards.
                break;
            }
            if term != self.current_term {
                continue;
            }

            let replicated = 1 + (0..self.cluster_size())
                .filter(|&p| p != self.id && leader.match_index[p] >= n)
                .count();
            if self.has_majority(replicated) {
                new_commit = n;
                break;
            }
        }

        if new_commit > self.commit_index {
            debug!(
                "Leader {} advancing commit index {} -> {}",
                self.id, self.commit_index, new_commit
            );
            self.commit_index = new_commit;
        }
    }

    // ---- client commands ----

    pub fn start(&mut self, command: Vec<u8>) -> Result<StartOutcome, RaftError> {
        if !self.is_leader() {
            return Ok(StartOutcome {
                index: 0,
                term: self.current_term,
                is_leader: false,
            });
        }

        let index = self.log.append(LogEntry::new(self.current_term, command));
        if let Err(e) = self.persist() {
            self.log.truncate_from(index)?;
            return Err(e);
        }

        // Lets a single-server cluster commit on its own log.
        self.update_commit_index();

        Ok(StartOutcome {
            index,
            term: self.current_term,
            is_leader: true,
        })
    }

    // ---- apply pipeline ----

    pub fn has_unapplied(&self) -> bool {
        self.last_applied < self.commit_index
    }

    /// Committed entries not yet handed to the caller, in index order.
    pub fn unapplied_entries(&self) -> Vec<(u64, LogEntry)> {
        self.log.entries_between(self.last_applied, self.commit_index)
    }

    pub fn mark_applied(&mut self, index: u64) {
        if index != self.last_applied + 1 || index > self.commit_index {
            panic!(
                "node {} applied index {} out of order (last applied {}, commit {})",
                self.id, index, self.last_applied, self.commit_index
            );
        }
        self.last_applied = index;
    }
}
