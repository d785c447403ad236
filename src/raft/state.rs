use serde::{Deserialize, Serialize};

use super::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// Point-in-time view of a server, as returned by `Raft::status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub id: NodeId,
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub role: NodeRole,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
}

/// One delivery on the apply channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// A committed log entry, delivered exactly once and in index order.
    Command {
        index: u64,
        term: u64,
        command: Vec<u8>,
    },
}

/// Result of submitting a command with `Raft::start_command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOutcome {
    /// Index the command will occupy if it is ever committed. Zero when this
    /// server is not the leader.
    pub index: u64,
    pub term: u64,
    pub is_leader: bool,
}
