//! Peer RPC contracts and the seams through which they travel.
//!
//! [`Transport`] is the outbound side used by the engine's election and
//! replication tasks; [`RaftService`] is the inbound side a transport server
//! dispatches into. Both are implemented over TCP in `crate::network` and
//! in-process by `crate::network::LocalNetwork`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{LogEntry, NodeId, RaftError};
use crate::network::NetworkError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// Where the leader should resume when `success` is false: the
    /// follower's log length, or the first index of `conflict_term`.
    pub conflict_index: u64,
    /// Term of the follower's entry at `prev_log_index`, if it had one that
    /// did not match.
    pub conflict_term: Option<u64>,
}

impl AppendEntriesReply {
    pub(crate) fn rejected(term: u64) -> Self {
        Self {
            term,
            success: false,
            conflict_index: 0,
            conflict_term: None,
        }
    }
}

/// Outbound RPCs to a peer. A failed call is a soft failure: the engine logs
/// it and relies on the next heartbeat or election to retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(
        &self,
        to: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, NetworkError>;

    async fn append_entries(
        &self,
        to: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, NetworkError>;
}

/// Inbound RPC handlers.
#[async_trait]
pub trait RaftService: Send + Sync {
    async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply, RaftError>;

    async fn append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError>;
}
