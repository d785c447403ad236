use thiserror::Error;

use crate::raft::RaftError;

#[derive(Error, Debug)]
pub enum KvError {
    /// This server is not the leader, or lost leadership before the request
    /// committed. The caller should try another server.
    #[error("Wrong leader")]
    WrongLeader,

    #[error("Timed out waiting for the operation to apply")]
    Timeout,

    #[error("Raft error: {0}")]
    Raft(#[from] RaftError),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("A clerk needs at least one server")]
    NoServers,
}
