use thiserror::Error;

use crate::raft::NodeId;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout error")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    /// The peer received the request but its handler failed.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Peer {0} is unreachable")]
    Unreachable(NodeId),
}
