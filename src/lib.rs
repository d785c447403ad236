// Consensus engine
pub mod raft;

// Transports
pub mod network;

// Replicated key-value service
pub mod kv;

// Public exports
pub use raft::{ApplyMsg, Raft, RaftConfig, RaftError};
