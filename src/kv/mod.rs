//! Linearizable key-value service replicated through [`crate::raft`].
//!
//! A [`KvServer`] proposes each client [`Op`] to its Raft server and answers
//! once the entry comes back on the apply channel. Every replica applies the
//! same ops in the same order, suppressing retransmitted requests by
//! `(client_id, request_id)`. A [`Clerk`] finds the leader by rotation.

mod client;
mod error;
mod op;
mod server;

pub use client::Clerk;
pub use error::KvError;
pub use op::{Op, OpKind};
pub use server::{KvServer, KvStore, APPLY_TIMEOUT};
