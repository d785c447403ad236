pub mod client;
pub mod codec;
pub mod error;
pub mod local;
pub mod server;

pub use client::TcpTransport;
pub use codec::{RpcRequest, RpcResponse, MAX_FRAME_SIZE};
pub use error::NetworkError;
pub use local::LocalNetwork;
pub use server::RaftServer;
