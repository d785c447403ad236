use async_trait::async_trait;
use log::debug;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::codec::{self, RpcRequest, RpcResponse};
use super::NetworkError;
use crate::raft::{
    AppendEntriesArgs, AppendEntriesReply, NodeId, RaftConfig, RequestVoteArgs,
    RequestVoteReply, Transport,
};

/// [`Transport`] over TCP. Keeps at most one connection per peer, opened on
/// first use and dropped after any failure.
pub struct TcpTransport {
    peers: Vec<String>,
    rpc_timeout: Duration,
    connections: Vec<Mutex<Option<TcpStream>>>,
}

impl TcpTransport {
    pub fn new(peers: Vec<String>, rpc_timeout: Duration) -> Self {
        let connections = peers.iter().map(|_| Mutex::new(None)).collect();
        Self {
            peers,
            rpc_timeout,
            connections,
        }
    }

    pub fn from_config(config: &RaftConfig) -> Self {
        Self::new(config.peers.clone(), config.rpc_timeout())
    }

    async fn connect(address: &str) -> Result<TcpStream, NetworkError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| NetworkError::Connection(format!("{address}: {e}")))?;
        stream.set_nodelay(true)?;
        debug!("Connected to peer at {}", address);
        Ok(stream)
    }

    async fn call(&self, to: NodeId, request: RpcRequest) -> Result<RpcResponse, NetworkError> {
        let (Some(address), Some(slot)) = (self.peers.get(to), self.connections.get(to)) else {
            return Err(NetworkError::Unreachable(to));
        };

        let exchange = async {
            let mut slot = slot.lock().await;
            // Taken out so that a failed or cancelled exchange never leaves a
            // half-read stream behind.
            let mut stream = match slot.take() {
                Some(stream) => stream,
                None => Self::connect(address).await?,
            };

            codec::send_message(&mut stream, &request).await?;
            let response = codec::recv_message(&mut stream).await?.ok_or_else(|| {
                NetworkError::Connection(format!("{address} closed the connection"))
            })?;

            *slot = Some(stream);
            Ok::<RpcResponse, NetworkError>(response)
        };

        match timeout(self.rpc_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request_vote(
        &self,
        to: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, NetworkError> {
        match self.call(to, RpcRequest::RequestVote(args)).await? {
            RpcResponse::RequestVote(reply) => Ok(reply),
            RpcResponse::Error(message) => Err(NetworkError::Remote(message)),
            other => Err(NetworkError::Codec(format!(
                "unexpected response to RequestVote: {other:?}"
            ))),
        }
    }

    async fn append_entries(
        &self,
        to: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, NetworkError> {
        match self.call(to, RpcRequest::AppendEntries(args)).await? {
            RpcResponse::AppendEntries(reply) => Ok(reply),
            RpcResponse::Error(message) => Err(NetworkError::Remote(message)),
            other => Err(NetworkError::Codec(format!(
                "unexpected response to AppendEntries: {other:?}"
            ))),
        }
    }
}
