use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use super::codec::{self, RpcRequest, RpcResponse};
use super::NetworkError;
use crate::raft::RaftService;

/// Accepts peer connections and dispatches each request frame to the local
/// server. One task per connection; requests on a connection are answered in
/// order.
pub struct RaftServer {
    service: Arc<dyn RaftService>,
}

impl RaftServer {
    pub fn new(service: Arc<dyn RaftService>) -> Self {
        Self { service }
    }

    pub async fn bind(address: &str) -> Result<TcpListener, NetworkError> {
        TcpListener::bind(address)
            .await
            .map_err(|e| NetworkError::Connection(format!("bind {address}: {e}")))
    }

    /// Runs the accept loop until the listener fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), NetworkError> {
        let local = listener.local_addr()?;
        info!("Raft RPC server listening on {}", local);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY for {}: {}", peer_addr, e);
            }

            let service = Arc::clone(&self.service);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(service, stream, peer_addr).await {
                    warn!("Error handling connection from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    service: Arc<dyn RaftService>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<(), NetworkError> {
    loop {
        let Some(payload) = codec::read_frame(&mut stream).await? else {
            debug!("Connection from {} closed", peer_addr);
            return Ok(());
        };

        let response = match codec::decode::<RpcRequest>(&payload) {
            Ok(request) => dispatch(service.as_ref(), request).await,
            Err(e) => {
                warn!("Malformed request from {}: {}", peer_addr, e);
                RpcResponse::Error(e.to_string())
            }
        };

        codec::send_message(&mut stream, &response).await?;
    }
}

async fn dispatch(service: &dyn RaftService, request: RpcRequest) -> RpcResponse {
    match request {
        RpcRequest::RequestVote(args) => {
            debug!("Received RequestVote: {:?}", args);
            match service.request_vote(args).await {
                Ok(reply) => RpcResponse::RequestVote(reply),
                Err(e) => RpcResponse::Error(e.to_string()),
            }
        }
        RpcRequest::AppendEntries(args) => {
            debug!(
                "Received AppendEntries: term={}, leader={}, entries={}",
                args.term,
                args.leader_id,
                args.entries.len()
            );
            match service.append_entries(args).await {
                Ok(reply) => RpcResponse::AppendEntries(reply),
                Err(e) => RpcResponse::Error(e.to_string()),
            }
        }
    }
}
