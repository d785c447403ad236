use async_trait::async_trait;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::NetworkError;
use crate::raft::{
    AppendEntriesArgs, AppendEntriesReply, NodeId, RaftService, RequestVoteArgs,
    RequestVoteReply, Transport,
};

#[derive(Default)]
struct Inner {
    services: HashMap<NodeId, Arc<dyn RaftService>>,
    disconnected: HashSet<NodeId>,
    /// Partition group per node. Nodes in different groups cannot talk.
    groups: HashMap<NodeId, usize>,
}

impl Inner {
    fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        if self.disconnected.contains(&from) || self.disconnected.contains(&to) {
            return false;
        }
        self.groups.get(&from) == self.groups.get(&to)
    }
}

/// In-process network for running whole clusters inside one runtime.
///
/// Calls are delivered straight to the registered [`RaftService`]. A node
/// that is disconnected, or split from the caller by a partition, neither
/// receives requests nor returns replies.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<Inner>>,
    rpc_count: Arc<AtomicU64>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Routes calls addressed to `id` to `service`, replacing any previous
    /// registration (a restarted server).
    pub fn register(&self, id: NodeId, service: Arc<dyn RaftService>) {
        self.state().services.insert(id, service);
    }

    pub fn unregister(&self, id: NodeId) {
        self.state().services.remove(&id);
    }

    pub fn disconnect(&self, id: NodeId) {
        debug!("LocalNetwork: disconnecting node {}", id);
        self.state().disconnected.insert(id);
    }

    pub fn connect(&self, id: NodeId) {
        debug!("LocalNetwork: connecting node {}", id);
        self.state().disconnected.remove(&id);
    }

    pub fn is_connected(&self, id: NodeId) -> bool {
        !self.state().disconnected.contains(&id)
    }

    /// Splits the cluster into the given groups. Nodes not listed share an
    /// implicit group of their own.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut state = self.state();
        state.groups.clear();
        for (group, members) in groups.iter().enumerate() {
            for &id in members.iter() {
                state.groups.insert(id, group + 1);
            }
        }
        debug!("LocalNetwork: partitioned into {:?}", groups);
    }

    /// Removes every partition. Disconnected nodes stay disconnected.
    pub fn heal(&self) {
        self.state().groups.clear();
    }

    /// Total RPCs attempted through this network.
    pub fn rpc_count(&self) -> u64 {
        self.rpc_count.load(Ordering::Relaxed)
    }

    /// A transport whose calls originate from `from`.
    pub fn transport(&self, from: NodeId) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            from,
            network: self.clone(),
        })
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<Arc<dyn RaftService>, NetworkError> {
        self.rpc_count.fetch_add(1, Ordering::Relaxed);
        let state = self.state();
        if !state.reachable(from, to) {
            return Err(NetworkError::Unreachable(to));
        }
        state
            .services
            .get(&to)
            .cloned()
            .ok_or(NetworkError::Unreachable(to))
    }

    /// Replies are dropped if the link went down while the call was running.
    fn deliver<T>(&self, from: NodeId, to: NodeId, reply: T) -> Result<T, NetworkError> {
        if self.state().reachable(from, to) {
            Ok(reply)
        } else {
            Err(NetworkError::Unreachable(to))
        }
    }
}

struct LocalTransport {
    from: NodeId,
    network: LocalNetwork,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        to: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, NetworkError> {
        let service = self.network.route(self.from, to)?;
        let reply = service
            .request_vote(args)
            .await
            .map_err(|e| NetworkError::Remote(e.to_string()))?;
        self.network.deliver(self.from, to, reply)
    }

    async fn append_entries(
        &self,
        to: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, NetworkError> {
        let service = self.network.route(self.from, to)?;
        let reply = service
            .append_entries(args)
            .await
            .map_err(|e| NetworkError::Remote(e.to_string()))?;
        self.network.deliver(self.from, to, reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::RaftError;

    struct Echo;

    #[async_trait]
    impl RaftService for Echo {
        async fn request_vote(
            &self,
            args: RequestVoteArgs,
        ) -> Result<RequestVoteReply, RaftError> {
            Ok(RequestVoteReply {
                term: args.term,
                vote_granted: true,
            })
        }

        async fn append_entries(
            &self,
            args: AppendEntriesArgs,
        ) -> Result<AppendEntriesReply, RaftError> {
            Ok(AppendEntriesReply {
                term: args.term,
                success: true,
                conflict_index: 0,
                conflict_term: None,
            })
        }
    }

    fn vote(term: u64) -> RequestVoteArgs {
        RequestVoteArgs {
            term,
            candidate_id: 0,
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    fn network(size: usize) -> LocalNetwork {
        let net = LocalNetwork::new();
        for id in 0..size {
            net.register(id, Arc::new(Echo));
        }
        net
    }

    #[tokio::test]
    async fn connected_nodes_can_call_each_other() {
        let net = network(3);
        let reply = net.transport(0).request_vote(2, vote(4)).await.expect("vote");
        assert_eq!(reply.term, 4);
        assert_eq!(net.rpc_count(), 1);
    }

    #[tokio::test]
    async fn disconnect_cuts_both_directions() {
        let net = network(3);
        net.disconnect(1);

        assert!(net.transport(0).request_vote(1, vote(1)).await.is_err());
        assert!(net.transport(1).request_vote(0, vote(1)).await.is_err());
        assert!(net.transport(0).request_vote(2, vote(1)).await.is_ok());

        net.connect(1);
        assert!(net.transport(0).request_vote(1, vote(1)).await.is_ok());
    }

    #[tokio::test]
    async fn partitions_isolate_groups_until_healed() {
        let net = network(5);
        net.partition(&[&[0, 1], &[2, 3, 4]]);

        assert!(net.transport(0).request_vote(1, vote(1)).await.is_ok());
        assert!(net.transport(2).request_vote(4, vote(1)).await.is_ok());
        assert!(matches!(
            net.transport(1).request_vote(3, vote(1)).await,
            Err(NetworkError::Unreachable(3))
        ));

        net.heal();
        assert!(net.transport(1).request_vote(3, vote(1)).await.is_ok());
    }

    #[tokio::test]
    async fn unregistered_node_is_unreachable() {
        let net = network(2);
        net.unregister(1);
        assert!(matches!(
            net.transport(0).request_vote(1, vote(1)).await,
            Err(NetworkError::Unreachable(1))
        ));
    }
}
