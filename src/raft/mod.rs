mod config;
mod error;
mod log;
mod node;
mod persister;
mod rpc;
mod state;

pub use self::config::RaftConfig;
pub use self::error::RaftError;
pub use self::log::{Log, LogEntry};
pub use self::node::RaftNode;
pub use self::persister::{FilePersister, MemoryPersister, PersistentState, Persister};
#[cfg(test)]
pub(crate) use self::persister::FailingPersister;
pub use self::rpc::{
    AppendEntriesArgs, AppendEntriesReply, RaftService, RequestVoteArgs, RequestVoteReply,
    Transport,
};
pub use self::state::{ApplyMsg, NodeRole, NodeState, StartOutcome};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
// Use external log crate, not our own log module
use ::log::{debug, error, info, warn};

/// Position of a server in the shared peer list.
pub type NodeId = usize;

struct Shared {
    me: NodeId,
    node: Mutex<RaftNode>,
    transport: Arc<dyn Transport>,
    apply_tx: mpsc::Sender<ApplyMsg>,
    /// Wakes the ticker when its deadline may have moved.
    timer_notify: Notify,
    /// Wakes the applier when `commit_index` has advanced.
    apply_notify: Notify,
    killed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one Raft server. Clones share the same server.
///
/// All protocol state lives in a [`RaftNode`] behind one lock. That lock is
/// never held across an `.await`: outbound RPCs run in their own tasks and
/// re-acquire it only to apply the reply.
#[derive(Clone)]
pub struct Raft {
    shared: Arc<Shared>,
}

impl Raft {
    /// Rehydrates a server from `persister`. Nothing runs until
    /// [`Raft::start`] is called.
    pub fn new(
        config: RaftConfig,
        transport: Arc<dyn Transport>,
        persister: Arc<dyn Persister>,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Result<Self, RaftError> {
        let me = config.me;
        let node = RaftNode::new(config, persister)?;
        info!(
            "Node {} created in term {} ({} servers)",
            me,
            node.current_term(),
            node.cluster_size()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                me,
                node: Mutex::new(node),
                transport,
                apply_tx,
                timer_notify: Notify::new(),
                apply_notify: Notify::new(),
                killed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Spawns the ticker and the applier. Must be called from within a
    /// Tokio runtime.
    pub fn start(&self) -> Result<(), RaftError> {
        if self.killed() {
            return Err(RaftError::Killed);
        }

        let mut tasks = self
            .shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return Ok(());
        }

        let ticker = self.clone();
        tasks.push(tokio::spawn(async move { ticker.run_ticker().await }));

        let applier = self.clone();
        tasks.push(tokio::spawn(async move { applier.run_applier().await }));

        info!("Node {} started", self.shared.me);
        Ok(())
    }

    pub fn me(&self) -> NodeId {
        self.shared.me
    }

    /// Submits a command for replication. Returns immediately; a leader
    /// outcome says where the command will land if it commits, not that it
    /// will.
    pub fn start_command(&self, command: Vec<u8>) -> Result<StartOutcome, RaftError> {
        let mut node = self.lock_live()?;
        let outcome = node.start(command)?;

        if outcome.is_leader {
            debug!(
                "Leader {} accepted command at index {} in term {}",
                self.shared.me, outcome.index, outcome.term
            );
            // Replicate now instead of waiting out the heartbeat interval.
            node.trigger_replication();
            self.shared.timer_notify.notify_one();
            if node.has_unapplied() {
                self.shared.apply_notify.notify_one();
            }
        }

        Ok(outcome)
    }

    /// Current term and whether this server believes it is the leader.
    pub fn get_state(&self) -> (u64, bool) {
        let node = self.lock();
        (node.current_term(), node.is_leader())
    }

    pub fn status(&self) -> NodeState {
        self.lock().status()
    }

    /// Stops the ticker and applier and makes every later call fail with
    /// [`RaftError::Killed`]. RPCs already in flight finish but their replies
    /// are ignored.
    pub fn kill(&self) {
        {
            // Taking the lock orders the flag after any in-progress handler.
            let _node = self.lock();
            self.shared.killed.store(true, Ordering::SeqCst);
        }

        let tasks: Vec<_> = self
            .shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        info!("Node {} killed", self.shared.me);
    }

    pub fn killed(&self) -> bool {
        self.shared.killed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, RaftNode> {
        self.shared
            .node
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the node unless the server has been killed.
    fn lock_live(&self) -> Result<MutexGuard<'_, RaftNode>, RaftError> {
        let node = self.lock();
        if self.killed() {
            return Err(RaftError::Killed);
        }
        Ok(node)
    }

    // ---- inbound RPCs ----

    fn on_request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply, RaftError> {
        let mut node = self.lock_live()?;
        node.handle_request_vote(&args)
    }

    fn on_append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError> {
        let mut node = self.lock_live()?;
        let reply = node.handle_append_entries(args)?;
        if node.has_unapplied() {
            self.shared.apply_notify.notify_one();
        }
        Ok(reply)
    }

    // ---- ticker ----

    async fn run_ticker(self) {
        loop {
            let deadline = match self.lock_live() {
                Ok(node) => node.next_deadline(),
                Err(_) => break,
            };

            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = self.shared.timer_notify.notified() => {}
            }

            self.tick(Instant::now());
        }
        debug!("Node {} ticker stopped", self.shared.me);
    }

    fn tick(&self, now: Instant) {
        let Ok(mut node) = self.lock_live() else {
            return;
        };

        if node.election_timeout_elapsed(now) {
            match node.start_election() {
                Ok(args) => {
                    let won = node.is_leader();
                    drop(node);
                    self.broadcast_request_vote(args);
                    if won {
                        self.broadcast_append_entries();
                    }
                }
                Err(e) => error!("Node {} failed to start election: {}", self.shared.me, e),
            }
        } else if node.heartbeat_due(now) {
            node.reset_heartbeat_timer();
            drop(node);
            self.broadcast_append_entries();
        }
    }

    // ---- elections ----

    fn broadcast_request_vote(&self, args: RequestVoteArgs) {
        let peers = self.lock().peers();
        for peer in peers {
            let raft = self.clone();
            let args = args.clone();
            tokio::spawn(async move {
                let term = args.term;
                match raft.shared.transport.request_vote(peer, args).await {
                    Ok(reply) => raft.on_vote_reply(peer, term, reply),
                    Err(e) => debug!(
                        "Node {} RequestVote to {} failed: {}",
                        raft.shared.me, peer, e
                    ),
                }
            });
        }
    }

    fn on_vote_reply(&self, peer: NodeId, term: u64, reply: RequestVoteReply) {
        let Ok(mut node) = self.lock_live() else {
            return;
        };

        match node.handle_vote_reply(peer, term, &reply) {
            Ok(true) => {
                drop(node);
                self.shared.timer_notify.notify_one();
                self.broadcast_append_entries();
            }
            Ok(false) => {}
            Err(e) => error!(
                "Node {} failed to handle vote reply from {}: {}",
                self.shared.me, peer, e
            ),
        }
    }

    // ---- replication ----

    fn broadcast_append_entries(&self) {
        let requests: Vec<(NodeId, AppendEntriesArgs)> = {
            let node = self.lock();
            if !node.is_leader() {
                return;
            }
            node.peers()
                .into_iter()
                .filter_map(|peer| node.append_entries_args(peer).map(|args| (peer, args)))
                .collect()
        };

        for (peer, args) in requests {
            self.replicate_to(peer, args);
        }
    }

    fn replicate_to(&self, peer: NodeId, args: AppendEntriesArgs) {
        let raft = self.clone();
        tokio::spawn(async move {
            let term = args.term;
            let prev_log_index = args.prev_log_index;
            let sent = args.entries.len() as u64;

            match raft.shared.transport.append_entries(peer, args).await {
                Ok(reply) => raft.on_append_reply(peer, term, prev_log_index, sent, reply),
                Err(e) => debug!(
                    "Node {} AppendEntries to {} failed: {}",
                    raft.shared.me, peer, e
                ),
            }
        });
    }

    fn on_append_reply(
        &self,
        peer: NodeId,
        term: u64,
        prev_log_index: u64,
        sent: u64,
        reply: AppendEntriesReply,
    ) {
        let Ok(mut node) = self.lock_live() else {
            return;
        };

        if let Err(e) = node.handle_append_reply(peer, term, prev_log_index, sent, &reply) {
            error!(
                "Node {} failed to handle append reply from {}: {}",
                self.shared.me, peer, e
            );
            return;
        }
        if node.has_unapplied() {
            self.shared.apply_notify.notify_one();
        }
    }

    // ---- apply pipeline ----

    /// Delivers committed entries in index order. `last_applied` advances only
    /// after the consumer has accepted the message, so a slow consumer slows
    /// the applier and nothing else.
    async fn run_applier(self) {
        loop {
            self.shared.apply_notify.notified().await;

            loop {
                let batch = match self.lock_live() {
                    Ok(node) => node.unapplied_entries(),
                    Err(_) => return,
                };
                if batch.is_empty() {
                    break;
                }

                for (index, entry) in batch {
                    let msg = ApplyMsg::Command {
                        index,
                        term: entry.term,
                        command: entry.command,
                    };
                    if self.shared.apply_tx.send(msg).await.is_err() {
                        warn!(
                            "Node {} apply channel closed; stopping applier",
                            self.shared.me
                        );
                        return;
                    }

                    match self.lock_live() {
                        Ok(mut node) => node.mark_applied(index),
                        Err(_) => return,
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RaftService for Raft {
    async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply, RaftError> {
        self.on_request_vote(args)
    }

    async fn append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError> {
        self.on_append_entries(args)
    }
}
