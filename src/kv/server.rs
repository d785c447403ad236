use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{KvError, Op, OpKind};
use crate::raft::{ApplyMsg, Raft};

/// How long a request waits for its log entry to apply.
pub const APPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// What the apply loop reports back to the request that proposed an entry.
#[derive(Debug)]
struct Applied {
    op: Op,
    value: String,
}

/// The replicated map plus its duplicate table.
#[derive(Debug, Default)]
pub struct KvStore {
    data: HashMap<String, String>,
    /// Highest request id applied per client.
    last_request: HashMap<u64, u64>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `op` at most once per `(client_id, request_id)` and returns the
    /// value a `Get` observes. Missing keys read as the empty string.
    pub fn apply(&mut self, op: &Op) -> String {
        let duplicate = self
            .last_request
            .get(&op.client_id)
            .is_some_and(|&last| op.request_id <= last);

        if !duplicate {
            match op.kind {
                OpKind::Put => {
                    self.data.insert(op.key.clone(), op.value.clone());
                }
                OpKind::Append => {
                    self.data
                        .entry(op.key.clone())
                        .or_default()
                        .push_str(&op.value);
                }
                OpKind::Get => {}
            }
            self.last_request.insert(op.client_id, op.request_id);
        }

        match op.kind {
            OpKind::Get => self.get(&op.key),
            OpKind::Put | OpKind::Append => String::new(),
        }
    }

    pub fn get(&self, key: &str) -> String {
        self.data.get(key).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

struct KvState {
    store: KvStore,
    /// Requests waiting on the entry at a log index.
    waiters: HashMap<u64, oneshot::Sender<Applied>>,
    last_applied_index: u64,
}

struct Inner {
    raft: Raft,
    state: Mutex<KvState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, KvState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Key-value state machine driven by a [`Raft`] server's apply channel.
#[derive(Clone)]
pub struct KvServer {
    inner: Arc<Inner>,
    apply_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl KvServer {
    /// Starts consuming `apply_rx`, which must be the receiver paired with the
    /// sender given to `raft`.
    pub fn new(raft: Raft, apply_rx: mpsc::Receiver<ApplyMsg>) -> Self {
        let inner = Arc::new(Inner {
            raft,
            state: Mutex::new(KvState {
                store: KvStore::new(),
                waiters: HashMap::new(),
                last_applied_index: 0,
            }),
        });

        let apply_task = tokio::spawn(run_apply_loop(Arc::clone(&inner), apply_rx));

        Self {
            inner,
            apply_task: Arc::new(Mutex::new(Some(apply_task))),
        }
    }

    pub fn raft(&self) -> &Raft {
        &self.inner.raft
    }

    pub async fn get(&self, key: &str, client_id: u64, request_id: u64) -> Result<String, KvError> {
        self.execute(Op::get(key, client_id, request_id)).await
    }

    pub async fn put(
        &self,
        key: &str,
        value: &str,
        client_id: u64,
        request_id: u64,
    ) -> Result<(), KvError> {
        self.execute(Op::put(key, value, client_id, request_id))
            .await
            .map(|_| ())
    }

    pub async fn append(
        &self,
        key: &str,
        value: &str,
        client_id: u64,
        request_id: u64,
    ) -> Result<(), KvError> {
        self.execute(Op::append(key, value, client_id, request_id))
            .await
            .map(|_| ())
    }

    /// Proposes `op` and waits for it to apply. Fails with
    /// [`KvError::WrongLeader`] if another entry lands at its index.
    pub async fn execute(&self, op: Op) -> Result<String, KvError> {
        let command = op.encode()?;

        let (index, applied_rx) = {
            // Held across start_command so the entry cannot apply before its
            // waiter is registered.
            let mut state = self.inner.state();
            let outcome = self.inner.raft.start_command(command)?;
            if !outcome.is_leader {
                return Err(KvError::WrongLeader);
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.insert(outcome.index, tx);
            (outcome.index, rx)
        };

        debug!(
            "KV {} waiting on index {} for {:?} {}",
            self.inner.raft.me(),
            index,
            op.kind,
            op.key
        );

        match timeout(APPLY_TIMEOUT, applied_rx).await {
            Ok(Ok(applied)) if applied.op.same_request(&op) => Ok(applied.value),
            // Another entry took the index, or our waiter was replaced.
            Ok(_) => Err(KvError::WrongLeader),
            Err(_) => {
                self.inner.state().waiters.retain(|_, tx| !tx.is_closed());
                Err(KvError::Timeout)
            }
        }
    }

    /// Value currently held for `key` on this replica, without consensus.
    pub fn local_get(&self, key: &str) -> String {
        self.inner.state().store.get(key)
    }

    pub fn last_applied_index(&self) -> u64 {
        self.inner.state().last_applied_index
    }

    pub fn kill(&self) {
        self.inner.raft.kill();
        if let Some(task) = self
            .apply_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

async fn run_apply_loop(inner: Arc<Inner>, mut apply_rx: mpsc::Receiver<ApplyMsg>) {
    while let Some(msg) = apply_rx.recv().await {
        match msg {
            ApplyMsg::Command { index, command, .. } => apply_command(&inner, index, &command),
        }
    }
    info!("KV {} apply channel closed", inner.raft.me());
}

fn apply_command(inner: &Inner, index: u64, command: &[u8]) {
    let mut state = inner.state();
    state.last_applied_index = index;

    let op = match Op::decode(command) {
        Ok(op) => op,
        Err(e) => {
            warn!("KV {} skipping undecodable entry {}: {}", inner.raft.me(), index, e);
            // Whoever waited here proposed something else.
            state.waiters.remove(&index);
            return;
        }
    };

    let value = state.store.apply(&op);
    if let Some(waiter) = state.waiters.remove(&index) {
        // The requester may have timed out already.
        let _ = waiter.send(Applied { op, value });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_overwrites_and_append_concatenates() {
        let mut store = KvStore::new();
        store.apply(&Op::append("k", "a", 1, 1));
        assert_eq!(store.get("k"), "a");

        store.apply(&Op::append("k", "b", 1, 2));
        assert_eq!(store.get("k"), "ab");

        store.apply(&Op::put("k", "fresh", 1, 3));
        assert_eq!(store.apply(&Op::get("k", 1, 4)), "fresh");
        assert_eq!(store.apply(&Op::get("missing", 1, 5)), "");
    }

    #[test]
    fn duplicate_requests_apply_once() {
        let mut store = KvStore::new();
        store.apply(&Op::append("k", "x", 9, 1));
        // Retransmitted after a lost reply.
        store.apply(&Op::append("k", "x", 9, 1));
        assert_eq!(store.get("k"), "x");

        // An older request id arriving late is also ignored.
        store.apply(&Op::append("k", "y", 9, 2));
        store.apply(&Op::put("k", "stale", 9, 1));
        assert_eq!(store.get("k"), "xy");

        // Other clients are tracked separately.
        store.apply(&Op::append("k", "z", 10, 1));
        assert_eq!(store.get("k"), "xyz");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn duplicate_get_still_reads_current_value() {
        let mut store = KvStore::new();
        store.apply(&Op::put("k", "v", 1, 1));
        assert_eq!(store.apply(&Op::get("k", 1, 1)), "v");
    }
}
