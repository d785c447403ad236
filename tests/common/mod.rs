//! In-process cluster harness shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use replog::network::LocalNetwork;
use replog::raft::{ApplyMsg, MemoryPersister, Raft, RaftConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// Upper bound of the election timeout used by every test cluster.
pub const ELECTION_TIMEOUT: Duration = Duration::from_millis(300);

/// Applied commands observed on every server, checked as they arrive.
#[derive(Default)]
struct Applied {
    logs: Vec<HashMap<u64, Vec<u8>>>,
    last: Vec<u64>,
    error: Option<String>,
}

pub struct Cluster {
    pub net: LocalNetwork,
    pub size: usize,
    rafts: Vec<Option<Raft>>,
    persisters: Vec<Arc<MemoryPersister>>,
    appliers: Vec<Option<JoinHandle<()>>>,
    applied: Arc<Mutex<Applied>>,
    next_start: usize,
}

impl Cluster {
    pub fn new(size: usize) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut cluster = Self {
            net: LocalNetwork::new(),
            size,
            rafts: (0..size).map(|_| None).collect(),
            persisters: (0..size).map(|_| Arc::new(MemoryPersister::new())).collect(),
            appliers: (0..size).map(|_| None).collect(),
            applied: Arc::new(Mutex::new(Applied {
                logs: vec![HashMap::new(); size],
                last: vec![0; size],
                error: None,
            })),
            next_start: 0,
        };
        for i in 0..size {
            cluster.start(i);
        }
        cluster
    }

    pub fn raft(&self, i: usize) -> &Raft {
        self.rafts[i].as_ref().expect("server is running")
    }

    pub fn persister(&self, i: usize) -> &MemoryPersister {
        &self.persisters[i]
    }

    /// Starts (or restarts) server `i` from whatever its persister holds.
    pub fn start(&mut self, i: usize) {
        self.crash(i);

        let (tx, mut rx) = mpsc::channel(64);
        let raft = Raft::new(
            RaftConfig::local(i, self.size),
            self.net.transport(i),
            self.persisters[i].clone(),
            tx,
        )
        .expect("create raft");

        {
            let mut applied = self.applied.lock().unwrap();
            applied.logs[i].clear();
            applied.last[i] = 0;
        }

        let applied = Arc::clone(&self.applied);
        self.appliers[i] = Some(tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let ApplyMsg::Command { index, command, .. } = msg;
                let mut guard = applied.lock().unwrap();
                let state = &mut *guard;

                for (j, log) in state.logs.iter().enumerate() {
                    if let Some(other) = log.get(&index) {
                        if *other != command && state.error.is_none() {
                            state.error = Some(format!(
                                "commit index={index} server={i} {command:?} != server={j} {other:?}"
                            ));
                        }
                    }
                }
                if index != state.last[i] + 1 && state.error.is_none() {
                    state.error = Some(format!(
                        "server {i} applied {index} after {}",
                        state.last[i]
                    ));
                }
                state.last[i] = index;
                state.logs[i].insert(index, command);
            }
        }));

        self.net.register(i, Arc::new(raft.clone()));
        raft.start().expect("start raft");
        self.rafts[i] = Some(raft);
    }

    /// Kills server `i`, keeping a copy of its persisted state for a later
    /// restart.
    pub fn crash(&mut self, i: usize) {
        self.net.unregister(i);
        if let Some(raft) = self.rafts[i].take() {
            raft.kill();
        }
        if let Some(applier) = self.appliers[i].take() {
            applier.abort();
        }
        // The dead instance can never touch the copy the next one uses.
        self.persisters[i] = Arc::new(self.persisters[i].snapshot_copy());
    }

    pub fn disconnect(&self, i: usize) {
        self.net.disconnect(i);
    }

    pub fn connect(&self, i: usize) {
        self.net.connect(i);
    }

    fn is_live(&self, i: usize) -> bool {
        self.rafts[i].is_some() && self.net.is_connected(i)
    }

    pub fn check_errors(&self) {
        if let Some(err) = &self.applied.lock().unwrap().error {
            panic!("apply check failed: {err}");
        }
    }

    /// Waits for exactly one leader in the newest term among connected
    /// servers and returns it.
    pub async fn check_one_leader(&self) -> usize {
        for _ in 0..10 {
            sleep(Duration::from_millis(450 + rand::random_range(0..100))).await;

            let mut leaders: HashMap<u64, Vec<usize>> = HashMap::new();
            for i in (0..self.size).filter(|&i| self.is_live(i)) {
                let (term, is_leader) = self.raft(i).get_state();
                if is_leader {
                    leaders.entry(term).or_default().push(i);
                }
            }

            for (term, ids) in &leaders {
                assert!(ids.len() <= 1, "term {term} has {} leaders: {ids:?}", ids.len());
            }
            if let Some(term) = leaders.keys().max() {
                return leaders[term][0];
            }
        }
        panic!("expected one leader, got none");
    }

    pub fn check_no_leader(&self) {
        for i in (0..self.size).filter(|&i| self.is_live(i)) {
            let (_, is_leader) = self.raft(i).get_state();
            assert!(!is_leader, "expected no leader, but {i} claims to be leader");
        }
    }

    /// Asserts every connected server agrees on the term and returns it.
    pub fn check_terms(&self) -> u64 {
        let mut term = None;
        for i in (0..self.size).filter(|&i| self.is_live(i)) {
            let (t, _) = self.raft(i).get_state();
            match term {
                None => term = Some(t),
                Some(seen) => assert_eq!(seen, t, "servers disagree on term"),
            }
        }
        term.expect("at least one connected server")
    }

    /// How many servers have applied `index`, and the command there.
    pub fn n_committed(&self, index: u64) -> (usize, Option<Vec<u8>>) {
        self.check_errors();
        let applied = self.applied.lock().unwrap();
        let mut count = 0;
        let mut cmd: Option<Vec<u8>> = None;
        for log in &applied.logs {
            if let Some(c) = log.get(&index) {
                if let Some(prev) = &cmd {
                    assert_eq!(prev, c, "committed values do not match at index {index}");
                }
                count += 1;
                cmd = Some(c.clone());
            }
        }
        (count, cmd)
    }

    /// Waits for at least `n` servers to apply `index`.
    pub async fn wait(&self, index: u64, n: usize) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let (count, cmd) = self.n_committed(index);
            if count >= n {
                return cmd.expect("committed command");
            }
            assert!(
                Instant::now() < deadline,
                "only {count} of {n} servers applied index {index}"
            );
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Submits `cmd` through whichever server is leader and waits until
    /// `expected` servers have applied it. With `retry`, re-submits if the
    /// first leader fails to commit it.
    pub async fn one(&mut self, cmd: &[u8], expected: usize, retry: bool) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            let mut index = None;
            for _ in 0..self.size {
                self.next_start = (self.next_start + 1) % self.size;
                let i = self.next_start;
                if !self.is_live(i) {
                    continue;
                }
                if let Ok(outcome) = self.raft(i).start_command(cmd.to_vec()) {
                    if outcome.is_leader {
                        index = Some(outcome.index);
                        break;
                    }
                }
            }

            if let Some(index) = index {
                let submitted = Instant::now();
                while submitted.elapsed() < Duration::from_secs(2) {
                    let (count, applied) = self.n_committed(index);
                    if count >= expected && applied.as_deref() == Some(cmd) {
                        return index;
                    }
                    sleep(Duration::from_millis(20)).await;
                }
                assert!(retry, "one({cmd:?}) failed to reach agreement");
            } else {
                sleep(Duration::from_millis(50)).await;
            }
        }
        panic!("one({cmd:?}) failed to reach agreement");
    }

    pub fn shutdown(&mut self) {
        for i in 0..self.size {
            self.crash(i);
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for raft in self.rafts.iter().flatten() {
            raft.kill();
        }
        for applier in self.appliers.iter().flatten() {
            applier.abort();
        }
    }
}

pub fn cmd(n: u64) -> Vec<u8> {
    format!("cmd-{n}").into_bytes()
}
