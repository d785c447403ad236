use log::debug;
use std::time::Duration;
use tokio::time::sleep;

use super::{KvError, KvServer, Op};

/// Pause after every server has been tried once without success.
const ROTATION_BACKOFF: Duration = Duration::from_millis(100);

/// Client for a replicated [`KvServer`] group. Retries each request until
/// some leader applies it; duplicate suppression on the servers makes the
/// retries safe.
pub struct Clerk {
    servers: Vec<KvServer>,
    client_id: u64,
    request_id: u64,
    leader: usize,
}

impl Clerk {
    pub fn new(servers: Vec<KvServer>) -> Result<Self, KvError> {
        if servers.is_empty() {
            return Err(KvError::NoServers);
        }
        Ok(Self {
            servers,
            client_id: rand::random(),
            request_id: 0,
            leader: 0,
        })
    }

    /// Returns "" if the key does not exist.
    pub async fn get(&mut self, key: &str) -> String {
        let op = self.next_op(|client_id, request_id| Op::get(key, client_id, request_id));
        self.run(op).await
    }

    pub async fn put(&mut self, key: &str, value: &str) {
        let op = self.next_op(|client_id, request_id| Op::put(key, value, client_id, request_id));
        self.run(op).await;
    }

    pub async fn append(&mut self, key: &str, value: &str) {
        let op =
            self.next_op(|client_id, request_id| Op::append(key, value, client_id, request_id));
        self.run(op).await;
    }

    fn next_op(&mut self, build: impl FnOnce(u64, u64) -> Op) -> Op {
        self.request_id += 1;
        build(self.client_id, self.request_id)
    }

    async fn run(&mut self, op: Op) -> String {
        let mut attempts = 0usize;
        loop {
            match self.servers[self.leader].execute(op.clone()).await {
                Ok(value) => return value,
                Err(e) => {
                    debug!(
                        "Clerk {} request {} failed on server {}: {}",
                        self.client_id, op.request_id, self.leader, e
                    );
                }
            }

            self.leader = (self.leader + 1) % self.servers.len();
            attempts += 1;
            if attempts % self.servers.len() == 0 {
                sleep(ROTATION_BACKOFF).await;
            }
        }
    }
}
