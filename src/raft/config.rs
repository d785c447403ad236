use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{NodeId, RaftError};

fn default_election_timeout_min() -> u64 {
    150
}

fn default_election_timeout_max() -> u64 {
    300
}

fn default_heartbeat_interval() -> u64 {
    50
}

fn default_rpc_timeout() -> u64 {
    100
}

fn default_apply_buffer() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Index of this server in `peers`.
    pub me: NodeId,
    /// Every server's endpoint, in the same order on all servers.
    pub peers: Vec<String>,
    #[serde(default = "default_election_timeout_min")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_timeout_max")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_apply_buffer")]
    pub apply_buffer: usize,
}

impl RaftConfig {
    pub fn new(me: NodeId, peers: Vec<String>) -> Self {
        Self {
            me,
            peers,
            election_timeout_min_ms: default_election_timeout_min(),
            election_timeout_max_ms: default_election_timeout_max(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            rpc_timeout_ms: default_rpc_timeout(),
            apply_buffer: default_apply_buffer(),
        }
    }

    /// Builds a config for an in-process cluster where peers are addressed
    /// by index only.
    pub fn local(me: NodeId, cluster_size: usize) -> Self {
        let peers = (0..cluster_size).map(|i| format!("node-{i}")).collect();
        Self::new(me, peers)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RaftError> {
        let raw = std::fs::read_to_string(path)?;
        let config: RaftConfig =
            serde_json::from_str(&raw).map_err(|e| RaftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        if self.peers.is_empty() {
            return Err(RaftError::Config("peer list is empty".to_string()));
        }
        if self.me >= self.peers.len() {
            return Err(RaftError::Config(format!(
                "me={} is out of range for {} peers",
                self.me,
                self.peers.len()
            )));
        }
        if self.election_timeout_min_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(RaftError::Config("timeouts must be non-zero".to_string()));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(RaftError::Config(format!(
                "election timeout window is empty: {}..={}",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(RaftError::Config(format!(
                "heartbeat interval {}ms must be shorter than the election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        Ok(())
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}
