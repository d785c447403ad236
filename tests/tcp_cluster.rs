use std::sync::Arc;
use std::time::Duration;

use replog::network::{RaftServer, TcpTransport};
use replog::raft::{ApplyMsg, FilePersister, Raft, RaftConfig};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

struct TcpNode {
    raft: Raft,
    apply_rx: mpsc::Receiver<ApplyMsg>,
    server: JoinHandle<()>,
}

async fn start_cluster(size: usize, data_dir: &TempDir) -> Vec<TcpNode> {
    // Bind first so every server knows every address up front.
    let mut listeners = Vec::new();
    for _ in 0..size {
        listeners.push(RaftServer::bind("127.0.0.1:0").await.expect("bind"));
    }
    let peers: Vec<String> = listeners
        .iter()
        .map(|l| l.local_addr().expect("addr").to_string())
        .collect();

    let mut nodes = Vec::new();
    for (i, listener) in listeners.into_iter().enumerate() {
        let config = RaftConfig::new(i, peers.clone());
        let persister =
            Arc::new(FilePersister::new(data_dir.path().join(i.to_string())).expect("persister"));
        let (tx, apply_rx) = mpsc::channel(64);
        let raft = Raft::new(
            config.clone(),
            Arc::new(TcpTransport::from_config(&config)),
            persister,
            tx,
        )
        .expect("create raft");

        let service = RaftServer::new(Arc::new(raft.clone()));
        let server = tokio::spawn(async move {
            let _ = service.serve(listener).await;
        });
        raft.start().expect("start raft");

        nodes.push(TcpNode {
            raft,
            apply_rx,
            server,
        });
    }
    nodes
}

async fn find_leader(nodes: &[TcpNode]) -> usize {
    for _ in 0..100 {
        for (i, node) in nodes.iter().enumerate() {
            if node.raft.get_state().1 {
                return i;
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("no Raft leader found after retries");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_servers_replicate_over_tcp() {
    let _ = env_logger::builder().is_test(true).try_init();
    let tmp = TempDir::new().expect("tempdir");
    let mut nodes = start_cluster(3, &tmp).await;

    let leader = find_leader(&nodes).await;
    let outcome = nodes[leader]
        .raft
        .start_command(b"hello over tcp".to_vec())
        .expect("start");
    assert!(outcome.is_leader);
    assert_eq!(outcome.index, 1);

    for node in nodes.iter_mut() {
        let msg = timeout(Duration::from_secs(5), node.apply_rx.recv())
            .await
            .expect("applied in time")
            .expect("apply channel open");
        assert_eq!(
            msg,
            ApplyMsg::Command {
                index: 1,
                term: outcome.term,
                command: b"hello over tcp".to_vec(),
            }
        );
    }

    // The entry was persisted on disk by every server.
    for i in 0..3 {
        assert!(tmp.path().join(i.to_string()).join("raft-state.bin").exists());
    }

    for node in &nodes {
        node.raft.kill();
        node.server.abort();
    }
}
