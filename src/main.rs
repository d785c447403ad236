use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use log::{error, info, warn};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use replog::network::{RaftServer, TcpTransport};
use replog::raft::{ApplyMsg, FilePersister, PersistentState, Persister, Raft, RaftConfig};

/// Number of trailing entries `inspect` prints.
const INSPECT_TAIL: usize = 10;

struct RotatingFile {
    path: String,
    max_size: u64,
    max_files: u32,
    file: File,
    current_size: u64,
}

impl RotatingFile {
    fn new(path: String, max_size: u64, max_files: u32) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_size,
            max_files,
            file,
            current_size,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        // path.N-1 -> path.N, ..., path -> path.1
        for i in (1..self.max_files).rev() {
            let src = format!("{}.{}", self.path, i);
            let dst = format!("{}.{}", self.path, i + 1);
            let _ = std::fs::rename(&src, &dst);
        }
        let _ = std::fs::rename(&self.path, format!("{}.1", self.path));

        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.current_size = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.current_size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

fn init_logging() {
    // With REPLOG_LOG_FILE set, `log` records go to a rotated plain-text file
    // through env_logger; otherwise they are bridged into tracing on stderr.
    if let Ok(path) = std::env::var("REPLOG_LOG_FILE") {
        let max_size_mb: u64 = env_or("REPLOG_LOG_MAX_SIZE_MB", 10);
        let max_files: u32 = env_or("REPLOG_LOG_MAX_FILES", 3);

        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        match RotatingFile::new(path.clone(), max_size_mb * 1024 * 1024, max_files) {
            Ok(rot) => {
                builder.target(env_logger::Target::Pipe(Box::new(rot)));
            }
            Err(e) => eprintln!("cannot open log file {path}: {e}; logging to stderr"),
        }
        if builder.try_init().is_ok() {
            return;
        }
    }

    let _ = LogTracer::init();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(true).with_writer(io::stderr);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

#[derive(Parser)]
#[command(name = "replog")]
#[command(about = "A replicated log built on the Raft consensus protocol")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one server of a cluster over TCP. Lines on stdin are submitted as
    /// commands; applied entries are printed as `<index>\t<command>`.
    Node {
        /// Index of this server in the peer list
        #[arg(short, long)]
        id: usize,

        /// Comma-separated host:port of every server, this one included
        #[arg(short, long)]
        peers: Option<String>,

        /// JSON config file; --id and --peers override its values
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory holding one state subdirectory per server
        #[arg(short, long, default_value = "data")]
        data_dir: PathBuf,

        /// Clean this server's state before starting
        #[arg(long)]
        clean: bool,
    },

    /// Print the persisted state of a server
    Inspect {
        #[arg(short, long, default_value = "data")]
        data_dir: PathBuf,

        #[arg(short, long)]
        id: usize,
    },
}

fn node_dir(data_dir: &Path, id: usize) -> PathBuf {
    data_dir.join(id.to_string())
}

fn build_config(
    id: usize,
    peers: Option<String>,
    config: Option<PathBuf>,
) -> anyhow::Result<RaftConfig> {
    let peers = peers.map(|list| {
        list.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect::<Vec<_>>()
    });

    let mut config = match (config, peers) {
        (Some(path), peers) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let mut config: RaftConfig = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?;
            if let Some(peers) = peers {
                config.peers = peers;
            }
            config
        }
        (None, Some(peers)) => RaftConfig::new(id, peers),
        (None, None) => bail!("either --peers or --config is required"),
    };
    config.me = id;
    config.validate()?;
    Ok(config)
}

async fn run_node(
    id: usize,
    peers: Option<String>,
    config: Option<PathBuf>,
    data_dir: PathBuf,
    clean: bool,
) -> anyhow::Result<()> {
    let config = build_config(id, peers, config)?;
    let address = config.peers[config.me].clone();
    info!("Starting replog node {} at {}", id, address);

    let dir = node_dir(&data_dir, id);
    if clean && dir.exists() {
        info!("--clean flag detected, removing {}", dir.display());
        std::fs::remove_dir_all(&dir)?;
    }
    let persister = Arc::new(FilePersister::new(&dir)?);

    let (apply_tx, mut apply_rx) = mpsc::channel(config.apply_buffer);
    let transport = Arc::new(TcpTransport::from_config(&config));
    let raft = Raft::new(config, transport, persister, apply_tx)?;

    let listener = RaftServer::bind(&address).await?;
    let server = RaftServer::new(Arc::new(raft.clone()));
    tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            error!("RPC server stopped: {}", e);
        }
    });

    raft.start()?;

    tokio::spawn(async move {
        while let Some(msg) = apply_rx.recv().await {
            match msg {
                ApplyMsg::Command { index, command, .. } => {
                    println!("{}\t{}", index, String::from_utf8_lossy(&command));
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let outcome = raft.start_command(line.as_bytes().to_vec())?;
                if outcome.is_leader {
                    info!("Submitted at index {} in term {}", outcome.index, outcome.term);
                } else {
                    let status = raft.status();
                    warn!(
                        "Not the leader (term {}, leader {:?}); command dropped",
                        status.current_term, status.leader_id
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    raft.kill();
    Ok(())
}

fn inspect(data_dir: &Path, id: usize) -> anyhow::Result<()> {
    let persister = FilePersister::new(node_dir(data_dir, id))?;
    let blob = persister.load()?;

    let Some(state) = PersistentState::decode(&blob)? else {
        println!("no persisted state at {}", persister.path().display());
        return Ok(());
    };

    let last_index = state.log.len().saturating_sub(1);
    println!("term:       {}", state.current_term);
    match state.voted_for {
        Some(vote) => println!("voted for:  {vote}"),
        None => println!("voted for:  -"),
    }
    println!("last index: {last_index}");

    let start = state.log.len().saturating_sub(INSPECT_TAIL).max(1);
    for (index, entry) in state.log.iter().enumerate().skip(start) {
        println!(
            "{}\t{}\t{}",
            index,
            entry.term,
            String::from_utf8_lossy(&entry.command)
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();
    match cli.command {
        Command::Node {
            id,
            peers,
            config,
            data_dir,
            clean,
        } => run_node(id, peers, config, data_dir, clean).await,
        Command::Inspect { data_dir, id } => inspect(&data_dir, id),
    }
}
