use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Node has been killed")]
    Killed,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt persisted state: {0}")]
    CorruptState(String),
}
