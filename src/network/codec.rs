//! Length-prefixed bincode framing for peer RPCs.
//!
//! Each frame is a 4-byte big-endian payload length followed by the payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::NetworkError;
use crate::raft::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};

/// Upper bound on a single frame. Large enough for a full log catch-up of
/// small commands, small enough that a corrupt length cannot exhaust memory.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
    Error(String),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, NetworkError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| NetworkError::Codec(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, NetworkError> {
    let (value, _read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| NetworkError::Codec(e.to_string()))?;
    Ok(value)
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let len = (payload.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` if the peer closed the stream cleanly
/// between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn send_message<W, T>(writer: &mut W, message: &T) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = encode(message)?;
    write_frame(writer, &payload).await
}

pub async fn recv_message<R, T>(reader: &mut R) -> Result<Option<T>, NetworkError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader).await? {
        Some(payload) => decode(&payload).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::LogEntry;
    use tokio::io::duplex;

    #[tokio::test]
    async fn messages_cross_a_stream_in_order() {
        let (mut client, mut server) = duplex(1024);

        let vote = RpcRequest::RequestVote(RequestVoteArgs {
            term: 3,
            candidate_id: 1,
            last_log_index: 7,
            last_log_term: 2,
        });
        let append = RpcRequest::AppendEntries(AppendEntriesArgs {
            term: 3,
            leader_id: 1,
            prev_log_index: 7,
            prev_log_term: 2,
            entries: vec![LogEntry::new(3, b"set x".to_vec())],
            leader_commit: 6,
        });

        send_message(&mut client, &vote).await.expect("send vote");
        send_message(&mut client, &append).await.expect("send append");
        drop(client);

        let first: Option<RpcRequest> = recv_message(&mut server).await.expect("recv");
        let second: Option<RpcRequest> = recv_message(&mut server).await.expect("recv");
        let end: Option<RpcRequest> = recv_message(&mut server).await.expect("eof");

        assert_eq!(first, Some(vote));
        assert_eq!(second, Some(append));
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = duplex(64);
        let len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        client.write_all(&len).await.expect("write");

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, NetworkError::FrameTooLarge { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn truncated_frame_is_an_io_error() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.expect("write len");
        client.write_all(b"abc").await.expect("write body");
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, NetworkError::Io(_)), "got {err:?}");
    }

    #[test]
    fn garbage_payload_is_a_codec_error() {
        let err = decode::<RpcResponse>(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, NetworkError::Codec(_)));
    }
}
