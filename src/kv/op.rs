use serde::{Deserialize, Serialize};

use super::KvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Get,
    Put,
    Append,
}

/// A client operation as it travels through the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    pub kind: OpKind,
    pub key: String,
    pub value: String,
    pub client_id: u64,
    pub request_id: u64,
}

impl Op {
    pub fn get(key: impl Into<String>, client_id: u64, request_id: u64) -> Self {
        Self {
            kind: OpKind::Get,
            key: key.into(),
            value: String::new(),
            client_id,
            request_id,
        }
    }

    pub fn put(
        key: impl Into<String>,
        value: impl Into<String>,
        client_id: u64,
        request_id: u64,
    ) -> Self {
        Self {
            kind: OpKind::Put,
            key: key.into(),
            value: value.into(),
            client_id,
            request_id,
        }
    }

    pub fn append(
        key: impl Into<String>,
        value: impl Into<String>,
        client_id: u64,
        request_id: u64,
    ) -> Self {
        Self {
            kind: OpKind::Append,
            key: key.into(),
            value: value.into(),
            client_id,
            request_id,
        }
    }

    /// Whether `other` is the same client request.
    pub fn same_request(&self, other: &Op) -> bool {
        self.client_id == other.client_id && self.request_id == other.request_id
    }

    pub fn encode(&self) -> Result<Vec<u8>, KvError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| KvError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, KvError> {
        let (op, _read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| KvError::Codec(e.to_string()))?;
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_survives_the_log() {
        let op = Op::append("k", "tail", 42, 7);
        let bytes = op.encode().expect("encode");
        assert_eq!(Op::decode(&bytes).expect("decode"), op);
    }

    #[test]
    fn foreign_command_does_not_decode() {
        assert!(matches!(
            Op::decode(b"\xff\xff\xff\xff\xff\xff"),
            Err(KvError::Codec(_))
        ));
    }

    #[test]
    fn same_request_ignores_payload() {
        let a = Op::put("k", "v1", 1, 2);
        let b = Op::append("other", "v2", 1, 2);
        assert!(a.same_request(&b));
        assert!(!a.same_request(&Op::put("k", "v1", 1, 3)));
    }
}
