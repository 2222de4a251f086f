//! Wire codecs: the length-prefixed, base64-wrapped stdio frames spoken
//! between a worker handle and its worker process (§4.1/§6), and the binary
//! HTTP envelopes spoken between a caller and the dispatcher (§4.5/§6).

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{AgentError, Result};

const B64: base64::engine::general_purpose::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// The three opaque blobs a job carries, forwarded untouched to the worker's
/// own deserializer (Design Notes: "the agent handles byte blobs only").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub procedure: Vec<u8>,
    pub args: Vec<u8>,
    pub kwargs: Vec<u8>,
}

/// A worker's reply to one RPC, matching §4.1 verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    pub error: bool,
    pub result: Option<Vec<u8>>,
    pub kind: Option<String>,
    pub message: Option<String>,
    pub trace: Option<String>,
}

impl RpcReply {
    pub fn ok(result: Vec<u8>) -> Self {
        RpcReply {
            error: false,
            result: Some(result),
            kind: None,
            message: None,
            trace: None,
        }
    }

    pub fn failure(kind: impl Into<String>, message: impl Into<String>, trace: Option<String>) -> Self {
        RpcReply {
            error: true,
            result: None,
            kind: Some(kind.into()),
            message: Some(message.into()),
            trace,
        }
    }
}

/// Reads one length-prefixed frame from `reader` and returns its raw payload
/// bytes. Returns `Ok(None)` on a clean EOF before any length byte arrives —
/// the graceful-shutdown signal both directions of this protocol treat as
/// terminal (§4.1, §6).
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Writes one length-prefixed frame to `writer`: a 4-byte big-endian length
/// followed by `payload`.
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame payload exceeds u32 length")
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Encodes a stdio message: bincode-serialize, then base64-wrap. The base64
/// wrap protects against stray binary chunks confusing any tooling that
/// observes the stream.
pub fn encode_stdio<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| AgentError::AgentInternal(format!("stdio encode failed: {e}")))?;
    Ok(B64.encode(raw).into_bytes())
}

/// Decodes a stdio message frame payload previously produced by
/// [`encode_stdio`].
pub fn decode_stdio<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    let raw = B64
        .decode(payload)
        .map_err(|e| AgentError::BadRequest(format!("invalid base64 frame payload: {e}")))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| AgentError::BadRequest(format!("invalid frame payload: {e}")))?;
    Ok(value)
}

/// `/execute` request envelope (§4.5). Binary-encoded, not base64-wrapped —
/// the base64 wrap is specific to the worker stdio transport (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub procedure: Vec<u8>,
    pub args: Vec<u8>,
    pub kwargs: Vec<u8>,
    pub dependencies: Vec<String>,
    pub dep_hash: String,
    pub timeout_sec: u64,
    pub memory_mb: u64,
    pub cpus: u32,
}

/// `/execute` response envelope (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub error: bool,
    pub result: Option<Vec<u8>>,
    pub kind: Option<String>,
    pub message: Option<String>,
    pub trace: Option<String>,
}

impl ExecuteResponse {
    pub fn ok(result: Vec<u8>) -> Self {
        ExecuteResponse {
            error: false,
            result: Some(result),
            kind: None,
            message: None,
            trace: None,
        }
    }
}

impl From<&AgentError> for ExecuteResponse {
    fn from(err: &AgentError) -> Self {
        let (message, trace) = match err {
            AgentError::UserError { message, trace, .. } => (message.clone(), trace.clone()),
            other => (other.to_string(), None),
        };
        ExecuteResponse {
            error: true,
            result: None,
            kind: Some(err.kind()),
            message: Some(message),
            trace,
        }
    }
}

pub fn encode_http<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| AgentError::AgentInternal(format!("http encode failed: {e}")))
}

pub fn decode_http<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| AgentError::BadRequest(format!("invalid request envelope: {e}")))?;
    Ok(value)
}
