//! JSON-RPC 2.0 envelopes and the `Content-Length` framing used on the wire.
//!
//! Payloads stay opaque `serde_json::Value`s: routing only needs the id and
//! the method name.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const JSONRPC_VERSION: &str = "2.0";

/// Error code a server answers with when it honoured `$/cancelRequest`.
pub const REQUEST_CANCELLED: i64 = -32800;
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: RequestId, method: &str, params: Option<Value>) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), id, method: method.to_string(), params }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), method: method.to_string(), params }
    }

    /// The protocol's generic cancellation notification for request `id`.
    pub fn cancel(id: &RequestId) -> Self {
        Self::new("$/cancelRequest", Some(serde_json::json!({ "id": id })))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), id: Some(id), result: Some(result), error: None }
    }

    pub fn failure(id: RequestId, error: RpcError) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), id: Some(id), result: None, error: Some(error) }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == REQUEST_CANCELLED
    }
}

/// Any inbound message. Variant order matters: requests carry both `id` and
/// `method`, notifications only `method`, responses neither.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum Message {
    Request(RpcRequest),
    Notification(RpcNotification),
    Response(RpcResponse),
}

impl Message {
    pub fn parse(content: &str) -> serde_json::Result<Self> {
        serde_json::from_str(content)
    }
}

/// Read one framed message. Returns `Ok(None)` on a clean EOF.
///
/// Headers other than `Content-Length` (e.g. `Content-Type`) are skipped.
pub async fn read_message<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut content_length: Option<usize> = None;

    let length = loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let header = line.trim();
        if header.is_empty() {
            match content_length {
                Some(len) => break len,
                None => continue,
            }
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                content_length = value.trim().parse().ok();
            }
        }
    };

    let mut body = vec![0; length];
    reader.read_exact(&mut body).await?;
    String::from_utf8(body)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Frame `content` with a `Content-Length` header and flush it.
pub async fn write_message<W>(writer: &mut W, content: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let message = format!("Content-Length: {}\r\n\r\n{content}", content.len());
    writer.write_all(message.as_bytes()).await?;
    writer.flush().await
}
