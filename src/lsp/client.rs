use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::BufReader;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::lsp::connection::{InputStream, OutputStream};
use crate::lsp::protocol::{
    read_message, write_message, Message, RequestId, RpcError, RpcNotification, RpcRequest,
    RpcResponse, METHOD_NOT_FOUND,
};
use crate::utils::error::{HubError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Traffic {
    Sent,
    Received,
}

/// Observer for every raw message crossing the wire.
pub type TrafficTap = Arc<dyn Fn(Traffic, &str) + Send + Sync>;

/// JSON-RPC client bound to one server connection.
///
/// Writes go through a FIFO lock, so requests reach the transport in
/// submission order; responses complete whenever they arrive.
pub struct RpcClient {
    shared: Arc<Shared>,
}

struct Shared {
    server: String,
    writer: tokio::sync::Mutex<OutputStream>,
    request_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<RpcResponse>>>,
    /// Cancelled once the read loop is gone; nothing will be answered after that.
    closed: CancellationToken,
    tap: Option<TrafficTap>,
}

impl RpcClient {
    /// Wrap the streams and start reading responses in a background task.
    pub fn start(server: &str, input: InputStream, output: OutputStream, tap: Option<TrafficTap>) -> Self {
        let shared = Arc::new(Shared {
            server: server.to_string(),
            writer: tokio::sync::Mutex::new(output),
            request_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
            tap,
        });

        // JoinHandle intentionally not stored: the task ends on EOF or when
        // `closed` is cancelled.
        tokio::spawn(read_loop(Arc::clone(&shared), input));

        Self { shared }
    }

    pub fn server(&self) -> &str {
        &self.shared.server
    }

    /// Send a request and wait for its result. A `null` result is `Ok(None)`.
    ///
    /// Dropping the returned future before it completes sends `$/cancelRequest`.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Option<Value>> {
        let id = RequestId::Number(self.shared.request_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();

        self.shared.pending.lock().expect("pending mutex poisoned").insert(id.clone(), tx);
        if self.is_closed() {
            self.shared.forget(&id);
            return Err(HubError::unavailable(&self.shared.server));
        }
        let mut guard = InFlightRequest { shared: Arc::clone(&self.shared), id: Some(id.clone()) };

        let content = serde_json::to_string(&RpcRequest::new(id.clone(), method, params))?;
        tracing::debug!("Sending request to {}: {method} (id: {id})", self.shared.server);
        self.shared.send_raw(&content).await?;

        let response = rx.await.map_err(|_| HubError::unavailable(&self.shared.server))?;
        guard.disarm();

        if let Some(error) = response.error {
            tracing::debug!("Error response for {method} (id: {id}): {error:?}");
            if error.is_cancelled() {
                return Err(HubError::OperationCancelled);
            }
            return Err(HubError::Rpc { server: self.shared.server.clone(), code: error.code, message: error.message });
        }
        Ok(response.result.filter(|v| !v.is_null()))
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(HubError::unavailable(&self.shared.server));
        }
        let content = serde_json::to_string(&RpcNotification::new(method, params))?;
        self.shared.send_raw(&content).await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the connection is gone (EOF, read error or [`close`](Self::close)).
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    /// Stop reading and fail every pending request with `ServerUnavailable`.
    pub fn close(&self) {
        self.shared.closed.cancel();
        self.shared.fail_pending();
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().expect("pending mutex poisoned").len()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    async fn send_raw(&self, content: &str) -> Result<()> {
        if let Some(tap) = &self.tap {
            tap(Traffic::Sent, content);
        }
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, content).await.map_err(|e| {
            tracing::debug!("Write to {} failed: {e}", self.server);
            HubError::unavailable(&self.server)
        })
    }

    fn forget(&self, id: &RequestId) -> bool {
        self.pending.lock().expect("pending mutex poisoned").remove(id).is_some()
    }

    /// Dropping the senders wakes every waiter with a closed channel.
    fn fail_pending(&self) {
        self.pending.lock().expect("pending mutex poisoned").clear();
    }
}

/// Removes an abandoned request and tells the server to stop working on it.
struct InFlightRequest {
    shared: Arc<Shared>,
    id: Option<RequestId>,
}

impl InFlightRequest {
    fn disarm(&mut self) {
        self.id = None;
    }
}

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        if !self.shared.forget(&id) || self.shared.closed.is_cancelled() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        handle.spawn(async move {
            tracing::debug!("Cancelling request {id} on {}", shared.server);
            match serde_json::to_string(&RpcNotification::cancel(&id)) {
                Ok(content) => {
                    let _ = shared.send_raw(&content).await;
                }
                Err(e) => tracing::debug!("Failed to encode cancel notification: {e}"),
            }
        });
    }
}

async fn read_loop(shared: Arc<Shared>, input: InputStream) {
    let mut reader = BufReader::new(input);

    loop {
        let content = tokio::select! {
            () = shared.closed.cancelled() => break,
            read = read_message(&mut reader) => match read {
                Ok(Some(content)) => content,
                Ok(None) => {
                    tracing::debug!("{} closed its output (EOF)", shared.server);
                    break;
                }
                Err(e) => {
                    tracing::debug!("Read from {} failed: {e}", shared.server);
                    break;
                }
            },
        };

        if let Some(tap) = &shared.tap {
            tap(Traffic::Received, &content);
        }

        match Message::parse(&content) {
            Ok(Message::Response(response)) => {
                let Some(id) = response.id.clone() else {
                    tracing::debug!("Response without id from {}: {:?}", shared.server, response.error);
                    continue;
                };
                let sender = shared.pending.lock().expect("pending mutex poisoned").remove(&id);
                if let Some(sender) = sender {
                    let _ = sender.send(response);
                }
            }
            Ok(Message::Request(request)) => {
                let reply = reply_to(&request);
                match serde_json::to_string(&reply) {
                    // A peer that stops reading must not stall the read loop.
                    Ok(reply) => {
                        let shared = Arc::clone(&shared);
                        tokio::spawn(async move {
                            let _ = shared.send_raw(&reply).await;
                        });
                    }
                    Err(e) => tracing::debug!("Failed to encode reply to {}: {e}", request.method),
                }
            }
            Ok(Message::Notification(notification)) => log_notification(&shared.server, &notification),
            Err(e) => {
                tracing::debug!(
                    "Failed to parse message from {}: {e}: {}",
                    shared.server,
                    content.chars().take(200).collect::<String>()
                );
            }
        }
    }

    // Order matters: a request registered after the clear must observe `closed`.
    shared.closed.cancel();
    shared.fail_pending();
}

/// Generic answers so that servers waiting on the client never stall.
fn reply_to(request: &RpcRequest) -> RpcResponse {
    let id = request.id.clone();
    match request.method.as_str() {
        "workspace/configuration" => {
            let items = request
                .params
                .as_ref()
                .and_then(|p| p.get("items"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            RpcResponse::success(id, Value::Array(vec![Value::Null; items]))
        }
        "client/registerCapability"
        | "client/unregisterCapability"
        | "window/workDoneProgress/create"
        | "window/showMessageRequest" => RpcResponse::success(id, Value::Null),
        method => RpcResponse::failure(id, RpcError::new(METHOD_NOT_FOUND, format!("Unhandled method {method}"))),
    }
}

fn log_notification(server: &str, notification: &RpcNotification) {
    if notification.method == "window/logMessage" {
        let message = notification
            .params
            .as_ref()
            .and_then(|p| p.get("message"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        tracing::info!(server = %server, "{message}");
    } else {
        tracing::debug!("Notification from {server}: {}", notification.method);
    }
}
