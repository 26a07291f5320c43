use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::types::{ConverseRequest, ConverseResponse};

pub mod config;
mod consts;
mod utils;

pub use config::Config;

const DEFAULT_CAPACITY: usize = 1024;

pub type RequestTx = tokio::sync::mpsc::Sender<ConverseRequest>;
type ResponseTx = tokio::sync::broadcast::Sender<SessionEvent>;
pub type ResponseRx = tokio::sync::broadcast::Receiver<SessionEvent>;

/// What the receive pump hands to subscribers. End-of-stream is not an
/// event: it is the broadcast channel closing.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Response(ConverseResponse),
    /// The underlying stream failed mid-session.
    TransportError(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection attempt timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("websocket failure: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// An open session with the assistant. Requests go through a single writer
/// task, so concurrent senders never interleave partial writes.
pub struct Session {
    req_tx: RequestTx,
    resp_rx: ResponseRx,
    send_handle: tokio::task::JoinHandle<()>,
    recv_handle: tokio::task::JoinHandle<()>,
}

impl Session {
    /// A sender for outbound messages; clones share the writer task.
    pub fn requests(&self) -> RequestTx {
        self.req_tx.clone()
    }

    /// A fresh subscription to inbound events.
    pub fn responses(&self) -> ResponseRx {
        self.resp_rx.resubscribe()
    }

    /// Stop the writer, then tear the connection down.
    pub async fn shutdown(self) {
        drop(self.req_tx);
        if let Err(e) = self.send_handle.await {
            tracing::debug!("send task ended abnormally: {}", e);
        }
        self.recv_handle.abort();
    }
}

pub async fn connect(config: Config) -> Result<Session, ClientError> {
    connect_with_capacity(config, DEFAULT_CAPACITY).await
}

pub async fn connect_with_capacity(
    config: Config,
    capacity: usize,
) -> Result<Session, ClientError> {
    let request = utils::build_request(&config)?;
    let (ws_stream, _) = tokio::time::timeout(
        consts::CONNECT_TIMEOUT,
        tokio_tungstenite::connect_async(request),
    )
    .await
    .map_err(|_| ClientError::Timeout(consts::CONNECT_TIMEOUT))??;

    let (mut write, mut read) = ws_stream.split();

    let (req_tx, mut req_rx) = tokio::sync::mpsc::channel::<ConverseRequest>(capacity);
    let (resp_tx, resp_rx) = tokio::sync::broadcast::channel::<SessionEvent>(capacity);

    let send_handle = tokio::spawn(async move {
        while let Some(request) = req_rx.recv().await {
            match serde_json::to_string(&request) {
                Ok(text) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        tracing::error!("failed to send message: {}", e);
                    }
                }
                Err(e) => {
                    tracing::error!("failed to serialize request: {}", e);
                }
            }
        }
        // all senders are gone, say goodbye
        if let Err(e) = write.send(Message::Close(None)).await {
            tracing::debug!("failed to send close frame: {}", e);
        }
    });

    let recv_handle = tokio::spawn(async move {
        while let Some(message) = read.next().await {
            let message = match message {
                Err(e) => {
                    tracing::error!("session stream failed: {}", e);
                    let _ = resp_tx.send(SessionEvent::TransportError(e.to_string()));
                    break;
                }
                Ok(message) => message,
            };
            match message {
                Message::Text(text) => match serde_json::from_str::<ConverseResponse>(&text) {
                    Ok(response) => {
                        if resp_tx.send(SessionEvent::Response(response)).is_err() {
                            tracing::debug!("no subscribers for assistant events");
                        }
                    }
                    Err(e) => {
                        tracing::error!("failed to deserialize assistant event: {}, text=> {:?}", e, text);
                    }
                },
                Message::Binary(bin) => {
                    tracing::warn!("unexpected binary message ({} bytes)", bin.len());
                }
                Message::Close(reason) => {
                    tracing::info!("session closed: {:?}", reason);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(Session {
        req_tx,
        resp_rx,
        send_handle,
        recv_handle,
    })
}
