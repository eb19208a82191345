use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::types::{ClientMsg, ServerMsg};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("handshake rejected: {0}")]
    Rejected(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for ChannelError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ChannelError::Transport(e.to_string())
    }
}

/// Opens push connections. One call per connection attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Connection>, ChannelError>;
}

/// A single open push connection.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, msg: &ClientMsg) -> Result<(), ChannelError>;

    /// Next frame from the server; `None` once the connection is gone.
    async fn recv(&mut self) -> Option<Result<ServerMsg, ChannelError>>;

    async fn close(&mut self);
}

pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self) -> Result<Box<dyn Connection>, ChannelError> {
        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        debug!(url = %self.url, "websocket opened");
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, msg: &ClientMsg) -> Result<(), ChannelError> {
        let text = serde_json::to_string(msg).map_err(|e| ChannelError::Protocol(e.to_string()))?;
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<ServerMsg, ChannelError>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(e.into())),
            };
            match msg {
                Message::Text(text) => {
                    return Some(
                        serde_json::from_str(&text)
                            .map_err(|e| ChannelError::Protocol(format!("invalid frame: {e}"))),
                    );
                }
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::{ChannelError, Connection, Transport};
    use crate::types::{ClientMsg, ServerMsg};

    /// The server side of one in-memory connection.
    pub struct ServerEnd {
        pub from_client: mpsc::UnboundedReceiver<ClientMsg>,
        pub to_client: mpsc::UnboundedSender<ServerMsg>,
    }

    impl ServerEnd {
        pub async fn expect(&mut self) -> ClientMsg {
            self.from_client.recv().await.expect("client hung up")
        }

        pub fn push(&self, msg: ServerMsg) {
            let _ = self.to_client.send(msg);
        }
    }

    /// Hands every opened connection's server side to the test.
    pub struct MemoryTransport {
        accepted: mpsc::UnboundedSender<ServerEnd>,
        pub refuse: AtomicBool,
        pub attempts: AtomicUsize,
        pub attempt_times: Mutex<Vec<tokio::time::Instant>>,
        /// Shared log that sent client frames are appended to.
        pub log: Option<Arc<Mutex<Vec<String>>>>,
    }

    impl MemoryTransport {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
            let (accepted, rx) = mpsc::unbounded_channel();
            (
                Self {
                    accepted,
                    refuse: AtomicBool::new(false),
                    attempts: AtomicUsize::new(0),
                    attempt_times: Mutex::new(Vec::new()),
                    log: None,
                },
                rx,
            )
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn open(&self) -> Result<Box<dyn Connection>, ChannelError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.attempt_times.lock().push(tokio::time::Instant::now());
            if self.refuse.load(Ordering::SeqCst) {
                return Err(ChannelError::Transport("connection refused".into()));
            }

            let (to_server, from_client) = mpsc::unbounded_channel();
            let (to_client, from_server) = mpsc::unbounded_channel();
            self.accepted
                .send(ServerEnd {
                    from_client,
                    to_client,
                })
                .map_err(|_| ChannelError::Closed)?;
            Ok(Box::new(MemoryConnection {
                to_server,
                from_server,
                log: self.log.clone(),
            }))
        }
    }

    struct MemoryConnection {
        to_server: mpsc::UnboundedSender<ClientMsg>,
        from_server: mpsc::UnboundedReceiver<ServerMsg>,
        log: Option<Arc<Mutex<Vec<String>>>>,
    }

    #[async_trait]
    impl Connection for MemoryConnection {
        async fn send(&mut self, msg: &ClientMsg) -> Result<(), ChannelError> {
            if let Some(log) = &self.log {
                log.lock().push(format!("send:{msg:?}"));
            }
            self.to_server
                .send(msg.clone())
                .map_err(|_| ChannelError::Closed)
        }

        async fn recv(&mut self) -> Option<Result<ServerMsg, ChannelError>> {
            self.from_server.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.from_server.close();
        }
    }
}
