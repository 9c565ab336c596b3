//! TCP-based transport for production use.
//!
//! Each session is one TCP connection with two pump tasks: a writer that
//! frames outgoing [`ProposerMessage`]s and a reader that reassembles
//! incoming [`SafekeeperMessage`] frames. The pumps die on any socket or
//! framing error, which the session owner observes as
//! [`TransportError::Closed`] and answers with a reconnect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use lodestone_types::NodeId;
use lodestone_wire::{ProposerMessage, SafekeeperMessage, frame};

use super::{
    BoxFuture, Connector, SESSION_CHANNEL_CAPACITY, Session, TransportError, TransportResult,
};

/// Default bound on connection establishment.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connector that opens one TCP connection per session.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoints: HashMap<NodeId, SocketAddr>,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Creates a connector over the given safekeeper endpoints.
    pub fn new(endpoints: HashMap<NodeId, SocketAddr>) -> Self {
        Self {
            endpoints,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Overrides the connection establishment timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The configured endpoint for a safekeeper, if any.
    pub fn endpoint(&self, node_id: NodeId) -> Option<SocketAddr> {
        self.endpoints.get(&node_id).copied()
    }
}

impl Connector for TcpConnector {
    fn connect(&self, node_id: NodeId) -> BoxFuture<'_, TransportResult<Session>> {
        Box::pin(async move {
            let addr = self
                .endpoints
                .get(&node_id)
                .copied()
                .ok_or(TransportError::UnknownNode(node_id))?;

            let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::ConnectionFailed {
                    node_id,
                    reason: e.to_string(),
                })?;
            stream.set_nodelay(true)?;
            debug!(%node_id, %addr, "connected to safekeeper");

            let (mut read_half, mut write_half) = stream.into_split();

            let (to_sk_tx, mut to_sk_rx) =
                mpsc::channel::<ProposerMessage>(SESSION_CHANNEL_CAPACITY);
            let (from_sk_tx, from_sk_rx) =
                mpsc::channel::<SafekeeperMessage>(SESSION_CHANNEL_CAPACITY);

            // Writer pump: session -> socket.
            tokio::spawn(async move {
                while let Some(message) = to_sk_rx.recv().await {
                    let encoded = match frame::encode(&message) {
                        Ok(encoded) => encoded,
                        Err(e) => {
                            debug!(%node_id, error = %e, "encode failed, closing writer");
                            break;
                        }
                    };
                    if let Err(e) = write_half.write_all(&encoded).await {
                        debug!(%node_id, error = %e, "write failed, closing writer");
                        break;
                    }
                }
                let _ = write_half.shutdown().await;
            });

            // Reader pump: socket -> session.
            tokio::spawn(async move {
                let mut buf = BytesMut::with_capacity(8 * 1024);
                'read: loop {
                    match read_half.read_buf(&mut buf).await {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!(%node_id, error = %e, "read failed, closing reader");
                            break;
                        }
                    }

                    loop {
                        match frame::frame_size(&buf) {
                            Ok(Some(size)) => {
                                let frame_data = buf.split_to(size).freeze();
                                let message: SafekeeperMessage = match frame::decode(frame_data) {
                                    Ok(message) => message,
                                    Err(e) => {
                                        debug!(%node_id, error = %e, "decode failed, closing reader");
                                        break 'read;
                                    }
                                };
                                if from_sk_tx.send(message).await.is_err() {
                                    break 'read;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                debug!(%node_id, error = %e, "bad frame header, closing reader");
                                break 'read;
                            }
                        }
                    }
                }
            });

            Ok(Session::new(node_id, to_sk_tx, from_sk_rx))
        })
    }
}
