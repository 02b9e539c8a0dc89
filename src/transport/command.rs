//! Ephemeral per-command request/response exchange.

use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::protocol::{decode_line, CommandEnvelope, DecodedLine, MethodResponse};

/// Transport-level failure of a single command exchange.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Opening the TCP connection failed.
    #[error("connection to engine failed: {0}")]
    Connect(std::io::Error),

    /// Writing the encoded command failed.
    #[error("failed to send command: {0}")]
    Write(std::io::Error),

    /// Reading response lines failed.
    #[error("failed to read response: {0}")]
    Read(LinesCodecError),

    /// The engine closed the connection before the matching response.
    #[error("engine closed the connection before responding")]
    Truncated,

    /// No matching response arrived within the receive timeout.
    #[error("no response from engine within {0:?}")]
    Timeout(Duration),
}

/// Sends commands to the engine, one short-lived connection per call.
///
/// Each [`send`](CommandChannel::send) opens its own TCP connection, so the
/// channel is safe to use concurrently with the event listener's separate
/// connection. At most one command per operation kind is assumed to be in
/// flight at a time; callers serialize their own command traffic.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    endpoint: String,
}

impl CommandChannel {
    /// Creates a channel targeting `host:port`.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            endpoint: format!("{}:{}", host, port),
        }
    }

    /// Returns the `host:port` endpoint this channel targets.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Performs one command exchange.
    ///
    /// Opens a connection, writes the envelope, then reads lines until a
    /// response whose `id` matches the request. Events and unrelated
    /// responses arriving on this connection are discarded; they never
    /// complete the exchange. The connection is dropped on every exit path.
    ///
    /// # Errors
    ///
    /// [`TransportError::Connect`]/[`TransportError::Write`] for socket
    /// failures, [`TransportError::Truncated`] if the engine closes the
    /// connection first, [`TransportError::Timeout`] if `recv_timeout`
    /// elapses without a matching response.
    pub async fn send(
        &self,
        envelope: &CommandEnvelope,
        recv_timeout: Duration,
    ) -> Result<MethodResponse, TransportError> {
        let mut stream = TcpStream::connect(&self.endpoint)
            .await
            .map_err(TransportError::Connect)?;

        tracing::debug!("sending {} to {}", envelope.method, self.endpoint);
        stream
            .write_all(envelope.to_json_line().as_bytes())
            .await
            .map_err(TransportError::Write)?;
        stream.flush().await.map_err(TransportError::Write)?;

        let mut lines = FramedRead::new(stream, LinesCodec::new());
        let wait = async {
            while let Some(item) = lines.next().await {
                let line = item.map_err(TransportError::Read)?;
                match decode_line(&line) {
                    DecodedLine::Response(response) if response.id == envelope.id => {
                        return Ok(response);
                    }
                    DecodedLine::Response(other) => {
                        tracing::trace!(
                            "discarding response for '{}' while waiting for '{}'",
                            other.id,
                            envelope.id
                        );
                    }
                    // Events and junk on a command connection are discarded.
                    DecodedLine::Event(_) | DecodedLine::Ignored => {}
                }
            }
            Err(TransportError::Truncated)
        };

        match timeout(recv_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(recv_timeout)),
        }
    }
}
