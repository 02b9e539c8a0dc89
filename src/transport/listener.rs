//! Long-lived event connection to the engine.

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::protocol::{decode_line, DecodedLine};
use crate::session::SessionHandle;
use crate::transport::TransportError;

/// Background task reading the engine's event stream.
///
/// Owns the one long-lived connection. Every decoded event is applied to
/// the session before the next read, so workflow polls always observe
/// events in arrival order. When the engine closes the connection
/// (half-close included), when a read fails, or when the listener is
/// stopped, the session is torn down and the one-shot connection-lost
/// notification fires.
#[derive(Debug)]
pub struct EventListener {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl EventListener {
    /// Connects to `host:port` and spawns the read loop.
    ///
    /// The connection is opened in the caller's context so a refused or
    /// unreachable endpoint surfaces here, synchronously, rather than from
    /// the background task. On success the session is marked connected
    /// before this returns.
    ///
    /// # Errors
    ///
    /// [`TransportError::Connect`] when the endpoint cannot be reached.
    pub async fn start(
        host: &str,
        port: u16,
        session: SessionHandle,
    ) -> Result<Self, TransportError> {
        let endpoint = format!("{}:{}", host, port);
        let stream = TcpStream::connect(&endpoint)
            .await
            .map_err(TransportError::Connect)?;
        tracing::info!("event listener connected to {}", endpoint);

        session.set_connected().await;

        let token = CancellationToken::new();
        let task = tokio::spawn(listen_loop(stream, session, token.clone()));
        Ok(Self { token, task })
    }

    /// Stops the listener and waits for its task to finish.
    ///
    /// Tears the session down via the same path as a connection fault, so
    /// the connection-lost notification fires (once) here too.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("event listener task failed: {}", e);
        }
    }
}

async fn listen_loop(stream: TcpStream, session: SessionHandle, token: CancellationToken) {
    let mut lines = FramedRead::new(stream, LinesCodec::new());

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!("event listener stopped");
                break;
            }
            item = lines.next() => match item {
                Some(Ok(line)) => dispatch_line(&line, &session).await,
                Some(Err(e)) => {
                    tracing::warn!("event stream read failed: {}", e);
                    break;
                }
                None => {
                    tracing::warn!("engine closed the event connection");
                    break;
                }
            }
        }
    }

    session.mark_disconnected().await;
}

/// Decodes one line from the event stream and applies it to the session.
async fn dispatch_line(line: &str, session: &SessionHandle) {
    match decode_line(line) {
        DecodedLine::Event(event) => session.apply_event(&event).await,
        DecodedLine::Response(response) => {
            // Responses belong to command connections; a stray one here is
            // harmless but worth noting.
            tracing::trace!("ignoring response for '{}' on event connection", response.id);
        }
        DecodedLine::Ignored => {}
    }
}
