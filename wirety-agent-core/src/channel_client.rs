//! Agent-side half of the distribution channel (§4.4/§4.7): dials the
//! server over `tokio-tungstenite`, presents the enrollment token in the
//! handshake, and thereafter exchanges newline-delimited JSON `Frame`s.
//!
//! The REDESIGN FLAGS call for exposing this as a small capability —
//! `{transport} = {read_frame, write_frame, close}` — injected at
//! startup, the same way `wirety-server::channel::Transport` is kept
//! behind a trait so the reconciliation loop is testable without a real
//! socket.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use wirety_core::wire::Frame;

use crate::error::AgentError;

#[async_trait::async_trait]
pub trait ChannelTransport: Send {
    async fn read_frame(&mut self) -> Result<Option<Frame>, AgentError>;
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), AgentError>;
    async fn close(&mut self) -> Result<(), AgentError>;
}

pub struct WsChannelClient {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl WsChannelClient {
    /// Dials `server_url` (e.g. `wss://mesh.example.com:8080/v1/channel`)
    /// with the enrollment token appended as a query parameter, per §4.7
    /// step 1 ("presents an enrollment token over the distribution
    /// channel's handshake").
    pub async fn connect(server_url: &str, enrollment_token: &str) -> Result<Self, AgentError> {
        let separator = if server_url.contains('?') { "&" } else { "?" };
        let url = format!("{server_url}{separator}token={enrollment_token}");
        let (stream, _response) = connect_async(&url)
            .await
            .map_err(|e| AgentError::Transport(format!("failed to connect to {server_url}: {e}")))?;
        Ok(Self { stream })
    }
}

#[async_trait::async_trait]
impl ChannelTransport for WsChannelClient {
    async fn read_frame(&mut self) -> Result<Option<Frame>, AgentError> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => {
                    let frame = serde_json::from_str(&text)
                        .map_err(|e| AgentError::Protocol(format!("malformed frame: {e}")))?;
                    return Ok(Some(frame));
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(AgentError::Transport(format!("channel read failed: {e}"))),
            }
        }
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<(), AgentError> {
        let text = serde_json::to_string(frame).map_err(|e| AgentError::Protocol(e.to_string()))?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| AgentError::Transport(format!("channel write failed: {e}")))
    }

    async fn close(&mut self) -> Result<(), AgentError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| AgentError::Transport(format!("channel close failed: {e}")))
    }
}

/// Deterministic in-memory double for reconciler tests, mirroring the
/// server's `CountingTransport` test harness.
#[cfg(test)]
pub mod test_support {
    use std::collections::VecDeque;

    use super::*;

    #[derive(Default)]
    pub struct RecordingTransport {
        pub incoming: VecDeque<Frame>,
        pub outgoing: Vec<Frame>,
        pub closed: bool,
    }

    #[async_trait::async_trait]
    impl ChannelTransport for RecordingTransport {
        async fn read_frame(&mut self) -> Result<Option<Frame>, AgentError> {
            Ok(self.incoming.pop_front())
        }

        async fn write_frame(&mut self, frame: &Frame) -> Result<(), AgentError> {
            self.outgoing.push(frame.clone());
            Ok(())
        }

        async fn close(&mut self) -> Result<(), AgentError> {
            self.closed = true;
            Ok(())
        }
    }
}
