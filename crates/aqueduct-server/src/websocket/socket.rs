//! Client socket abstraction.
//!
//! The multiplexer only needs to receive frames, send text, send a keepalive
//! Ping and close. [`FrameSocket`] captures that so the loop can be driven by
//! axum's [`WebSocket`] in production and by an in-memory channel in tests.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};

use crate::errors::SocketError;

/// A frame received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Text frame.
    Text(String),
    /// Binary frame; decoded as UTF-8 text by the multiplexer.
    Binary(Vec<u8>),
    /// Protocol Ping.
    Ping,
    /// Protocol Pong.
    Pong,
    /// Close frame.
    Close,
}

/// Duplex message socket to one client.
#[async_trait]
pub trait FrameSocket: Send {
    /// Next frame, or `None` once the socket is closed.
    ///
    /// Must be cancel-safe: it is polled inside `tokio::select!`.
    async fn recv(&mut self) -> Option<Result<Inbound, SocketError>>;

    /// Send a text frame.
    async fn send_text(&mut self, text: String) -> Result<(), SocketError>;

    /// Send a protocol Ping.
    async fn send_ping(&mut self) -> Result<(), SocketError>;

    /// Send a Close frame; errors are ignored.
    async fn close(&mut self);
}

#[async_trait]
impl FrameSocket for WebSocket {
    async fn recv(&mut self) -> Option<Result<Inbound, SocketError>> {
        let msg = WebSocket::recv(self).await?;
        Some(
            msg.map(|m| match m {
                Message::Text(text) => Inbound::Text(text.as_str().to_owned()),
                Message::Binary(data) => Inbound::Binary(data.to_vec()),
                Message::Ping(_) => Inbound::Ping,
                Message::Pong(_) => Inbound::Pong,
                Message::Close(_) => Inbound::Close,
            })
            .map_err(|e| SocketError(e.to_string())),
        )
    }

    async fn send_text(&mut self, text: String) -> Result<(), SocketError> {
        self.send(Message::Text(text.into()))
            .await
            .map_err(|e| SocketError(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), SocketError> {
        self.send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| SocketError(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.send(Message::Close(None)).await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory [`FrameSocket`] for driving the multiplexer in tests.

    use std::time::Duration;

    use serde_json::Value;
    use tokio::sync::mpsc;

    use super::*;

    /// What the server sent.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Outbound {
        Text(String),
        Ping,
        Close,
    }

    pub(crate) struct ChannelSocket {
        inbound: mpsc::UnboundedReceiver<Result<Inbound, SocketError>>,
        outbound: mpsc::UnboundedSender<Outbound>,
    }

    /// The client end of a [`ChannelSocket`].
    pub(crate) struct TestClient {
        tx: Option<mpsc::UnboundedSender<Result<Inbound, SocketError>>>,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    pub(crate) fn pair() -> (ChannelSocket, TestClient) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            ChannelSocket {
                inbound: in_rx,
                outbound: out_tx,
            },
            TestClient {
                tx: Some(in_tx),
                rx: out_rx,
            },
        )
    }

    impl TestClient {
        pub(crate) fn send(&self, frame: Inbound) {
            if let Some(tx) = &self.tx {
                let _ = tx.send(Ok(frame));
            }
        }

        pub(crate) fn send_text(&self, text: &str) {
            self.send(Inbound::Text(text.to_owned()));
        }

        pub(crate) fn send_json(&self, value: &Value) {
            self.send_text(&value.to_string());
        }

        pub(crate) fn fail(&self, reason: &str) {
            if let Some(tx) = &self.tx {
                let _ = tx.send(Err(SocketError(reason.to_owned())));
            }
        }

        /// Drop the client's sending half; the server sees end-of-stream.
        pub(crate) fn hang_up(&mut self) {
            self.tx = None;
        }

        pub(crate) async fn next(&mut self) -> Option<Outbound> {
            tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .ok()
                .flatten()
        }

        /// Next text frame as JSON, skipping keepalive Pings.
        pub(crate) async fn next_json(&mut self) -> Value {
            loop {
                match self.next().await {
                    Some(Outbound::Text(text)) => return serde_json::from_str(&text).unwrap(),
                    Some(Outbound::Ping) => {}
                    other => panic!("expected a text frame, got {other:?}"),
                }
            }
        }

        /// Everything sent so far without waiting.
        pub(crate) fn sent_so_far(&mut self) -> Vec<Outbound> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                out.push(frame);
            }
            out
        }
    }

    #[async_trait]
    impl FrameSocket for ChannelSocket {
        async fn recv(&mut self) -> Option<Result<Inbound, SocketError>> {
            self.inbound.recv().await
        }

        async fn send_text(&mut self, text: String) -> Result<(), SocketError> {
            self.outbound
                .send(Outbound::Text(text))
                .map_err(|_| SocketError("client gone".into()))
        }

        async fn send_ping(&mut self) -> Result<(), SocketError> {
            self.outbound
                .send(Outbound::Ping)
                .map_err(|_| SocketError("client gone".into()))
        }

        async fn close(&mut self) {
            let _ = self.outbound.send(Outbound::Close);
        }
    }
}
