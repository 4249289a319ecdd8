//! WebSocket dialer for the rendezvous relay.
//!
//! The relay multiplexes arbitrary byte chunks onto WebSocket binary
//! messages, so logical frames (`u32-LE length || payload`) can split
//! across messages or arrive bundled; [`RelayFrameDecoder`] handles both.

use devlink_wire::framing::{encode_relay_frame, RelayFrameDecoder};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::WsError;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// An open connection to the rendezvous relay.
pub struct RendezvousSocket {
    ws: WsStream,
    decoder: RelayFrameDecoder,
}

impl RendezvousSocket {
    /// Dial the rendezvous relay at `url` (built by [`crate::urls::rendezvous_url`]).
    pub async fn connect(url: &str) -> Result<Self, WsError> {
        let (ws, _response) = connect_async(url).await.map_err(|e| WsError::Connect(e.to_string()))?;
        tracing::debug!(%url, "rendezvous relay connection open");
        Ok(Self { ws, decoder: RelayFrameDecoder::new() })
    }

    /// Send one logical frame, relay-framed as `u32-LE length || payload`.
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), WsError> {
        self.ws
            .send(Message::Binary(encode_relay_frame(payload).into()))
            .await
            .map_err(|e| WsError::Io(e.to_string()))
    }

    /// Receive the next complete logical frame, reading further WebSocket
    /// messages as needed until one is available.
    pub async fn recv_frame(&mut self) -> Result<Vec<u8>, WsError> {
        loop {
            if let Some(frame) = self.decoder.pop_frame() {
                return Ok(frame);
            }
            match self.ws.next().await {
                Some(Ok(Message::Binary(bytes))) => self.decoder.push(&bytes),
                Some(Ok(Message::Close(_))) | None => return Err(WsError::Closed),
                Some(Ok(_other)) => continue,
                Some(Err(e)) => return Err(WsError::Io(e.to_string())),
            }
        }
    }

    /// Close the connection cleanly (used once `Registered` has been sent).
    pub async fn close(mut self) -> Result<(), WsError> {
        self.ws.close(None).await.map_err(|e| WsError::Io(e.to_string()))
    }
}
