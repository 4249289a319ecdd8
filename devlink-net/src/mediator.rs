//! WebSocket dialer for the long-lived mediator (D2M) session.
//!
//! Unlike the rendezvous relay, each WebSocket message here is exactly one
//! mediator frame — no accumulation across messages is needed.

use devlink_wire::framing::MediatorFrame;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::WsError;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// An open connection to the mediator.
pub struct MediatorSocket {
    ws: WsStream,
}

impl MediatorSocket {
    /// Dial the mediator at `url` (built by [`crate::urls::mediator_url`]).
    pub async fn connect(url: &str) -> Result<Self, WsError> {
        let (ws, _response) = connect_async(url).await.map_err(|e| WsError::Connect(e.to_string()))?;
        tracing::debug!(%url, "mediator connection open");
        Ok(Self { ws })
    }

    /// Send one mediator frame: `type:u8 || reserved:3 || payload`.
    pub async fn send_frame(&mut self, frame_type: u8, payload: Vec<u8>) -> Result<(), WsError> {
        let frame = MediatorFrame::new(frame_type, payload);
        self.ws
            .send(Message::Binary(frame.encode().into()))
            .await
            .map_err(|e| WsError::Io(e.to_string()))
    }

    /// Receive the next mediator frame.
    pub async fn recv_frame(&mut self) -> Result<MediatorFrame, WsError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(bytes))) => {
                    return MediatorFrame::decode(&bytes).map_err(|e| WsError::Io(e.to_string()));
                }
                Some(Ok(Message::Close(_))) | None => return Err(WsError::Closed),
                Some(Ok(_other)) => continue,
                Some(Err(e)) => return Err(WsError::Io(e.to_string())),
            }
        }
    }

    /// Close the connection (e.g. on leader loss or host shutdown).
    pub async fn close(mut self) -> Result<(), WsError> {
        self.ws.close(None).await.map_err(|e| WsError::Io(e.to_string()))
    }
}
