//! The live websocket with its write guard.

use std::pin::Pin;

use futures_util::{Sink, SinkExt as _, Stream, StreamExt as _};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use uberterm_protocol::{ClientMessage, ResizeFormat, Revision};

use crate::{Error, Result};

pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = std::result::Result<Message, WsError>> + Send>>;

/// An open, negotiated websocket.
///
/// Writers take the sink lock per frame, so frames from different loops
/// interleave only at frame boundaries. The read half is checked out by the
/// output loop for the duration of a session.
pub struct Connection {
    sink: tokio::sync::Mutex<FrameSink>,
    stream: parking_lot::Mutex<Option<FrameStream>>,
    revision: Revision,
    resize_format: ResizeFormat,
}

impl Connection {
    pub fn new<S>(ws: WebSocketStream<S>, revision: Revision, resize_format: ResizeFormat) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        Self::from_parts(Box::pin(sink), Box::pin(stream), revision, resize_format)
    }

    pub fn from_parts(
        sink: FrameSink,
        stream: FrameStream,
        revision: Revision,
        resize_format: ResizeFormat,
    ) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(sink),
            stream: parking_lot::Mutex::new(Some(stream)),
            revision,
            resize_format,
        }
    }

    #[must_use]
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Encode and send one tagged frame.
    pub async fn send(&self, message: &ClientMessage) -> Result<()> {
        let frame = message.encode(self.revision, self.resize_format);
        let message = match String::from_utf8(frame) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        self.send_message(message).await
    }

    /// Send an untagged text frame (the negotiation message).
    pub async fn send_text(&self, text: String) -> Result<()> {
        self.send_message(Message::Text(text)).await
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(message).await?;
        Ok(())
    }

    pub(crate) fn take_stream(&self) -> Result<FrameStream> {
        self.stream.lock().take().ok_or(Error::StreamInUse)
    }

    pub(crate) fn restore_stream(&self, stream: FrameStream) {
        *self.stream.lock() = Some(stream);
    }

    /// Send a close frame. Closing an already closed socket is not an error.
    pub async fn close(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        match sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("revision", &self.revision)
            .field("resize_format", &self.resize_format)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair() -> (Connection, WebSocketStream<tokio::io::DuplexStream>) {
        let (client, server) = tokio::io::duplex(4096);
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        (
            Connection::new(client, Revision::V2, ResizeFormat::Binary),
            server,
        )
    }

    #[tokio::test]
    async fn test_input_goes_out_as_text() {
        let (conn, mut server) = pair().await;
        conn.send(&ClientMessage::Input(b"ls\r".to_vec()))
            .await
            .unwrap();
        let frame = server.next().await.unwrap().unwrap();
        assert_eq!(frame, Message::Text("1ls\r".to_string()));
    }

    #[tokio::test]
    async fn test_non_utf8_goes_out_as_binary() {
        let (conn, mut server) = pair().await;
        conn.send(&ClientMessage::Input(vec![0xff, 0xfe]))
            .await
            .unwrap();
        let frame = server.next().await.unwrap().unwrap();
        assert_eq!(frame, Message::Binary(vec![b'1', 0xff, 0xfe]));
    }

    #[tokio::test]
    async fn test_stream_checkout() {
        let (conn, _server) = pair().await;
        let stream = conn.take_stream().unwrap();
        assert!(matches!(conn.take_stream(), Err(Error::StreamInUse)));
        conn.restore_stream(stream);
        assert!(conn.take_stream().is_ok());
    }

    #[tokio::test]
    async fn test_close_twice() {
        let (conn, _server) = pair().await;
        conn.close().await.unwrap();
        conn.close().await.unwrap();
    }
}
