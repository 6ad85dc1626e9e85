//! Socket transport seam.
//!
//! The connection state machine only sees a [`Connector`] producing split
//! read/write halves, so tests can drive it with channel-backed fakes
//! instead of a live WebSocket.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::error::GatewayError;

pub type WsMessage = tungstenite::Message;
pub type WsStreamItem = Result<WsMessage, tungstenite::Error>;

/// Maximum inbound frame size (4 MB).
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Opens gateway sockets. One implementation dials real WebSockets;
/// tests substitute scripted fakes.
pub trait Connector: Send + Sync + 'static {
    type Read: Stream<Item = WsStreamItem> + Send + Unpin + 'static;
    type Write: Sink<WsMessage, Error = tungstenite::Error> + Send + Unpin + 'static;

    /// Opens a socket to `url` and returns the split write/read halves.
    fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<(Self::Write, Self::Read), GatewayError>> + Send;
}

/// Production connector over tokio-tungstenite.
pub struct WsConnector;

impl Connector for WsConnector {
    type Read = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
    type Write =
        futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

    fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<(Self::Write, Self::Read), GatewayError>> + Send {
        let url = url.to_string();
        async move {
            let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
            ws_config.max_message_size = Some(MAX_FRAME_BYTES);
            ws_config.max_frame_size = Some(MAX_FRAME_BYTES);
            let (stream, _) =
                tokio_tungstenite::connect_async_with_config(&url, Some(ws_config), false).await?;
            let (write, read) = stream.split();
            Ok((write, read))
        }
    }
}

/// Writes queued messages to the socket, closing it on exit.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<WsMessage>,
    cancel: CancellationToken,
) where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                match msg {
                    Some(m) => {
                        if let Err(e) = write.send(m).await {
                            error!("WebSocket write error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = write.send(WsMessage::Close(None)).await;
}
