//! WebSocket framing for a [`Multiplexer`].
//!
//! Each end runs one pump task that moves outbound frames from the
//! multiplexer onto the socket and hands inbound text frames back to it.
//! The pump ends when the peer closes, when the multiplexer drops its
//! writer, or when the shutdown token is cancelled.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::mux::Multiplexer;

/// Accept the WebSocket handshake on `stream` and pump frames for `mux`.
pub async fn serve(stream: TcpStream, mux: Multiplexer, shutdown: CancellationToken) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let socket = tokio_tungstenite::accept_async(stream).await?;
    debug!(?peer, "accepted worker connection");
    pump(socket, mux, shutdown).await
}

/// Connect to the host at `url`, announce readiness and pump frames.
pub async fn connect(url: &str, mux: Multiplexer, shutdown: CancellationToken) -> Result<()> {
    let (socket, _) = tokio_tungstenite::connect_async(url).await?;
    debug!(url, "connected to host");
    pump(socket, mux, shutdown).await
}

async fn pump<S>(socket: WebSocketStream<S>, mux: Multiplexer, shutdown: CancellationToken) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut outbound = mux.attach()?;
    let (mut sink, mut stream) = socket.split();

    let result = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break Ok(());
            }
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if let Err(error) = sink.send(Message::text(text)).await {
                        break Err(error.into());
                    }
                }
                None => {
                    // The multiplexer was cleared.
                    let _ = sink.send(Message::Close(None)).await;
                    break Ok(());
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Err(error) = mux.receive_frame(text.as_str()) {
                        warn!(%error, "dropping malformed frame");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(tungstenite::Error::ConnectionClosed)) => break Ok(()),
                Some(Err(error)) => break Err(error.into()),
            },
        }
    };

    mux.detach();
    debug!(ok = result.is_ok(), "connection closed");
    result
}
