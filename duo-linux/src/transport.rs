//! Transport seam: a link is a pair of text-frame channels. WebSocket dialer for production.

use std::future::Future;

use duo_core::Envelope;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Open full-duplex message link. Dropping `outbound` closes the connection; `inbound`
/// yields None once the remote side has gone away.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens links. Injected into the connection manager so tests can use in-memory links.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, url: &str) -> impl Future<Output = std::io::Result<Link>> + Send;
}

/// Send primitive shared by every subsystem that talks to the peer.
pub trait EnvelopeSink: Send + Sync {
    /// Queue an envelope for the peer. False if there is no open transport.
    fn send_envelope(&self, envelope: &Envelope) -> bool;
}

/// `ws://<ip>:<port>/socket`, bracketing IPv6 literals.
pub fn socket_url(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("ws://[{ip}]:{port}/socket")
    } else {
        format!("ws://{ip}:{port}/socket")
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WsDialer;

impl Dialer for WsDialer {
    async fn dial(&self, url: &str) -> std::io::Result<Link> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e))?;
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        let writer_url = url.to_string();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(url = %writer_url, error = %e, "WebSocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_url = url.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(text).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => {
                                if in_tx.send(text).is_err() {
                                    break;
                                }
                            }
                            Err(_) => debug!(url = %reader_url, "Dropping non-UTF-8 binary frame"),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(url = %reader_url, error = %e, "WebSocket read failed");
                            break;
                        }
                    },
                    _ = in_tx.closed() => break,
                }
            }
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
