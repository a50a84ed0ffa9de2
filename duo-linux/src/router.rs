//! Dispatch inbound envelopes by type to the transfer engine or an external handler.

use std::sync::Arc;

use duo_core::protocol::{
    FileChunk, FileChunkAck, FileTransferCancel, FileTransferComplete, FileTransferInit,
    TransferVerified, FILE_CHUNK, FILE_CHUNK_ACK, FILE_TRANSFER_CANCEL, FILE_TRANSFER_COMPLETE,
    FILE_TRANSFER_INIT, PEER_INFO, TRANSFER_VERIFIED,
};
use duo_core::Envelope;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::SessionEvent;
use crate::transfer::{FileReceiver, FileSender};

/// Receives every envelope type the router does not handle itself
/// (clipboard, notifications, media control and the like).
pub trait ExternalHandler: Send + Sync {
    fn handle(&self, envelope: &Envelope);
}

/// Default handler: log and drop.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl ExternalHandler for LoggingHandler {
    fn handle(&self, envelope: &Envelope) {
        info!(kind = %envelope.kind, "Unhandled message type");
    }
}

#[derive(Clone)]
pub struct MessageRouter {
    sender: Arc<FileSender>,
    receiver: Arc<FileReceiver>,
    external: Arc<dyn ExternalHandler>,
}

impl MessageRouter {
    pub fn new(
        sender: Arc<FileSender>,
        receiver: Arc<FileReceiver>,
        external: Arc<dyn ExternalHandler>,
    ) -> Self {
        Self {
            sender,
            receiver,
            external,
        }
    }

    /// Handle one envelope. Chunk writes complete before returning so they stay ordered;
    /// completion runs in its own task because it waits for outstanding chunks.
    pub async fn dispatch(&self, envelope: Envelope) {
        match envelope.kind.as_str() {
            FILE_TRANSFER_INIT => {
                if let Some(init) = typed::<FileTransferInit>(&envelope) {
                    if let Err(e) = self.receiver.handle_init(init).await {
                        warn!(error = %e, "Failed to start incoming transfer");
                    }
                }
            }
            FILE_CHUNK => {
                if let Some(chunk) = typed::<FileChunk>(&envelope) {
                    if let Err(e) = self.receiver.handle_chunk(chunk).await {
                        warn!(error = %e, "Failed to write chunk");
                    }
                }
            }
            FILE_TRANSFER_COMPLETE => {
                if let Some(complete) = typed::<FileTransferComplete>(&envelope) {
                    let receiver = self.receiver.clone();
                    tokio::spawn(async move {
                        let id = complete.id.clone();
                        if let Err(e) = receiver.handle_complete(complete).await {
                            debug!(id = %id, error = %e, "Incoming transfer did not complete");
                        }
                    });
                }
            }
            FILE_CHUNK_ACK => {
                if let Some(ack) = typed::<FileChunkAck>(&envelope) {
                    self.sender.handle_ack(ack);
                }
            }
            TRANSFER_VERIFIED => {
                if let Some(verdict) = typed::<TransferVerified>(&envelope) {
                    self.sender.handle_verified(verdict);
                }
            }
            FILE_TRANSFER_CANCEL => {
                if let Some(cancel) = typed::<FileTransferCancel>(&envelope) {
                    let ours = self.sender.handle_remote_cancel(&cancel.id)
                        | self.receiver.handle_remote_cancel(&cancel.id).await;
                    if !ours {
                        debug!(id = %cancel.id, "Cancel for unknown transfer");
                    }
                }
            }
            PEER_INFO => {}
            _ => self.external.handle(&envelope),
        }
    }

    /// Transfers cannot outlive the session that carries them.
    pub async fn session_closed(&self) {
        let outgoing = self.sender.abort_all();
        let incoming = self.receiver.abort_all().await;
        if outgoing + incoming > 0 {
            info!(outgoing, incoming, "Session closed, aborted transfers");
        }
    }

    /// Consume the session feed until the connection manager drops it.
    pub async fn run(self, mut feed: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = feed.recv().await {
            match event {
                SessionEvent::Message(envelope) => self.dispatch(envelope).await,
                SessionEvent::Closed => self.session_closed().await,
            }
        }
    }
}

fn typed<T: DeserializeOwned>(envelope: &Envelope) -> Option<T> {
    match envelope.payload::<T>() {
        Ok(p) => Some(p),
        Err(e) => {
            warn!(kind = %envelope.kind, error = %e, "Dropping malformed payload");
            None
        }
    }
}
