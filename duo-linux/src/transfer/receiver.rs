//! Incoming transfers: positional writes into a `.part` file, acks, verification.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use duo_core::chunk::{chunk_span, ReceiveProgress};
use duo_core::integrity::digests_match;
use duo_core::protocol::{
    FileChunk, FileChunkAck, FileTransferCancel, FileTransferComplete, FileTransferInit,
    TransferVerified, FILE_CHUNK_ACK, FILE_TRANSFER_CANCEL, TRANSFER_VERIFIED,
};
use duo_core::Envelope;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    digest_file, is_valid_transfer_id, sanitize_file_name, unique_destination, TransferError,
    TransferSettings,
};
use crate::events::{Direction, TransferEvent};
use crate::transport::EnvelopeSink;

struct Incoming {
    init: FileTransferInit,
    part_path: PathBuf,
    file: tokio::sync::Mutex<File>,
    progress: Mutex<ReceiveProgress>,
    cancelled: AtomicBool,
}

pub struct FileReceiver {
    sink: Arc<dyn EnvelopeSink>,
    settings: TransferSettings,
    events: broadcast::Sender<TransferEvent>,
    incoming: Mutex<HashMap<String, Arc<Incoming>>>,
}

impl FileReceiver {
    pub fn new(
        sink: Arc<dyn EnvelopeSink>,
        settings: TransferSettings,
        events: broadcast::Sender<TransferEvent>,
    ) -> Self {
        Self {
            sink,
            settings,
            events,
            incoming: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the `.part` sink sized to the declared length and start tracking.
    pub async fn handle_init(&self, mut init: FileTransferInit) -> Result<(), TransferError> {
        if !is_valid_transfer_id(&init.id) {
            warn!(id = ?init.id, "Rejecting transfer with unusable id");
            return Err(TransferError::InvalidTransferId(init.id));
        }
        if self.incoming.lock().contains_key(&init.id) {
            debug!(id = %init.id, "Duplicate init ignored");
            return Ok(());
        }
        init.name = sanitize_file_name(&init.name);
        fs::create_dir_all(&self.settings.download_dir).await?;
        let part_path = self.settings.download_dir.join(format!(".{}.part", init.id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&part_path)
            .await?;
        file.set_len(init.size).await?;

        info!(id = %init.id, name = %init.name, size = init.size, "Receiving file");
        let transfer = Arc::new(Incoming {
            progress: Mutex::new(ReceiveProgress::new(
                init.size,
                self.settings.progress_interval,
                Instant::now(),
            )),
            part_path,
            file: tokio::sync::Mutex::new(file),
            cancelled: AtomicBool::new(false),
            init,
        });
        let (id, name, size) = (
            transfer.init.id.clone(),
            transfer.init.name.clone(),
            transfer.init.size,
        );
        self.incoming.lock().insert(id.clone(), transfer);
        let _ = self.events.send(TransferEvent::Started {
            id: id.clone(),
            name,
            size,
            direction: Direction::Incoming,
        });
        let _ = self.events.send(TransferEvent::Progress {
            id,
            percent: if size == 0 { 100 } else { 0 },
            bytes_per_sec: 0.0,
            eta: None,
        });
        Ok(())
    }

    /// Write one chunk at its offset and acknowledge it. Invalid chunks are dropped unacked.
    pub async fn handle_chunk(&self, chunk: FileChunk) -> Result<(), TransferError> {
        let Some(transfer) = self.incoming.lock().get(&chunk.id).cloned() else {
            debug!(id = %chunk.id, "Chunk for unknown transfer");
            return Ok(());
        };
        let init = &transfer.init;
        let Some((offset, max_len)) = chunk_span(chunk.index, init.size, init.chunk_size) else {
            debug!(id = %chunk.id, index = chunk.index, "Chunk index out of range");
            return Ok(());
        };
        let bytes = match BASE64.decode(chunk.chunk.as_bytes()) {
            Ok(b) => b,
            Err(e) => {
                debug!(id = %chunk.id, index = chunk.index, error = %e, "Undecodable chunk");
                return Ok(());
            }
        };
        if bytes.len() > max_len {
            debug!(id = %chunk.id, index = chunk.index, len = bytes.len(), "Oversized chunk");
            return Ok(());
        }

        {
            let mut file = transfer.file.lock().await;
            if transfer.cancelled.load(Ordering::SeqCst) {
                return Ok(());
            }
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(&bytes).await?;
        }

        let snapshot = {
            let mut progress = transfer.progress.lock();
            progress.record(chunk.index, bytes.len());
            progress.sample(Instant::now())
        };
        self.send(
            FILE_CHUNK_ACK,
            &FileChunkAck {
                id: chunk.id.clone(),
                index: chunk.index,
            },
        );
        if let Some(s) = snapshot {
            let _ = self.events.send(TransferEvent::Progress {
                id: chunk.id,
                percent: s.percent,
                bytes_per_sec: s.bytes_per_sec,
                eta: s.eta,
            });
        }
        Ok(())
    }

    /// Wait for outstanding chunks, verify the digest, tell the peer, and keep or discard.
    /// Returns the final path of a verified file.
    pub async fn handle_complete(
        &self,
        complete: FileTransferComplete,
    ) -> Result<PathBuf, TransferError> {
        let transfer = self
            .incoming
            .lock()
            .get(&complete.id)
            .cloned()
            .ok_or_else(|| TransferError::UnknownTransfer(complete.id.clone()))?;

        let deadline = Instant::now() + self.settings.completion_wait;
        loop {
            if transfer.cancelled.load(Ordering::SeqCst) {
                return Err(TransferError::Cancelled);
            }
            if transfer.progress.lock().is_complete() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
        // Stop tracking before verifying so late duplicates are ignored.
        if self.incoming.lock().remove(&complete.id).is_none() {
            return Err(TransferError::Cancelled);
        }
        let id = complete.id.clone();
        let outcome = self.verify(&transfer, &complete).await;

        let verified = matches!(outcome, Ok(true));
        self.send(
            TRANSFER_VERIFIED,
            &TransferVerified {
                id: id.clone(),
                verified,
            },
        );

        let result = match outcome {
            Ok(true) => {
                let dest = unique_destination(&self.settings.download_dir, &transfer.init.name);
                fs::rename(&transfer.part_path, &dest).await.map(|_| dest)
            }
            Ok(false) => {
                let _ = fs::remove_file(&transfer.part_path).await;
                let _ = self.events.send(TransferEvent::Finished {
                    id,
                    direction: Direction::Incoming,
                    verified: false,
                });
                return Err(TransferError::ChecksumMismatch);
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(dest) => {
                info!(id = %id, path = %dest.display(), "File received and verified");
                let _ = self.events.send(TransferEvent::Finished {
                    id,
                    direction: Direction::Incoming,
                    verified: true,
                });
                Ok(dest)
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Failed to finish incoming file");
                let _ = fs::remove_file(&transfer.part_path).await;
                let _ = self.events.send(TransferEvent::Failed {
                    id,
                    direction: Direction::Incoming,
                    reason: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    async fn verify(
        &self,
        transfer: &Incoming,
        complete: &FileTransferComplete,
    ) -> std::io::Result<bool> {
        {
            let mut file = transfer.file.lock().await;
            file.flush().await?;
            file.sync_all().await?;
        }
        let received = transfer.progress.lock().received();
        if received < transfer.init.size {
            warn!(
                id = %complete.id,
                received,
                size = transfer.init.size,
                "Chunks still missing at completion"
            );
            return Ok(false);
        }
        let declared = complete
            .checksum
            .as_deref()
            .or(transfer.init.checksum.as_deref());
        let Some(declared) = declared else {
            debug!(id = %complete.id, "No checksum declared, accepting complete file");
            return Ok(true);
        };
        let computed = digest_file(&transfer.part_path).await?;
        if digests_match(declared, &computed) {
            Ok(true)
        } else {
            warn!(id = %complete.id, declared, computed = %computed, "Checksum mismatch");
            Ok(false)
        }
    }

    /// Abort a local transfer, delete partial output, tell the peer.
    pub async fn cancel_transfer(&self, id: &str) -> Result<(), TransferError> {
        let transfer = self
            .incoming
            .lock()
            .remove(id)
            .ok_or_else(|| TransferError::UnknownTransfer(id.to_string()))?;
        self.discard(&transfer).await;
        self.send(FILE_TRANSFER_CANCEL, &FileTransferCancel { id: id.to_string() });
        info!(id = %id, "Incoming transfer cancelled");
        let _ = self.events.send(TransferEvent::Cancelled {
            id: id.to_string(),
            direction: Direction::Incoming,
            by_peer: false,
        });
        Ok(())
    }

    /// Peer cancelled. Returns true if the id was one of ours.
    pub async fn handle_remote_cancel(&self, id: &str) -> bool {
        let Some(transfer) = self.incoming.lock().remove(id) else {
            return false;
        };
        self.discard(&transfer).await;
        info!(id = %id, "Peer cancelled incoming transfer");
        let _ = self.events.send(TransferEvent::Cancelled {
            id: id.to_string(),
            direction: Direction::Incoming,
            by_peer: true,
        });
        true
    }

    /// Session closed: drop every incoming transfer along with its partial file.
    pub async fn abort_all(&self) -> usize {
        let aborted: Vec<(String, Arc<Incoming>)> = self.incoming.lock().drain().collect();
        for (id, transfer) in &aborted {
            self.discard(transfer).await;
            warn!(id = %id, "Incoming transfer aborted, session closed");
            let _ = self.events.send(TransferEvent::Failed {
                id: id.clone(),
                direction: Direction::Incoming,
                reason: TransferError::NotConnected.to_string(),
            });
        }
        aborted.len()
    }

    async fn discard(&self, transfer: &Incoming) {
        transfer.cancelled.store(true, Ordering::SeqCst);
        // Wait out any in-progress write before deleting.
        let _file = transfer.file.lock().await;
        if let Err(e) = fs::remove_file(&transfer.part_path).await {
            debug!(path = %transfer.part_path.display(), error = %e, "Partial file already gone");
        }
    }

    pub fn active_transfers(&self) -> usize {
        self.incoming.lock().len()
    }

    pub fn download_dir(&self) -> &Path {
        &self.settings.download_dir
    }

    fn send<T: Serialize>(&self, kind: &str, payload: &T) -> bool {
        match Envelope::new(kind, payload) {
            Ok(env) => self.sink.send_envelope(&env),
            Err(e) => {
                warn!(kind, error = %e, "Failed to encode transfer envelope");
                false
            }
        }
    }
}
