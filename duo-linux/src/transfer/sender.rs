//! Outgoing transfers: digest, announce, stream chunks through the window, complete.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use duo_core::chunk::{chunk_count, chunk_span, SendWindow};
use duo_core::protocol::{
    new_transfer_id, FileChunk, FileChunkAck, FileTransferCancel, FileTransferComplete,
    FileTransferInit, TransferVerified, FILE_CHUNK, FILE_TRANSFER_CANCEL, FILE_TRANSFER_COMPLETE,
    FILE_TRANSFER_INIT,
};
use duo_core::Envelope;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{digest_file, TransferError, TransferSettings};
use crate::events::{Direction, TransferEvent};
use crate::transport::EnvelopeSink;

struct Outgoing {
    name: String,
    window: Mutex<SendWindow>,
    cancelled: AtomicBool,
    /// Set together with `cancelled` when the session went away.
    session_lost: AtomicBool,
}

pub struct FileSender {
    sink: Arc<dyn EnvelopeSink>,
    settings: TransferSettings,
    events: broadcast::Sender<TransferEvent>,
    outgoing: Arc<Mutex<HashMap<String, Arc<Outgoing>>>>,
}

impl FileSender {
    pub fn new(
        sink: Arc<dyn EnvelopeSink>,
        settings: TransferSettings,
        events: broadcast::Sender<TransferEvent>,
    ) -> Self {
        Self {
            sink,
            settings,
            events,
            outgoing: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Send a file. Resolves with the transfer id once every chunk is acknowledged and
    /// `fileTransferComplete` is sent; the peer's verdict arrives via `handle_verified`.
    pub async fn send_file(&self, path: &Path, mime: &str) -> Result<String, TransferError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let size = tokio::fs::metadata(path).await?.len();
        let checksum = digest_file(path).await?;
        let chunk_size = self.settings.chunk_size;
        let total = chunk_count(size, chunk_size);
        let id = new_transfer_id();

        let init = FileTransferInit {
            id: id.clone(),
            name: name.clone(),
            size,
            mime: mime.to_string(),
            chunk_size,
            checksum: Some(checksum.clone()),
        };
        let transfer = Arc::new(Outgoing {
            name: name.clone(),
            window: Mutex::new(SendWindow::new(total, self.settings.window_size)),
            cancelled: AtomicBool::new(false),
            session_lost: AtomicBool::new(false),
        });
        self.outgoing.lock().insert(id.clone(), transfer.clone());
        if !self.send(FILE_TRANSFER_INIT, &init) {
            self.outgoing.lock().remove(&id);
            return Err(TransferError::NotConnected);
        }
        info!(id = %id, name = %name, size, chunks = total, "Sending file");
        let _ = self.events.send(TransferEvent::Started {
            id: id.clone(),
            name: name.clone(),
            size,
            direction: Direction::Outgoing,
        });

        if let Err(e) = self.pump(&id, &transfer, path, size).await {
            self.fail(&id, &e);
            return Err(e);
        }

        let complete = FileTransferComplete {
            id: id.clone(),
            name,
            size,
            checksum: Some(checksum),
        };
        self.send(FILE_TRANSFER_COMPLETE, &complete);
        debug!(id = %id, "All chunks acknowledged, awaiting verification");
        self.expect_verdict(&id);
        Ok(id)
    }

    /// Stop waiting for a verdict that never arrives.
    fn expect_verdict(&self, id: &str) {
        let outgoing = self.outgoing.clone();
        let events = self.events.clone();
        let timeout = self.settings.verdict_timeout;
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if outgoing.lock().remove(&id).is_none() {
                return;
            }
            warn!(id = %id, "No verification from peer, giving up");
            let _ = events.send(TransferEvent::Failed {
                id,
                direction: Direction::Outgoing,
                reason: TransferError::NoVerdict.to_string(),
            });
        });
    }

    /// Window loop: fill fresh slots, retransmit overdue chunks, until all are acknowledged.
    async fn pump(
        &self,
        id: &str,
        transfer: &Outgoing,
        path: &Path,
        size: u64,
    ) -> Result<(), TransferError> {
        let mut file = File::open(path).await?;
        let started = Instant::now();
        let mut last_percent = None;
        loop {
            if transfer.cancelled.load(Ordering::SeqCst) {
                return Err(if transfer.session_lost.load(Ordering::SeqCst) {
                    TransferError::NotConnected
                } else {
                    TransferError::Cancelled
                });
            }
            let now = Instant::now();
            let (resend, fresh, acked, total) = {
                let mut window = transfer.window.lock();
                if window.is_complete() {
                    break;
                }
                let resend = window
                    .take_expired(now, self.settings.ack_timeout, self.settings.max_retries)
                    .map_err(|e| TransferError::RetryExceeded { index: e.index })?;
                let fresh = window.take_fresh(now);
                (resend, fresh, window.acked_count(), window.total())
            };
            for index in &resend {
                debug!(id = %id, index, "Retransmitting chunk");
            }
            for index in resend.into_iter().chain(fresh) {
                let Some((offset, len)) = chunk_span(index, size, self.settings.chunk_size) else {
                    continue;
                };
                let mut buf = vec![0u8; len];
                file.seek(SeekFrom::Start(offset)).await?;
                file.read_exact(&mut buf).await?;
                let chunk = FileChunk {
                    id: id.to_string(),
                    index,
                    chunk: BASE64.encode(&buf),
                };
                // A lost send is recovered by the ack timeout like a lost frame.
                self.send(FILE_CHUNK, &chunk);
            }

            let percent = if total == 0 {
                100
            } else {
                (acked as u64 * 100 / u64::from(total)) as u8
            };
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                let elapsed = started.elapsed().as_secs_f64();
                let sent = (acked as u64 * self.settings.chunk_size).min(size);
                let bytes_per_sec = if elapsed > 0.0 { sent as f64 / elapsed } else { 0.0 };
                let _ = self.events.send(TransferEvent::Progress {
                    id: id.to_string(),
                    percent,
                    bytes_per_sec,
                    eta: None,
                });
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
        Ok(())
    }

    /// End a transfer the send loop gave up on. Whoever removed the entry reports the outcome.
    fn fail(&self, id: &str, error: &TransferError) {
        if self.outgoing.lock().remove(id).is_none() {
            return;
        }
        warn!(id = %id, error = %error, "Outgoing transfer failed");
        self.send(FILE_TRANSFER_CANCEL, &FileTransferCancel { id: id.to_string() });
        let _ = self.events.send(TransferEvent::Failed {
            id: id.to_string(),
            direction: Direction::Outgoing,
            reason: error.to_string(),
        });
    }

    /// Session closed: stop every send loop and forget transfers awaiting a verdict.
    pub fn abort_all(&self) -> usize {
        let aborted: Vec<(String, Arc<Outgoing>)> = self.outgoing.lock().drain().collect();
        for (id, transfer) in &aborted {
            transfer.session_lost.store(true, Ordering::SeqCst);
            transfer.cancelled.store(true, Ordering::SeqCst);
            warn!(id = %id, name = %transfer.name, "Outgoing transfer aborted, session closed");
            let _ = self.events.send(TransferEvent::Failed {
                id: id.clone(),
                direction: Direction::Outgoing,
                reason: TransferError::NotConnected.to_string(),
            });
        }
        aborted.len()
    }

    pub fn handle_ack(&self, ack: FileChunkAck) {
        let transfer = self.outgoing.lock().get(&ack.id).cloned();
        match transfer {
            Some(t) => {
                t.window.lock().ack(ack.index);
            }
            None => debug!(id = %ack.id, "Ack for unknown transfer"),
        }
    }

    /// Peer's integrity verdict. Ends tracking of the transfer.
    pub fn handle_verified(&self, verdict: TransferVerified) {
        let Some(transfer) = self.outgoing.lock().remove(&verdict.id) else {
            debug!(id = %verdict.id, "Verdict for unknown transfer");
            return;
        };
        if verdict.verified {
            info!(id = %verdict.id, name = %transfer.name, "Peer verified file");
        } else {
            warn!(id = %verdict.id, name = %transfer.name, "Peer reported checksum mismatch");
        }
        let _ = self.events.send(TransferEvent::Finished {
            id: verdict.id,
            direction: Direction::Outgoing,
            verified: verdict.verified,
        });
    }

    /// Abort a local transfer and tell the peer.
    pub fn cancel_transfer(&self, id: &str) -> Result<(), TransferError> {
        let transfer = self
            .outgoing
            .lock()
            .remove(id)
            .ok_or_else(|| TransferError::UnknownTransfer(id.to_string()))?;
        transfer.cancelled.store(true, Ordering::SeqCst);
        self.send(FILE_TRANSFER_CANCEL, &FileTransferCancel { id: id.to_string() });
        info!(id = %id, "Outgoing transfer cancelled");
        let _ = self.events.send(TransferEvent::Cancelled {
            id: id.to_string(),
            direction: Direction::Outgoing,
            by_peer: false,
        });
        Ok(())
    }

    /// Peer cancelled. Returns true if the id was one of ours.
    pub fn handle_remote_cancel(&self, id: &str) -> bool {
        let Some(transfer) = self.outgoing.lock().remove(id) else {
            return false;
        };
        transfer.cancelled.store(true, Ordering::SeqCst);
        info!(id = %id, "Peer cancelled outgoing transfer");
        let _ = self.events.send(TransferEvent::Cancelled {
            id: id.to_string(),
            direction: Direction::Outgoing,
            by_peer: true,
        });
        true
    }

    pub fn active_transfers(&self) -> usize {
        self.outgoing.lock().len()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::test_support::{drain, ChannelSink};
    use std::time::Duration;

    fn settings(dir: &Path) -> TransferSettings {
        let mut s = TransferSettings::new(dir);
        s.chunk_size = 4;
        s.window_size = 2;
        s.poll_interval = Duration::from_millis(5);
        s.ack_timeout = Duration::from_millis(20);
        s.max_retries = 3;
        s
    }

    #[tokio::test]
    async fn unacked_chunk_fails_after_exact_retry_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one.bin");
        std::fs::write(&path, b"abc").unwrap();
        let (sink, mut rx) = ChannelSink::new();
        let (events, mut events_rx) = broadcast::channel(64);
        let sender = FileSender::new(Arc::new(sink), settings(dir.path()), events);

        let err = sender.send_file(&path, "application/octet-stream").await.unwrap_err();
        assert!(matches!(err, TransferError::RetryExceeded { index: 0 }));
        assert_eq!(sender.active_transfers(), 0);

        let sent = drain(&mut rx);
        let chunk_sends = sent.iter().filter(|e| e.is(FILE_CHUNK)).count();
        assert_eq!(chunk_sends, 1 + 3);
        assert!(sent.first().unwrap().is(FILE_TRANSFER_INIT));
        assert!(sent.last().unwrap().is(FILE_TRANSFER_CANCEL));
        assert!(!sent.iter().any(|e| e.is(FILE_TRANSFER_COMPLETE)));

        let mut failed = false;
        while let Ok(ev) = events_rx.try_recv() {
            failed |= matches!(ev, TransferEvent::Failed { .. });
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn acks_drive_window_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ten.bin");
        std::fs::write(&path, b"0123456789").unwrap();
        let (sink, mut rx) = ChannelSink::new();
        let (events, _) = broadcast::channel(64);
        let sender = Arc::new(FileSender::new(Arc::new(sink), settings(dir.path()), events));

        let acker = {
            let sender = sender.clone();
            tokio::spawn(async move {
                let mut chunks = Vec::new();
                while let Some(env) = rx.recv().await {
                    if env.is(FILE_CHUNK) {
                        let chunk: FileChunk = env.payload().unwrap();
                        let bytes = BASE64.decode(&chunk.chunk).unwrap();
                        chunks.push((chunk.index, bytes));
                        sender.handle_ack(FileChunkAck {
                            id: chunk.id,
                            index: chunk.index,
                        });
                    }
                    if env.is(FILE_TRANSFER_COMPLETE) {
                        return (chunks, env.payload::<FileTransferComplete>().unwrap());
                    }
                }
                panic!("sink closed");
            })
        };

        let id = sender.send_file(&path, "text/plain").await.unwrap();
        let (mut chunks, complete) = acker.await.unwrap();
        assert_eq!(complete.id, id);
        assert_eq!(complete.size, 10);
        assert_eq!(
            complete.checksum.as_deref(),
            Some(duo_core::integrity::digest_hex(b"0123456789").as_str())
        );
        chunks.sort();
        let joined: Vec<u8> = chunks.into_iter().flat_map(|(_, b)| b).collect();
        assert_eq!(joined, b"0123456789");

        // Still tracked until the verdict.
        assert_eq!(sender.active_transfers(), 1);
        sender.handle_verified(TransferVerified { id, verified: true });
        assert_eq!(sender.active_transfers(), 0);
    }

    #[tokio::test]
    async fn remote_cancel_stops_the_send_loop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![7u8; 64]).unwrap();
        let (sink, mut rx) = ChannelSink::new();
        let (events, _) = broadcast::channel(64);
        let mut s = settings(dir.path());
        s.ack_timeout = Duration::from_secs(60);
        let sender = Arc::new(FileSender::new(Arc::new(sink), s, events));

        let task = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send_file(&path, "application/octet-stream").await })
        };
        let init = rx.recv().await.unwrap();
        let init: FileTransferInit = init.payload().unwrap();
        assert!(sender.handle_remote_cancel(&init.id));
        assert!(!sender.handle_remote_cancel(&init.id));

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert!(!drain(&mut rx).iter().any(|e| e.is(FILE_TRANSFER_CANCEL)));
    }

    #[tokio::test]
    async fn local_cancel_notifies_peer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![7u8; 64]).unwrap();
        let (sink, mut rx) = ChannelSink::new();
        let (events, _) = broadcast::channel(64);
        let mut s = settings(dir.path());
        s.ack_timeout = Duration::from_secs(60);
        let sender = Arc::new(FileSender::new(Arc::new(sink), s, events));

        let task = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send_file(&path, "application/octet-stream").await })
        };
        let init: FileTransferInit = rx.recv().await.unwrap().payload().unwrap();
        sender.cancel_transfer(&init.id).unwrap();
        assert!(matches!(
            sender.cancel_transfer(&init.id),
            Err(TransferError::UnknownTransfer(_))
        ));
        assert!(matches!(task.await.unwrap(), Err(TransferError::Cancelled)));
        let sent = drain(&mut rx);
        assert_eq!(sent.iter().filter(|e| e.is(FILE_TRANSFER_CANCEL)).count(), 1);
    }

    #[tokio::test]
    async fn abort_all_stops_senders_and_forgets_pending_verdicts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![7u8; 64]).unwrap();
        let (sink, mut rx) = ChannelSink::new();
        let (events, mut events_rx) = broadcast::channel(64);
        let mut s = settings(dir.path());
        s.ack_timeout = Duration::from_secs(60);
        let sender = Arc::new(FileSender::new(Arc::new(sink), s, events));

        let task = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send_file(&path, "application/octet-stream").await })
        };
        let _init = rx.recv().await.unwrap();
        assert_eq!(sender.abort_all(), 1);
        assert_eq!(sender.active_transfers(), 0);
        assert!(matches!(task.await.unwrap(), Err(TransferError::NotConnected)));
        // No cancel goes out over a session that is already gone.
        assert!(!drain(&mut rx).iter().any(|e| e.is(FILE_TRANSFER_CANCEL)));

        let mut failures = 0;
        while let Ok(ev) = events_rx.try_recv() {
            if matches!(ev, TransferEvent::Failed { .. }) {
                failures += 1;
            }
        }
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn missing_verdict_releases_the_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.bin");
        std::fs::write(&path, b"abcdef").unwrap();
        let (sink, mut rx) = ChannelSink::new();
        let (events, mut events_rx) = broadcast::channel(64);
        let mut s = settings(dir.path());
        s.verdict_timeout = Duration::from_millis(50);
        let sender = Arc::new(FileSender::new(Arc::new(sink), s, events));

        let acker = {
            let sender = sender.clone();
            tokio::spawn(async move {
                while let Some(env) = rx.recv().await {
                    if env.is(FILE_CHUNK) {
                        let chunk: FileChunk = env.payload().unwrap();
                        sender.handle_ack(FileChunkAck {
                            id: chunk.id,
                            index: chunk.index,
                        });
                    }
                    if env.is(FILE_TRANSFER_COMPLETE) {
                        return;
                    }
                }
            })
        };
        let id = sender.send_file(&path, "application/octet-stream").await.unwrap();
        acker.await.unwrap();
        assert_eq!(sender.active_transfers(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sender.active_transfers(), 0);
        let mut timed_out = false;
        while let Ok(ev) = events_rx.try_recv() {
            if let TransferEvent::Failed { id: failed, .. } = ev {
                timed_out |= failed == id;
            }
        }
        assert!(timed_out);
        // A late verdict is ignored.
        sender.handle_verified(TransferVerified { id, verified: true });
        assert_eq!(sender.active_transfers(), 0);
    }
}
