//! Receiver half of the chunk transfer protocol.

use std::sync::Arc;

use super::sink::{DiskTarget, MemoryAccumulator, ReceiveSink, ReceivedFile, SinkKind};
use super::transfer::{ChannelMessage, ControlMessage, FileMeta, TransferError, TransferPhase, TransferProgress};

/// What a handled frame meant for the transfer
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveEvent {
    Started { meta: FileMeta, sink: SinkKind },
    Progress(TransferProgress),
    Completed(ReceivedFile),
}

struct ActiveTransfer {
    meta: FileMeta,
    sink: ReceiveSink,
    progress: TransferProgress,
}

/// Turns data-channel frames into a materialized file.
///
/// At most one transfer is active. Any error closes the active sink.
pub struct TransferReceiver {
    disk: Option<Arc<dyn DiskTarget>>,
    prefer_disk: bool,
    active: Option<ActiveTransfer>,
    last_progress: TransferProgress,
}

impl TransferReceiver {
    pub fn new(disk: Option<Arc<dyn DiskTarget>>, prefer_disk: bool) -> Self {
        Self {
            disk,
            prefer_disk,
            active: None,
            last_progress: TransferProgress::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn progress(&self) -> TransferProgress {
        self.active
            .as_ref()
            .map(|a| a.progress)
            .unwrap_or(self.last_progress)
    }

    pub async fn handle_message(
        &mut self,
        message: ChannelMessage,
    ) -> Result<Option<ReceiveEvent>, TransferError> {
        match message {
            ChannelMessage::Text(text) => match ControlMessage::decode(&text) {
                Ok(ControlMessage::Meta(meta)) => self.begin(meta).await.map(Some),
                Ok(ControlMessage::Done) => self.finish().await,
                Err(e) => {
                    log::warn!("Dropping control frame: {}", e);
                    Ok(None)
                }
            },
            ChannelMessage::Binary(data) => self.append(&data).await,
        }
    }

    /// Abort the in-flight transfer, discarding partial data
    pub async fn abort(&mut self) {
        if let Some(active) = self.active.take() {
            log::debug!("Aborting incoming transfer of {}", active.meta.name);
            self.last_progress = TransferProgress {
                phase: TransferPhase::Failed,
                ..active.progress
            };
            active.sink.abort().await;
        }
    }

    /// Abort and forget the last transfer's progress
    pub async fn reset(&mut self) {
        self.abort().await;
        self.last_progress = TransferProgress::default();
    }

    async fn begin(&mut self, meta: FileMeta) -> Result<ReceiveEvent, TransferError> {
        if let Some(stale) = self.active.take() {
            log::warn!(
                "New transfer announced while {} was still open; discarding it",
                stale.meta.name
            );
            stale.sink.abort().await;
        }
        self.last_progress = TransferProgress::default();
        meta.validate()?;

        let sink = self.open_sink(&meta).await;
        let kind = sink.kind();
        self.active = Some(ActiveTransfer {
            progress: TransferProgress::started(meta.total_size),
            meta: meta.clone(),
            sink,
        });
        Ok(ReceiveEvent::Started { meta, sink: kind })
    }

    async fn open_sink(&self, meta: &FileMeta) -> ReceiveSink {
        if self.prefer_disk {
            if let Some(disk) = &self.disk {
                match disk.open_writer(meta).await {
                    Ok(writer) => return ReceiveSink::Disk(writer),
                    Err(e) => log::warn!("Disk writer unavailable, receiving into memory: {:#}", e),
                }
            }
        }
        ReceiveSink::Memory(MemoryAccumulator::new(meta))
    }

    async fn append(&mut self, data: &[u8]) -> Result<Option<ReceiveEvent>, TransferError> {
        let Some(active) = self.active.as_mut() else {
            log::warn!("Dropping {} byte frame outside of a transfer", data.len());
            return Ok(None);
        };

        let moved = active.progress.bytes_moved + data.len() as u64;
        if moved > active.meta.total_size {
            let err = TransferError::Protocol(format!(
                "received {} bytes for a {} byte file",
                moved, active.meta.total_size
            ));
            self.abort().await;
            return Err(err);
        }

        if let Err(e) = active.sink.append(data).await {
            self.abort().await;
            return Err(e);
        }
        active.progress.bytes_moved = moved;
        Ok(Some(ReceiveEvent::Progress(active.progress)))
    }

    async fn finish(&mut self) -> Result<Option<ReceiveEvent>, TransferError> {
        let Some(active) = self.active.take() else {
            log::warn!("Dropping 'done' with no transfer in progress");
            return Ok(None);
        };

        if active.progress.bytes_moved != active.meta.total_size {
            let err = TransferError::Protocol(format!(
                "transfer ended after {} of {} bytes",
                active.progress.bytes_moved, active.meta.total_size
            ));
            self.last_progress = TransferProgress {
                phase: TransferPhase::Failed,
                ..active.progress
            };
            active.sink.abort().await;
            return Err(err);
        }

        let progress = active.progress;
        match active.sink.commit(active.meta).await {
            Ok(file) => {
                self.last_progress = TransferProgress {
                    phase: TransferPhase::Complete,
                    ..progress
                };
                Ok(Some(ReceiveEvent::Completed(file)))
            }
            Err(e) => {
                self.last_progress = TransferProgress {
                    phase: TransferPhase::Failed,
                    ..progress
                };
                Err(e)
            }
        }
    }
}
