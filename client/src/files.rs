//! Chunked file transfer bookkeeping
//!
//! Outgoing files are split into fixed-size chunks that the node sends one
//! FILE_CHUNK at a time. Incoming files are reassembled into per-index slots
//! and handed over exactly once when every slot is filled, regardless of
//! arrival order. The manager owns no sockets; it only decides what a chunk
//! or offer means and the node acts on the outcome.

use log::{debug, info, warn};
use shared::{field, CodecError, Message, MessageKind};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Offered,
    Pending,
    Receiving,
    Complete,
    Failed,
    Ignored,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Offered => "OFFERED",
            TransferStatus::Pending => "PENDING",
            TransferStatus::Receiving => "RECEIVING",
            TransferStatus::Complete => "COMPLETE",
            TransferStatus::Failed => "FAILED",
            TransferStatus::Ignored => "IGNORED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OFFERED" => Some(TransferStatus::Offered),
            "PENDING" => Some(TransferStatus::Pending),
            "RECEIVING" => Some(TransferStatus::Receiving),
            "COMPLETE" => Some(TransferStatus::Complete),
            "FAILED" => Some(TransferStatus::Failed),
            "IGNORED" => Some(TransferStatus::Ignored),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Complete | TransferStatus::Failed | TransferStatus::Ignored
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileError {
    #[error("unknown file transfer {0}")]
    UnknownTransfer(String),
    #[error("file transfer {file_id} is {status}, expected {expected}")]
    InvalidState {
        file_id: String,
        status: TransferStatus,
        expected: TransferStatus,
    },
    #[error("chunk index {index} out of range for {total} chunks")]
    ChunkOutOfRange { index: u32, total: u32 },
    #[error("file of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("offer declares {declared} chunks but {size} bytes need {expected}")]
    InconsistentOffer {
        size: u64,
        declared: u32,
        expected: u32,
    },
    #[error("chunk size must be positive")]
    ZeroChunkSize,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Number of chunks needed for `size` bytes
pub fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64) as u32
}

/// Metadata announced in FILE_OFFER
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    pub file_id: String,
    pub filename: String,
    pub filesize: u64,
    pub filetype: String,
    pub total_chunks: u32,
    pub chunk_size: usize,
    pub description: Option<String>,
}

impl FileOffer {
    /// Reads the offer fields from a FILE_OFFER message
    pub fn from_message(message: &Message) -> Result<Self, FileError> {
        let filesize: u64 = message.require_parsed(field::FILESIZE)?;
        let total_chunks: u32 = message.require_parsed(field::TOTAL_CHUNKS)?;
        let chunk_size = match message.get(field::CHUNK_SIZE) {
            Some(_) => message.require_parsed(field::CHUNK_SIZE)?,
            None => shared::DEFAULT_CHUNK_SIZE,
        };
        if chunk_size == 0 {
            return Err(FileError::ZeroChunkSize);
        }
        let expected = chunk_count(filesize, chunk_size);
        if expected != total_chunks {
            return Err(FileError::InconsistentOffer {
                size: filesize,
                declared: total_chunks,
                expected,
            });
        }

        Ok(Self {
            file_id: message.require(field::FILEID)?.to_string(),
            filename: message.require(field::FILENAME)?.to_string(),
            filesize,
            filetype: message
                .get(field::FILETYPE)
                .unwrap_or("application/octet-stream")
                .to_string(),
            total_chunks,
            chunk_size,
            description: message.get(field::DESCRIPTION).map(str::to_string),
        })
    }

    /// Exact byte length of chunk `index`; only the last chunk may be short
    pub fn chunk_len(&self, index: u32) -> usize {
        let start = index as u64 * self.chunk_size as u64;
        self.filesize
            .saturating_sub(start)
            .min(self.chunk_size as u64) as usize
    }

    /// FILE_OFFER carrying these fields; the caller adds routing and token
    pub fn to_message(&self) -> Message {
        let mut message = Message::new(MessageKind::FileOffer)
            .with(field::FILEID, self.file_id.clone())
            .with(field::FILENAME, self.filename.clone())
            .with(field::FILESIZE, self.filesize.to_string())
            .with(field::FILETYPE, self.filetype.clone())
            .with(field::TOTAL_CHUNKS, self.total_chunks.to_string())
            .with(field::CHUNK_SIZE, self.chunk_size.to_string());
        if let Some(description) = &self.description {
            message.set(field::DESCRIPTION, description.clone());
        }
        message
    }
}

/// A fully reassembled incoming file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub file_id: String,
    pub filename: String,
    pub filetype: String,
    pub sender: String,
    pub data: Vec<u8>,
}

/// What an inbound chunk did to its transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Stored { received: u32, total: u32 },
    Duplicate,
    OutOfRange,
    /// Chunk payload does not match the offered chunk layout
    WrongLength { index: u32, expected: usize, got: usize },
    /// All chunks present; fires once per transfer
    Completed(CompletedFile),
    /// Chunk arrived before the offer was accepted; transfer is now IGNORED
    AutoIgnored,
    /// Transfer already finished, ignored or failed
    Discarded(TransferStatus),
    UnknownTransfer,
}

#[derive(Debug)]
struct OutgoingTransfer {
    offer: FileOffer,
    recipient: String,
    data: Vec<u8>,
    status: TransferStatus,
    last_activity: Instant,
    finished_at: Option<Instant>,
}

#[derive(Debug)]
struct IncomingTransfer {
    offer: FileOffer,
    sender: String,
    chunks: Vec<Option<Vec<u8>>>,
    received: u32,
    status: TransferStatus,
    last_activity: Instant,
    finished_at: Option<Instant>,
}

impl IncomingTransfer {
    fn finish(&mut self, status: TransferStatus, now: Instant) {
        self.status = status;
        self.finished_at = Some(now);
        if status != TransferStatus::Complete {
            self.chunks.clear();
        }
    }

    fn reassemble(&mut self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.offer.filesize as usize);
        for chunk in self.chunks.drain(..).flatten() {
            data.extend_from_slice(&chunk);
        }
        data
    }
}

/// Snapshot of a transfer for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub file_id: String,
    pub filename: String,
    pub counterpart: String,
    pub status: TransferStatus,
    pub received: u32,
    pub total: u32,
    pub outgoing: bool,
}

/// Results of a periodic sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub failed: Vec<String>,
    pub purged: Vec<String>,
}

pub struct FileTransferManager {
    outgoing: HashMap<String, OutgoingTransfer>,
    incoming: HashMap<String, IncomingTransfer>,
    inactivity_timeout: Duration,
    retention: Duration,
    max_file_size: u64,
}

impl FileTransferManager {
    pub fn new(inactivity_timeout: Duration, retention: Duration, max_file_size: u64) -> Self {
        Self {
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            inactivity_timeout,
            retention,
            max_file_size,
        }
    }

    /// Registers an outgoing file in OFFERED and returns its offer
    pub fn offer(
        &mut self,
        recipient: &str,
        filename: &str,
        filetype: &str,
        data: Vec<u8>,
        chunk_size: usize,
        description: Option<String>,
    ) -> Result<FileOffer, FileError> {
        if chunk_size == 0 {
            return Err(FileError::ZeroChunkSize);
        }
        let size = data.len() as u64;
        if size > self.max_file_size {
            return Err(FileError::TooLarge {
                size,
                limit: self.max_file_size,
            });
        }

        let offer = FileOffer {
            file_id: shared::new_message_id(),
            filename: filename.to_string(),
            filesize: size,
            filetype: filetype.to_string(),
            total_chunks: chunk_count(size, chunk_size),
            chunk_size,
            description,
        };
        info!(
            "Offering {} ({} bytes, {} chunks) to {}",
            filename, size, offer.total_chunks, recipient
        );
        self.outgoing.insert(
            offer.file_id.clone(),
            OutgoingTransfer {
                offer: offer.clone(),
                recipient: recipient.to_string(),
                data,
                status: TransferStatus::Offered,
                last_activity: Instant::now(),
                finished_at: None,
            },
        );
        Ok(offer)
    }

    /// Payload of chunk `index` of an outgoing file, with the chunk total
    pub fn outgoing_chunk(&mut self, file_id: &str, index: u32) -> Result<(u32, Vec<u8>), FileError> {
        let transfer = self
            .outgoing
            .get_mut(file_id)
            .ok_or_else(|| FileError::UnknownTransfer(file_id.to_string()))?;
        if transfer.status != TransferStatus::Offered {
            return Err(FileError::InvalidState {
                file_id: file_id.to_string(),
                status: transfer.status,
                expected: TransferStatus::Offered,
            });
        }

        let total = transfer.offer.total_chunks;
        let chunk = transfer
            .data
            .chunks(transfer.offer.chunk_size)
            .nth(index as usize)
            .ok_or(FileError::ChunkOutOfRange { index, total })?;
        transfer.last_activity = Instant::now();
        Ok((total, chunk.to_vec()))
    }

    pub fn recipient_of(&self, file_id: &str) -> Option<&str> {
        self.outgoing
            .get(file_id)
            .map(|transfer| transfer.recipient.as_str())
    }

    /// Applies a FILE_RECEIVED report from the recipient of an outgoing file
    pub fn on_receipt(&mut self, file_id: &str, from: &str, status: TransferStatus) -> Option<TransferStatus> {
        let transfer = self.outgoing.get_mut(file_id)?;
        if transfer.recipient != from {
            warn!("FILE_RECEIVED for {} from {} who is not the recipient", file_id, from);
            return None;
        }
        if transfer.status.is_terminal() {
            return None;
        }
        if !matches!(status, TransferStatus::Complete | TransferStatus::Ignored) {
            return None;
        }

        transfer.status = status;
        transfer.finished_at = Some(Instant::now());
        transfer.data = Vec::new();
        info!("{} reported {} for {}", from, status, transfer.offer.filename);
        Some(status)
    }

    /// Records an inbound offer in PENDING; false when the id was already known
    pub fn on_offer(&mut self, sender: &str, offer: FileOffer) -> Result<bool, FileError> {
        if self.incoming.contains_key(&offer.file_id) {
            debug!("Repeated offer for {}", offer.file_id);
            return Ok(false);
        }
        if offer.filesize > self.max_file_size {
            return Err(FileError::TooLarge {
                size: offer.filesize,
                limit: self.max_file_size,
            });
        }

        info!(
            "{} offers {} ({} bytes)",
            sender, offer.filename, offer.filesize
        );
        self.incoming.insert(
            offer.file_id.clone(),
            IncomingTransfer {
                chunks: vec![None; offer.total_chunks as usize],
                offer,
                sender: sender.to_string(),
                received: 0,
                status: TransferStatus::Pending,
                last_activity: Instant::now(),
                finished_at: None,
            },
        );
        Ok(true)
    }

    /// PENDING -> RECEIVING. An empty file completes immediately.
    pub fn accept(&mut self, file_id: &str) -> Result<Option<CompletedFile>, FileError> {
        let transfer = self.pending_incoming(file_id)?;
        let now = Instant::now();
        transfer.status = TransferStatus::Receiving;
        transfer.last_activity = now;
        info!("Accepted {} from {}", transfer.offer.filename, transfer.sender);

        if transfer.offer.total_chunks == 0 {
            transfer.finish(TransferStatus::Complete, now);
            return Ok(Some(CompletedFile {
                file_id: file_id.to_string(),
                filename: transfer.offer.filename.clone(),
                filetype: transfer.offer.filetype.clone(),
                sender: transfer.sender.clone(),
                data: Vec::new(),
            }));
        }
        Ok(None)
    }

    /// PENDING -> IGNORED; returns the sender to notify
    pub fn ignore(&mut self, file_id: &str) -> Result<String, FileError> {
        let transfer = self.pending_incoming(file_id)?;
        transfer.finish(TransferStatus::Ignored, Instant::now());
        info!("Ignored {} from {}", transfer.offer.filename, transfer.sender);
        Ok(transfer.sender.clone())
    }

    fn pending_incoming(&mut self, file_id: &str) -> Result<&mut IncomingTransfer, FileError> {
        let transfer = self
            .incoming
            .get_mut(file_id)
            .ok_or_else(|| FileError::UnknownTransfer(file_id.to_string()))?;
        if transfer.status != TransferStatus::Pending {
            return Err(FileError::InvalidState {
                file_id: file_id.to_string(),
                status: transfer.status,
                expected: TransferStatus::Pending,
            });
        }
        Ok(transfer)
    }

    /// Stores an inbound chunk and reports what it did
    pub fn on_chunk(
        &mut self,
        file_id: &str,
        sender: &str,
        index: u32,
        total: u32,
        data: Vec<u8>,
    ) -> ChunkOutcome {
        let Some(transfer) = self.incoming.get_mut(file_id) else {
            return ChunkOutcome::UnknownTransfer;
        };
        if transfer.sender != sender {
            debug!("Chunk for {} from {} who did not offer it", file_id, sender);
            return ChunkOutcome::UnknownTransfer;
        }

        let now = Instant::now();
        match transfer.status {
            TransferStatus::Pending => {
                transfer.finish(TransferStatus::Ignored, now);
                info!(
                    "Chunk for unaccepted {} arrived, ignoring transfer",
                    transfer.offer.filename
                );
                return ChunkOutcome::AutoIgnored;
            }
            TransferStatus::Receiving => {}
            other => return ChunkOutcome::Discarded(other),
        }

        if total != transfer.offer.total_chunks || index >= transfer.offer.total_chunks {
            debug!(
                "Chunk {}/{} outside {} chunks of {}",
                index, total, transfer.offer.total_chunks, file_id
            );
            return ChunkOutcome::OutOfRange;
        }

        let expected = transfer.offer.chunk_len(index);
        if data.len() != expected {
            debug!(
                "Chunk {} of {} has {} bytes, expected {}",
                index,
                file_id,
                data.len(),
                expected
            );
            return ChunkOutcome::WrongLength {
                index,
                expected,
                got: data.len(),
            };
        }

        transfer.last_activity = now;
        let slot = &mut transfer.chunks[index as usize];
        if slot.is_some() {
            return ChunkOutcome::Duplicate;
        }
        *slot = Some(data);
        transfer.received += 1;

        if transfer.received < transfer.offer.total_chunks {
            debug!(
                "Stored chunk {} of {} ({}/{})",
                index, transfer.offer.filename, transfer.received, transfer.offer.total_chunks
            );
            return ChunkOutcome::Stored {
                received: transfer.received,
                total: transfer.offer.total_chunks,
            };
        }

        let data = transfer.reassemble();
        if data.len() as u64 != transfer.offer.filesize {
            warn!(
                "Reassembled {} is {} bytes, offer said {}",
                transfer.offer.filename,
                data.len(),
                transfer.offer.filesize
            );
            transfer.finish(TransferStatus::Failed, now);
            return ChunkOutcome::Discarded(TransferStatus::Failed);
        }
        transfer.finish(TransferStatus::Complete, now);
        info!(
            "File transfer of {} is complete ({} bytes)",
            transfer.offer.filename,
            data.len()
        );
        ChunkOutcome::Completed(CompletedFile {
            file_id: file_id.to_string(),
            filename: transfer.offer.filename.clone(),
            filetype: transfer.offer.filetype.clone(),
            sender: transfer.sender.clone(),
            data,
        })
    }

    /// Fails stalled transfers and purges finished ones past retention
    pub fn sweep(&mut self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let inactivity = self.inactivity_timeout;
        let retention = self.retention;

        for (file_id, transfer) in self.incoming.iter_mut() {
            let stalled = matches!(
                transfer.status,
                TransferStatus::Pending | TransferStatus::Receiving
            ) && now.saturating_duration_since(transfer.last_activity) > inactivity;
            if stalled {
                warn!(
                    "Transfer of {} from {} stalled at {}/{} chunks",
                    transfer.offer.filename,
                    transfer.sender,
                    transfer.received,
                    transfer.offer.total_chunks
                );
                transfer.finish(TransferStatus::Failed, now);
                report.failed.push(file_id.clone());
            }
        }
        for (file_id, transfer) in self.outgoing.iter_mut() {
            if transfer.status == TransferStatus::Offered
                && now.saturating_duration_since(transfer.last_activity) > inactivity
            {
                warn!("No receipt for {} from {}", transfer.offer.filename, transfer.recipient);
                transfer.status = TransferStatus::Failed;
                transfer.finished_at = Some(now);
                transfer.data = Vec::new();
                report.failed.push(file_id.clone());
            }
        }

        let expired = |finished_at: Option<Instant>| {
            finished_at.map_or(false, |at| now.saturating_duration_since(at) > retention)
        };
        self.incoming.retain(|file_id, transfer| {
            let keep = !expired(transfer.finished_at);
            if !keep {
                report.purged.push(file_id.clone());
            }
            keep
        });
        self.outgoing.retain(|file_id, transfer| {
            let keep = !expired(transfer.finished_at);
            if !keep {
                report.purged.push(file_id.clone());
            }
            keep
        });
        report
    }

    pub fn status(&self, file_id: &str) -> Option<TransferStatus> {
        self.incoming
            .get(file_id)
            .map(|t| t.status)
            .or_else(|| self.outgoing.get(file_id).map(|t| t.status))
    }

    pub fn progress(&self, file_id: &str) -> Option<TransferProgress> {
        if let Some(t) = self.incoming.get(file_id) {
            return Some(TransferProgress {
                file_id: file_id.to_string(),
                filename: t.offer.filename.clone(),
                counterpart: t.sender.clone(),
                status: t.status,
                received: t.received,
                total: t.offer.total_chunks,
                outgoing: false,
            });
        }
        self.outgoing.get(file_id).map(|t| TransferProgress {
            file_id: file_id.to_string(),
            filename: t.offer.filename.clone(),
            counterpart: t.recipient.clone(),
            status: t.status,
            received: 0,
            total: t.offer.total_chunks,
            outgoing: true,
        })
    }

    pub fn transfers(&self) -> Vec<TransferProgress> {
        let mut all: Vec<TransferProgress> = self
            .incoming
            .keys()
            .chain(self.outgoing.keys())
            .filter_map(|id| self.progress(id))
            .collect();
        all.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        all
    }
}
