//! File transfer manager: per-file sessions on both sides of an OFFER.
//!
//! Sender: `Offered` → ACCEPT → `Streaming` (chunks pulled one at a time by the
//! host, read sequentially from disk) → `AwaitingReceipt` → gone on FILE_RECEIVED.
//! REJECT discards the session at any point, which stops the stream.
//!
//! Receiver: `Offered` → local accept → `Accepted` → chunks assembled until every
//! index is present, then the file is written and the session discarded. A total
//! that changes mid-transfer aborts the session without writing anything.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::chunk::{self, AssemblyError, ChunkAssembly, ChunkProgress};
use crate::integrity;

/// MIME type placeholder announced in every offer.
pub const DEFAULT_FILE_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    Offered,
    Streaming,
    AwaitingReceipt,
}

/// A file we offered to a peer.
pub struct OutgoingSession {
    pub file_id: String,
    pub path: PathBuf,
    pub filename: String,
    pub size: u64,
    pub total_chunks: u64,
    pub to_user: String,
    pub to: SocketAddr,
    /// `file`-scoped token presented with the offer and every chunk.
    pub token: String,
    pub state: OutgoingState,
    reader: Option<BufReader<File>>,
    next_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingState {
    Offered,
    Accepted,
}

/// A file a peer offered to us.
pub struct IncomingSession {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub description: String,
    pub sender: String,
    pub from: SocketAddr,
    pub state: IncomingState,
    assembly: ChunkAssembly,
}

impl IncomingSession {
    pub fn received_chunks(&self) -> u64 {
        self.assembly.received()
    }
}

/// Offer metadata parsed from a FILE_OFFER.
#[derive(Debug, Clone)]
pub struct IncomingOffer {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub description: String,
    pub sender: String,
    pub from: SocketAddr,
}

/// Result of preparing an outbound offer.
#[derive(Debug, Clone)]
pub struct PreparedOffer {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub total_chunks: u64,
}

/// One chunk read from disk, ready to be wrapped in a FILE_CHUNK.
#[derive(Debug, Clone)]
pub struct OutboundChunk {
    pub file_id: String,
    pub index: u64,
    pub total: u64,
    pub payload: Vec<u8>,
    pub to_user: String,
    pub to: SocketAddr,
    pub token: String,
}

/// A completed inbound file that has been written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    pub file_id: String,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub sender: String,
    pub from: SocketAddr,
}

#[derive(Debug)]
pub enum ChunkOutcome {
    Stored { received: u64, total: u64 },
    Saved(SavedFile),
}

pub struct TransferManager {
    chunk_size: usize,
    download_dir: PathBuf,
    outgoing: HashMap<String, OutgoingSession>,
    incoming: HashMap<String, IncomingSession>,
}

impl TransferManager {
    pub fn new(chunk_size: usize, download_dir: PathBuf) -> Self {
        Self {
            chunk_size: chunk::effective_chunk_size(chunk_size),
            download_dir,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        }
    }

    // ----- sender side -----

    /// Register an outbound offer for `path`. Reads only the file's metadata.
    pub fn prepare_offer(
        &mut self,
        file_id: String,
        path: &Path,
        to_user: &str,
        to: SocketAddr,
        token: String,
    ) -> Result<PreparedOffer, TransferError> {
        let meta = std::fs::metadata(path).map_err(|e| TransferError::Io(path.to_path_buf(), e))?;
        if !meta.is_file() {
            return Err(TransferError::NotAFile(path.to_path_buf()));
        }
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::NotAFile(path.to_path_buf()))?
            .to_string();
        let size = meta.len();
        let total_chunks = chunk::total_chunks(size, self.chunk_size);
        self.outgoing.insert(
            file_id.clone(),
            OutgoingSession {
                file_id: file_id.clone(),
                path: path.to_path_buf(),
                filename: filename.clone(),
                size,
                total_chunks,
                to_user: to_user.to_string(),
                to,
                token,
                state: OutgoingState::Offered,
                reader: None,
                next_index: 0,
            },
        );
        debug!(file_id = %file_id, size, total_chunks, "offer prepared");
        Ok(PreparedOffer {
            file_id,
            filename,
            size,
            total_chunks,
        })
    }

    /// The receiver accepted: open the file and start streaming.
    pub fn on_accept(&mut self, file_id: &str) -> Result<&OutgoingSession, TransferError> {
        let path = match self.outgoing.get(file_id) {
            None => return Err(TransferError::UnknownFile(file_id.to_string())),
            Some(s) if s.state != OutgoingState::Offered => {
                return Err(TransferError::WrongState(file_id.to_string()))
            }
            Some(s) => s.path.clone(),
        };
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                self.outgoing.remove(file_id);
                return Err(TransferError::Io(path, e));
            }
        };
        let session = self
            .outgoing
            .get_mut(file_id)
            .ok_or_else(|| TransferError::UnknownFile(file_id.to_string()))?;
        session.reader = Some(BufReader::new(file));
        session.state = OutgoingState::Streaming;
        info!(file_id, to = %session.to_user, chunks = session.total_chunks, "offer accepted, streaming");
        Ok(session)
    }

    /// Read the next chunk of a streaming session. `Ok(None)` once the stream is
    /// finished or the session no longer exists (rejected, abandoned).
    pub fn next_chunk(&mut self, file_id: &str) -> Result<Option<OutboundChunk>, TransferError> {
        let Some(session) = self.outgoing.get_mut(file_id) else {
            return Ok(None);
        };
        if session.state != OutgoingState::Streaming || session.next_index >= session.total_chunks {
            return Ok(None);
        }
        let Some(reader) = session.reader.as_mut() else {
            return Ok(None);
        };
        let mut payload = Vec::with_capacity(self.chunk_size);
        if let Err(e) = reader
            .by_ref()
            .take(self.chunk_size as u64)
            .read_to_end(&mut payload)
        {
            let path = session.path.clone();
            self.outgoing.remove(file_id);
            return Err(TransferError::Io(path, e));
        }
        let index = session.next_index;
        session.next_index += 1;
        if session.next_index >= session.total_chunks {
            session.state = OutgoingState::AwaitingReceipt;
            session.reader = None;
            debug!(file_id, "all chunks read");
        }
        Ok(Some(OutboundChunk {
            file_id: file_id.to_string(),
            index,
            total: session.total_chunks,
            payload,
            to_user: session.to_user.clone(),
            to: session.to,
            token: session.token.clone(),
        }))
    }

    pub fn on_reject(&mut self, file_id: &str) -> Option<OutgoingSession> {
        self.outgoing.remove(file_id)
    }

    pub fn on_received(&mut self, file_id: &str) -> Option<OutgoingSession> {
        self.outgoing.remove(file_id)
    }

    /// Drop an outbound session that cannot continue.
    pub fn abandon_outgoing(&mut self, file_id: &str) -> Option<OutgoingSession> {
        self.outgoing.remove(file_id)
    }

    /// Drop an outbound session whose offer was never answered. A session the
    /// receiver already accepted is left alone.
    pub fn abandon_unanswered(&mut self, file_id: &str) -> Option<OutgoingSession> {
        match self.outgoing.get(file_id) {
            Some(s) if s.state == OutgoingState::Offered => self.outgoing.remove(file_id),
            _ => None,
        }
    }

    pub fn is_streaming(&self, file_id: &str) -> bool {
        self.outgoing
            .get(file_id)
            .is_some_and(|s| s.state == OutgoingState::Streaming)
    }

    pub fn outgoing(&self) -> impl Iterator<Item = &OutgoingSession> {
        self.outgoing.values()
    }

    // ----- receiver side -----

    /// Open a session for a new offer. Returns false for an id that already has one.
    pub fn on_offer(&mut self, offer: IncomingOffer) -> bool {
        if self.incoming.contains_key(&offer.file_id) {
            debug!(file_id = %offer.file_id, "duplicate offer ignored");
            return false;
        }
        self.incoming.insert(
            offer.file_id.clone(),
            IncomingSession {
                file_id: offer.file_id,
                filename: offer.filename,
                size: offer.size,
                description: offer.description,
                sender: offer.sender,
                from: offer.from,
                state: IncomingState::Offered,
                assembly: ChunkAssembly::new(),
            },
        );
        true
    }

    /// Accept a pending offer. Returns the session so the caller can address the reply.
    pub fn accept(&mut self, file_id: &str) -> Result<&IncomingSession, TransferError> {
        let session = self
            .incoming
            .get_mut(file_id)
            .ok_or_else(|| TransferError::UnknownFile(file_id.to_string()))?;
        if session.state != IncomingState::Offered {
            return Err(TransferError::WrongState(file_id.to_string()));
        }
        session.state = IncomingState::Accepted;
        Ok(session)
    }

    /// Reject (and discard) a pending offer.
    pub fn reject(&mut self, file_id: &str) -> Result<IncomingSession, TransferError> {
        self.incoming
            .remove(file_id)
            .ok_or_else(|| TransferError::UnknownFile(file_id.to_string()))
    }

    /// Store one decoded chunk; writes the file once every index is present.
    pub fn on_chunk(
        &mut self,
        file_id: &str,
        index: u64,
        total: u64,
        payload: Vec<u8>,
    ) -> Result<ChunkOutcome, TransferError> {
        let session = self
            .incoming
            .get_mut(file_id)
            .ok_or_else(|| TransferError::UnknownFile(file_id.to_string()))?;
        if session.state != IncomingState::Accepted {
            return Err(TransferError::WrongState(file_id.to_string()));
        }
        match session.assembly.insert(index, total, payload) {
            Ok(ChunkProgress::InProgress { received, total }) => {
                debug!(file_id, index, received, total, "chunk stored");
                Ok(ChunkOutcome::Stored { received, total })
            }
            Ok(ChunkProgress::Complete) => self.complete(file_id).map(ChunkOutcome::Saved),
            Err(e @ (AssemblyError::IndexOutOfRange { .. } | AssemblyError::EmptyTotal)) => {
                Err(TransferError::BadChunk(e))
            }
            Err(e) => {
                warn!(file_id, error = %e, "aborting transfer");
                self.incoming.remove(file_id);
                Err(TransferError::Aborted(e))
            }
        }
    }

    fn complete(&mut self, file_id: &str) -> Result<SavedFile, TransferError> {
        let session = self
            .incoming
            .remove(file_id)
            .ok_or_else(|| TransferError::UnknownFile(file_id.to_string()))?;
        let bytes = session
            .assembly
            .reassemble()
            .ok_or(TransferError::Incomplete)?;
        let path = integrity::safe_destination(&self.download_dir, &session.filename)
            .ok_or_else(|| TransferError::BadFilename(session.filename.clone()))?;
        std::fs::create_dir_all(&self.download_dir)
            .map_err(|e| TransferError::Io(self.download_dir.clone(), e))?;
        std::fs::write(&path, &bytes).map_err(|e| TransferError::Io(path.clone(), e))?;
        let saved = SavedFile {
            file_id: session.file_id,
            size: bytes.len() as u64,
            sha256: integrity::file_digest(&bytes),
            path,
            sender: session.sender,
            from: session.from,
        };
        info!(file_id, path = %saved.path.display(), size = saved.size, "file received");
        Ok(saved)
    }

    pub fn incoming(&self) -> impl Iterator<Item = &IncomingSession> {
        self.incoming.values()
    }

    pub fn incoming_session(&self, file_id: &str) -> Option<&IncomingSession> {
        self.incoming.get(file_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no transfer session for file id {0}")]
    UnknownFile(String),
    #[error("transfer {0} is not in a state that allows this")]
    WrongState(String),
    #[error("{0} is not a regular file")]
    NotAFile(PathBuf),
    #[error("declared filename {0:?} has no usable name component")]
    BadFilename(String),
    #[error("malformed chunk: {0}")]
    BadChunk(AssemblyError),
    #[error("transfer aborted: {0}")]
    Aborted(AssemblyError),
    #[error("transfer completed with missing chunks")]
    Incomplete,
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
}
