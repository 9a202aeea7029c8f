//! # Storage Object Model
//!
//! Metadata and lifecycle of a named binary blob referenced by message
//! payloads. Two state machines live here:
//!
//! - **sync status** — what dependent messages care about: has the blob's
//!   content been confirmed synchronized with the cloud store?
//! - **transfer state** — what the storage dispatcher cares about: where in
//!   the queue/transfer pipeline the object currently sits.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                Storage Object Transfer Lifecycle                        │
//! │                                                                         │
//! │  INITIATED ──queue()──► QUEUED ──scheduler pop──► IN_PROGRESS           │
//! │      ▲                    │                           │                 │
//! │      │ set new path       │ cancel()                  │                 │
//! │      │ (reuse)            ▼                           ▼                 │
//! │  COMPLETED ◄──────── CANCELLED ◄───────────┬── {COMPLETED|FAILED}       │
//! │                                            │                            │
//! │  SYNC STATUS:  NOT_IN_SYNC ──► SYNC_PENDING ──► {IN_SYNC|SYNC_FAILED}   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A transfer owns at most one of an upload source or a download target
//! (upload xor download). Setting a new path while COMPLETED implicitly
//! resets the object to INITIATED for reuse; setting one while QUEUED or
//! IN_PROGRESS is an illegal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::StateError;

// =============================================================================
// Sync Status
// =============================================================================

/// Whether the object's content is confirmed synchronized with the cloud
/// store. Dependent messages are held back while this is `NotInSync` or
/// `SyncPending` and their dependency record is still live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    NotInSync,
    SyncPending,
    InSync,
    SyncFailed,
}

impl SyncStatus {
    /// True once the status can no longer change for this transfer.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::InSync | SyncStatus::SyncFailed)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncStatus::NotInSync => "NOT_IN_SYNC",
            SyncStatus::SyncPending => "SYNC_PENDING",
            SyncStatus::InSync => "IN_SYNC",
            SyncStatus::SyncFailed => "SYNC_FAILED",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Transfer State
// =============================================================================

/// Queue/transfer pipeline position of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    /// Created or reset, not yet queued.
    Initiated,
    /// Waiting in the storage dispatcher queue.
    Queued,
    /// Transfer handed to the transport.
    InProgress,
    /// Terminal: content transferred and confirmed.
    Completed,
    /// Terminal: transfer failed.
    Failed,
    /// Terminal: cancelled before or during transfer.
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransferState::Initiated => "INITIATED",
            TransferState::Queued => "QUEUED",
            TransferState::InProgress => "IN_PROGRESS",
            TransferState::Completed => "COMPLETED",
            TransferState::Failed => "FAILED",
            TransferState::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Transfer Direction
// =============================================================================

/// The local end of a transfer: an upload source xor a download target.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransferIo {
    /// No local end configured yet.
    #[default]
    None,
    /// Content is read from this local path and uploaded.
    UploadFrom(PathBuf),
    /// Content is downloaded into this local path.
    DownloadTo(PathBuf),
}

// =============================================================================
// Storage Object
// =============================================================================

/// Reference to a named binary blob held in the cloud storage service.
#[derive(Debug, Clone)]
pub struct StorageObject {
    /// Client-generated id, used for dependency tracking and cancellation.
    id: Uuid,
    /// Storage URI of the blob.
    uri: String,
    /// Object name within its storage container.
    name: String,
    /// MIME type.
    content_type: String,
    /// Content encoding, if any.
    encoding: Option<String>,
    /// Last-modified date reported by the storage service.
    date: Option<DateTime<Utc>>,
    /// Content length in bytes, once known.
    length: Option<u64>,
    sync_status: SyncStatus,
    transfer_state: TransferState,
    io: TransferIo,
    /// Set by `cancel` while a transfer is running; applied at the next
    /// progress tick.
    cancel_requested: bool,
}

impl StorageObject {
    /// Creates a new, unsynchronized storage object reference.
    pub fn new(uri: impl Into<String>, name: impl Into<String>, content_type: impl Into<String>) -> Self {
        StorageObject {
            id: Uuid::new_v4(),
            uri: uri.into(),
            name: name.into(),
            content_type: content_type.into(),
            encoding: None,
            date: None,
            length: None,
            sync_status: SyncStatus::NotInSync,
            transfer_state: TransferState::Initiated,
            io: TransferIo::None,
            cancel_requested: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }

    pub fn set_encoding(&mut self, encoding: impl Into<String>) {
        self.encoding = Some(encoding.into());
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.date
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sync_status
    }

    pub fn transfer_state(&self) -> TransferState {
        self.transfer_state
    }

    pub fn io(&self) -> &TransferIo {
        &self.io
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    // =========================================================================
    // Local Transfer End
    // =========================================================================

    /// Configures the object as an upload from a local path.
    ///
    /// Illegal while QUEUED or IN_PROGRESS. On a COMPLETED object this
    /// resets the lifecycle to INITIATED / NOT_IN_SYNC for reuse.
    pub fn set_upload_path(&mut self, path: impl Into<PathBuf>) -> Result<(), StateError> {
        self.set_io(TransferIo::UploadFrom(path.into()), "set input path")
    }

    /// Configures the object as a download into a local path.
    ///
    /// Same state rules as [`StorageObject::set_upload_path`].
    pub fn set_download_path(&mut self, path: impl Into<PathBuf>) -> Result<(), StateError> {
        self.set_io(TransferIo::DownloadTo(path.into()), "set output path")
    }

    fn set_io(&mut self, io: TransferIo, operation: &'static str) -> Result<(), StateError> {
        match self.transfer_state {
            TransferState::Queued | TransferState::InProgress => {
                return Err(StateError::new(operation, self.transfer_state.to_string()))
            }
            TransferState::Completed
            | TransferState::Failed
            | TransferState::Cancelled => self.reset(),
            TransferState::Initiated => {}
        }
        self.io = io;
        Ok(())
    }

    /// Returns the object to its freshly-created lifecycle position.
    fn reset(&mut self) {
        self.transfer_state = TransferState::Initiated;
        self.sync_status = SyncStatus::NotInSync;
        self.cancel_requested = false;
        self.length = None;
    }

    // =========================================================================
    // Transitions (driven by the storage dispatcher)
    // =========================================================================

    /// INITIATED → QUEUED. A COMPLETED (or otherwise terminal) object is
    /// implicitly reset first, allowing reuse for a second transfer; QUEUED
    /// and IN_PROGRESS are rejected.
    pub fn mark_queued(&mut self) -> Result<(), StateError> {
        match self.transfer_state {
            TransferState::Queued | TransferState::InProgress => {
                Err(StateError::new("queue", self.transfer_state.to_string()))
            }
            TransferState::Completed
            | TransferState::Failed
            | TransferState::Cancelled => {
                self.reset();
                self.transfer_state = TransferState::Queued;
                Ok(())
            }
            TransferState::Initiated => {
                self.transfer_state = TransferState::Queued;
                Ok(())
            }
        }
    }

    /// QUEUED → INITIATED, undoing an admission the dispatcher could not
    /// keep (for example when its queue turned out to be full). The object
    /// can be queued again.
    pub fn mark_initiated(&mut self) -> Result<(), StateError> {
        if self.transfer_state != TransferState::Queued {
            return Err(StateError::new("unqueue", self.transfer_state.to_string()));
        }
        self.transfer_state = TransferState::Initiated;
        Ok(())
    }

    /// QUEUED → IN_PROGRESS; the content also becomes SYNC_PENDING.
    pub fn mark_in_progress(&mut self) -> Result<(), StateError> {
        if self.transfer_state != TransferState::Queued {
            return Err(StateError::new("start", self.transfer_state.to_string()));
        }
        self.transfer_state = TransferState::InProgress;
        self.sync_status = SyncStatus::SyncPending;
        Ok(())
    }

    /// IN_PROGRESS → COMPLETED / IN_SYNC, recording the transferred length.
    pub fn mark_completed(&mut self, length: u64) -> Result<(), StateError> {
        if self.transfer_state != TransferState::InProgress {
            return Err(StateError::new("complete", self.transfer_state.to_string()));
        }
        self.transfer_state = TransferState::Completed;
        self.sync_status = SyncStatus::InSync;
        self.length = Some(length);
        self.date = Some(Utc::now());
        self.cancel_requested = false;
        Ok(())
    }

    /// IN_PROGRESS → FAILED / SYNC_FAILED.
    pub fn mark_failed(&mut self) -> Result<(), StateError> {
        if self.transfer_state != TransferState::InProgress {
            return Err(StateError::new("fail", self.transfer_state.to_string()));
        }
        self.transfer_state = TransferState::Failed;
        self.sync_status = SyncStatus::SyncFailed;
        self.cancel_requested = false;
        Ok(())
    }

    /// QUEUED or IN_PROGRESS → CANCELLED. The content never synchronized,
    /// so the sync status returns to NOT_IN_SYNC.
    pub fn mark_cancelled(&mut self) -> Result<(), StateError> {
        match self.transfer_state {
            TransferState::Queued | TransferState::InProgress => {
                self.transfer_state = TransferState::Cancelled;
                self.sync_status = SyncStatus::NotInSync;
                self.cancel_requested = false;
                Ok(())
            }
            other => Err(StateError::new("cancel", other.to_string())),
        }
    }

    /// Requests cancellation of a running transfer; honored at the next
    /// progress tick. No-op unless IN_PROGRESS.
    pub fn request_cancel(&mut self) {
        if self.transfer_state == TransferState::InProgress {
            self.cancel_requested = true;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
