//! # Transport Boundary
//!
//! The wire transport (HTTPS or MQTT plumbing) and the credential store are
//! collaborators, not part of this crate. The dispatchers reach them through
//! a channel: each network operation is a [`TransportRequest`] with a oneshot
//! reply, so the scheduler loops never hold references into transport
//! internals and mock transports in tests are just a task draining the
//! receiver.
//!
//! ## Request Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Transport Boundary                                 │
//! │                                                                         │
//! │  MessageDispatcher ──SendReceive{batch, reply}──►┐                      │
//! │  MessageDispatcher ──Refresh{reply}────────────► │  transport task      │
//! │  StorageDispatcher ──Transfer{desc, progress}──► │  (HTTPS client,      │
//! │                                                  │   or test mock)      │
//! │          ◄─────────────oneshot replies───────────┘                      │
//! │                                                                         │
//! │  Session flags (authenticated / refresh-in-flight) are explicit        │
//! │  shared state, not closure captures.                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use cloudlink_core::{Message, TransferIo};

use crate::error::TransportError;

// =============================================================================
// Transfer Descriptor & Progress
// =============================================================================

/// Everything the transport needs to move one storage object's content.
#[derive(Debug, Clone)]
pub struct TransferDescriptor {
    pub object_id: Uuid,
    pub uri: String,
    pub name: String,
    pub content_type: String,
    /// Upload source xor download target.
    pub io: TransferIo,
}

/// Progress tick emitted by the transport while a transfer runs.
#[derive(Debug, Clone, Copy)]
pub struct TransferProgress {
    pub object_id: Uuid,
    pub bytes: u64,
    pub total: Option<u64>,
}

// =============================================================================
// Transport Requests
// =============================================================================

/// One operation asked of the transport collaborator.
#[derive(Debug)]
pub enum TransportRequest {
    /// Send a batch and collect whatever the server has pending.
    ///
    /// An empty `messages` with `long_poll = true` is the held-open receive
    /// call; `accept_bytes` is the buffer budget offered to the server.
    SendReceive {
        messages: Vec<Message>,
        accept_bytes: usize,
        long_poll: bool,
        timeout: Duration,
        reply: oneshot::Sender<Result<Vec<Message>, TransportError>>,
    },

    /// Refresh the bearer credentials after a 401-class failure.
    Refresh {
        reply: oneshot::Sender<Result<(), TransportError>>,
    },

    /// Move one storage object's content, reporting progress along the way.
    /// The reply carries the transferred byte count.
    Transfer {
        descriptor: TransferDescriptor,
        progress: mpsc::Sender<TransferProgress>,
        reply: oneshot::Sender<Result<u64, TransportError>>,
    },
}

// =============================================================================
// Transport Handle
// =============================================================================

/// Cloneable sender side of the transport boundary.
#[derive(Clone)]
pub struct TransportHandle {
    request_tx: mpsc::Sender<TransportRequest>,
}

/// Creates the transport channel pair. The receiver goes to the transport
/// implementation (or a test mock); handles go to the dispatchers.
pub fn transport_channel(buffer: usize) -> (TransportHandle, mpsc::Receiver<TransportRequest>) {
    let (request_tx, request_rx) = mpsc::channel(buffer);
    (TransportHandle { request_tx }, request_rx)
}

impl TransportHandle {
    /// Sends a batch and awaits the received messages, bounded by `timeout`.
    pub async fn send_receive(
        &self,
        messages: Vec<Message>,
        accept_bytes: usize,
        long_poll: bool,
        timeout: Duration,
    ) -> Result<Vec<Message>, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(TransportRequest::SendReceive {
                messages,
                accept_bytes,
                long_poll,
                timeout,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::new(None, "transport channel closed"))?;

        // The transport is expected to honor the timeout itself; this outer
        // bound protects the scheduler from a stalled implementation.
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::new(None, "transport dropped the reply")),
            Err(_) => Err(TransportError::new(
                None,
                format!("send/receive timed out after {:?}", timeout),
            )),
        }
    }

    /// Asks the credential collaborator for fresh bearer credentials.
    pub async fn refresh(&self) -> Result<(), TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(TransportRequest::Refresh { reply: reply_tx })
            .await
            .map_err(|_| TransportError::new(None, "transport channel closed"))?;

        reply_rx
            .await
            .map_err(|_| TransportError::new(None, "transport dropped the reply"))?
    }

    /// Runs one content transfer to completion, streaming progress ticks
    /// into `progress`.
    pub async fn transfer(
        &self,
        descriptor: TransferDescriptor,
        progress: mpsc::Sender<TransferProgress>,
    ) -> Result<u64, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(TransportRequest::Transfer {
                descriptor,
                progress,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::new(None, "transport channel closed"))?;

        reply_rx
            .await
            .map_err(|_| TransportError::new(None, "transport dropped the reply"))?
    }
}

// =============================================================================
// Session State
// =============================================================================

/// Shared authentication flags consulted by the scheduler sweep.
///
/// Two explicit invariants live here:
/// - a sweep never sends against an unauthenticated or stale session
/// - at most one credential refresh is in flight at a time
#[derive(Debug, Default)]
pub struct SessionState {
    authenticated: AtomicBool,
    refresh_in_flight: AtomicBool,
}

impl SessionState {
    pub fn new() -> Arc<Self> {
        Arc::new(SessionState::default())
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Claims the refresh slot. Returns false if a refresh is already
    /// running somewhere else.
    pub fn begin_refresh(&self) -> bool {
        !self.refresh_in_flight.swap(true, Ordering::SeqCst)
    }

    pub fn end_refresh(&self) {
        self.refresh_in_flight.store(false, Ordering::SeqCst);
    }

    pub fn refresh_in_flight(&self) -> bool {
        self.refresh_in_flight.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Tests
// =============================================================================
