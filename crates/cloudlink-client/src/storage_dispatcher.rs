//! # Storage Dispatcher
//!
//! Queue and scheduler for storage object transfers, structurally parallel
//! to the message dispatcher but moving binary content instead of message
//! batches.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Storage Dispatcher Task                             │
//! │                                                                         │
//! │  Handle::queue ──► command channel ──► FIFO heap (capacity 50)          │
//! │                                             │ pop (one at a time)       │
//! │                                             ▼                           │
//! │                                      transfer task ──► transport        │
//! │                                        │ progress ticks → observer      │
//! │                                        ▼                                │
//! │                     terminal state on the object                        │
//! │                        + StorageEvent ──► message dispatcher            │
//! │                          (releases or fails dependent messages)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One transfer runs at a time; the command loop stays responsive while it
//! does, so `cancel` can reach an in-progress transfer. In-progress
//! cancellation is best-effort: the transfer task is abandoned and the
//! transport may keep moving bytes it has already committed to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cloudlink_core::{PriorityQueue, StorageObject, TransferState};

use crate::error::{ClientError, ClientResult, TransportError};
use crate::transport::{TransferDescriptor, TransportHandle};

// =============================================================================
// Shared Types
// =============================================================================

/// Storage objects are mutated from the dispatcher task and inspected by
/// callers, so they live behind a shared async lock.
pub type SharedStorageObject = Arc<Mutex<StorageObject>>;

/// Wraps a freshly-built object for queueing.
pub fn shared(object: StorageObject) -> SharedStorageObject {
    Arc::new(Mutex::new(object))
}

/// Progress callbacks for transfers. One tick per state change plus one per
/// transport progress report.
pub trait StorageObserver: Send + Sync {
    fn on_progress(&self, object_id: Uuid, state: TransferState, bytes: u64, total: Option<u64>);
}

/// Observer used when the caller does not care about progress.
pub struct NoOpStorageObserver;

impl StorageObserver for NoOpStorageObserver {
    fn on_progress(&self, _object_id: Uuid, _state: TransferState, _bytes: u64, _total: Option<u64>) {}
}

/// Terminal-transfer notification consumed by the message dispatcher's
/// dependency tracker. Success releases dependent messages; anything else
/// permanently fails them.
#[derive(Debug, Clone, Copy)]
pub struct StorageEvent {
    pub object_id: Uuid,
    pub success: bool,
}

// =============================================================================
// Commands
// =============================================================================

enum StorageCommand {
    Queue {
        object: SharedStorageObject,
        reply: oneshot::Sender<ClientResult<()>>,
    },
    Cancel {
        object_id: Uuid,
        reply: oneshot::Sender<ClientResult<bool>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

struct TransferOutcome {
    object_id: Uuid,
    result: Result<u64, TransportError>,
}

struct InFlightTransfer {
    object_id: Uuid,
    object: SharedStorageObject,
    task: JoinHandle<()>,
}

// All transfers share one rank; FIFO order comes from the heap's insertion
// sequence tie-break.
const TRANSFER_RANK: u8 = 0;

struct QueuedTransfer {
    object_id: Uuid,
}

// =============================================================================
// Dispatcher Task
// =============================================================================

pub struct StorageDispatcher {
    queue: PriorityQueue<QueuedTransfer>,
    /// Objects currently in the heap, by id. Kept alongside the heap so
    /// `cancel` can reach the object itself.
    queued: HashMap<Uuid, SharedStorageObject>,
    transport: TransportHandle,
    observer: Arc<dyn StorageObserver>,
    events_tx: mpsc::Sender<StorageEvent>,
    command_rx: mpsc::Receiver<StorageCommand>,
    outcome_tx: mpsc::Sender<TransferOutcome>,
    outcome_rx: mpsc::Receiver<TransferOutcome>,
    in_flight: Option<InFlightTransfer>,
}

/// Cloneable handle to a running storage dispatcher task.
#[derive(Clone)]
pub struct StorageDispatcherHandle {
    command_tx: mpsc::Sender<StorageCommand>,
    stopped: Arc<AtomicBool>,
}

impl StorageDispatcher {
    /// Spawns the dispatcher task and returns its handle.
    pub fn spawn(
        capacity: usize,
        transport: TransportHandle,
        events_tx: mpsc::Sender<StorageEvent>,
        observer: Arc<dyn StorageObserver>,
    ) -> StorageDispatcherHandle {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (outcome_tx, outcome_rx) = mpsc::channel(8);

        let dispatcher = StorageDispatcher {
            queue: PriorityQueue::new(capacity),
            queued: HashMap::new(),
            transport,
            observer,
            events_tx,
            command_rx,
            outcome_tx,
            outcome_rx,
            in_flight: None,
        };

        tokio::spawn(dispatcher.run());

        StorageDispatcherHandle {
            command_tx,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn run(mut self) {
        info!("Storage dispatcher started");
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(StorageCommand::Queue { object, reply }) => {
                        let result = self.enqueue(object).await;
                        let _ = reply.send(result);
                        self.start_next().await;
                    }
                    Some(StorageCommand::Cancel { object_id, reply }) => {
                        let result = self.cancel(object_id).await;
                        let _ = reply.send(result);
                        self.start_next().await;
                    }
                    Some(StorageCommand::Stop { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
                Some(outcome) = self.outcome_rx.recv() => {
                    self.finish(outcome).await;
                    self.start_next().await;
                }
            }
        }
        info!("Storage dispatcher stopped");
    }

    /// Validates the state transition and admits the object to the heap.
    async fn enqueue(&mut self, object: SharedStorageObject) -> ClientResult<()> {
        let object_id = {
            let mut guard = object.lock().await;
            guard.mark_queued()?;
            guard.id()
        };

        if let Err(e) = self.queue.push(QueuedTransfer { object_id }, TRANSFER_RANK) {
            // Roll the admission back to INITIATED so a rejected queue()
            // leaves the object exactly as re-queueable as before the call.
            let mut guard = object.lock().await;
            let _ = guard.mark_initiated();
            return Err(e.into());
        }

        debug!(%object_id, queued = self.queued.len() + 1, "Storage object queued");
        self.queued.insert(object_id, object);
        self.observer
            .on_progress(object_id, TransferState::Queued, 0, None);
        Ok(())
    }

    /// Starts the next transfer if none is running.
    async fn start_next(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let next = match self.queue.pop() {
            Some(next) => next,
            None => return,
        };
        let object = match self.queued.remove(&next.object_id) {
            Some(object) => object,
            None => return,
        };

        let descriptor = {
            let mut guard = object.lock().await;
            if let Err(e) = guard.mark_in_progress() {
                warn!(object_id = %next.object_id, %e, "Skipping transfer in unexpected state");
                return;
            }
            TransferDescriptor {
                object_id: guard.id(),
                uri: guard.uri().to_string(),
                name: guard.name().to_string(),
                content_type: guard.content_type().to_string(),
                io: guard.io().clone(),
            }
        };

        let object_id = next.object_id;
        debug!(%object_id, "Starting storage transfer");
        self.observer
            .on_progress(object_id, TransferState::InProgress, 0, None);

        let transport = self.transport.clone();
        let observer = self.observer.clone();
        let outcome_tx = self.outcome_tx.clone();
        let task = tokio::spawn(async move {
            let (progress_tx, mut progress_rx) = mpsc::channel(16);
            let mut transfer = Box::pin(transport.transfer(descriptor, progress_tx));
            let result = loop {
                tokio::select! {
                    result = &mut transfer => break result,
                    Some(tick) = progress_rx.recv() => {
                        observer.on_progress(
                            tick.object_id,
                            TransferState::InProgress,
                            tick.bytes,
                            tick.total,
                        );
                    }
                }
            };
            let _ = outcome_tx.send(TransferOutcome { object_id, result }).await;
        });

        self.in_flight = Some(InFlightTransfer {
            object_id,
            object,
            task,
        });
    }

    /// Applies the terminal state and notifies dependents.
    async fn finish(&mut self, outcome: TransferOutcome) {
        let in_flight = match self.in_flight.take() {
            Some(in_flight) if in_flight.object_id == outcome.object_id => in_flight,
            other => {
                // A stale outcome from an aborted transfer; the cancel path
                // already settled the object.
                self.in_flight = other;
                return;
            }
        };

        let mut guard = in_flight.object.lock().await;
        let success = match outcome.result {
            Ok(bytes) if !guard.cancel_requested() => {
                if guard.mark_completed(bytes).is_ok() {
                    info!(object_id = %outcome.object_id, bytes, "Storage transfer completed");
                    self.observer
                        .on_progress(outcome.object_id, TransferState::Completed, bytes, Some(bytes));
                    true
                } else {
                    false
                }
            }
            Ok(bytes) => {
                // Cancellation raced transfer completion; the cancel wins.
                let _ = guard.mark_cancelled();
                self.observer
                    .on_progress(outcome.object_id, TransferState::Cancelled, bytes, None);
                false
            }
            Err(e) => {
                warn!(object_id = %outcome.object_id, %e, "Storage transfer failed");
                let _ = guard.mark_failed();
                self.observer
                    .on_progress(outcome.object_id, TransferState::Failed, 0, None);
                false
            }
        };
        drop(guard);

        let _ = self
            .events_tx
            .send(StorageEvent {
                object_id: outcome.object_id,
                success,
            })
            .await;
    }

    /// Cancels a queued or in-progress transfer. Anything else is a no-op.
    async fn cancel(&mut self, object_id: Uuid) -> ClientResult<bool> {
        // In-progress: abandon the transfer task and settle the object.
        if let Some(in_flight) = &self.in_flight {
            if in_flight.object_id == object_id {
                let in_flight = self.in_flight.take().ok_or_else(|| {
                    ClientError::Channel("in-flight transfer vanished".into())
                })?;
                in_flight.task.abort();

                let mut guard = in_flight.object.lock().await;
                guard.request_cancel();
                guard.mark_cancelled()?;
                drop(guard);

                info!(%object_id, "In-progress storage transfer cancelled");
                self.observer
                    .on_progress(object_id, TransferState::Cancelled, 0, None);
                let _ = self
                    .events_tx
                    .send(StorageEvent {
                        object_id,
                        success: false,
                    })
                    .await;
                return Ok(true);
            }
        }

        // Queued: pull it out of the heap before it ever starts.
        if self.queue.remove(|t| t.object_id == object_id) {
            if let Some(object) = self.queued.remove(&object_id) {
                let mut guard = object.lock().await;
                guard.mark_cancelled()?;
                drop(guard);

                info!(%object_id, "Queued storage transfer cancelled");
                self.observer
                    .on_progress(object_id, TransferState::Cancelled, 0, None);
                let _ = self
                    .events_tx
                    .send(StorageEvent {
                        object_id,
                        success: false,
                    })
                    .await;
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn shutdown(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.task.abort();
            let mut guard = in_flight.object.lock().await;
            guard.request_cancel();
            let _ = guard.mark_cancelled();
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

impl StorageDispatcherHandle {
    /// Queues a storage object for transfer.
    ///
    /// Fails with `IllegalState` while the object is already QUEUED or
    /// IN_PROGRESS; a terminal-state object is implicitly reset and
    /// re-queued. Fails with `CapacityExceeded` when the heap is full,
    /// leaving the object INITIATED so a later `queue` can succeed.
    pub async fn queue(&self, object: SharedStorageObject) -> ClientResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ClientError::ShuttingDown);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(StorageCommand::Queue {
                object,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClientError::ShuttingDown)?;
        reply_rx
            .await
            .map_err(|_| ClientError::Channel("storage dispatcher dropped the reply".into()))?
    }

    /// Cancels a transfer. Returns whether anything was cancelled.
    pub async fn cancel(&self, object_id: Uuid) -> ClientResult<bool> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ClientError::ShuttingDown);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(StorageCommand::Cancel {
                object_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClientError::ShuttingDown)?;
        reply_rx
            .await
            .map_err(|_| ClientError::Channel("storage dispatcher dropped the reply".into()))?
    }

    /// Stops the dispatcher task. Safe to call twice.
    pub async fn stop(&self) -> ClientResult<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .command_tx
            .send(StorageCommand::Stop { reply: reply_tx })
            .await
            .is_err()
        {
            // Task already gone; stopping a stopped dispatcher is fine.
            return Ok(());
        }
        let _ = reply_rx.await;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{transport_channel, TransferProgress, TransportRequest};
    use cloudlink_core::SyncStatus;
    use std::sync::Mutex as StdMutex;

    struct RecordingObserver {
        ticks: StdMutex<Vec<(Uuid, TransferState, u64)>>,
    }

    impl RecordingObserver {
        fn new() -> Arc<Self> {
            Arc::new(RecordingObserver {
                ticks: StdMutex::new(Vec::new()),
            })
        }

        fn states_for(&self, object_id: Uuid) -> Vec<TransferState> {
            self.ticks
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _, _)| *id == object_id)
                .map(|(_, state, _)| *state)
                .collect()
        }
    }

    impl StorageObserver for RecordingObserver {
        fn on_progress(&self, object_id: Uuid, state: TransferState, bytes: u64, _total: Option<u64>) {
            self.ticks.lock().unwrap().push((object_id, state, bytes));
        }
    }

    /// Serves the transport channel: every transfer reports one progress
    /// tick and then succeeds (or fails when `fail` is set).
    fn spawn_mock_transport(
        mut request_rx: mpsc::Receiver<TransportRequest>,
        fail: bool,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                if let TransportRequest::Transfer {
                    descriptor,
                    progress,
                    reply,
                } = request
                {
                    let _ = progress
                        .send(TransferProgress {
                            object_id: descriptor.object_id,
                            bytes: 128,
                            total: Some(256),
                        })
                        .await;
                    let result = if fail {
                        Err(TransportError::new(Some(500), "storage backend unavailable"))
                    } else {
                        Ok(256)
                    };
                    let _ = reply.send(result);
                }
            }
        })
    }

    fn object() -> SharedStorageObject {
        shared(StorageObject::new(
            "https://storage.example/bucket/fw.bin",
            "fw.bin",
            "application/octet-stream",
        ))
    }

    #[tokio::test]
    async fn test_transfer_completes_and_releases_dependents() {
        let (transport, request_rx) = transport_channel(8);
        let _mock = spawn_mock_transport(request_rx, false);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let observer = RecordingObserver::new();

        let handle = StorageDispatcher::spawn(50, transport, events_tx, observer.clone());
        let obj = object();
        let object_id = obj.lock().await.id();

        handle.queue(obj.clone()).await.unwrap();

        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.object_id, object_id);
        assert!(event.success);

        let guard = obj.lock().await;
        assert_eq!(guard.transfer_state(), TransferState::Completed);
        assert_eq!(guard.sync_status(), SyncStatus::InSync);
        assert_eq!(guard.length(), Some(256));
        drop(guard);

        let states = observer.states_for(object_id);
        assert_eq!(states.first(), Some(&TransferState::Queued));
        assert_eq!(states.last(), Some(&TransferState::Completed));
        assert!(states.contains(&TransferState::InProgress));
    }

    #[tokio::test]
    async fn test_transfer_failure_notifies_dependents() {
        let (transport, request_rx) = transport_channel(8);
        let _mock = spawn_mock_transport(request_rx, true);
        let (events_tx, mut events_rx) = mpsc::channel(8);

        let handle =
            StorageDispatcher::spawn(50, transport, events_tx, Arc::new(NoOpStorageObserver));
        let obj = object();

        handle.queue(obj.clone()).await.unwrap();

        let event = events_rx.recv().await.unwrap();
        assert!(!event.success);
        assert_eq!(obj.lock().await.sync_status(), SyncStatus::SyncFailed);
    }

    #[tokio::test]
    async fn test_queue_twice_is_illegal_state() {
        let (transport, _request_rx) = transport_channel(8);
        let (events_tx, _events_rx) = mpsc::channel(8);

        let handle =
            StorageDispatcher::spawn(50, transport, events_tx, Arc::new(NoOpStorageObserver));
        let obj = object();

        handle.queue(obj.clone()).await.unwrap();
        // The mock transport never answers, so the object is stuck in
        // progress; queueing it again must be rejected.
        let err = handle.queue(obj.clone()).await.unwrap_err();
        assert!(matches!(err, ClientError::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_capacity_exceeded() {
        let (transport, _request_rx) = transport_channel(8);
        let (events_tx, _events_rx) = mpsc::channel(8);

        // Capacity 1: the first object leaves the heap immediately when its
        // transfer starts, so fill the heap behind a stuck transfer.
        let handle =
            StorageDispatcher::spawn(1, transport, events_tx, Arc::new(NoOpStorageObserver));

        handle.queue(object()).await.unwrap(); // starts, never finishes
        handle.queue(object()).await.unwrap(); // occupies the single slot
        let err = handle.queue(object()).await.unwrap_err();
        assert!(matches!(err, ClientError::CapacityExceeded { capacity: 1 }));
    }

    #[tokio::test]
    async fn test_rejected_queue_leaves_object_requeueable() {
        let (transport, _request_rx) = transport_channel(8);
        let (events_tx, _events_rx) = mpsc::channel(8);
        let observer = RecordingObserver::new();

        let handle = StorageDispatcher::spawn(1, transport, events_tx, observer.clone());
        handle.queue(object()).await.unwrap(); // starts, never finishes
        handle.queue(object()).await.unwrap(); // occupies the single slot

        let rejected = object();
        let rejected_id = rejected.lock().await.id();
        let err = handle.queue(rejected.clone()).await.unwrap_err();
        assert!(matches!(err, ClientError::CapacityExceeded { capacity: 1 }));

        // The rejection is side-effect-free: no terminal state, no ticks.
        let guard = rejected.lock().await;
        assert_eq!(guard.transfer_state(), TransferState::Initiated);
        assert_eq!(guard.sync_status(), SyncStatus::NotInSync);
        drop(guard);
        assert!(observer.states_for(rejected_id).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_queued_transfer() {
        let (transport, _request_rx) = transport_channel(8);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let observer = RecordingObserver::new();

        let handle = StorageDispatcher::spawn(50, transport, events_tx, observer.clone());

        let first = object(); // will start and block on the silent transport
        let second = object();
        let second_id = second.lock().await.id();

        handle.queue(first).await.unwrap();
        handle.queue(second.clone()).await.unwrap();

        assert!(handle.cancel(second_id).await.unwrap());
        assert_eq!(second.lock().await.transfer_state(), TransferState::Cancelled);

        // Exactly one Cancelled tick after the Queued one.
        let states = observer.states_for(second_id);
        assert_eq!(states, vec![TransferState::Queued, TransferState::Cancelled]);

        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.object_id, second_id);
        assert!(!event.success);
    }

    #[tokio::test]
    async fn test_cancel_in_progress_transfer() {
        let (transport, _request_rx) = transport_channel(8);
        let (events_tx, mut events_rx) = mpsc::channel(8);

        let handle =
            StorageDispatcher::spawn(50, transport, events_tx, Arc::new(NoOpStorageObserver));
        let obj = object();
        let object_id = obj.lock().await.id();

        handle.queue(obj.clone()).await.unwrap();
        assert!(handle.cancel(object_id).await.unwrap());

        assert_eq!(obj.lock().await.transfer_state(), TransferState::Cancelled);
        assert!(!events_rx.recv().await.unwrap().success);
    }

    #[tokio::test]
    async fn test_cancel_unknown_object_is_noop() {
        let (transport, _request_rx) = transport_channel(8);
        let (events_tx, _events_rx) = mpsc::channel(8);

        let handle =
            StorageDispatcher::spawn(50, transport, events_tx, Arc::new(NoOpStorageObserver));
        assert!(!handle.cancel(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_twice_is_ok() {
        let (transport, _request_rx) = transport_channel(8);
        let (events_tx, _events_rx) = mpsc::channel(8);

        let handle =
            StorageDispatcher::spawn(50, transport, events_tx, Arc::new(NoOpStorageObserver));
        handle.stop().await.unwrap();
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_completed_object_requeues_after_reset() {
        let (transport, request_rx) = transport_channel(8);
        let _mock = spawn_mock_transport(request_rx, false);
        let (events_tx, mut events_rx) = mpsc::channel(8);

        let handle =
            StorageDispatcher::spawn(50, transport, events_tx, Arc::new(NoOpStorageObserver));
        let obj = object();

        handle.queue(obj.clone()).await.unwrap();
        assert!(events_rx.recv().await.unwrap().success);

        // Terminal state resets implicitly on re-queue.
        handle.queue(obj.clone()).await.unwrap();
        assert!(events_rx.recv().await.unwrap().success);
    }
}
