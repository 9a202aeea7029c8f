//! # Message Dispatcher
//!
//! The core of the client: sole owner of the outbound queue and the storage
//! dependency tracker, and the only caller of the transport send/receive
//! primitive for its endpoint.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Message Dispatcher Task                             │
//! │                                                                         │
//! │  Handle::queue ──► command channel ──► priority heap (capacity 1000)    │
//! │                                             │                           │
//! │  storage events ──► dependency tracker ─────┤ scheduler sweep           │
//! │  (release / fail dependents)                ▼                           │
//! │                                     drain ≤ max_batch                   │
//! │                                       │ eligible → send batch           │
//! │                                       │ waiting  → re-queued            │
//! │                                       │ failed   → onError, dropped     │
//! │                                       ▼                                 │
//! │                                 transport send/receive                  │
//! │                                       │ 401 → refresh + one retry       │
//! │                                       ▼                                 │
//! │                          inbound REQUESTs → correlator → RESPONSEs      │
//! │                                            re-queued for next sweep     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The sweep runs on a fixed interval (adjustable through the polling
//! interval control resource, floored globally). Sweeps never overlap: the
//! dispatcher is one task and the interval uses skip-on-miss semantics.
//! When long polling is enabled exactly one held-open receive call is kept
//! outstanding, running in its own task so the command loop stays
//! responsive; its results come back over an internal channel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use cloudlink_core::{Counters, CountersSnapshot, Message, MessageType, PriorityQueue};

use crate::config::{ClientConfig, MIN_POLLING_INTERVAL_MS};
use crate::dependency::StorageDependencyTracker;
use crate::diagnostics::{register_diagnostics, resources_report, DiagnosticsState};
use crate::error::{ClientError, ClientResult, TransportError};
use crate::request::RequestDispatcher;
use crate::storage_dispatcher::{SharedStorageObject, StorageEvent};
use crate::transport::{SessionState, TransportHandle};

// =============================================================================
// Observer
// =============================================================================

/// Delivery callbacks fired from the dispatcher task after each sweep.
/// Implementations must not block; they run on the dispatcher's task.
pub trait DispatcherObserver: Send + Sync {
    /// The batch that was actually sent and acknowledged.
    fn on_delivery(&self, _batch: &[Message]) {}

    /// A typed failure together with the batch it affected.
    fn on_error(&self, _error: &ClientError, _batch: &[Message]) {}

    /// An inbound message that is not a REQUEST (those go to the
    /// correlator instead).
    fn on_receive(&self, _message: &Message) {}
}

/// Observer used when the caller does not care about delivery feedback.
pub struct NoOpObserver;

impl DispatcherObserver for NoOpObserver {}

// =============================================================================
// Commands
// =============================================================================

enum DispatcherCommand {
    Queue {
        message: Message,
        reply: oneshot::Sender<ClientResult<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle to a running message dispatcher task.
#[derive(Clone)]
pub struct DispatcherHandle {
    command_tx: mpsc::Sender<DispatcherCommand>,
    correlator: RequestDispatcher,
    counters: Arc<Counters>,
    storage_events_tx: mpsc::Sender<StorageEvent>,
    stopped: Arc<AtomicBool>,
}

impl DispatcherHandle {
    /// Validates and enqueues an outbound message.
    ///
    /// Fails synchronously with `InvalidMessage` or `CapacityExceeded`; a
    /// returned `Ok` means the message is tracked and will either be
    /// delivered or reported through `on_error`.
    pub async fn queue(&self, message: Message) -> ClientResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ClientError::ShuttingDown);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(DispatcherCommand::Queue {
                message,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClientError::ShuttingDown)?;
        reply_rx
            .await
            .map_err(|_| ClientError::Channel("dispatcher dropped the reply".into()))?
    }

    /// Queues a message whose payload references the given storage objects.
    ///
    /// The message is held back until every referenced object reaches a
    /// terminal sync state; a failed sync drops the message and reports it
    /// through `on_error`.
    pub async fn queue_with_content(
        &self,
        mut message: Message,
        content: &[SharedStorageObject],
    ) -> ClientResult<()> {
        for object in content {
            let object_id = object.lock().await.id();
            if !message.storage_refs.contains(&object_id) {
                message.storage_refs.push(object_id);
            }
        }
        self.queue(message).await
    }

    /// The request/response correlator for this endpoint.
    pub fn request_dispatcher(&self) -> RequestDispatcher {
        self.correlator.clone()
    }

    /// Point-in-time dispatch counters.
    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    /// Sender the storage dispatcher reports terminal transfers into.
    pub fn storage_events(&self) -> mpsc::Sender<StorageEvent> {
        self.storage_events_tx.clone()
    }

    /// Stops the scheduler and abandons any in-flight long poll. Safe to
    /// call twice.
    pub async fn stop(&self) -> ClientResult<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .command_tx
            .send(DispatcherCommand::Stop { reply: reply_tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        let _ = reply_rx.await;
        Ok(())
    }

    /// Whether two handles point at the same dispatcher task.
    pub fn same_dispatcher(&self, other: &DispatcherHandle) -> bool {
        self.command_tx.same_channel(&other.command_tx)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.command_tx.is_closed()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// At most one dispatcher exists per endpoint; obtaining a second handle
/// for the same endpoint returns the existing one while it is running. A
/// stopped dispatcher is replaced on the next `obtain`.
#[derive(Default)]
pub struct DispatcherRegistry {
    dispatchers: StdMutex<HashMap<String, DispatcherHandle>>,
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        DispatcherRegistry::default()
    }

    /// Returns the dispatcher for the configured endpoint, starting it on
    /// first call.
    pub fn obtain(
        &self,
        config: ClientConfig,
        transport: TransportHandle,
        session: Arc<SessionState>,
        observer: Arc<dyn DispatcherObserver>,
    ) -> ClientResult<DispatcherHandle> {
        config.validate()?;
        let key = config.server.endpoint_id.clone();

        let mut dispatchers = self
            .dispatchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = dispatchers.get(&key) {
            if !existing.is_stopped() {
                debug!(endpoint = %key, "Reusing existing dispatcher");
                return Ok(existing.clone());
            }
            // A stopped entry only hands out dead handles; replace it.
            debug!(endpoint = %key, "Discarding stopped dispatcher");
        }

        let handle = MessageDispatcher::spawn(config, transport, session, observer);
        dispatchers.insert(key, handle.clone());
        Ok(handle)
    }
}

// =============================================================================
// Dispatcher Task
// =============================================================================

pub struct MessageDispatcher {
    config: ClientConfig,
    endpoint_id: String,
    queue: PriorityQueue<Message>,
    tracker: StorageDependencyTracker,
    transport: TransportHandle,
    session: Arc<SessionState>,
    correlator: RequestDispatcher,
    diagnostics: Arc<DiagnosticsState>,
    counters: Arc<Counters>,
    observer: Arc<dyn DispatcherObserver>,
    command_rx: mpsc::Receiver<DispatcherCommand>,
    storage_rx: mpsc::Receiver<StorageEvent>,
    poll_tx: mpsc::Sender<Result<Vec<Message>, TransportError>>,
    poll_rx: mpsc::Receiver<Result<Vec<Message>, TransportError>>,
    long_poll_active: Arc<AtomicBool>,
    long_poll_task: Option<JoinHandle<()>>,
    /// Set when a long-poll 401 has already spent its credential refresh;
    /// cleared by the next successful poll. Mirrors the one-refresh-one-retry
    /// rule of the send path.
    poll_refreshed: bool,
    /// Diagnostic resources are registered and advertised on the first
    /// authenticated sweep.
    announced: bool,
}

impl MessageDispatcher {
    /// Spawns the dispatcher task and returns its handle.
    pub fn spawn(
        config: ClientConfig,
        transport: TransportHandle,
        session: Arc<SessionState>,
        observer: Arc<dyn DispatcherObserver>,
    ) -> DispatcherHandle {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (storage_events_tx, storage_rx) = mpsc::channel(32);
        let (poll_tx, poll_rx) = mpsc::channel(8);

        let counters = Arc::new(Counters::new());
        let correlator = RequestDispatcher::new();
        let diagnostics = DiagnosticsState::new(
            counters.clone(),
            config.effective_polling_interval().as_millis() as u64,
        );

        let dispatcher = MessageDispatcher {
            endpoint_id: config.server.endpoint_id.clone(),
            queue: PriorityQueue::new(config.queue.message_capacity),
            tracker: StorageDependencyTracker::new(),
            transport,
            session,
            correlator: correlator.clone(),
            diagnostics,
            counters: counters.clone(),
            observer,
            command_rx,
            storage_rx,
            poll_tx,
            poll_rx,
            long_poll_active: Arc::new(AtomicBool::new(false)),
            long_poll_task: None,
            poll_refreshed: false,
            announced: false,
            config,
        };

        tokio::spawn(dispatcher.run());

        DispatcherHandle {
            command_tx,
            correlator,
            counters,
            storage_events_tx,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn run(mut self) {
        info!(endpoint = %self.endpoint_id, "Message dispatcher started");
        let mut period = self.poll_period();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(DispatcherCommand::Queue { message, reply }) => {
                        let _ = reply.send(self.enqueue(message));
                    }
                    Some(DispatcherCommand::Stop { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
                Some(event) = self.storage_rx.recv() => {
                    self.apply_storage_event(event);
                }
                Some(result) = self.poll_rx.recv() => {
                    self.handle_poll_result(result).await;
                }
                _ = ticker.tick() => {
                    self.sweep().await;

                    // Pick up interval changes made through the control
                    // resource without firing an immediate extra sweep.
                    let desired = self.poll_period();
                    if desired != period {
                        period = desired;
                        ticker = interval_at(Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    }
                }
            }
        }
        info!(endpoint = %self.endpoint_id, "Message dispatcher stopped");
    }

    fn poll_period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.diagnostics
                .polling_interval_ms()
                .max(MIN_POLLING_INTERVAL_MS),
        )
    }

    /// Validates and admits a message, recording its storage dependencies.
    fn enqueue(&mut self, message: Message) -> ClientResult<()> {
        message.validate()?;
        let client_id = message.client_id;
        let storage_refs = message.storage_refs.clone();
        let rank = message.priority.rank();

        self.queue.push(message, rank)?;
        for object_id in storage_refs {
            self.tracker.add(object_id, client_id);
        }
        debug!(%client_id, "Message queued");
        Ok(())
    }

    fn apply_storage_event(&mut self, event: StorageEvent) {
        let dependents = self.tracker.complete(event.object_id, event.success);
        if event.success {
            debug!(
                object_id = %event.object_id,
                released = dependents.len(),
                "Storage sync completed, dependents released"
            );
        } else {
            warn!(
                object_id = %event.object_id,
                failed = dependents.len(),
                "Storage sync failed, dependents will not be sent"
            );
        }
    }

    // =========================================================================
    // Scheduler Sweep
    // =========================================================================

    async fn sweep(&mut self) {
        // Never send against a missing or stale session.
        if !self.session.is_authenticated() || self.session.refresh_in_flight() {
            debug!("Skipping sweep, session not ready");
            return;
        }

        if !self.announced {
            // Registering twice is a silent replace, so retrying the whole
            // block until the report push sticks is safe.
            register_diagnostics(&self.correlator, &self.endpoint_id, self.diagnostics.clone())
                .await;
            let report = resources_report(&self.endpoint_id);
            let rank = report.priority.rank();
            match self.queue.push(report, rank) {
                Ok(()) => self.announced = true,
                Err(e) => warn!(%e, "Could not queue the resources report, retrying next sweep"),
            }
        }

        // One connectivity-test message per sweep while a test runs.
        if let Some(test) = self.diagnostics.take_test_message(&self.endpoint_id) {
            let rank = test.priority.rank();
            if self.queue.push(test, rank).is_err() {
                debug!("Outbound queue full, dropping connectivity test message");
            }
        }

        let (send_batch, wait_batch, failed_batch) = self.drain();

        // Waited messages are reconsidered next sweep.
        for message in wait_batch {
            let rank = message.priority.rank();
            let _ = self.queue.push(message, rank);
        }

        // Sticky dependency failures: reported exactly once, then dropped.
        for message in failed_batch {
            let error = ClientError::ContentSyncFailed {
                client_id: message.client_id,
            };
            warn!(client_id = %message.client_id, "Dropping message, content sync failed");
            self.observer.on_error(&error, std::slice::from_ref(&message));
        }

        if send_batch.is_empty() {
            if self.config.polling.long_polling {
                self.ensure_long_poll();
            } else {
                // No held-open receive available: proactively drain
                // server-pending work with an empty call.
                self.dispatch_batch(Vec::new()).await;
            }
            return;
        }

        self.dispatch_batch(send_batch).await;
        if self.config.polling.long_polling {
            self.ensure_long_poll();
        }
    }

    /// Pops eligible messages into a send batch, deferring the rest.
    ///
    /// Eligibility: RESPONSE and RESOURCES_REPORT messages always go out;
    /// a content-dependent message is deferred while its storage object is
    /// still syncing, and at most one content-dependent message per source
    /// joins a batch so attribute updates apply in order.
    fn drain(&mut self) -> (Vec<Message>, Vec<Message>, Vec<Message>) {
        let mut send = Vec::new();
        let mut wait = Vec::new();
        let mut failed = Vec::new();
        let mut content_sources: HashSet<String> = HashSet::new();

        while send.len() < self.config.polling.max_batch {
            let message = match self.queue.pop() {
                Some(message) => message,
                None => break,
            };

            if self.tracker.take_failed(&message.client_id) {
                failed.push(message);
                continue;
            }

            match message.kind {
                // The local sentinel never reaches the wire.
                MessageType::ResponseWait => continue,
                MessageType::Response | MessageType::ResourcesReport => {
                    send.push(message);
                    continue;
                }
                _ => {}
            }

            if !message.storage_refs.is_empty() {
                if self.tracker.has_pending(&message.client_id) {
                    wait.push(message);
                    continue;
                }
                let source = message.source.clone().unwrap_or_default();
                if !content_sources.insert(source) {
                    wait.push(message);
                    continue;
                }
            }

            send.push(message);
        }

        (send, wait, failed)
    }

    // =========================================================================
    // Transport
    // =========================================================================

    /// Sends one batch, recovering a 401 with a single refresh + retry.
    async fn dispatch_batch(&mut self, batch: Vec<Message>) {
        let accept_bytes = self.config.transport.request_buffer_bytes;
        let timeout = self.config.connect_timeout();

        let outcome = self
            .transport
            .send_receive(batch.clone(), accept_bytes, false, timeout)
            .await;

        match outcome {
            Ok(received) => self.on_send_success(&batch, received).await,
            Err(e) if e.is_auth_expired() => {
                debug!("Send rejected with 401, refreshing credentials");
                match self.refresh_session().await {
                    Ok(()) => {
                        self.counters.add_retried(batch.len() as u64);
                        let retry = self
                            .transport
                            .send_receive(batch.clone(), accept_bytes, false, timeout)
                            .await;
                        match retry {
                            Ok(received) => self.on_send_success(&batch, received).await,
                            Err(e2) => self.fail_batch(ClientError::from(e2), batch),
                        }
                    }
                    Err(refresh_err) => {
                        self.fail_batch(ClientError::AuthExpired(refresh_err.to_string()), batch)
                    }
                }
            }
            Err(e) => self.fail_batch(ClientError::from(e), batch),
        }
    }

    async fn refresh_session(&self) -> Result<(), TransportError> {
        if !self.session.begin_refresh() {
            // Another refresh already claimed the slot; treat ours as done.
            return Ok(());
        }
        let result = self.transport.refresh().await;
        self.session.end_refresh();
        self.session.set_authenticated(result.is_ok());
        result
    }

    fn fail_batch(&self, error: ClientError, batch: Vec<Message>) {
        warn!(%error, messages = batch.len(), "Batch not delivered");
        self.counters.add_protocol_error();
        self.observer.on_error(&error, &batch);
    }

    async fn on_send_success(&mut self, batch: &[Message], received: Vec<Message>) {
        if !batch.is_empty() {
            let bytes = serde_json::to_vec(batch).map(|b| b.len() as u64).unwrap_or(0);
            self.counters.add_sent(batch.len() as u64, bytes);
        }
        self.process_received(received).await;
        if !batch.is_empty() {
            self.observer.on_delivery(batch);
        }
    }

    async fn process_received(&mut self, received: Vec<Message>) {
        for message in received {
            let bytes = serde_json::to_vec(&message)
                .map(|b| b.len() as u64)
                .unwrap_or(0);
            self.counters.add_received(1, bytes);

            if message.kind == MessageType::Request {
                if let Some(response) = self.correlator.dispatch(&message).await {
                    let rank = response.priority.rank();
                    if let Err(e) = self.queue.push(response.clone(), rank) {
                        warn!(client_id = %response.client_id, "Dropping response, outbound queue full");
                        self.counters.add_protocol_error();
                        self.observer
                            .on_error(&ClientError::from(e), std::slice::from_ref(&response));
                    }
                }
            } else {
                self.observer.on_receive(&message);
            }
        }
    }

    // =========================================================================
    // Long Polling
    // =========================================================================

    /// Keeps exactly one held-open receive call outstanding.
    fn ensure_long_poll(&mut self) {
        if self.long_poll_active.swap(true, Ordering::AcqRel) {
            return;
        }
        let transport = self.transport.clone();
        let poll_tx = self.poll_tx.clone();
        let active = self.long_poll_active.clone();
        let accept_bytes = self.config.transport.request_buffer_bytes;
        let timeout = self.config.receive_timeout();

        self.long_poll_task = Some(tokio::spawn(async move {
            let result = transport
                .send_receive(Vec::new(), accept_bytes, true, timeout)
                .await;
            active.store(false, Ordering::Release);
            let _ = poll_tx.send(result).await;
        }));
    }

    /// A held-open receive that ends with nothing comes back as an empty
    /// `Ok`; an `Err` is a genuine failure and gets the same 401 recovery
    /// as a rejected send. The next sweep re-opens the poll either way.
    async fn handle_poll_result(&mut self, result: Result<Vec<Message>, TransportError>) {
        match result {
            Ok(received) => {
                self.poll_refreshed = false;
                self.process_received(received).await;
            }
            Err(e) if e.is_auth_expired() && !self.poll_refreshed => {
                debug!("Long poll rejected with 401, refreshing credentials");
                self.poll_refreshed = true;
                if let Err(refresh_err) = self.refresh_session().await {
                    let error = ClientError::AuthExpired(refresh_err.to_string());
                    warn!(%error, "Credential refresh after rejected long poll failed");
                    self.counters.add_protocol_error();
                    self.observer.on_error(&error, &[]);
                }
            }
            // A second consecutive 401, or any other transport failure.
            Err(e) => {
                self.poll_refreshed = false;
                warn!(%e, "Long poll failed");
                self.counters.add_protocol_error();
                self.observer.on_error(&ClientError::from(e), &[]);
            }
        }
    }

    /// Long-poll cancellation is best-effort: the in-flight request is
    /// abandoned, not torn down.
    fn shutdown(&mut self) {
        if let Some(task) = self.long_poll_task.take() {
            task.abort();
        }
        self.long_poll_active.store(false, Ordering::Release);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PollingConfig, QueueConfig, ServerConfig};
    use crate::storage_dispatcher::{shared, NoOpStorageObserver, StorageDispatcher};
    use crate::transport::{transport_channel, TransportRequest};
    use cloudlink_core::{Payload, Priority, StorageObject};
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::time::Duration;
    use uuid::Uuid;

    // =========================================================================
    // Harness
    // =========================================================================

    #[derive(Clone)]
    struct MockState {
        batches: Arc<StdMutex<Vec<Vec<Message>>>>,
        long_polls: Arc<StdMutex<usize>>,
        script: Arc<StdMutex<VecDeque<Result<Vec<Message>, TransportError>>>>,
        long_poll_script: Arc<StdMutex<VecDeque<Result<Vec<Message>, TransportError>>>>,
        refreshes: Arc<StdMutex<usize>>,
        refresh_ok: Arc<AtomicBool>,
    }

    impl MockState {
        fn new() -> Self {
            MockState {
                batches: Arc::new(StdMutex::new(Vec::new())),
                long_polls: Arc::new(StdMutex::new(0)),
                script: Arc::new(StdMutex::new(VecDeque::new())),
                long_poll_script: Arc::new(StdMutex::new(VecDeque::new())),
                refreshes: Arc::new(StdMutex::new(0)),
                refresh_ok: Arc::new(AtomicBool::new(true)),
            }
        }

        fn push_result(&self, result: Result<Vec<Message>, TransportError>) {
            self.script.lock().unwrap().push_back(result);
        }

        fn push_long_poll_result(&self, result: Result<Vec<Message>, TransportError>) {
            self.long_poll_script.lock().unwrap().push_back(result);
        }

        fn sent_batches(&self) -> Vec<Vec<Message>> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .filter(|b| !b.is_empty())
                .cloned()
                .collect()
        }

        fn refreshes(&self) -> usize {
            *self.refreshes.lock().unwrap()
        }
    }

    fn spawn_mock(mut request_rx: mpsc::Receiver<TransportRequest>, state: MockState) {
        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                match request {
                    TransportRequest::SendReceive {
                        messages,
                        long_poll,
                        reply,
                        ..
                    } => {
                        if long_poll {
                            *state.long_polls.lock().unwrap() += 1;
                            let result = state
                                .long_poll_script
                                .lock()
                                .unwrap()
                                .pop_front()
                                .unwrap_or(Ok(Vec::new()));
                            let _ = reply.send(result);
                            continue;
                        }
                        state.batches.lock().unwrap().push(messages);
                        let result = state
                            .script
                            .lock()
                            .unwrap()
                            .pop_front()
                            .unwrap_or(Ok(Vec::new()));
                        let _ = reply.send(result);
                    }
                    TransportRequest::Refresh { reply } => {
                        *state.refreshes.lock().unwrap() += 1;
                        let result = if state.refresh_ok.load(Ordering::Relaxed) {
                            Ok(())
                        } else {
                            Err(TransportError::new(Some(401), "refresh rejected"))
                        };
                        let _ = reply.send(result);
                    }
                    TransportRequest::Transfer { reply, .. } => {
                        let _ = reply.send(Ok(0));
                    }
                }
            }
        });
    }

    #[derive(Default)]
    struct RecordingObserver {
        delivered: StdMutex<Vec<Vec<Uuid>>>,
        errors: StdMutex<Vec<(String, Vec<Uuid>)>>,
        received: StdMutex<Vec<Uuid>>,
    }

    impl DispatcherObserver for RecordingObserver {
        fn on_delivery(&self, batch: &[Message]) {
            self.delivered
                .lock()
                .unwrap()
                .push(batch.iter().map(|m| m.client_id).collect());
        }

        fn on_error(&self, error: &ClientError, batch: &[Message]) {
            self.errors
                .lock()
                .unwrap()
                .push((error.to_string(), batch.iter().map(|m| m.client_id).collect()));
        }

        fn on_receive(&self, message: &Message) {
            self.received.lock().unwrap().push(message.client_id);
        }
    }

    struct Harness {
        handle: DispatcherHandle,
        session: Arc<SessionState>,
        mock: MockState,
        observer: Arc<RecordingObserver>,
    }

    fn test_config() -> ClientConfig {
        ClientConfig {
            server: ServerConfig {
                url: "https://iot.example".into(),
                endpoint_id: "device-1".into(),
            },
            polling: PollingConfig {
                long_polling: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn harness(config: ClientConfig) -> Harness {
        let (transport, request_rx) = transport_channel(32);
        let mock = MockState::new();
        spawn_mock(request_rx, mock.clone());

        let session = SessionState::new();
        let observer = Arc::new(RecordingObserver::default());
        let handle = DispatcherRegistry::new()
            .obtain(config, transport, session.clone(), observer.clone())
            .unwrap();

        Harness {
            handle,
            session,
            mock,
            observer,
        }
    }

    fn data_message(source: &str, priority: Priority) -> Message {
        let mut data = serde_json::Map::new();
        data.insert("speed".into(), json!(42));
        Message::builder()
            .source(source)
            .priority(priority)
            .data("urn:cloudlink:attributes", data)
            .build()
            .unwrap()
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    // =========================================================================
    // Cases
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_invalid_message_rejected_synchronously() {
        let h = harness(test_config());
        let mut message = data_message("device-1", Priority::Low);
        message.properties.insert("k".repeat(3000), json!(1));

        let err = h.handle.queue(message).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidMessage(_)));
        assert!(err.is_synchronous());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_exceeded_synchronously() {
        let mut config = test_config();
        config.queue = QueueConfig {
            message_capacity: 2,
            ..Default::default()
        };
        let h = harness(config);

        // Unauthenticated, so nothing drains between pushes.
        h.handle.queue(data_message("a", Priority::Low)).await.unwrap();
        h.handle.queue(data_message("b", Priority::Low)).await.unwrap();
        let err = h.handle.queue(data_message("c", Priority::Low)).await.unwrap_err();
        assert!(matches!(err, ClientError::CapacityExceeded { capacity: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sweep_without_authentication() {
        let h = harness(test_config());
        h.handle.queue(data_message("device-1", Priority::High)).await.unwrap();

        settle(10_000).await;
        assert!(h.mock.sent_batches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_dominates_fifo_in_batches() {
        let h = harness(test_config());
        let low = data_message("device-1", Priority::Low);
        let high = data_message("device-1", Priority::High);
        let low_id = low.client_id;
        let high_id = high.client_id;

        h.handle.queue(low).await.unwrap();
        h.handle.queue(high).await.unwrap();
        h.session.set_authenticated(true);
        settle(4_000).await;

        let batches = h.mock.sent_batches();
        let first: Vec<Uuid> = batches[0].iter().map(|m| m.client_id).collect();
        // The resources report rides the first sweep at HIGHEST priority.
        assert_eq!(batches[0][0].kind, MessageType::ResourcesReport);
        assert!(first.contains(&high_id) && first.contains(&low_id));
        let high_pos = first.iter().position(|id| *id == high_id).unwrap();
        let low_pos = first.iter().position(|id| *id == low_id).unwrap();
        assert!(high_pos < low_pos);

        assert_eq!(h.observer.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_authenticated_sweep_advertises_resources() {
        let h = harness(test_config());
        h.session.set_authenticated(true);
        settle(4_000).await;

        let batches = h.mock.sent_batches();
        let report = &batches[0][0];
        assert_eq!(report.kind, MessageType::ResourcesReport);
        match &report.payload {
            Payload::Data { data, .. } => {
                assert_eq!(data["mark"].as_str().unwrap().len(), 32);
            }
            other => panic!("expected data payload, got {:?}", other),
        }

        // The control resources answer once advertised.
        let correlator = h.handle.request_dispatcher();
        let req = Message::builder()
            .source("server")
            .destination("device-1")
            .request(
                "GET",
                "deviceModels/urn:cloudlink:capability:message_dispatcher/counters",
                Value::Null,
            )
            .build()
            .unwrap();
        let response = correlator.dispatch(&req).await.unwrap();
        match &response.payload {
            Payload::Response { status, .. } => assert_eq!(*status, 200),
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_content_dependent_message_held_until_sync() {
        let h = harness(test_config());
        let object_id = Uuid::new_v4();
        let message = Message::builder()
            .source("device-1")
            .storage_reference(object_id)
            .data("urn:cloudlink:attributes", serde_json::Map::new())
            .build()
            .unwrap();
        let message_id = message.client_id;

        h.handle.queue(message).await.unwrap();
        h.session.set_authenticated(true);
        settle(8_000).await;

        // Held back while the object is still syncing.
        assert!(h
            .mock
            .sent_batches()
            .iter()
            .flatten()
            .all(|m| m.client_id != message_id));

        h.handle
            .storage_events()
            .send(StorageEvent {
                object_id,
                success: true,
            })
            .await
            .unwrap();
        settle(4_000).await;

        assert!(h
            .mock
            .sent_batches()
            .iter()
            .flatten()
            .any(|m| m.client_id == message_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_with_content_released_by_storage_dispatcher() {
        let h = harness(test_config());

        // A separate transport pair serves the storage dispatcher; its mock
        // completes every transfer immediately.
        let (storage_transport, storage_rx) = transport_channel(8);
        spawn_mock(storage_rx, MockState::new());
        let storage = StorageDispatcher::spawn(
            50,
            storage_transport,
            h.handle.storage_events(),
            Arc::new(NoOpStorageObserver),
        );

        let object = shared(StorageObject::new(
            "https://storage.example/bucket/photo.jpg",
            "photo.jpg",
            "image/jpeg",
        ));
        let message = Message::builder()
            .source("device-1")
            .data("urn:cloudlink:attributes", serde_json::Map::new())
            .build()
            .unwrap();
        let message_id = message.client_id;

        h.handle
            .queue_with_content(message, std::slice::from_ref(&object))
            .await
            .unwrap();
        storage.queue(object).await.unwrap();
        h.session.set_authenticated(true);
        settle(8_000).await;

        assert!(h
            .mock
            .sent_batches()
            .iter()
            .flatten()
            .any(|m| m.client_id == message_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_content_sync_failure_reported_exactly_once() {
        let h = harness(test_config());
        let object_id = Uuid::new_v4();
        let message = Message::builder()
            .source("device-1")
            .storage_reference(object_id)
            .data("urn:cloudlink:attributes", serde_json::Map::new())
            .build()
            .unwrap();
        let message_id = message.client_id;

        h.handle.queue(message).await.unwrap();
        h.session.set_authenticated(true);
        h.handle
            .storage_events()
            .send(StorageEvent {
                object_id,
                success: false,
            })
            .await
            .unwrap();
        settle(12_000).await;

        // Never sent, reported once, then dropped.
        assert!(h
            .mock
            .sent_batches()
            .iter()
            .flatten()
            .all(|m| m.client_id != message_id));
        let errors = h.observer.errors.lock().unwrap();
        let matching: Vec<_> = errors
            .iter()
            .filter(|(text, ids)| text.contains("Content sync failed") && ids.contains(&message_id))
            .collect();
        assert_eq!(matching.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_request_answered_next_sweep() {
        let h = harness(test_config());
        let request = Message::builder()
            .source("server")
            .destination("device-1")
            .request("GET", "devices/attributes/unknown", Value::Null)
            .build()
            .unwrap();
        let request_id = request.client_id;
        h.mock.push_result(Ok(vec![request]));

        h.session.set_authenticated(true);
        settle(8_000).await;

        let responses: Vec<Message> = h
            .mock
            .sent_batches()
            .into_iter()
            .flatten()
            .filter(|m| m.kind == MessageType::Response)
            .collect();
        assert_eq!(responses.len(), 1);
        match &responses[0].payload {
            Payload::Response {
                status, request_id: echoed, ..
            } => {
                assert_eq!(*status, 404);
                assert_eq!(echoed, &request_id.to_string());
            }
            other => panic!("expected response, got {:?}", other),
        }

        // REQUESTs go to the correlator, not on_receive.
        assert!(h.observer.received.lock().unwrap().is_empty());
        assert_eq!(h.handle.counters().messages_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_401_triggers_one_refresh_and_retry() {
        let h = harness(test_config());
        h.mock
            .push_result(Err(TransportError::new(Some(401), "token expired")));

        let message = data_message("device-1", Priority::Medium);
        let message_id = message.client_id;
        h.handle.queue(message).await.unwrap();
        h.session.set_authenticated(true);
        settle(4_000).await;

        assert_eq!(h.mock.refreshes(), 1);
        let attempts: Vec<_> = h
            .mock
            .sent_batches()
            .into_iter()
            .filter(|b| b.iter().any(|m| m.client_id == message_id))
            .collect();
        assert_eq!(attempts.len(), 2);
        assert_eq!(h.handle.counters().messages_retried as usize, attempts[0].len());
        assert_eq!(h.observer.delivered.lock().unwrap().len(), 1);
        assert!(h.observer.errors.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_401_surfaces_as_transport_error() {
        let h = harness(test_config());
        h.mock
            .push_result(Err(TransportError::new(Some(401), "token expired")));
        h.mock
            .push_result(Err(TransportError::new(Some(401), "still expired")));

        h.handle.queue(data_message("device-1", Priority::Low)).await.unwrap();
        h.session.set_authenticated(true);
        settle(4_000).await;

        assert_eq!(h.mock.refreshes(), 1);
        let errors = h.observer.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].0.contains("401"));
        assert!(h.observer.delivered.lock().unwrap().is_empty());
        assert_eq!(h.handle.counters().protocol_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_surfaces_auth_expired() {
        let h = harness(test_config());
        h.mock.refresh_ok.store(false, Ordering::Relaxed);
        h.mock
            .push_result(Err(TransportError::new(Some(401), "token expired")));

        h.handle.queue(data_message("device-1", Priority::Low)).await.unwrap();
        h.session.set_authenticated(true);
        settle(4_000).await;

        let errors = h.observer.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].0.contains("refresh failed"));
        // The failed refresh deauthenticates the session; later sweeps skip.
        assert!(!h.session.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_kept_outstanding() {
        let mut config = test_config();
        config.polling.long_polling = true;
        let h = harness(config);

        h.session.set_authenticated(true);
        settle(10_000).await;

        assert!(*h.mock.long_polls.lock().unwrap() >= 1);
        // Long polling replaces the proactive empty drain.
        assert!(h
            .mock
            .batches
            .lock()
            .unwrap()
            .iter()
            .all(|b| !b.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_401_refreshes_credentials() {
        let mut config = test_config();
        config.polling.long_polling = true;
        let h = harness(config);
        h.mock
            .push_long_poll_result(Err(TransportError::new(Some(401), "token expired")));

        h.session.set_authenticated(true);
        settle(10_000).await;

        // A receive-only device still recovers: one refresh, then the next
        // sweep re-opens the poll against fresh credentials.
        assert_eq!(h.mock.refreshes(), 1);
        assert!(h.session.is_authenticated());
        assert!(*h.mock.long_polls.lock().unwrap() >= 2);
        assert!(h.observer.errors.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_long_poll_401_surfaces_transport_error() {
        let mut config = test_config();
        config.polling.long_polling = true;
        let h = harness(config);
        h.mock
            .push_long_poll_result(Err(TransportError::new(Some(401), "token expired")));
        h.mock
            .push_long_poll_result(Err(TransportError::new(Some(401), "still expired")));

        h.session.set_authenticated(true);
        settle(8_000).await;

        // The refresh is spent on the first 401; the second one surfaces.
        assert_eq!(h.mock.refreshes(), 1);
        let errors = h.observer.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].0.contains("401"));
        assert!(errors[0].1.is_empty());
        assert_eq!(h.handle.counters().protocol_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_response_reported_when_queue_full() {
        let mut config = test_config();
        config.queue = QueueConfig {
            message_capacity: 2,
            ..Default::default()
        };
        let h = harness(config);

        // Two content-held messages keep the queue full across the sweep.
        let object_id = Uuid::new_v4();
        for _ in 0..2 {
            let message = Message::builder()
                .source("device-1")
                .storage_reference(object_id)
                .data("urn:cloudlink:attributes", serde_json::Map::new())
                .build()
                .unwrap();
            h.handle.queue(message).await.unwrap();
        }
        let request = Message::builder()
            .source("server")
            .destination("device-1")
            .request("GET", "devices/attributes/unknown", Value::Null)
            .build()
            .unwrap();
        h.mock.push_result(Ok(vec![request]));

        h.session.set_authenticated(true);
        settle(4_000).await;

        // The correlator's response had nowhere to go; it must not vanish
        // without an error naming it.
        let errors = h.observer.errors.lock().unwrap();
        let dropped: Vec<_> = errors
            .iter()
            .filter(|(text, ids)| text.contains("capacity") && ids.len() == 1)
            .collect();
        assert_eq!(dropped.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resources_report_retried_until_queued() {
        let mut config = test_config();
        config.queue = QueueConfig {
            message_capacity: 1,
            ..Default::default()
        };
        let h = harness(config);

        // The single slot is taken when the first sweep tries to advertise.
        h.handle.queue(data_message("device-1", Priority::Low)).await.unwrap();
        h.session.set_authenticated(true);
        settle(8_000).await;

        // The report goes out on a later sweep instead of being lost.
        assert!(h
            .mock
            .sent_batches()
            .iter()
            .flatten()
            .any(|m| m.kind == MessageType::ResourcesReport));
    }

    #[tokio::test(start_paused = true)]
    async fn test_obtain_replaces_stopped_dispatcher() {
        let (transport, _request_rx) = transport_channel(32);
        let registry = DispatcherRegistry::new();
        let session = SessionState::new();

        let first = registry
            .obtain(
                test_config(),
                transport.clone(),
                session.clone(),
                Arc::new(NoOpObserver),
            )
            .unwrap();
        first.stop().await.unwrap();

        let second = registry
            .obtain(test_config(), transport, session, Arc::new(NoOpObserver))
            .unwrap();
        assert!(!first.same_dispatcher(&second));
        second.queue(data_message("device-1", Priority::Low)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_obtain_is_idempotent_per_endpoint() {
        let (transport, _request_rx) = transport_channel(32);
        let registry = DispatcherRegistry::new();
        let session = SessionState::new();

        let first = registry
            .obtain(
                test_config(),
                transport.clone(),
                session.clone(),
                Arc::new(NoOpObserver),
            )
            .unwrap();
        let second = registry
            .obtain(test_config(), transport, session, Arc::new(NoOpObserver))
            .unwrap();
        assert!(first.same_dispatcher(&second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_twice_is_ok() {
        let h = harness(test_config());
        h.handle.stop().await.unwrap();
        h.handle.stop().await.unwrap();
        let err = h.handle.queue(data_message("a", Priority::Low)).await.unwrap_err();
        assert!(matches!(err, ClientError::ShuttingDown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_wait_never_sent() {
        let h = harness(test_config());
        let correlator = h.handle.request_dispatcher();
        correlator
            .register_request_handler(
                "device-1",
                "slow/resource",
                Arc::new(|_| Ok(Message::response_wait())),
            )
            .await;
        let request = Message::builder()
            .source("server")
            .destination("device-1")
            .request("GET", "slow/resource", Value::Null)
            .build()
            .unwrap();
        h.mock.push_result(Ok(vec![request]));

        h.session.set_authenticated(true);
        settle(10_000).await;

        assert!(h
            .mock
            .sent_batches()
            .iter()
            .flatten()
            .all(|m| m.kind != MessageType::Response && m.kind != MessageType::ResponseWait));
    }
}
