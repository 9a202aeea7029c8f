//! # Request/Response Correlator
//!
//! Matches server-originated REQUEST messages to registered handlers by
//! (endpoint, resource path) and builds the RESPONSE messages that answer
//! them.
//!
//! ## Dispatch State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   Request Dispatch States                               │
//! │                                                                         │
//! │  RECEIVED ──lookup──► DISPATCHED ──handler──► RESPONDED (RESPONSE)      │
//! │     │                     │                                             │
//! │     │ invalid /           │ handler returns RESPONSE_WAIT               │
//! │     │ no handler          ▼                                             │
//! │     └────► 404        WAITING — handler queues the real RESPONSE       │
//! │                        later through the message dispatcher            │
//! │                                                                         │
//! │  A handler error, or a return value that is neither RESPONSE nor       │
//! │  RESPONSE_WAIT, is a contract violation by the handler: answered       │
//! │  with the default 404, never a crash.                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The registry is an explicit value injected where needed (the dispatcher
//! exposes its instance via `request_dispatcher()`); resource paths are
//! globally addressed per endpoint, so one logical registry exists per
//! client process.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use cloudlink_core::{Message, MessageType};

use crate::error::ClientResult;

// =============================================================================
// Handler Type
// =============================================================================

/// A registered request handler.
///
/// Returns the RESPONSE to send, or the RESPONSE_WAIT sentinel
/// ([`Message::response_wait`]) when the answer will be queued
/// asynchronously after I/O completes.
pub type RequestHandler = Arc<dyn Fn(&Message) -> ClientResult<Message> + Send + Sync>;

/// Dispatch progress, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Received,
    Dispatched,
    Responded,
    Waiting,
}

// =============================================================================
// Request Dispatcher
// =============================================================================

/// Handler registry plus the dispatch algorithm. Cheap to clone; all clones
/// share one registry.
#[derive(Clone, Default)]
pub struct RequestDispatcher {
    handlers: Arc<RwLock<HashMap<(String, String), RequestHandler>>>,
}

impl RequestDispatcher {
    pub fn new() -> Self {
        RequestDispatcher::default()
    }

    /// Registers a handler for (endpoint, path). Registering the same pair
    /// twice replaces the previous handler silently.
    pub async fn register_request_handler(
        &self,
        endpoint_id: impl Into<String>,
        path: impl Into<String>,
        handler: RequestHandler,
    ) {
        let key = (endpoint_id.into(), path.into());
        debug!(endpoint = %key.0, path = %key.1, "Registering request handler");
        self.handlers.write().await.insert(key, handler);
    }

    /// Removes a handler; returns whether one was registered.
    pub async fn unregister_request_handler(&self, endpoint_id: &str, path: &str) -> bool {
        self.handlers
            .write()
            .await
            .remove(&(endpoint_id.to_string(), path.to_string()))
            .is_some()
    }

    /// Looks up the handler for (endpoint, path).
    pub async fn get_request_handler(&self, endpoint_id: &str, path: &str) -> Option<RequestHandler> {
        self.handlers
            .read()
            .await
            .get(&(endpoint_id.to_string(), path.to_string()))
            .cloned()
    }

    /// Routes one REQUEST message.
    ///
    /// Returns the RESPONSE to queue, or `None` when the handler answered
    /// RESPONSE_WAIT and will queue the real response itself.
    pub async fn dispatch(&self, request: &Message) -> Option<Message> {
        let mut state = DispatchState::Received;
        debug!(client_id = %request.client_id, ?state, "Request received");

        // A request we cannot route to a handler still gets an answer.
        let (destination, url) = match Self::routing_key(request) {
            Some(key) => key,
            None => {
                warn!(client_id = %request.client_id, "Malformed request, answering 404");
                return Some(Self::default_response(request));
            }
        };

        let handler = match self.get_request_handler(&destination, &url).await {
            Some(handler) => handler,
            None => {
                debug!(endpoint = %destination, path = %url, "No handler registered, answering 404");
                return Some(Self::default_response(request));
            }
        };

        state = DispatchState::Dispatched;
        debug!(endpoint = %destination, path = %url, ?state, "Invoking request handler");

        let response = match handler(request) {
            Ok(message) => message,
            Err(e) => {
                warn!(?e, endpoint = %destination, path = %url, "Handler failed, answering 404");
                return Some(Self::default_response(request));
            }
        };

        match response.kind {
            MessageType::Response => {
                state = DispatchState::Responded;
                debug!(client_id = %request.client_id, ?state, "Request answered");
                Some(response)
            }
            MessageType::ResponseWait => {
                state = DispatchState::Waiting;
                debug!(client_id = %request.client_id, ?state, "Handler will answer asynchronously");
                None
            }
            other => {
                warn!(
                    kind = %other,
                    endpoint = %destination,
                    path = %url,
                    "Handler returned a non-response message, answering 404"
                );
                Some(Self::default_response(request))
            }
        }
    }

    /// Extracts (destination, url) if the message is a well-formed REQUEST.
    fn routing_key(request: &Message) -> Option<(String, String)> {
        if request.kind != MessageType::Request {
            return None;
        }
        let destination = request.destination.as_deref()?.trim();
        let url = request.payload.url()?.trim();
        if destination.is_empty() || url.is_empty() {
            return None;
        }
        Some((destination.to_string(), url.to_string()))
    }

    /// The default 404 RESPONSE, echoing the request id.
    pub fn default_response(request: &Message) -> Message {
        Message::response_to(request, 404, json!({ "error": "Not Found" }))
    }
}

// =============================================================================
// Tests
// =============================================================================
