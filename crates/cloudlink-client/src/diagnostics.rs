//! # Diagnostic & Control Resources
//!
//! The dispatcher advertises a small fixed set of control resources to the
//! server on its first authenticated sweep, then answers REQUESTs against
//! them through the request dispatcher.
//!
//! ## Resource Table
//! ```text
//! ┌──────────────────────────────────────────────────────────────┬─────────┐
//! │ Path                                                         │ Methods │
//! ├──────────────────────────────────────────────────────────────┼─────────┤
//! │ …capability:message_dispatcher/counters                      │ GET     │
//! │ …capability:message_dispatcher/reset                         │ PUT     │
//! │ …capability:message_dispatcher/pollingInterval               │ GET,PUT │
//! │ …capability:diagnostics/info                                 │ GET     │
//! │ …capability:diagnostics/testConnectivity                     │ GET,PUT │
//! └──────────────────────────────────────────────────────────────┴─────────┘
//! ```
//!
//! The table is reproducible: the RESOURCES_REPORT carries an MD5
//! reconciliation mark computed over the comma-joined path list, so the
//! server can detect drift without diffing the full report.
//!
//! Handlers only mutate shared atomic state. Test-connectivity traffic is
//! generated by the scheduler sweep draining [`DiagnosticsState`], never by
//! a handler queueing into the dispatcher it runs inside of.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use cloudlink_core::{Counters, Message, Payload, Priority};

use crate::config::MIN_POLLING_INTERVAL_MS;
use crate::request::RequestDispatcher;

// =============================================================================
// Resource Table
// =============================================================================

const DISPATCHER_CAPABILITY: &str = "deviceModels/urn:cloudlink:capability:message_dispatcher";
const DIAGNOSTICS_CAPABILITY: &str = "deviceModels/urn:cloudlink:capability:diagnostics";

/// One advertised resource.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSpec {
    pub path: &'static str,
    pub methods: &'static str,
}

/// The fixed resource table, in report order.
pub const DIAGNOSTIC_RESOURCES: [ResourceSpec; 5] = [
    ResourceSpec {
        path: "deviceModels/urn:cloudlink:capability:message_dispatcher/counters",
        methods: "GET",
    },
    ResourceSpec {
        path: "deviceModels/urn:cloudlink:capability:message_dispatcher/reset",
        methods: "PUT",
    },
    ResourceSpec {
        path: "deviceModels/urn:cloudlink:capability:message_dispatcher/pollingInterval",
        methods: "GET,PUT",
    },
    ResourceSpec {
        path: "deviceModels/urn:cloudlink:capability:diagnostics/info",
        methods: "GET",
    },
    ResourceSpec {
        path: "deviceModels/urn:cloudlink:capability:diagnostics/testConnectivity",
        methods: "GET,PUT",
    },
];

/// Lowercase hex MD5 over the comma-joined path list. The server uses this
/// to reconcile its view of the advertised resources with ours.
pub fn reconciliation_mark(paths: &[&str]) -> String {
    format!("{:x}", md5::compute(paths.join(",")))
}

/// Builds the RESOURCES_REPORT advertising the full table.
pub fn resources_report(endpoint_id: &str) -> Message {
    let paths: Vec<&str> = DIAGNOSTIC_RESOURCES.iter().map(|r| r.path).collect();
    let resources: Vec<Value> = DIAGNOSTIC_RESOURCES
        .iter()
        .map(|r| json!({ "path": r.path, "methods": r.methods, "status": "ADDED" }))
        .collect();

    let mut data = Map::new();
    data.insert("reportType".into(), json!("COMPLETE"));
    data.insert("endpointId".into(), json!(endpoint_id));
    data.insert("value".into(), json!({ "resources": resources }));
    data.insert("mark".into(), json!(reconciliation_mark(&paths)));

    // The payload format and data are fixed and within limits, so build
    // cannot fail.
    Message::builder()
        .source(endpoint_id)
        .priority(Priority::Highest)
        .resources_report("urn:cloudlink:resources_report", data)
        .build()
        .unwrap_or_else(|_| Message::response_wait())
}

// =============================================================================
// Shared Diagnostic State
// =============================================================================

/// Atomic state shared between the request handlers (which run inside the
/// dispatcher task) and the scheduler sweep (which drains it). Handlers set
/// flags; the sweep emits the traffic.
pub struct DiagnosticsState {
    counters: Arc<Counters>,
    polling_interval_ms: AtomicU64,
    started_at: DateTime<Utc>,
    test_active: AtomicBool,
    test_remaining: AtomicU64,
    test_payload_bytes: AtomicU64,
    test_interval_ms: AtomicU64,
}

impl DiagnosticsState {
    pub fn new(counters: Arc<Counters>, polling_interval_ms: u64) -> Arc<Self> {
        Arc::new(DiagnosticsState {
            counters,
            polling_interval_ms: AtomicU64::new(polling_interval_ms),
            started_at: Utc::now(),
            test_active: AtomicBool::new(false),
            test_remaining: AtomicU64::new(0),
            test_payload_bytes: AtomicU64::new(0),
            test_interval_ms: AtomicU64::new(0),
        })
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn polling_interval_ms(&self) -> u64 {
        self.polling_interval_ms.load(Ordering::Relaxed)
    }

    /// Stores a new interval, clamped to the global floor. Returns the
    /// effective value.
    pub fn set_polling_interval_ms(&self, requested: u64) -> u64 {
        let effective = requested.max(MIN_POLLING_INTERVAL_MS);
        self.polling_interval_ms.store(effective, Ordering::Relaxed);
        info!(requested, effective, "Polling interval updated");
        effective
    }

    fn start_test(&self, count: u64, payload_bytes: u64, interval_ms: u64) {
        self.test_remaining.store(count, Ordering::Relaxed);
        self.test_payload_bytes.store(payload_bytes, Ordering::Relaxed);
        self.test_interval_ms.store(interval_ms, Ordering::Relaxed);
        self.test_active.store(count > 0, Ordering::Relaxed);
        info!(count, payload_bytes, interval_ms, "Connectivity test started");
    }

    fn stop_test(&self) {
        self.test_active.store(false, Ordering::Relaxed);
        self.test_remaining.store(0, Ordering::Relaxed);
        info!("Connectivity test stopped");
    }

    pub fn test_active(&self) -> bool {
        self.test_active.load(Ordering::Relaxed)
    }

    /// Called by the scheduler sweep. Emits the next test DATA message if a
    /// connectivity test is running, deactivating after the last one.
    pub fn take_test_message(&self, endpoint_id: &str) -> Option<Message> {
        if !self.test_active.load(Ordering::Relaxed) {
            return None;
        }
        let before = self.test_remaining.fetch_sub(1, Ordering::Relaxed);
        if before == 0 {
            // Another caller drained the last one between the checks.
            self.test_remaining.store(0, Ordering::Relaxed);
            self.test_active.store(false, Ordering::Relaxed);
            return None;
        }
        if before == 1 {
            self.test_active.store(false, Ordering::Relaxed);
        }

        let payload_bytes = self.test_payload_bytes.load(Ordering::Relaxed) as usize;
        let mut data = Map::new();
        data.insert("count".into(), json!(before - 1));
        data.insert("payload".into(), json!("*".repeat(payload_bytes)));

        debug!(remaining = before - 1, "Emitting connectivity test message");
        Message::builder()
            .source(endpoint_id)
            .priority(Priority::Lowest)
            .data("urn:cloudlink:capability:diagnostics:test_message", data)
            .build()
            .ok()
    }

    fn test_snapshot(&self) -> Value {
        json!({
            "active": self.test_active.load(Ordering::Relaxed),
            "count": self.test_remaining.load(Ordering::Relaxed),
            "payloadSize": self.test_payload_bytes.load(Ordering::Relaxed),
            "interval": self.test_interval_ms.load(Ordering::Relaxed),
        })
    }

    fn info_snapshot(&self) -> Value {
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "startTime": self.started_at.to_rfc3339(),
        })
    }
}

// =============================================================================
// Handler Registration
// =============================================================================

fn request_body(request: &Message) -> &Value {
    match &request.payload {
        Payload::Request { body, .. } => body,
        _ => &Value::Null,
    }
}

fn ok(request: &Message, body: Value) -> Message {
    Message::response_to(request, 200, body)
}

fn bad_request(request: &Message, reason: &str) -> Message {
    Message::response_to(request, 400, json!({ "error": reason }))
}

/// Registers all diagnostic handlers for `endpoint_id`.
pub async fn register_diagnostics(
    dispatcher: &RequestDispatcher,
    endpoint_id: &str,
    state: Arc<DiagnosticsState>,
) {
    let counters_state = state.clone();
    dispatcher
        .register_request_handler(
            endpoint_id,
            format!("{}/counters", DISPATCHER_CAPABILITY),
            Arc::new(move |req| {
                let snapshot = counters_state.counters().snapshot();
                Ok(ok(req, serde_json::to_value(snapshot).unwrap_or(Value::Null)))
            }),
        )
        .await;

    let reset_state = state.clone();
    dispatcher
        .register_request_handler(
            endpoint_id,
            format!("{}/reset", DISPATCHER_CAPABILITY),
            Arc::new(move |req| {
                reset_state.counters().reset();
                info!("Dispatch counters reset");
                Ok(ok(req, Value::Null))
            }),
        )
        .await;

    let interval_state = state.clone();
    dispatcher
        .register_request_handler(
            endpoint_id,
            format!("{}/pollingInterval", DISPATCHER_CAPABILITY),
            Arc::new(move |req| {
                let body = request_body(req);
                Ok(match method_of(req).as_deref() {
                    Some("GET") => ok(
                        req,
                        json!({ "pollingInterval": interval_state.polling_interval_ms() }),
                    ),
                    Some("PUT") => match body.get("pollingInterval").and_then(Value::as_u64) {
                        Some(requested) => {
                            let effective = interval_state.set_polling_interval_ms(requested);
                            ok(req, json!({ "pollingInterval": effective }))
                        }
                        None => bad_request(req, "pollingInterval must be a positive integer"),
                    },
                    _ => bad_request(req, "unsupported method"),
                })
            }),
        )
        .await;

    let info_state = state.clone();
    dispatcher
        .register_request_handler(
            endpoint_id,
            format!("{}/info", DIAGNOSTICS_CAPABILITY),
            Arc::new(move |req| Ok(ok(req, info_state.info_snapshot()))),
        )
        .await;

    let test_state = state;
    dispatcher
        .register_request_handler(
            endpoint_id,
            format!("{}/testConnectivity", DIAGNOSTICS_CAPABILITY),
            Arc::new(move |req| {
                let body = request_body(req);
                Ok(match method_of(req).as_deref() {
                    Some("GET") => ok(req, test_state.test_snapshot()),
                    Some("PUT") => {
                        let active = body.get("active").and_then(Value::as_bool);
                        match active {
                            Some(true) => {
                                let count = body.get("count").and_then(Value::as_u64);
                                let size = body.get("payloadSize").and_then(Value::as_u64);
                                let interval =
                                    body.get("interval").and_then(Value::as_u64).unwrap_or(0);
                                match (count, size) {
                                    (Some(count), Some(size)) => {
                                        test_state.start_test(count, size, interval);
                                        ok(req, test_state.test_snapshot())
                                    }
                                    _ => bad_request(req, "count and payloadSize are required"),
                                }
                            }
                            Some(false) => {
                                test_state.stop_test();
                                ok(req, test_state.test_snapshot())
                            }
                            None => bad_request(req, "active must be a boolean"),
                        }
                    }
                    _ => bad_request(req, "unsupported method"),
                })
            }),
        )
        .await;

    debug!(endpoint = endpoint_id, "Diagnostic resources registered");
}

fn method_of(request: &Message) -> Option<String> {
    match &request.payload {
        Payload::Request { method, .. } => Some(method.to_uppercase()),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use cloudlink_core::MessageType;

    fn state() -> Arc<DiagnosticsState> {
        DiagnosticsState::new(Arc::new(Counters::new()), 3000)
    }

    fn request(path: &str, method: &str, body: Value) -> Message {
        Message::builder()
            .source("server")
            .destination("device-1")
            .request(method, path, body)
            .build()
            .unwrap()
    }

    fn response_body(message: &Message) -> (u16, Value) {
        match &message.payload {
            Payload::Response { status, body, .. } => (*status, body.clone()),
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_reconciliation_mark_is_stable() {
        let paths: Vec<&str> = DIAGNOSTIC_RESOURCES.iter().map(|r| r.path).collect();
        let first = reconciliation_mark(&paths);
        let second = reconciliation_mark(&paths);
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));

        // Any table change must change the mark.
        let reordered: Vec<&str> = paths.iter().rev().copied().collect();
        assert_ne!(first, reconciliation_mark(&reordered));
    }

    #[test]
    fn test_resources_report_shape() {
        let report = resources_report("device-1");
        assert_eq!(report.kind, MessageType::ResourcesReport);
        assert_eq!(report.source.as_deref(), Some("device-1"));

        match &report.payload {
            Payload::Data { data, .. } => {
                assert_eq!(data["reportType"], json!("COMPLETE"));
                let resources = data["value"]["resources"].as_array().unwrap();
                assert_eq!(resources.len(), DIAGNOSTIC_RESOURCES.len());
                assert!(data["mark"].as_str().unwrap().len() == 32);
            }
            other => panic!("expected data payload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_polling_interval_put_clamps_to_floor() {
        let dispatcher = RequestDispatcher::new();
        let diag = state();
        register_diagnostics(&dispatcher, "device-1", diag.clone()).await;

        let req = request(
            "deviceModels/urn:cloudlink:capability:message_dispatcher/pollingInterval",
            "PUT",
            json!({ "pollingInterval": 10 }),
        );
        let response = dispatcher.dispatch(&req).await.unwrap();
        let (status, body) = response_body(&response);
        assert_eq!(status, 200);
        assert_eq!(body["pollingInterval"], json!(MIN_POLLING_INTERVAL_MS));
        assert_eq!(diag.polling_interval_ms(), MIN_POLLING_INTERVAL_MS);
    }

    #[tokio::test]
    async fn test_counters_reset_resource() {
        let dispatcher = RequestDispatcher::new();
        let diag = state();
        diag.counters().add_sent(5, 1234);
        register_diagnostics(&dispatcher, "device-1", diag.clone()).await;

        let get = request(
            "deviceModels/urn:cloudlink:capability:message_dispatcher/counters",
            "GET",
            Value::Null,
        );
        let (status, body) = response_body(&dispatcher.dispatch(&get).await.unwrap());
        assert_eq!(status, 200);
        assert_eq!(body["messagesSent"], json!(5));

        let reset = request(
            "deviceModels/urn:cloudlink:capability:message_dispatcher/reset",
            "PUT",
            Value::Null,
        );
        assert_eq!(response_body(&dispatcher.dispatch(&reset).await.unwrap()).0, 200);
        assert_eq!(diag.counters().snapshot().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_connectivity_test_drained_by_sweep() {
        let dispatcher = RequestDispatcher::new();
        let diag = state();
        register_diagnostics(&dispatcher, "device-1", diag.clone()).await;

        let start = request(
            "deviceModels/urn:cloudlink:capability:diagnostics/testConnectivity",
            "PUT",
            json!({ "active": true, "count": 2, "payloadSize": 8 }),
        );
        assert_eq!(response_body(&dispatcher.dispatch(&start).await.unwrap()).0, 200);
        assert!(diag.test_active());

        // The handler never queued anything; the sweep drains the state.
        let first = diag.take_test_message("device-1").unwrap();
        assert_eq!(first.source.as_deref(), Some("device-1"));
        assert!(diag.take_test_message("device-1").is_some());
        assert!(diag.take_test_message("device-1").is_none());
        assert!(!diag.test_active());
    }

    #[tokio::test]
    async fn test_connectivity_test_stop() {
        let dispatcher = RequestDispatcher::new();
        let diag = state();
        register_diagnostics(&dispatcher, "device-1", diag.clone()).await;

        diag.start_test(100, 4, 0);
        let stop = request(
            "deviceModels/urn:cloudlink:capability:diagnostics/testConnectivity",
            "PUT",
            json!({ "active": false }),
        );
        assert_eq!(response_body(&dispatcher.dispatch(&stop).await.unwrap()).0, 200);
        assert!(!diag.test_active());
        assert!(diag.take_test_message("device-1").is_none());
    }

    #[tokio::test]
    async fn test_info_resource() {
        let dispatcher = RequestDispatcher::new();
        register_diagnostics(&dispatcher, "device-1", state()).await;

        let req = request(
            "deviceModels/urn:cloudlink:capability:diagnostics/info",
            "GET",
            Value::Null,
        );
        let (status, body) = response_body(&dispatcher.dispatch(&req).await.unwrap());
        assert_eq!(status, 200);
        assert!(body["version"].as_str().is_some());
        assert!(body["startTime"].as_str().is_some());
    }
}
