//! # cloudlink-client: Dispatch Engine for CloudLink
//!
//! This crate provides the messaging layer of the CloudLink device SDK:
//! queueing, scheduling, request correlation, and storage transfer
//! dispatch over a pluggable transport.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       CloudLink Client Architecture                     │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 MessageDispatcher (Tokio task)                   │  │
//! │  │                                                                  │  │
//! │  │  Owns the priority queue + storage dependency tracker            │  │
//! │  │  Periodic sweep: drain → send/receive → classify → re-queue      │  │
//! │  │  One instance per endpoint via DispatcherRegistry                │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │RequestDispatch.│  │   Transport    │  │  StorageDispatcher     │    │
//! │  │                │  │   (channel     │  │                        │    │
//! │  │ (endpoint,path)│  │   boundary)    │  │ Upload/download queue  │    │
//! │  │ → handler      │  │ send/receive   │  │ Transfer state machine │    │
//! │  │ default 404    │  │ refresh        │  │ StorageEvents feed the │    │
//! │  │                │  │ transfer       │  │ dependency tracker     │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Diagnostics Resources                        │   │
//! │  │                                                                 │   │
//! │  │ Counters, reset, polling interval, info, connectivity test      │   │
//! │  │ Advertised once via RESOURCES_REPORT with an MD5 mark           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - TOML + environment configuration with validation
//! - [`dependency`] - Storage dependency tracker (held-back messages)
//! - [`diagnostics`] - Control resources and the resources report
//! - [`dispatcher`] - The message dispatcher task, registry, and observer
//! - [`error`] - Client error taxonomy
//! - [`request`] - Request/response correlator
//! - [`storage_dispatcher`] - Storage transfer queue and scheduler
//! - [`transport`] - Transport channel boundary and session state
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cloudlink_client::{
//!     transport_channel, ClientConfig, DispatcherRegistry, NoOpObserver, SessionState,
//! };
//! use cloudlink_core::{Message, Priority};
//! use std::sync::Arc;
//!
//! let config = ClientConfig::from_toml(&toml_text)?;
//! let (transport, transport_rx) = transport_channel(32);
//! // ... hand transport_rx to the HTTP transport implementation ...
//!
//! let session = SessionState::new();
//! let registry = DispatcherRegistry::new();
//! let dispatcher = registry.obtain(config, transport, session, Arc::new(NoOpObserver))?;
//!
//! let message = Message::builder()
//!     .source("my-endpoint")
//!     .priority(Priority::Medium)
//!     .data("urn:example:attributes", attributes)
//!     .build()?;
//! dispatcher.queue(message).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod dependency;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod request;
pub mod storage_dispatcher;
pub mod transport;

// =============================================================================
// Re-exports
// =============================================================================

// Core dispatch types
pub use dispatcher::{
    DispatcherHandle, DispatcherObserver, DispatcherRegistry, MessageDispatcher, NoOpObserver,
};
pub use error::{ClientError, ClientResult, TransportError};
pub use request::{RequestDispatcher, RequestHandler};

// Configuration
pub use config::{ClientConfig, PollingConfig, QueueConfig, ServerConfig, TransportConfig};

// Transport boundary
pub use transport::{
    transport_channel, SessionState, TransferDescriptor, TransferProgress, TransportHandle,
    TransportRequest,
};

// Storage
pub use dependency::StorageDependencyTracker;
pub use storage_dispatcher::{
    shared, NoOpStorageObserver, SharedStorageObject, StorageDispatcher, StorageDispatcherHandle,
    StorageEvent, StorageObserver,
};

// Diagnostics
pub use diagnostics::{
    reconciliation_mark, resources_report, DiagnosticsState, ResourceSpec, DIAGNOSTIC_RESOURCES,
};
