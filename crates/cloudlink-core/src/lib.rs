//! # cloudlink-core: Pure Message Model for CloudLink
//!
//! This crate is the **heart** of the CloudLink SDK. It contains the message
//! model and the algorithms the dispatch engine is built on, as pure code
//! with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       CloudLink Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Application / Device Code                        │   │
//! │  │     builds Data/Alert messages, registers request handlers      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                cloudlink-client (Dispatch Engine)               │   │
//! │  │   scheduler sweeps, correlator, storage transfers, long-poll    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              ★ cloudlink-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐ ┌───────────┐ ┌───────────┐ ┌──────────────┐  │   │
//! │  │   │  message  │ │   queue   │ │  storage  │ │    fields    │  │   │
//! │  │   │ envelopes │ │ bounded   │ │ lifecycle │ │ typed attrs  │  │   │
//! │  │   │ builders  │ │ heap,FIFO │ │ machines  │ │ w/ schemas   │  │   │
//! │  │   └───────────┘ └───────────┘ └───────────┘ └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO TIMERS • NO NETWORK • PURE FUNCTIONS             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`message`] - Message envelopes, builders, priorities, payloads
//! - [`queue`] - Bounded priority queue, FIFO-stable within a priority
//! - [`storage`] - Storage object metadata and transfer state machines
//! - [`fields`] - Schema-driven typed attribute records
//! - [`counters`] - Dispatcher diagnostic totals
//! - [`error`] - Typed validation/queue/state errors
//!
//! ## Design Principles
//!
//! 1. **Pure Functions**: every operation here is deterministic and
//!    synchronous; the dispatch engine above owns all suspension points
//! 2. **No I/O**: network, file system and timers are FORBIDDEN here
//! 3. **Explicit Errors**: all failures are typed, never strings or panics
//! 4. **Validate before enqueue**: a message that fails validation never
//!    enters any tracked state

// =============================================================================
// Module Declarations
// =============================================================================

pub mod counters;
pub mod error;
pub mod fields;
pub mod message;
pub mod queue;
pub mod storage;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use counters::{Counters, CountersSnapshot};
pub use error::{QueueError, StateError, ValidationError, ValidationResult};
pub use fields::{FieldSpec, FieldType, FieldValue, Record, Schema};
pub use message::{Message, MessageBuilder, MessageType, Payload, Priority, Reliability};
pub use queue::PriorityQueue;
pub use storage::{StorageObject, SyncStatus, TransferIo, TransferState};
