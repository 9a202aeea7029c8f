//! # Storage Dependency Tracker
//!
//! Maps in-flight storage objects to the client ids of messages whose
//! payloads reference them, so dependent messages are held back until their
//! content finishes synchronizing.
//!
//! ## Dependency Lifetime
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  Storage Dependency Lifetime                            │
//! │                                                                         │
//! │  queue(msg referencing obj)                                            │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  add(obj, msg) — exists while obj ∈ {NOT_IN_SYNC, SYNC_PENDING}        │
//! │        │                                                                │
//! │        ▼ obj reaches a terminal sync state                              │
//! │  complete(obj, success)                                                │
//! │     ├── success: dependents become eligible for the next sweep         │
//! │     └── failure: dependents enter the sticky permanently-failed set;   │
//! │                  each is reported via onError exactly once             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Owned exclusively by the message dispatcher task; no locking here.

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Tracks which messages wait on which storage objects, plus the sticky set
/// of messages whose content sync failed permanently.
#[derive(Debug, Default)]
pub struct StorageDependencyTracker {
    /// object id → client ids of messages waiting on it.
    by_object: HashMap<Uuid, HashSet<Uuid>>,
    /// message client id → object ids it still waits on.
    by_message: HashMap<Uuid, HashSet<Uuid>>,
    /// Messages that can never be sent because a dependency failed.
    /// Sticky until consumed by the single onError report.
    failed: HashSet<Uuid>,
}

impl StorageDependencyTracker {
    pub fn new() -> Self {
        StorageDependencyTracker::default()
    }

    /// Records that `message_id` must wait for `object_id`.
    pub fn add(&mut self, object_id: Uuid, message_id: Uuid) {
        self.by_object.entry(object_id).or_default().insert(message_id);
        self.by_message.entry(message_id).or_default().insert(object_id);
    }

    /// True while the message still waits on at least one object.
    pub fn has_pending(&self, message_id: &Uuid) -> bool {
        self.by_message
            .get(message_id)
            .is_some_and(|objects| !objects.is_empty())
    }

    /// Resolves an object's terminal sync state.
    ///
    /// On success, returns the messages released by this object (they may
    /// still wait on other objects — check [`Self::has_pending`]). On
    /// failure, the dependents move into the permanently-failed set and the
    /// released list is empty.
    pub fn complete(&mut self, object_id: Uuid, success: bool) -> Vec<Uuid> {
        let dependents = match self.by_object.remove(&object_id) {
            Some(dependents) => dependents,
            None => return Vec::new(),
        };

        let mut released = Vec::new();
        for message_id in dependents {
            if let Some(objects) = self.by_message.get_mut(&message_id) {
                objects.remove(&object_id);
                if objects.is_empty() {
                    self.by_message.remove(&message_id);
                }
            }

            if success {
                released.push(message_id);
            } else {
                self.failed.insert(message_id);
            }
        }
        released
    }

    /// Consumes the failed marker for a message. Returns true the first
    /// time (message must be routed to the error batch), false afterwards —
    /// the "reported exactly once" guarantee lives here.
    pub fn take_failed(&mut self, message_id: &Uuid) -> bool {
        self.failed.remove(message_id)
    }

    /// Number of objects with live dependents (diagnostics).
    pub fn tracked_objects(&self) -> usize {
        self.by_object.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_until_complete() {
        let mut tracker = StorageDependencyTracker::new();
        let object = Uuid::new_v4();
        let message = Uuid::new_v4();

        tracker.add(object, message);
        assert!(tracker.has_pending(&message));

        let released = tracker.complete(object, true);
        assert_eq!(released, vec![message]);
        assert!(!tracker.has_pending(&message));
        assert!(!tracker.take_failed(&message));
    }

    #[test]
    fn test_failure_marks_dependents_once() {
        let mut tracker = StorageDependencyTracker::new();
        let object = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        tracker.add(object, a);
        tracker.add(object, b);

        let released = tracker.complete(object, false);
        assert!(released.is_empty());

        // Each dependent is reported exactly once.
        assert!(tracker.take_failed(&a));
        assert!(!tracker.take_failed(&a));
        assert!(tracker.take_failed(&b));
    }

    #[test]
    fn test_message_with_two_objects_waits_for_both() {
        let mut tracker = StorageDependencyTracker::new();
        let obj_a = Uuid::new_v4();
        let obj_b = Uuid::new_v4();
        let message = Uuid::new_v4();

        tracker.add(obj_a, message);
        tracker.add(obj_b, message);

        tracker.complete(obj_a, true);
        assert!(tracker.has_pending(&message), "still waits on obj_b");

        tracker.complete(obj_b, true);
        assert!(!tracker.has_pending(&message));
    }

    #[test]
    fn test_unknown_object_is_noop() {
        let mut tracker = StorageDependencyTracker::new();
        assert!(tracker.complete(Uuid::new_v4(), true).is_empty());
        assert_eq!(tracker.tracked_objects(), 0);
    }
}
