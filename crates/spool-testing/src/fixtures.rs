//! Event fixtures and entry builders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spool_core::{Entry, EntryId, EntryState, NewEntry, NodeId, Payload, SearchKeys};
use spool_dispatch::{encode_event, BusEvent};
use uuid::Uuid;

/// Event type used throughout the test suites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEvent {
    /// Unique marker for correlating deliveries.
    pub marker: String,
    /// Free-form content.
    pub body: String,
}

impl BusEvent for TestEvent {
    const EVENT_TYPE: &'static str = "test.event";
}

impl TestEvent {
    /// Creates an event with the given body and a fresh marker.
    pub fn new(body: impl Into<String>) -> Self {
        Self { marker: Uuid::new_v4().simple().to_string(), body: body.into() }
    }

    /// Encoded payload for this event.
    pub fn payload(&self) -> Payload {
        match encode_event(self) {
            Ok(payload) => payload,
            Err(error) => panic!("test event must encode: {error}"),
        }
    }
}

/// Append request for `event` created by `owner`.
pub fn new_entry(event: &TestEvent, owner: &NodeId) -> NewEntry {
    NewEntry::new(event.payload(), owner.clone())
}

/// Builder for stored entries in arbitrary states.
#[derive(Debug, Clone)]
pub struct EntryBuilder {
    id: EntryId,
    payload: Payload,
    creating_owner: NodeId,
    processing_owner: Option<NodeId>,
    state: EntryState,
    error_count: u32,
    at: DateTime<Utc>,
    search_keys: SearchKeys,
}

impl EntryBuilder {
    /// Available entry with id `id` holding a fresh [`TestEvent`].
    pub fn new(id: i64) -> Self {
        Self {
            id: EntryId(id),
            payload: TestEvent::new("fixture").payload(),
            creating_owner: NodeId::new("node-a"),
            processing_owner: None,
            state: EntryState::Available,
            error_count: 0,
            at: Utc::now(),
            search_keys: SearchKeys::default(),
        }
    }

    /// Sets the payload.
    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the payload from an event.
    pub fn event(self, event: &TestEvent) -> Self {
        self.payload(event.payload())
    }

    /// Sets the creating node.
    pub fn created_by(mut self, owner: impl Into<NodeId>) -> Self {
        self.creating_owner = owner.into();
        self
    }

    /// Marks the entry `IN_PROCESSING` under `owner`.
    pub fn claimed_by(mut self, owner: impl Into<NodeId>) -> Self {
        self.processing_owner = Some(owner.into());
        self.state = EntryState::InProcessing;
        self
    }

    /// Sets a state with no processing owner.
    pub fn state(mut self, state: EntryState) -> Self {
        self.state = state;
        self.processing_owner = None;
        self
    }

    /// Sets the error count.
    pub fn error_count(mut self, error_count: u32) -> Self {
        self.error_count = error_count;
        self
    }

    /// Sets every timestamp.
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    /// Sets the search keys.
    pub fn search_keys(mut self, search_keys: SearchKeys) -> Self {
        self.search_keys = search_keys;
        self
    }

    /// Builds the entry.
    pub fn build(self) -> Entry {
        Entry {
            id: self.id,
            payload: self.payload,
            creating_owner: self.creating_owner,
            processing_owner: self.processing_owner,
            state: self.state,
            error_count: self.error_count,
            created_time: self.at,
            updated_time: self.at,
            next_available_time: self.at,
            search_keys: self.search_keys,
        }
    }
}
