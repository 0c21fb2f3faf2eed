//! Entry model and strongly-typed identifiers.
//!
//! An [`Entry`] is one durable unit of queued work. Its lifecycle is a small
//! monotonic graph:
//!
//! ```text
//!             claim                 handler ok
//! AVAILABLE ─────────▶ IN_PROCESSING ──────────▶ PROCESSED
//!     ▲                   │   │   │
//!     │ retry / reap /    │   │   └──── retries exhausted ──▶ FAILED
//!     └── release ────────┘   └──────── reap at limit ──────▶ REAPED
//! ```
//!
//! Terminal states (`PROCESSED`, `FAILED`, `REAPED`) are never left again.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Store-assigned entry identifier.
///
/// Identifiers are handed out in increasing order at append time and double
/// as the FIFO ordering key when claiming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub i64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EntryId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl sqlx::Type<PgDb> for EntryId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EntryId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let id = <i64 as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for EntryId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Opaque identity of one process participating in the bus.
///
/// Node identity is injected rather than looked up globally, so a single
/// test process can run many virtual nodes against one store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Wraps an existing identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds an identity for the running process as
    /// `hostname-pid-suffix`, where the suffix is random per call.
    pub fn generate() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        let suffix: u32 = rand::rng().random();

        Self(format!("{host}-{}-{suffix:08x}", std::process::id()))
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryState {
    /// Waiting to be claimed once `next_available_time` has passed.
    Available,
    /// Claimed by exactly one node.
    InProcessing,
    /// Handler completed successfully.
    Processed,
    /// Retries exhausted or payload unprocessable.
    Failed,
    /// Orphaned claim reclaimed after the retry budget was already spent.
    Reaped,
}

impl EntryState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 5] =
        [Self::Available, Self::InProcessing, Self::Processed, Self::Failed, Self::Reaped];

    /// Stable storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::InProcessing => "IN_PROCESSING",
            Self::Processed => "PROCESSED",
            Self::Failed => "FAILED",
            Self::Reaped => "REAPED",
        }
    }

    /// Terminal states are retained until purged and never re-enter
    /// circulation.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::Failed | Self::Reaped)
    }

    /// Returns whether the lifecycle graph has an edge from `self` to `next`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Available, Self::InProcessing)
                | (
                    Self::InProcessing,
                    Self::Available | Self::Processed | Self::Failed | Self::Reaped
                )
        )
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown entry state: {s}")))
    }
}

/// Serialized event body plus the discriminator used to pick its codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Event type discriminator.
    pub event_type: String,
    /// Encoded event body.
    pub body: Vec<u8>,
}

impl Payload {
    /// Creates a payload from a discriminator and encoded body.
    pub fn new(event_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self { event_type: event_type.into(), body: body.into() }
    }
}

/// Opaque correlation keys attached at append time for external querying.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchKeys {
    /// First correlation key.
    pub key1: Option<String>,
    /// Second correlation key.
    pub key2: Option<String>,
}

impl SearchKeys {
    /// Keys with only the first slot set.
    pub fn key1(key: impl Into<String>) -> Self {
        Self { key1: Some(key.into()), key2: None }
    }

    /// Keys with both slots set.
    pub fn pair(key1: impl Into<String>, key2: impl Into<String>) -> Self {
        Self { key1: Some(key1.into()), key2: Some(key2.into()) }
    }
}

/// One durable unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Store-assigned identifier, never changes.
    pub id: EntryId,
    /// Event discriminator and body, never changes.
    pub payload: Payload,
    /// Node that appended the entry.
    pub creating_owner: NodeId,
    /// Node holding the claim; set only while `InProcessing`.
    pub processing_owner: Option<NodeId>,
    /// Current lifecycle state.
    pub state: EntryState,
    /// Failed dispatch attempts so far.
    pub error_count: u32,
    /// Append time.
    pub created_time: DateTime<Utc>,
    /// Last state change, stamped by the store.
    pub updated_time: DateTime<Utc>,
    /// Earliest time the entry may be claimed.
    pub next_available_time: DateTime<Utc>,
    /// Correlation keys.
    pub search_keys: SearchKeys,
}

impl Entry {
    /// Returns whether the entry can be claimed at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.state == EntryState::Available && self.next_available_time <= now
    }

    /// Returns whether the claim is older than `cutoff`.
    pub fn is_stale_claim(&self, cutoff: DateTime<Utc>) -> bool {
        self.state == EntryState::InProcessing && self.updated_time < cutoff
    }

    /// Checks the owner/state pairing every stored entry must satisfy.
    pub fn ownership_consistent(&self) -> bool {
        self.processing_owner.is_some() == (self.state == EntryState::InProcessing)
    }
}

/// Input for [`crate::EntryStore::append`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    /// Event discriminator and body.
    pub payload: Payload,
    /// Appending node.
    pub creating_owner: NodeId,
    /// Correlation keys.
    pub search_keys: SearchKeys,
}

impl NewEntry {
    /// Creates an append request without search keys.
    pub fn new(payload: Payload, creating_owner: NodeId) -> Self {
        Self { payload, creating_owner, search_keys: SearchKeys::default() }
    }

    /// Attaches correlation keys.
    #[must_use]
    pub fn with_search_keys(mut self, search_keys: SearchKeys) -> Self {
        self.search_keys = search_keys;
        self
    }
}
