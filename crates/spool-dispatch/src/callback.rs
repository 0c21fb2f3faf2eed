//! Payload decoding, handler invocation and outcome resolution.
//!
//! Handlers are registered per event type discriminator. A claimed entry is
//! decoded with `serde_json` into the handler's event type and handed to the
//! handler; the outcome then drives the entry's next lifecycle state:
//!
//! - handler succeeds: `PROCESSED`
//! - handler fails below the retry limit: `AVAILABLE` after a backoff
//! - handler fails at the retry limit: `FAILED`
//! - payload undecodable or no handler registered: `FAILED`

use std::{any::Any, collections::HashMap, fmt, marker::PhantomData, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use spool_core::{Clock, Entry, EntryId, EntryState, NodeId, Payload, SearchKeys};

use crate::{
    error::{DispatchError, HandlerError, Result},
    retry::{RetryDecision, RetryPolicy},
};

/// Event type carried on the bus.
///
/// `EVENT_TYPE` is the discriminator stored next to the serialized body and
/// used to route entries to handlers.
pub trait BusEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable discriminator for this event type.
    const EVENT_TYPE: &'static str;
}

/// Application handler for one event type.
///
/// Handlers run at least once per entry and must be idempotent.
#[async_trait]
pub trait EventHandler<E: BusEvent>: Send + Sync + 'static {
    /// Handles one event. An error schedules a retry or fails the entry.
    async fn handle(&self, event: E, ctx: &DispatchContext) -> std::result::Result<(), HandlerError>;
}

/// Entry metadata visible to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchContext {
    /// Entry being dispatched.
    pub entry_id: EntryId,
    /// Failed attempts before this one.
    pub error_count: u32,
    /// Node that appended the entry.
    pub creating_owner: NodeId,
    /// Correlation keys attached at append time.
    pub search_keys: SearchKeys,
}

impl DispatchContext {
    fn for_entry(entry: &Entry) -> Self {
        Self {
            entry_id: entry.id,
            error_count: entry.error_count,
            creating_owner: entry.creating_owner.clone(),
            search_keys: entry.search_keys.clone(),
        }
    }
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn invoke(&self, body: &[u8], ctx: &DispatchContext) -> Result<()>;
}

struct TypedHandler<E, H> {
    handler: H,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> ErasedHandler for TypedHandler<E, H>
where
    E: BusEvent,
    H: EventHandler<E>,
{
    async fn invoke(&self, body: &[u8], ctx: &DispatchContext) -> Result<()> {
        let event: E = serde_json::from_slice(body)
            .map_err(|e| DispatchError::decode(E::EVENT_TYPE, e.to_string()))?;

        self.handler
            .handle(event, ctx)
            .await
            .map_err(|e| DispatchError::handler(E::EVENT_TYPE, format!("{e:#}")))
    }
}

/// Maps event type discriminators to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `E` and returns the registry.
    #[must_use]
    pub fn with_handler<E, H>(mut self, handler: H) -> Self
    where
        E: BusEvent,
        H: EventHandler<E>,
    {
        self.register::<E, H>(handler);
        self
    }

    /// Registers `handler` for `E`, replacing any previous handler.
    pub fn register<E, H>(&mut self, handler: H)
    where
        E: BusEvent,
        H: EventHandler<E>,
    {
        let erased = TypedHandler { handler, _event: PhantomData::<fn() -> E> };
        self.handlers.insert(E::EVENT_TYPE, Arc::new(erased));
    }

    /// Whether a handler is registered for `event_type`.
    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Registered discriminators, sorted.
    pub fn event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    fn get(&self, event_type: &str) -> Option<Arc<dyn ErasedHandler>> {
        self.handlers.get(event_type).cloned()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry").field("event_types", &self.event_types()).finish()
    }
}

/// Serializes `event` into a payload tagged with its discriminator.
///
/// # Errors
///
/// Returns `DispatchError::Internal` if the event cannot be serialized.
pub fn encode_event<E: BusEvent>(event: &E) -> Result<Payload> {
    let body = serde_json::to_vec(event).map_err(|e| {
        DispatchError::internal(format!("failed to encode {}: {e}", E::EVENT_TYPE))
    })?;
    Ok(Payload::new(E::EVENT_TYPE, body))
}

/// Result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler completed.
    Processed,
    /// The handler returned an error or panicked.
    HandlerFailed {
        /// Handler error message
        error: String,
    },
    /// The payload could not be decoded or has no registered handler.
    Undecodable {
        /// Decode failure description
        reason: String,
    },
}

/// Decodes claimed entries, runs their handler and builds the next record.
#[derive(Debug, Clone)]
pub struct DispatchCallback {
    registry: Arc<HandlerRegistry>,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl DispatchCallback {
    /// Creates a callback over `registry`.
    pub fn new(registry: Arc<HandlerRegistry>, retry_policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { registry, retry_policy, clock }
    }

    /// Retry policy applied to handler failures.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Decodes `entry` and invokes its handler.
    ///
    /// Handler panics are caught and reported as handler failures.
    pub async fn dispatch(&self, entry: &Entry) -> DispatchOutcome {
        let event_type = entry.payload.event_type.as_str();
        let Some(handler) = self.registry.get(event_type) else {
            return DispatchOutcome::Undecodable {
                reason: format!("no handler registered for event type {event_type}"),
            };
        };

        let ctx = DispatchContext::for_entry(entry);
        let invocation = AssertUnwindSafe(handler.invoke(&entry.payload.body, &ctx)).catch_unwind();

        match invocation.await {
            Ok(Ok(())) => DispatchOutcome::Processed,
            Ok(Err(DispatchError::Decode { message, .. })) => {
                DispatchOutcome::Undecodable { reason: message }
            },
            Ok(Err(error)) => DispatchOutcome::HandlerFailed { error: error.to_string() },
            Err(panic) => DispatchOutcome::HandlerFailed {
                error: format!("handler for {event_type} panicked: {}", panic_message(&*panic)),
            },
        }
    }

    /// Builds the record that replaces `claimed` after `outcome`.
    ///
    /// The result is never `IN_PROCESSING` and never owned.
    pub fn build_entry(&self, claimed: &Entry, outcome: &DispatchOutcome) -> Entry {
        let now = self.clock.now_utc();
        let mut next = claimed.clone();
        next.processing_owner = None;
        next.updated_time = now;

        match outcome {
            DispatchOutcome::Processed => next.state = EntryState::Processed,
            DispatchOutcome::Undecodable { .. } => {
                next.error_count = claimed.error_count.saturating_add(1);
                next.state = EntryState::Failed;
            },
            DispatchOutcome::HandlerFailed { .. } => {
                next.error_count = claimed.error_count.saturating_add(1);
                match self.retry_policy.decide(next.error_count, now) {
                    RetryDecision::Retry { next_available_time } => {
                        next.state = EntryState::Available;
                        next.next_available_time = next_available_time;
                    },
                    RetryDecision::GiveUp { .. } => next.state = EntryState::Failed,
                }
            },
        }
        next
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use serde::Deserialize;
    use spool_core::TestClock;

    use super::*;
    use crate::retry::BackoffStrategy;

    #[derive(Debug, Serialize, Deserialize)]
    struct Greeting {
        name: String,
    }

    impl BusEvent for Greeting {
        const EVENT_TYPE: &'static str = "greeting";
    }

    #[derive(Default)]
    struct Greeter {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventHandler<Greeting> for Arc<Greeter> {
        async fn handle(
            &self,
            event: Greeting,
            _ctx: &DispatchContext,
        ) -> std::result::Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match event.name.as_str() {
                "panic" => panic!("greeter exploded"),
                "" => anyhow::bail!("name is empty"),
                _ => Ok(()),
            }
        }
    }

    fn policy(max_failure_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_failure_retries,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            jitter_factor: 0.0,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    fn claimed(clock: &TestClock, payload: Payload, error_count: u32) -> Entry {
        let now = clock.now_utc();
        Entry {
            id: EntryId(1),
            payload,
            creating_owner: NodeId::new("node-a"),
            processing_owner: Some(NodeId::new("node-a")),
            state: EntryState::InProcessing,
            error_count,
            created_time: now,
            updated_time: now,
            next_available_time: now,
            search_keys: SearchKeys::default(),
        }
    }

    fn greeting(name: &str) -> Payload {
        encode_event(&Greeting { name: name.to_string() }).unwrap()
    }

    fn callback(clock: &TestClock, greeter: &Arc<Greeter>, max: u32) -> DispatchCallback {
        let registry = HandlerRegistry::new().with_handler::<Greeting, _>(greeter.clone());
        DispatchCallback::new(Arc::new(registry), policy(max), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn successful_handler_processes_entry() {
        let clock = TestClock::new();
        let greeter = Arc::new(Greeter::default());
        let callback = callback(&clock, &greeter, 3);
        let entry = claimed(&clock, greeting("ada"), 0);

        let outcome = callback.dispatch(&entry).await;
        let next = callback.build_entry(&entry, &outcome);

        assert_eq!(outcome, DispatchOutcome::Processed);
        assert_eq!(next.state, EntryState::Processed);
        assert_eq!(next.error_count, 0);
        assert!(next.processing_owner.is_none());
        assert_eq!(greeter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_below_limit_schedules_retry() {
        let clock = TestClock::new();
        let greeter = Arc::new(Greeter::default());
        let callback = callback(&clock, &greeter, 3);
        let entry = claimed(&clock, greeting(""), 1);

        let outcome = callback.dispatch(&entry).await;
        let next = callback.build_entry(&entry, &outcome);

        assert!(matches!(outcome, DispatchOutcome::HandlerFailed { ref error } if error.contains("name is empty")));
        assert_eq!(next.state, EntryState::Available);
        assert_eq!(next.error_count, 2);
        assert_eq!(next.next_available_time, clock.now_utc() + chrono::Duration::seconds(4));
    }

    #[tokio::test]
    async fn failure_at_limit_fails_entry() {
        let clock = TestClock::new();
        let greeter = Arc::new(Greeter::default());
        let callback = callback(&clock, &greeter, 3);
        let entry = claimed(&clock, greeting(""), 2);

        let next = callback.build_entry(&entry, &callback.dispatch(&entry).await);

        assert_eq!(next.state, EntryState::Failed);
        assert_eq!(next.error_count, 3);
    }

    #[tokio::test]
    async fn undecodable_payloads_fail_without_invoking_handler() {
        let clock = TestClock::new();
        let greeter = Arc::new(Greeter::default());
        let callback = callback(&clock, &greeter, 3);

        for payload in [
            Payload::new("greeting", b"not json".to_vec()),
            Payload::new("farewell", b"{}".to_vec()),
        ] {
            let entry = claimed(&clock, payload, 0);
            let outcome = callback.dispatch(&entry).await;
            let next = callback.build_entry(&entry, &outcome);

            assert!(matches!(outcome, DispatchOutcome::Undecodable { .. }));
            assert_eq!(next.state, EntryState::Failed);
            assert_eq!(next.error_count, 1);
        }
        assert_eq!(greeter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_handler_counts_as_failure() {
        let clock = TestClock::new();
        let greeter = Arc::new(Greeter::default());
        let callback = callback(&clock, &greeter, 3);
        let entry = claimed(&clock, greeting("panic"), 0);

        let outcome = callback.dispatch(&entry).await;

        match outcome {
            DispatchOutcome::HandlerFailed { error } => assert!(error.contains("greeter exploded")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn registry_lists_event_types() {
        let registry =
            HandlerRegistry::new().with_handler::<Greeting, _>(Arc::new(Greeter::default()));

        assert!(registry.contains("greeting"));
        assert!(!registry.contains("farewell"));
        assert_eq!(registry.event_types(), vec!["greeting"]);
    }
}
