//! The dispatch engine: state reconstruction and command dispatch.
//!
//! An [`Engine`] owns a populated, read-only [`Registry`] plus two pieces
//! of configuration: the default CloudEvents `source` stamped on
//! materialized events and the [`UnmatchedPolicy`] governing unknown
//! command/event types. Both pipelines are pure orchestration -- the only
//! suspension points are the state loader await and the side-effect
//! handler awaits, and the fold over events is strictly sequential.
//!
//! Engines are cheap to share: `&Engine` is `Send + Sync`, and concurrent
//! dispatches share nothing but the read-only registry.

use std::any::type_name;

use serde_json::Value;

use crate::command::Command;
use crate::error::EngineError;
use crate::event::Event;
use crate::registry::{Registry, ScopeKey, StateSlot};
use crate::upcast::maybe_upcast;

/// Default CloudEvents `source` when the builder does not configure one.
const DEFAULT_SOURCE: &str = "/";

/// What to do when no handler matches a command or event type.
///
/// The permissive [`Skip`](UnmatchedPolicy::Skip) default reproduces the
/// classic behavior of treating unmatched types as legitimate absence: an
/// unknown command dispatches to nothing and returns an absent state, an
/// event with no rebuilder leaves the fold untouched. Each skip leaves a
/// `tracing::debug!` breadcrumb so the condition stays diagnosable.
/// [`Fail`](UnmatchedPolicy::Fail) surfaces both cases as typed errors.
///
/// Side-effect fan-out is unaffected: an event type with no registered
/// event handlers is never an error under either policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnmatchedPolicy {
    /// Silently skip unmatched command and event types.
    #[default]
    Skip,
    /// Surface unmatched types as [`EngineError::UnknownCommandType`] /
    /// [`EngineError::UnknownEventType`].
    Fail,
}

/// The dispatch engine.
///
/// Constructed from a populated [`Registry`] via [`Engine::new`] or
/// [`Engine::builder`]. Multiple independent engines can coexist in one
/// process -- there is no global state.
///
/// # Examples
///
/// ```
/// use commandfold::{Engine, Registry};
/// use std::convert::Infallible;
///
/// #[derive(serde::Deserialize)]
/// struct Registered { amount: i64 }
///
/// let mut registry = Registry::new();
/// registry.register_state_rebuilder(
///     "Registered",
///     "lending",
///     |data: Registered, _state: Option<i64>| data.amount,
/// )?;
///
/// let engine = Engine::builder(registry)
///     .default_source("https://library.example")
///     .build();
/// assert_eq!(engine.default_source(), "https://library.example");
/// # Ok::<(), commandfold::RegistrationError>(())
/// ```
pub struct Engine {
    registry: Registry,
    default_source: String,
    policy: UnmatchedPolicy,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("default_source", &self.default_source)
            .field("policy", &self.policy)
            .finish()
    }
}

impl Engine {
    /// Build an engine with default configuration.
    pub fn new(registry: Registry) -> Self {
        Self::builder(registry).build()
    }

    /// Start configuring an engine around a populated registry.
    pub fn builder(registry: Registry) -> EngineBuilder {
        EngineBuilder {
            registry,
            default_source: DEFAULT_SOURCE.to_owned(),
            policy: UnmatchedPolicy::default(),
        }
    }

    /// The default `source` stamped on materialized events that do not
    /// carry an explicit one.
    pub fn default_source(&self) -> &str {
        &self.default_source
    }

    /// Reconstruct current state for `subjects` under `context`.
    ///
    /// Obtains history through the context's registered loader (no loader
    /// means empty history), upcasts each event independently in order,
    /// and folds the results through the context's rebuilders starting
    /// from absent state. Reconstruction is a pure function of the
    /// loader's output and the registry; nothing is cached across calls.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Loader`] if the loader fails.
    /// - [`EngineError::InvalidEventPayload`] /
    ///   [`EngineError::StateTypeMismatch`] on a typed-boundary mismatch.
    /// - [`EngineError::UnknownEventType`] under [`UnmatchedPolicy::Fail`]
    ///   when an event has no rebuilder.
    pub async fn create_state<S>(
        &self,
        context: &str,
        subjects: &[String],
    ) -> Result<Option<S>, EngineError>
    where
        S: Send + Sync + 'static,
    {
        let state = self.replay(context, subjects).await?;
        downcast_state(state)
    }

    /// Dispatch a command and return the resulting state.
    ///
    /// Reconstructs state under the handler's registered context, invokes
    /// the handler, folds each produced event into the state immediately
    /// and in order (so a command producing multiple events sees each
    /// prior event's effect), materializes the events into wire form, and
    /// fans each one out to its event handlers in registration order.
    /// Every side-effect handler is awaited before this method returns.
    ///
    /// An unknown command type returns `Ok(None)` under the default
    /// policy -- indistinguishable from a dispatch that produced no
    /// state. Callers who need to tell the cases apart configure
    /// [`UnmatchedPolicy::Fail`].
    ///
    /// # Errors
    ///
    /// - [`EngineError::Domain`] if the handler rejects the command; no
    ///   events are emitted and no side effects run.
    /// - [`EngineError::SideEffect`] if an event handler fails; remaining
    ///   fan-out is aborted.
    /// - Any error [`create_state`](Engine::create_state) can produce,
    ///   plus [`EngineError::InvalidCommandData`] and, under
    ///   [`UnmatchedPolicy::Fail`], [`EngineError::UnknownCommandType`].
    pub async fn handle_command<S>(&self, command: Command) -> Result<Option<S>, EngineError>
    where
        S: Send + Sync + 'static,
    {
        let Some(entry) = self.registry.command_handler(&command.command_type) else {
            return match self.policy {
                UnmatchedPolicy::Skip => {
                    tracing::debug!(
                        command_type = %command.command_type,
                        "no command handler registered, ignoring command"
                    );
                    Ok(None)
                }
                UnmatchedPolicy::Fail => Err(EngineError::UnknownCommandType {
                    command_type: command.command_type,
                }),
            };
        };
        let context = entry.context.as_str();

        let mut state = self.replay(context, &command.subjects).await?;

        // Decide: a domain rejection aborts the dispatch here, before any
        // event exists.
        let produced = (entry.handler)(&command.data, state.as_deref())?;

        // Fold new events live, in order. They are current-version by
        // construction, so no upcasting applies.
        for event in &produced {
            state = self.fold(context, &event.event_type, &event.data, state)?;
        }

        let events: Vec<Event> = produced
            .into_iter()
            .map(|event| event.materialize(&self.default_source))
            .collect();

        tracing::info!(
            command_type = %command.command_type,
            context = %context,
            events = events.len(),
            "command dispatched"
        );

        // Fan out: all handlers for all events, awaited in registration
        // order. A failure aborts the remaining fan-out.
        for event in &events {
            for handler in self.registry.event_handlers(&event.event_type) {
                handler
                    .handle(event, state.as_deref())
                    .await
                    .map_err(|source| EngineError::SideEffect {
                        event_type: event.event_type.clone(),
                        source,
                    })?;
            }
        }

        downcast_state(state)
    }

    /// Load, upcast, and fold history into a type-erased state slot.
    async fn replay(&self, context: &str, subjects: &[String]) -> Result<StateSlot, EngineError> {
        let history = match self.registry.loader(context) {
            Some(loader) => loader.load(subjects).await.map_err(EngineError::Loader)?,
            None => {
                tracing::debug!(context = %context, "no state loader registered, history is empty");
                Vec::new()
            }
        };

        tracing::debug!(context = %context, events = history.len(), "replaying history");

        let mut state: StateSlot = None;
        for event in history {
            let event = maybe_upcast(&self.registry, context, event);
            state = self.fold(context, &event.event_type, &event.data, state)?;
        }
        Ok(state)
    }

    /// One fold step: apply the `(context, type)` rebuilder or follow the
    /// unmatched policy.
    fn fold(
        &self,
        context: &str,
        event_type: &str,
        data: &Value,
        state: StateSlot,
    ) -> Result<StateSlot, EngineError> {
        match self.registry.rebuilder(context, event_type) {
            Some(rebuilder) => rebuilder(data, state),
            None => match self.policy {
                UnmatchedPolicy::Skip => {
                    tracing::debug!(
                        context = %context,
                        event_type = %event_type,
                        "no state rebuilder registered, skipping event"
                    );
                    Ok(state)
                }
                UnmatchedPolicy::Fail => Err(EngineError::UnknownEventType {
                    key: ScopeKey::new(context, event_type),
                }),
            },
        }
    }
}

/// Recover the caller's concrete state type from the erased fold result.
fn downcast_state<S>(state: StateSlot) -> Result<Option<S>, EngineError>
where
    S: Send + Sync + 'static,
{
    match state {
        Some(boxed) => boxed
            .downcast::<S>()
            .map(|boxed| Some(*boxed))
            .map_err(|_| EngineError::StateTypeMismatch {
                expected: type_name::<S>(),
            }),
        None => Ok(None),
    }
}

/// Builder collecting engine configuration around a populated registry.
#[derive(Debug)]
pub struct EngineBuilder {
    registry: Registry,
    default_source: String,
    policy: UnmatchedPolicy,
}

impl EngineBuilder {
    /// Set the default CloudEvents `source` for materialized events.
    ///
    /// Applies to any event the command handler produced without an
    /// explicit source. Defaults to `"/"`.
    pub fn default_source(mut self, source: impl Into<String>) -> Self {
        self.default_source = source.into();
        self
    }

    /// Set the policy for unmatched command and event types.
    ///
    /// Defaults to [`UnmatchedPolicy::Skip`].
    pub fn unmatched_policy(mut self, policy: UnmatchedPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Finish configuration and produce the [`Engine`].
    pub fn build(self) -> Engine {
        Engine {
            registry: self.registry,
            default_source: self.default_source,
            policy: self.policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{NewEvent, SPEC_VERSION};
    use crate::handler::{BoxError, EventHandler, StateLoader};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::{Value, json};
    use std::any::Any;
    use std::sync::{Arc, Mutex};

    /// Lending-domain state used across the engine tests.
    #[derive(Debug, Clone, PartialEq)]
    struct Shelf {
        amount: i64,
    }

    #[derive(Deserialize)]
    struct Registered {
        amount: i64,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("nothing left to borrow")]
    struct OutOfStock;

    /// Loader returning a fixed event sequence regardless of subjects.
    struct FixedLoader(Vec<Event>);

    #[async_trait]
    impl StateLoader for FixedLoader {
        async fn load(&self, _subjects: &[String]) -> Result<Vec<Event>, BoxError> {
            Ok(self.0.clone())
        }
    }

    struct FailingLoader;

    #[async_trait]
    impl StateLoader for FailingLoader {
        async fn load(&self, _subjects: &[String]) -> Result<Vec<Event>, BoxError> {
            Err("store unreachable".into())
        }
    }

    /// Side-effect handler recording every event it sees, tagged so
    /// fan-out order across handlers is observable.
    struct Recorder {
        tag: &'static str,
        seen: Arc<Mutex<Vec<(String, Event)>>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(
            &self,
            event: &Event,
            _state: Option<&(dyn Any + Send + Sync)>,
        ) -> Result<(), BoxError> {
            self.seen
                .lock()
                .expect("recorder lock")
                .push((self.tag.to_string(), event.clone()));
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl EventHandler for FailingHandler {
        async fn handle(
            &self,
            _event: &Event,
            _state: Option<&(dyn Any + Send + Sync)>,
        ) -> Result<(), BoxError> {
            Err("projection write failed".into())
        }
    }

    fn stored(event_type: &str, subject: &str, data: Value) -> Event {
        NewEvent::new(event_type, subject, data).materialize("urn:loader")
    }

    /// Registry with the lending fixtures: a loader seeded with a
    /// `Registered {amount}` event, rebuilders for `Registered` and
    /// `Borrowed`, and a `borrow` command handler that rejects once the
    /// shelf is empty.
    fn lending_registry(initial_amount: i64) -> Registry {
        let mut registry = Registry::new();
        registry.register_state_loader(
            "lending",
            FixedLoader(vec![stored(
                "Registered",
                "/b/1",
                json!({"amount": initial_amount}),
            )]),
        );
        registry
            .register_state_rebuilder(
                "Registered",
                "lending",
                |data: Registered, _state: Option<Shelf>| Shelf {
                    amount: data.amount,
                },
            )
            .expect("register Registered rebuilder");
        registry
            .register_state_rebuilder(
                "Borrowed",
                "lending",
                |_data: Value, state: Option<Shelf>| {
                    let shelf = state.expect("Borrowed always follows Registered");
                    Shelf {
                        amount: shelf.amount - 1,
                    }
                },
            )
            .expect("register Borrowed rebuilder");
        registry
            .register_command_handler(
                "borrow",
                "lending",
                |_data: Value, state: Option<&Shelf>| {
                    let amount = state.map_or(0, |shelf| shelf.amount);
                    if amount <= 0 {
                        return Err(OutOfStock);
                    }
                    Ok(vec![NewEvent::new("Borrowed", "/b/1", Value::Null)])
                },
            )
            .expect("register borrow handler");
        registry
    }

    #[tokio::test]
    async fn create_state_is_deterministic() {
        let engine = Engine::new(lending_registry(3));

        let subjects = vec!["/b/1".to_string()];
        let first: Option<Shelf> = engine
            .create_state("lending", &subjects)
            .await
            .expect("first reconstruction");
        let second: Option<Shelf> = engine
            .create_state("lending", &subjects)
            .await
            .expect("second reconstruction");

        assert_eq!(first, Some(Shelf { amount: 3 }));
        assert_eq!(first, second, "same history must yield the same state");
    }

    #[tokio::test]
    async fn create_state_without_loader_is_absent() {
        let engine = Engine::new(Registry::new());
        let state: Option<Shelf> = engine
            .create_state("lending", &["/b/1".to_string()])
            .await
            .expect("reconstruction with empty history");
        assert_eq!(state, None);
    }

    #[tokio::test]
    async fn create_state_skips_events_without_rebuilder() {
        let mut registry = lending_registry(3);
        // Replace the loader with one that interleaves an unknown type.
        registry.register_state_loader(
            "lending",
            FixedLoader(vec![
                stored("Registered", "/b/1", json!({"amount": 3})),
                stored("Audited", "/b/1", json!({"by": "inspector"})),
                stored("Borrowed", "/b/1", Value::Null),
            ]),
        );
        let engine = Engine::new(registry);

        let state: Option<Shelf> = engine
            .create_state("lending", &["/b/1".to_string()])
            .await
            .expect("unknown event types are skipped");
        assert_eq!(state, Some(Shelf { amount: 2 }));
    }

    #[tokio::test]
    async fn create_state_strict_policy_fails_on_unknown_event() {
        let mut registry = lending_registry(3);
        registry.register_state_loader(
            "lending",
            FixedLoader(vec![stored("Audited", "/b/1", json!({}))]),
        );
        let engine = Engine::builder(registry)
            .unmatched_policy(UnmatchedPolicy::Fail)
            .build();

        let err = engine
            .create_state::<Shelf>("lending", &["/b/1".to_string()])
            .await
            .expect_err("strict policy should surface the unknown type");
        assert!(matches!(
            err,
            EngineError::UnknownEventType { ref key } if key.to_string() == "[lending|Audited]"
        ));
    }

    #[tokio::test]
    async fn rebuilders_are_isolated_by_context() {
        let mut registry = Registry::new();
        // Both contexts see an event of type "Registered"; only lending
        // has a rebuilder for it.
        registry.register_state_loader(
            "lending",
            FixedLoader(vec![stored("Registered", "/b/1", json!({"amount": 3}))]),
        );
        registry.register_state_loader(
            "billing",
            FixedLoader(vec![stored("Registered", "/b/1", json!({"amount": 3}))]),
        );
        registry
            .register_state_rebuilder(
                "Registered",
                "lending",
                |data: Registered, _: Option<Shelf>| Shelf {
                    amount: data.amount,
                },
            )
            .expect("register rebuilder");
        let engine = Engine::new(registry);

        let lending: Option<Shelf> = engine
            .create_state("lending", &["/b/1".to_string()])
            .await
            .expect("lending reconstruction");
        assert_eq!(lending, Some(Shelf { amount: 3 }));

        let billing: Option<Shelf> = engine
            .create_state("billing", &["/b/1".to_string()])
            .await
            .expect("billing reconstruction");
        assert_eq!(
            billing, None,
            "the lending rebuilder must not fire under billing"
        );
    }

    #[tokio::test]
    async fn replay_folds_the_upcaster_output() {
        let mut registry = lending_registry(3);
        // History carries the v0 shape; the upcaster rewrites it to the
        // current type and payload before the fold.
        registry.register_state_loader(
            "lending",
            FixedLoader(vec![stored("RegisteredV0", "/b/1", json!({"count": 5}))]),
        );
        registry
            .register_upcaster("RegisteredV0", "lending", |mut event| {
                let count = event.data["count"].clone();
                event.event_type = "Registered".to_string();
                event.data = json!({ "amount": count });
                event
            })
            .expect("register upcaster");
        let engine = Engine::new(registry);

        let state: Option<Shelf> = engine
            .create_state("lending", &["/b/1".to_string()])
            .await
            .expect("reconstruction through the upcaster");
        assert_eq!(state, Some(Shelf { amount: 5 }));
    }

    #[tokio::test]
    async fn create_state_surfaces_loader_failure() {
        let mut registry = Registry::new();
        registry.register_state_loader("lending", FailingLoader);
        let engine = Engine::new(registry);

        let err = engine
            .create_state::<Shelf>("lending", &["/b/1".to_string()])
            .await
            .expect_err("loader failure should propagate");
        assert!(matches!(err, EngineError::Loader(_)));
    }

    #[tokio::test]
    async fn create_state_rejects_wrong_state_type() {
        let engine = Engine::new(lending_registry(3));

        let err = engine
            .create_state::<String>("lending", &["/b/1".to_string()])
            .await
            .expect_err("downcast to the wrong type should fail");
        assert!(matches!(err, EngineError::StateTypeMismatch { .. }));
    }

    #[tokio::test]
    async fn handle_command_folds_and_returns_state() {
        let engine = Engine::new(lending_registry(3));

        let state: Option<Shelf> = engine
            .handle_command(Command::new("borrow", ["/b/1"], json!({})))
            .await
            .expect("dispatch should succeed");
        assert_eq!(
            state,
            Some(Shelf { amount: 2 }),
            "the produced Borrowed event is folded before returning"
        );
    }

    #[tokio::test]
    async fn handle_command_unknown_type_is_a_silent_no_op() {
        let engine = Engine::new(lending_registry(3));

        let state: Option<Shelf> = engine
            .handle_command(Command::new("purchase", ["/b/1"], json!({})))
            .await
            .expect("unknown command type should not error by default");
        assert_eq!(state, None);
    }

    #[tokio::test]
    async fn handle_command_unknown_type_fails_under_strict_policy() {
        let engine = Engine::builder(lending_registry(3))
            .unmatched_policy(UnmatchedPolicy::Fail)
            .build();

        let err = engine
            .handle_command::<Shelf>(Command::new("purchase", ["/b/1"], json!({})))
            .await
            .expect_err("strict policy should surface the unknown command");
        assert!(matches!(
            err,
            EngineError::UnknownCommandType { ref command_type } if command_type == "purchase"
        ));
    }

    #[tokio::test]
    async fn handle_command_domain_rejection_aborts_dispatch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = lending_registry(0);
        registry.register_event_handler(
            "Borrowed",
            Recorder {
                tag: "a",
                seen: seen.clone(),
            },
        );
        let engine = Engine::new(registry);

        let err = engine
            .handle_command::<Shelf>(Command::new("borrow", ["/b/1"], json!({})))
            .await
            .expect_err("empty shelf should reject the borrow");
        assert!(matches!(err, EngineError::Domain(_)));
        assert_eq!(err.to_string(), "nothing left to borrow");
        assert!(
            seen.lock().expect("recorder lock").is_empty(),
            "no side effect may run on a rejected command"
        );
    }

    #[tokio::test]
    async fn handle_command_rejects_malformed_payload() {
        let mut registry = Registry::new();

        #[derive(Deserialize)]
        struct BorrowData {
            #[allow(dead_code)]
            member: String,
        }

        registry
            .register_command_handler(
                "borrow",
                "lending",
                |_data: BorrowData, _state: Option<&Shelf>| -> Result<Vec<NewEvent>, OutOfStock> {
                    Ok(Vec::new())
                },
            )
            .expect("register handler");
        let engine = Engine::new(registry);

        let err = engine
            .handle_command::<Shelf>(Command::new("borrow", ["/b/1"], json!({"wrong": true})))
            .await
            .expect_err("payload missing required fields should fail");
        assert!(matches!(
            err,
            EngineError::InvalidCommandData { ref command_type, .. } if command_type == "borrow"
        ));
    }

    #[tokio::test]
    async fn produced_events_fold_in_order() {
        #[derive(Deserialize)]
        struct SetData {
            value: i64,
        }

        let mut registry = Registry::new();
        registry
            .register_state_rebuilder("Set", "math", |data: SetData, _: Option<i64>| data.value)
            .expect("register Set");
        registry
            .register_state_rebuilder("Doubled", "math", |_: Value, state: Option<i64>| {
                state.unwrap_or(0) * 2
            })
            .expect("register Doubled");
        registry
            .register_command_handler(
                "compute",
                "math",
                |_: Value, _: Option<&i64>| -> Result<Vec<NewEvent>, OutOfStock> {
                    Ok(vec![
                        NewEvent::new("Set", "/m/1", json!({"value": 5})),
                        NewEvent::new("Doubled", "/m/1", Value::Null),
                    ])
                },
            )
            .expect("register compute");
        let engine = Engine::new(registry);

        let state: Option<i64> = engine
            .handle_command(Command::new("compute", ["/m/1"], Value::Null))
            .await
            .expect("dispatch should succeed");
        assert_eq!(
            state,
            Some(10),
            "Doubled must observe the effect of the earlier Set event"
        );
    }

    #[tokio::test]
    async fn fan_out_runs_handlers_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = lending_registry(3);
        registry.register_event_handler(
            "Borrowed",
            Recorder {
                tag: "first",
                seen: seen.clone(),
            },
        );
        registry.register_event_handler(
            "Borrowed",
            Recorder {
                tag: "second",
                seen: seen.clone(),
            },
        );
        let engine = Engine::new(registry);

        engine
            .handle_command::<Shelf>(Command::new("borrow", ["/b/1"], json!({})))
            .await
            .expect("dispatch should succeed");

        let tags: Vec<String> = seen
            .lock()
            .expect("recorder lock")
            .iter()
            .map(|(tag, _)| tag.clone())
            .collect();
        assert_eq!(tags, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn materialized_events_carry_defaults() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = lending_registry(3);
        registry.register_event_handler(
            "Borrowed",
            Recorder {
                tag: "a",
                seen: seen.clone(),
            },
        );
        let engine = Engine::builder(registry)
            .default_source("https://library.example")
            .build();

        let before = Utc::now();
        engine
            .handle_command::<Shelf>(Command::new("borrow", ["/b/1"], json!({})))
            .await
            .expect("dispatch should succeed");
        let after = Utc::now();

        let seen = seen.lock().expect("recorder lock");
        let (_, event) = seen.first().expect("one event fanned out");
        assert!(!event.id.is_empty());
        assert_eq!(event.source, "https://library.example");
        assert_eq!(event.specversion, SPEC_VERSION);
        assert_eq!(event.event_type, "Borrowed");
        assert_eq!(event.subject, "/b/1");
        assert!(event.time >= before && event.time <= after);
    }

    #[tokio::test]
    async fn side_effect_failure_aborts_remaining_fan_out() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = lending_registry(3);
        registry.register_event_handler("Borrowed", FailingHandler);
        registry.register_event_handler(
            "Borrowed",
            Recorder {
                tag: "after-failure",
                seen: seen.clone(),
            },
        );
        let engine = Engine::new(registry);

        let err = engine
            .handle_command::<Shelf>(Command::new("borrow", ["/b/1"], json!({})))
            .await
            .expect_err("failing handler should propagate");
        assert!(matches!(
            err,
            EngineError::SideEffect { ref event_type, .. } if event_type == "Borrowed"
        ));
        assert!(
            seen.lock().expect("recorder lock").is_empty(),
            "handlers after the failure must not run"
        );
    }

    #[tokio::test]
    async fn concurrent_reconstructions_are_independent() {
        let engine = Arc::new(Engine::new(lending_registry(3)));
        let subjects = vec!["/b/1".to_string()];

        let (a, b) = tokio::join!(
            engine.create_state::<Shelf>("lending", &subjects),
            engine.create_state::<Shelf>("lending", &subjects),
        );
        assert_eq!(a.expect("first"), Some(Shelf { amount: 3 }));
        assert_eq!(b.expect("second"), Some(Shelf { amount: 3 }));
    }

    #[test]
    fn builder_defaults() {
        let engine = Engine::new(Registry::new());
        assert_eq!(engine.default_source(), "/");
        assert_eq!(engine.policy, UnmatchedPolicy::Skip);
    }
}
