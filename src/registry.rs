//! Handler registries and the context × type key scheme.
//!
//! A [`Registry`] holds the five mapping tables the engine dispatches
//! through: command handlers, state rebuilders, upcasters, event
//! (side-effect) handlers, and state loaders. It is populated during an
//! explicit initialization phase and then moved into an
//! [`Engine`](crate::Engine), after which it is read-only.
//!
//! Registration is typed; storage is erased. Command and event payloads
//! are registered against concrete `serde` data shapes and state types,
//! and the registry wraps each handler in a closure that performs the
//! deserialization and state downcast at the dispatch boundary. This
//! keeps one map per table while surfacing shape mismatches as
//! diagnosable [`EngineError`]s instead of silent coercions.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{EngineError, RegistrationError};
use crate::event::{Event, NewEvent};
use crate::handler::{EventHandler, StateLoader};

/// Composite registration key scoping a handler to one domain.
///
/// Rebuilders and upcasters are addressed by `(context, type)`; the
/// context partition prevents collisions when multiple domains register
/// handlers for event types with the same name. Renders deterministically
/// as `[context|type]` in errors and logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    context: String,
    event_type: String,
}

impl ScopeKey {
    /// Build a key from a context namespace and an event type.
    pub fn new(context: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            event_type: event_type.into(),
        }
    }

    /// The context namespace.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// The event type.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}|{}]", self.context, self.event_type)
    }
}

/// Type-erased state threaded through a fold.
///
/// `None` is the absent state every reconstruction starts from. The boxed
/// value is whatever concrete state type the context's rebuilders
/// produce; API boundaries recover it by downcasting.
pub(crate) type StateSlot = Option<Box<dyn Any + Send + Sync>>;

/// Erased fold step: deserialize the payload, downcast prior state,
/// invoke the typed rebuilder, re-box the result.
pub(crate) type ErasedRebuilder =
    Box<dyn Fn(&Value, StateSlot) -> Result<StateSlot, EngineError> + Send + Sync>;

/// Erased command handler: deserialize the payload, downcast state,
/// invoke the typed handler, box any domain error.
pub(crate) type ErasedCommandHandler = Box<
    dyn Fn(&Value, Option<&(dyn Any + Send + Sync)>) -> Result<Vec<NewEvent>, EngineError>
        + Send
        + Sync,
>;

/// Erased upcaster. Pure transform from a stored event to its
/// current-version form.
pub(crate) type ErasedUpcaster = Box<dyn Fn(Event) -> Event + Send + Sync>;

/// A registered command handler together with the context its state is
/// reconstructed under.
pub(crate) struct CommandEntry {
    pub(crate) context: String,
    pub(crate) handler: ErasedCommandHandler,
}

/// The five mapping tables behind the engine.
///
/// Populate with the `register_*` methods during startup, then hand the
/// registry to [`Engine::builder`](crate::Engine::builder). There are no
/// removal or update operations; the last-writer-wins loader slot is the
/// only registration that may be replaced.
#[derive(Default)]
pub struct Registry {
    command_handlers: HashMap<String, CommandEntry>,
    rebuilders: HashMap<ScopeKey, ErasedRebuilder>,
    upcasters: HashMap<ScopeKey, ErasedUpcaster>,
    event_handlers: HashMap<String, Vec<Box<dyn EventHandler>>>,
    loaders: HashMap<String, Box<dyn StateLoader>>,
}

// Manual Debug: handler maps hold closures and trait objects, so only
// the table sizes are worth printing.
impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("command_handlers", &self.command_handlers.len())
            .field("rebuilders", &self.rebuilders.len())
            .field("upcasters", &self.upcasters.len())
            .field("event_handlers", &self.event_handlers.len())
            .field("loaders", &self.loaders.len())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the command handler for `command_type`.
    ///
    /// Command handlers are globally unique by type: one handler per
    /// command type across the whole engine, regardless of context. The
    /// `context` names the domain whose loader, rebuilders, and upcasters
    /// are used when reconstructing state for this command.
    ///
    /// The handler receives its payload deserialized into `C` and the
    /// reconstructed state as `Option<&S>`, and returns zero or more
    /// [`NewEvent`]s. Returning `Err` rejects the command and aborts the
    /// whole dispatch before any event is emitted.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::DuplicateCommandHandler`] if `command_type`
    /// already has a handler; the existing registration is untouched.
    pub fn register_command_handler<C, S, E, F>(
        &mut self,
        command_type: impl Into<String>,
        context: impl Into<String>,
        handler: F,
    ) -> Result<(), RegistrationError>
    where
        C: DeserializeOwned,
        S: Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: Fn(C, Option<&S>) -> Result<Vec<NewEvent>, E> + Send + Sync + 'static,
    {
        let command_type = command_type.into();
        if self.command_handlers.contains_key(&command_type) {
            return Err(RegistrationError::DuplicateCommandHandler { command_type });
        }

        let erased: ErasedCommandHandler = {
            let command_type = command_type.clone();
            Box::new(move |data, state| {
                let data: C = serde_json::from_value(data.clone()).map_err(|source| {
                    EngineError::InvalidCommandData {
                        command_type: command_type.clone(),
                        source,
                    }
                })?;
                let prior: Option<&S> = match state {
                    Some(any) => {
                        Some(
                            any.downcast_ref::<S>()
                                .ok_or(EngineError::StateTypeMismatch {
                                    expected: type_name::<S>(),
                                })?,
                        )
                    }
                    None => None,
                };
                handler(data, prior).map_err(|e| EngineError::Domain(Box::new(e)))
            })
        };

        self.command_handlers.insert(
            command_type,
            CommandEntry {
                context: context.into(),
                handler: erased,
            },
        );
        Ok(())
    }

    /// Register the state rebuilder for `(context, event_type)`.
    ///
    /// The rebuilder is a pure fold step: it receives the event payload
    /// deserialized into `D` and the prior state (absent on the first
    /// matched event), and returns the next state. Replaying the same
    /// event sequence must always yield the same state.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::DuplicateRebuilder`] if the `(context, type)`
    /// pair already has a rebuilder; the existing registration is
    /// untouched.
    pub fn register_state_rebuilder<D, S, F>(
        &mut self,
        event_type: impl Into<String>,
        context: impl Into<String>,
        rebuilder: F,
    ) -> Result<(), RegistrationError>
    where
        D: DeserializeOwned,
        S: Send + Sync + 'static,
        F: Fn(D, Option<S>) -> S + Send + Sync + 'static,
    {
        let key = ScopeKey::new(context, event_type);
        if self.rebuilders.contains_key(&key) {
            return Err(RegistrationError::DuplicateRebuilder { key });
        }

        let erased: ErasedRebuilder = {
            let key = key.clone();
            Box::new(move |data, state| {
                let data: D = serde_json::from_value(data.clone()).map_err(|source| {
                    EngineError::InvalidEventPayload {
                        key: key.clone(),
                        source,
                    }
                })?;
                let prior: Option<S> = match state {
                    Some(boxed) => Some(*boxed.downcast::<S>().map_err(|_| {
                        EngineError::StateTypeMismatch {
                            expected: type_name::<S>(),
                        }
                    })?),
                    None => None,
                };
                let next = rebuilder(data, prior);
                Ok(Some(Box::new(next) as Box<dyn Any + Send + Sync>))
            })
        };

        self.rebuilders.insert(key, erased);
        Ok(())
    }

    /// Register the upcaster for `(context, event_type)`.
    ///
    /// The upcaster runs on every replayed event of this type under this
    /// context, before the fold. It must be a pure, total function of its
    /// input event -- it executes on every reconstruction, not once at
    /// storage time. The fold sees the upcaster's output, including a
    /// possibly-changed event type.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::DuplicateUpcaster`] if the `(context, type)`
    /// pair already has an upcaster; the existing registration is
    /// untouched.
    pub fn register_upcaster<F>(
        &mut self,
        event_type: impl Into<String>,
        context: impl Into<String>,
        upcaster: F,
    ) -> Result<(), RegistrationError>
    where
        F: Fn(Event) -> Event + Send + Sync + 'static,
    {
        let key = ScopeKey::new(context, event_type);
        if self.upcasters.contains_key(&key) {
            return Err(RegistrationError::DuplicateUpcaster { key });
        }
        self.upcasters.insert(key, Box::new(upcaster));
        Ok(())
    }

    /// Register a side-effect handler for `event_type`.
    ///
    /// Event handlers are not scoped by context -- multiple domains may
    /// react to the same event type. Always succeeds; the handler is
    /// appended to the type's ordered list and will be invoked in
    /// registration order.
    pub fn register_event_handler<H>(&mut self, event_type: impl Into<String>, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.event_handlers
            .entry(event_type.into())
            .or_default()
            .push(Box::new(handler));
    }

    /// Register the state loader for `context`.
    ///
    /// One loader per context; the last registration wins. Replacing an
    /// existing loader is intentional behavior, not an error.
    pub fn register_state_loader<L>(&mut self, context: impl Into<String>, loader: L)
    where
        L: StateLoader + 'static,
    {
        let context = context.into();
        if self
            .loaders
            .insert(context.clone(), Box::new(loader))
            .is_some()
        {
            tracing::debug!(context = %context, "replaced state loader");
        }
    }

    pub(crate) fn command_handler(&self, command_type: &str) -> Option<&CommandEntry> {
        self.command_handlers.get(command_type)
    }

    pub(crate) fn rebuilder(&self, context: &str, event_type: &str) -> Option<&ErasedRebuilder> {
        self.rebuilders.get(&ScopeKey::new(context, event_type))
    }

    pub(crate) fn upcaster(&self, context: &str, event_type: &str) -> Option<&ErasedUpcaster> {
        self.upcasters.get(&ScopeKey::new(context, event_type))
    }

    pub(crate) fn event_handlers(&self, event_type: &str) -> &[Box<dyn EventHandler>] {
        self.event_handlers
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub(crate) fn loader(&self, context: &str) -> Option<&dyn StateLoader> {
        self.loaders.get(context).map(Box::as_ref)
    }
}
