//! Collaborator traits the engine calls into.
//!
//! The engine itself never persists anything and never opens a connection.
//! History comes in through a [`StateLoader`], side effects go out through
//! [`EventHandler`]s; both are implemented externally (an event store, a
//! projection writer, a message bus) and registered on the
//! [`Registry`](crate::Registry).

use std::any::Any;

use async_trait::async_trait;

use crate::event::Event;

/// Boxed error type used across all collaborator boundaries.
///
/// Collaborators surface whatever error type they like; the engine wraps
/// it into the matching [`EngineError`](crate::EngineError) variant with
/// the source preserved.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Fetches historical events for a set of subjects.
///
/// Registered per context via
/// [`Registry::register_state_loader`](crate::Registry::register_state_loader).
/// The returned order is the replay order -- typically insertion/append
/// order. The engine performs no sorting, filtering, or retries on the
/// loader's output.
#[async_trait]
pub trait StateLoader: Send + Sync {
    /// Return all historical events relevant to `subjects`, in intended
    /// replay order.
    ///
    /// # Errors
    ///
    /// Any failure propagates out of the calling pipeline as
    /// [`EngineError::Loader`](crate::EngineError::Loader); the engine
    /// never retries.
    async fn load(&self, subjects: &[String]) -> Result<Vec<Event>, BoxError>;
}

/// Reacts to a materialized event -- persistence, projections, outbound
/// notifications.
///
/// Registered per event type via
/// [`Registry::register_event_handler`](crate::Registry::register_event_handler);
/// multiple handlers may react to the same type and are invoked in
/// registration order. Each handler is awaited before the next one runs.
///
/// The `state` argument is the final folded state of the dispatch that
/// produced the event, type-erased because handlers are not scoped by
/// context. Handlers that care about it downcast to their domain's state
/// type with `downcast_ref`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one materialized event.
    ///
    /// # Errors
    ///
    /// A failure aborts the remaining fan-out and propagates out of
    /// [`handle_command`](crate::Engine::handle_command) as
    /// [`EngineError::SideEffect`](crate::EngineError::SideEffect).
    async fn handle(
        &self,
        event: &Event,
        state: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<(), BoxError>;
}
