//! Crate-level error types for registration and dispatch.

use crate::handler::BoxError;
use crate::registry::ScopeKey;

/// Error returned when a registration would overwrite an existing handler.
///
/// Registration conflicts are signaled immediately and never corrupt the
/// registry -- the prior registration remains active and usable.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// A command handler already exists for this command type.
    ///
    /// Command handlers are globally unique by type regardless of context.
    #[error("a command handler is already registered for '{command_type}'")]
    DuplicateCommandHandler {
        /// The conflicting command type.
        command_type: String,
    },

    /// A state rebuilder already exists for this `(context, type)` pair.
    #[error("a state rebuilder is already registered for {key}")]
    DuplicateRebuilder {
        /// The conflicting registration key.
        key: ScopeKey,
    },

    /// An upcaster already exists for this `(context, type)` pair.
    #[error("an upcaster is already registered for {key}")]
    DuplicateUpcaster {
        /// The conflicting registration key.
        key: ScopeKey,
    },
}

/// Error returned when a dispatch pipeline fails.
///
/// The engine never swallows a collaborator failure: loader, handler,
/// and side-effect errors all surface here with their source preserved.
/// The two "unknown type" variants are produced only under
/// [`UnmatchedPolicy::Fail`](crate::UnmatchedPolicy::Fail); the default
/// policy treats unmatched types as legitimate absence.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No command handler is registered for the dispatched command type.
    #[error("no command handler registered for '{command_type}'")]
    UnknownCommandType {
        /// The unmatched command type.
        command_type: String,
    },

    /// No state rebuilder is registered for an event encountered during
    /// the fold.
    #[error("no state rebuilder registered for {key}")]
    UnknownEventType {
        /// The unmatched registration key.
        key: ScopeKey,
    },

    /// The command payload did not deserialize into the handler's
    /// registered data type.
    #[error("invalid command data for '{command_type}'")]
    InvalidCommandData {
        /// The command type whose payload was rejected.
        command_type: String,
        /// The underlying deserialization failure.
        #[source]
        source: serde_json::Error,
    },

    /// An event payload did not deserialize into the rebuilder's
    /// registered data type.
    #[error("invalid event payload for {key}")]
    InvalidEventPayload {
        /// The registration key whose payload was rejected.
        key: ScopeKey,
        /// The underlying deserialization failure.
        #[source]
        source: serde_json::Error,
    },

    /// The folded state does not match the expected state type.
    ///
    /// Raised when a rebuilder, command handler, or the caller's
    /// requested state type disagrees with the type another rebuilder in
    /// the same context produced.
    #[error("state value does not match the expected type {expected}")]
    StateTypeMismatch {
        /// Fully qualified name of the expected state type.
        expected: &'static str,
    },

    /// Business-rule rejection from a command handler.
    ///
    /// Forwards the handler's own error unmodified; no events are
    /// emitted and no side effects run on this path.
    #[error(transparent)]
    Domain(BoxError),

    /// The state loader failed while fetching history.
    #[error("state loader failed")]
    Loader(#[source] BoxError),

    /// A side-effect handler failed during fan-out.
    ///
    /// Remaining handlers for the dispatch are not invoked.
    #[error("event handler for '{event_type}' failed")]
    SideEffect {
        /// Type of the event being fanned out.
        event_type: String,
        /// The handler's failure.
        #[source]
        source: BoxError,
    },
}
