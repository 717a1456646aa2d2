//! Upcast resolution: normalize stored events to their current version.

use crate::event::Event;
use crate::registry::Registry;

/// Apply the upcaster registered for `(context, event.type)`, if any.
///
/// The original stored event is never mutated in place -- it is consumed
/// and superseded by the upcaster's output in the in-memory pipeline.
/// With no upcaster registered the event passes through unchanged. Runs
/// on every replayed event, so registered upcasters must be pure and
/// idempotent-safe to re-apply.
pub(crate) fn maybe_upcast(registry: &Registry, context: &str, event: Event) -> Event {
    match registry.upcaster(context, &event.event_type) {
        Some(upcaster) => {
            tracing::trace!(
                context = %context,
                event_type = %event.event_type,
                "upcasting event"
            );
            upcaster(event)
        }
        None => event,
    }
}
