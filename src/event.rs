//! Event wire shape and materialization.
//!
//! Events follow the CloudEvents v1.0 attribute set: `id`, `source`,
//! `specversion`, `type`, `subject`, `time`, free-form `data`, and
//! arbitrary passthrough extension attributes. Command handlers produce
//! the minimal [`NewEvent`] form; [`NewEvent::materialize`] fills the
//! defaulted attributes to yield the immutable wire [`Event`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The CloudEvents protocol version stamped on every materialized event.
pub const SPEC_VERSION: &str = "1.0";

/// An immutable event in CloudEvents v1.0 wire form.
///
/// This is the unit of persistence and the unit of replay: state loaders
/// return `Event`s, upcasters transform them, and the dispatcher hands
/// them to side-effect handlers. All attributes are concrete -- an
/// `Event` only exists after materialization (or after a loader read it
/// back from storage, where it was materialized before being written).
///
/// Extension attributes are flattened into the top level of the JSON
/// representation, as CloudEvents requires. Extension names must not
/// collide with the core attribute names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: String,
    /// Origin of the event (e.g. a service URI).
    pub source: String,
    /// CloudEvents protocol version; [`SPEC_VERSION`] for events this
    /// engine materializes.
    pub specversion: String,
    /// Event type tag; selects rebuilders, upcasters, and event handlers.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The entity this event is about (e.g. an aggregate id).
    pub subject: String,
    /// Instant the event was materialized.
    pub time: DateTime<Utc>,
    /// Free-form JSON payload.
    #[serde(default)]
    pub data: Value,
    /// Passthrough extension attributes, carried verbatim.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

/// A domain event as produced by a command handler, before materialization.
///
/// Only `type`, `subject`, and `data` are required; `id`, `source`, and
/// `time` may be set explicitly but are normally left empty and filled
/// with defaults when the dispatcher materializes the event.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Event type tag. Required, never defaulted.
    pub event_type: String,
    /// The entity this event is about. Required, never defaulted.
    pub subject: String,
    /// Free-form JSON payload.
    pub data: Value,
    /// Explicit event id; a fresh UUID v4 is generated if absent.
    pub id: Option<String>,
    /// Explicit source; the engine's default source is used if absent.
    pub source: Option<String>,
    /// Explicit timestamp; the current instant is used if absent.
    pub time: Option<DateTime<Utc>>,
    /// Extension attributes carried verbatim into the wire event.
    pub extensions: BTreeMap<String, Value>,
}

impl NewEvent {
    /// Create a minimal event with the required attributes only.
    pub fn new(event_type: impl Into<String>, subject: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            subject: subject.into(),
            data,
            id: None,
            source: None,
            time: None,
            extensions: BTreeMap::new(),
        }
    }

    /// Set an explicit event id, overriding the generated UUID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set an explicit source, overriding the engine default.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set an explicit timestamp, overriding the materialization instant.
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Attach an extension attribute, carried verbatim into the wire event.
    pub fn with_extension(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(name.into(), value);
        self
    }

    /// Fill in the defaulted attributes and produce the wire [`Event`].
    ///
    /// `id` defaults to a fresh UUID v4, `source` to `default_source`,
    /// `time` to the current instant. `specversion` is stamped with
    /// [`SPEC_VERSION`]. `type`, `subject`, `data`, and extensions are
    /// carried through verbatim.
    pub fn materialize(self, default_source: &str) -> Event {
        Event {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            source: self.source.unwrap_or_else(|| default_source.to_owned()),
            specversion: SPEC_VERSION.to_owned(),
            event_type: self.event_type,
            subject: self.subject,
            time: self.time.unwrap_or_else(Utc::now),
            data: self.data,
            extensions: self.extensions,
        }
    }
}
