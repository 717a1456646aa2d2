//! In-process CQRS / event-sourcing dispatch engine with CloudEvents-shaped events.

mod command;
mod engine;
mod error;
mod event;
mod handler;
mod registry;
mod upcast;

pub use command::Command;
pub use engine::{Engine, EngineBuilder, UnmatchedPolicy};
pub use error::{EngineError, RegistrationError};
pub use event::{Event, NewEvent, SPEC_VERSION};
pub use handler::{BoxError, EventHandler, StateLoader};
pub use registry::{Registry, ScopeKey};
