//! Agent sessions: configuration, the per-turn controller, and the runner.
//!
//! - [`config::SessionConfig`]: model, budget, compaction strategy, retry
//!   policy. Loaded from TOML with [`config::ConfigFile`].
//! - [`controller::Controller`]: the context-budget state machine. One
//!   [`step`](controller::Controller::step) is one model round trip plus
//!   any tool calls and compaction it triggers.
//! - [`session::SessionRunner`]: drives the controller from the
//!   environment's prompt to a scored answer, persisting as it goes.
//! - [`events`]: [`EventHandler`] trait and [`SessionEvent`] enum for
//!   observing sessions.
//! - [`artifact`]: the per-run JSON record and its atomic store.

pub mod artifact;
pub mod config;
pub mod controller;
pub mod events;
pub mod session;

pub use artifact::{ArtifactStore, RunArtifact, RunCounters, RunStatus};
pub use config::{CompactionStrategy, ConfigFile, SessionConfig, Toggle};
pub use controller::{Controller, ControllerState, TurnOutcome};
pub use events::{
    CompositeEventHandler, EventHandler, EventObserver, EventResponse, FnEventHandler,
    LoggingHandler, NoopHandler, SessionEvent,
};
pub use session::SessionRunner;
