//! The dispatch engine and its supporting pieces.

pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod mailbox;
mod runner;
pub mod stats;

pub use config::EngineConfig;
pub use dispatch::{Engine, EngineBuilder, EngineError, LaunchHandle};
pub use lifecycle::EngineState;
pub use mailbox::LiveOpInfo;
pub use stats::StatsSnapshot;
