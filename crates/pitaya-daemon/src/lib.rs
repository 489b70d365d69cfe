//! Pitaya Daemon
//!
//! Background service for Pitaya - keeps the performance snapshot fresh and
//! optionally restricts the ACE agent on every tick.

pub mod commands;
pub mod config;
pub mod orchestrator;

pub use commands::CommandSurface;
pub use config::Config;
pub use orchestrator::{
    Orchestrator, OrchestratorSettings, OrchestratorStatus, RestrictionStatus, TargetStatus,
    TickHandles,
};
