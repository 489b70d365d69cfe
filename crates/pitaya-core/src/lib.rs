//! Pitaya Core Library
//!
//! Process restriction and persistent priority engine for Pitaya.
//! Provides target discovery, resource directives (affinity, priority,
//! efficiency mode, I/O and memory priority), IFEO priority overrides and
//! per-process performance sampling.

pub mod autostart;
pub mod blocking;
pub mod error;
pub mod matcher;
pub mod os;
pub mod probe;
pub mod registry;
pub mod restrict;
pub mod sampler;
pub mod types;

pub use autostart::{AutoStartManager, AUTOSTART_ENTRY};
pub use blocking::DEFAULT_CALL_TIMEOUT;
pub use error::{Error, FailureKind, Result};
pub use matcher::{MatchSet, ProcessMatcher, TargetPattern};
pub use os::{Adapters, AutoStartOs, HostOs, PerfOptions, ProcessEntry, ProcessOs, RegistryOs};
pub use probe::SystemProbe;
pub use registry::{
    PriorityAction, PriorityDirection, PriorityProfile, PriorityReport, PriorityState,
    RegistryEntryReport, RegistryOutcome, RegistryPriorityManager,
};
pub use restrict::RestrictionApplier;
pub use sampler::{PerformanceSampler, DEFAULT_SAMPLE_WINDOW};
pub use types::{
    Directive, DirectiveKind, DirectiveOutcome, InstanceReport, ProcessHandleInfo,
    ProcessPerformanceSample, ReportMode, RestrictionConfig, RestrictionResult, SkipReason,
    SystemInfo, TargetReport,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Executables restricted by default
pub const DEFAULT_RESTRICTION_TARGETS: &[&str] = &["SGuard64.exe", "SGuardSvc64.exe"];

/// Executables sampled by default
pub const DEFAULT_WATCH_LIST: &[&str] = &[
    "SGuard64.exe",
    "SGuardSvc64.exe",
    "DeltaForceClient-Win64-Shipping.exe",
    "VALORANT-Win64-Shipping.exe",
];
