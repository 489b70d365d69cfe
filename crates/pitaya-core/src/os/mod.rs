//! Narrow adapters over host-wide OS state
//!
//! Every component reaches the process table, the registry and the login
//! launch list through these traits. The native implementations live in
//! [`native`] (and `windows` on Windows hosts); [`memory`] provides
//! in-memory tables used by tests.

pub mod memory;
pub mod native;
#[cfg(windows)]
mod windows;

use crate::error::Result;
use crate::types::Directive;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// One row of the live process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub memory_bytes: u64,
}

/// Best-effort host facts. `None` means the value could not be read.
pub trait HostOs: Send + Sync {
    fn cpu_model(&self) -> Option<String>;
    fn os_name(&self) -> Option<String>;
    fn os_version(&self) -> Option<String>;
    fn os_build(&self) -> Option<u32>;
    fn logical_cores(&self) -> Option<usize>;
    fn is_elevated(&self) -> Option<bool>;
    /// (total, available) in bytes
    fn memory_bytes(&self) -> Option<(u64, u64)>;
}

pub trait ProcessOs: Send + Sync {
    fn list_processes(&self) -> Result<Vec<ProcessEntry>>;

    /// Cumulative user + kernel CPU time since process start
    fn cpu_time(&self, pid: u32) -> Result<Duration>;

    fn apply(&self, pid: u32, directive: Directive) -> Result<()>;
}

/// Values stored under an executable's `PerfOptions` key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfOptions {
    pub cpu_priority_class: u32,
    pub io_priority: Option<u32>,
}

pub trait RegistryOs: Send + Sync {
    /// `Ok(None)` when no override exists for `executable`
    fn read_perf_options(&self, executable: &str) -> Result<Option<PerfOptions>>;

    fn write_perf_options(&self, executable: &str, options: PerfOptions) -> Result<()>;

    /// Returns whether an override was present
    fn delete_perf_options(&self, executable: &str) -> Result<bool>;
}

pub trait AutoStartOs: Send + Sync {
    fn register(&self, name: &str, command: &str) -> Result<()>;

    /// Returns whether an entry was present
    fn unregister(&self, name: &str) -> Result<bool>;

    fn registered_command(&self, name: &str) -> Result<Option<String>>;
}

/// The full adapter set handed to the engine
#[derive(Clone)]
pub struct Adapters {
    pub host: Arc<dyn HostOs>,
    pub processes: Arc<dyn ProcessOs>,
    pub registry: Arc<dyn RegistryOs>,
    pub autostart: Arc<dyn AutoStartOs>,
}

impl Adapters {
    /// Adapters backed by the running host
    pub fn native() -> Self {
        Self {
            host: Arc::new(native::NativeHost),
            processes: Arc::new(native::NativeProcessOs),
            registry: Arc::new(native::NativeRegistry),
            autostart: Arc::new(native::NativeAutoStart),
        }
    }
}
