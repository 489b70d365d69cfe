//! Persistent priority overrides
//!
//! Windows applies `Image File Execution Options\<exe>\PerfOptions` every
//! time the executable starts, so an override survives restarts of the
//! target. Writes need an elevated caller.

use crate::blocking::{run_bounded, run_settled};
use crate::error::{Error, FailureKind, Result};
use crate::os::{PerfOptions, RegistryOs};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const IDLE_PRIORITY_CLASS: u32 = 1;
const HIGH_PRIORITY_CLASS: u32 = 3;
const IO_PRIORITY_VERY_LOW: u32 = 0;
const IO_PRIORITY_HIGH: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityDirection {
    Raise,
    Lower,
}

impl PriorityDirection {
    pub fn perf_options(&self) -> PerfOptions {
        match self {
            PriorityDirection::Lower => PerfOptions {
                cpu_priority_class: IDLE_PRIORITY_CLASS,
                io_priority: Some(IO_PRIORITY_VERY_LOW),
            },
            PriorityDirection::Raise => PerfOptions {
                cpu_priority_class: HIGH_PRIORITY_CLASS,
                io_priority: Some(IO_PRIORITY_HIGH),
            },
        }
    }
}

impl fmt::Display for PriorityDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorityDirection::Raise => write!(f, "raised"),
            PriorityDirection::Lower => write!(f, "lowered"),
        }
    }
}

/// State of one executable's override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityState {
    Default,
    Overridden(PriorityDirection),
    /// A CpuPriorityClass this tool never writes
    Unrecognized(u32),
}

impl PriorityState {
    pub fn from_options(options: Option<PerfOptions>) -> Self {
        match options.map(|o| o.cpu_priority_class) {
            None => PriorityState::Default,
            Some(IDLE_PRIORITY_CLASS) => PriorityState::Overridden(PriorityDirection::Lower),
            Some(HIGH_PRIORITY_CLASS) => PriorityState::Overridden(PriorityDirection::Raise),
            Some(other) => PriorityState::Unrecognized(other),
        }
    }
}

impl fmt::Display for PriorityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorityState::Default => write!(f, "default"),
            PriorityState::Overridden(direction) => write!(f, "{}", direction),
            PriorityState::Unrecognized(class) => {
                write!(f, "unrecognized (CpuPriorityClass={})", class)
            }
        }
    }
}

/// Named set of executables sharing one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityProfile {
    pub name: &'static str,
    pub executables: &'static [&'static str],
    pub direction: PriorityDirection,
}

impl PriorityProfile {
    pub const ACE: PriorityProfile = PriorityProfile {
        name: "ACE",
        executables: &["SGuard64.exe", "SGuardSvc64.exe"],
        direction: PriorityDirection::Lower,
    };

    pub const DELTA_FORCE: PriorityProfile = PriorityProfile {
        name: "Delta Force",
        executables: &["DeltaForceClient-Win64-Shipping.exe"],
        direction: PriorityDirection::Raise,
    };

    pub const VALORANT: PriorityProfile = PriorityProfile {
        name: "VALORANT",
        executables: &["VALORANT-Win64-Shipping.exe"],
        direction: PriorityDirection::Raise,
    };

    pub fn all() -> [PriorityProfile; 3] {
        [Self::ACE, Self::DELTA_FORCE, Self::VALORANT]
    }

    pub fn executables(&self) -> Vec<String> {
        self.executables.iter().map(|e| e.to_string()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityAction {
    Apply(PriorityDirection),
    Check,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RegistryOutcome {
    Ok { state: PriorityState },
    Failed { kind: FailureKind, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntryReport {
    pub executable: String,
    pub outcome: RegistryOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityReport {
    pub action: PriorityAction,
    pub entries: Vec<RegistryEntryReport>,
    pub message: String,
}

impl PriorityReport {
    /// State of `executable`, `None` when its operation failed
    pub fn state(&self, executable: &str) -> Option<PriorityState> {
        self.entries
            .iter()
            .find(|e| e.executable.eq_ignore_ascii_case(executable))
            .and_then(|e| match e.outcome {
                RegistryOutcome::Ok { state } => Some(state),
                RegistryOutcome::Failed { .. } => None,
            })
    }

    pub fn is_success(&self) -> bool {
        self.entries
            .iter()
            .all(|e| matches!(e.outcome, RegistryOutcome::Ok { .. }))
    }

    /// Concatenate reports of the same action (used by check-all)
    pub fn merge(action: PriorityAction, reports: Vec<PriorityReport>) -> Self {
        let mut entries = Vec::new();
        let mut message = String::new();
        for report in reports {
            entries.extend(report.entries);
            if !message.is_empty() && !report.message.is_empty() {
                message.push('\n');
            }
            message.push_str(&report.message);
        }
        Self {
            action,
            entries,
            message,
        }
    }
}

/// Applies, queries and resets IFEO priority overrides
pub struct RegistryPriorityManager {
    registry: Arc<dyn RegistryOs>,
    call_timeout: Duration,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RegistryPriorityManager {
    pub fn new(registry: Arc<dyn RegistryOs>, call_timeout: Duration) -> Self {
        Self {
            registry,
            call_timeout,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Write the override for every executable; last writer wins.
    pub async fn apply(&self, executables: &[String], direction: PriorityDirection) -> PriorityReport {
        let options = direction.perf_options();
        let mut entries = Vec::with_capacity(executables.len());

        for executable in executables {
            let key_lock = self.key_lock(executable);
            let _guard = key_lock.lock().await;

            let registry = Arc::clone(&self.registry);
            let exe = executable.clone();
            let result = run_settled(
                &format!("write PerfOptions for {}", executable),
                self.call_timeout,
                move || registry.write_perf_options(&exe, options),
            )
            .await
            .map(|()| PriorityState::Overridden(direction));

            entries.push(self.entry(executable, result));
        }

        let report = self.report(PriorityAction::Apply(direction), entries);
        info!("Priority {} for {} executable(s)", direction, executables.len());
        report
    }

    /// Read-only state query
    pub async fn check(&self, executables: &[String]) -> PriorityReport {
        let mut entries = Vec::with_capacity(executables.len());

        for executable in executables {
            let registry = Arc::clone(&self.registry);
            let exe = executable.clone();
            let result = run_bounded(
                &format!("read PerfOptions for {}", executable),
                self.call_timeout,
                move || registry.read_perf_options(&exe),
            )
            .await
            .map(PriorityState::from_options);

            entries.push(self.entry(executable, result));
        }

        self.report(PriorityAction::Check, entries)
    }

    /// Remove overrides. An absent key already is the default.
    pub async fn reset(&self, executables: &[String]) -> PriorityReport {
        let mut entries = Vec::with_capacity(executables.len());

        for executable in executables {
            let key_lock = self.key_lock(executable);
            let _guard = key_lock.lock().await;

            let registry = Arc::clone(&self.registry);
            let exe = executable.clone();
            let result = run_settled(
                &format!("delete PerfOptions for {}", executable),
                self.call_timeout,
                move || registry.delete_perf_options(&exe),
            )
            .await;

            if let Ok(existed) = &result {
                debug!(
                    "{}: {}",
                    executable,
                    if *existed { "override removed" } else { "no override present" }
                );
            }
            entries.push(self.entry(executable, result.map(|_| PriorityState::Default)));
        }

        let report = self.report(PriorityAction::Reset, entries);
        info!("Priority reset for {} executable(s)", executables.len());
        report
    }

    pub async fn apply_profile(&self, profile: &PriorityProfile) -> PriorityReport {
        self.apply(&profile.executables(), profile.direction).await
    }

    pub async fn reset_profile(&self, profile: &PriorityProfile) -> PriorityReport {
        self.reset(&profile.executables()).await
    }

    pub async fn check_profile(&self, profile: &PriorityProfile) -> PriorityReport {
        self.check(&profile.executables()).await
    }

    fn key_lock(&self, executable: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .key_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(executable.to_lowercase()).or_default())
    }

    fn entry(&self, executable: &str, result: Result<PriorityState>) -> RegistryEntryReport {
        let outcome = match result {
            Ok(state) => RegistryOutcome::Ok { state },
            Err(e) => {
                warn!("{}: {}", executable, e);
                RegistryOutcome::Failed {
                    kind: e.kind(),
                    reason: failure_reason(&e),
                }
            }
        };
        RegistryEntryReport {
            executable: executable.to_string(),
            outcome,
        }
    }

    fn report(&self, action: PriorityAction, entries: Vec<RegistryEntryReport>) -> PriorityReport {
        let mut message = String::new();
        for entry in &entries {
            let line = match (&entry.outcome, action) {
                (RegistryOutcome::Ok { state }, PriorityAction::Apply(direction)) => {
                    let options = direction.perf_options();
                    format!(
                        "{}: priority {} (CpuPriorityClass={}, IoPriority={})",
                        entry.executable,
                        state,
                        options.cpu_priority_class,
                        options.io_priority.unwrap_or_default()
                    )
                }
                (RegistryOutcome::Ok { .. }, PriorityAction::Reset) => {
                    format!("{}: reset to default", entry.executable)
                }
                (RegistryOutcome::Ok { state }, PriorityAction::Check) => {
                    format!("{}: {}", entry.executable, state)
                }
                (RegistryOutcome::Failed { kind, reason }, _) => {
                    format!("{}: failed ({}: {})", entry.executable, kind.label(), reason)
                }
            };
            let _ = writeln!(message, "{}", line);
        }

        PriorityReport {
            action,
            entries,
            message: message.trim_end().to_string(),
        }
    }
}

fn failure_reason(err: &Error) -> String {
    match err {
        Error::PermissionDenied(m) => format!("{}; run as administrator", m),
        other => other.reason(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::memory::InMemoryRegistry;

    fn manager() -> (Arc<InMemoryRegistry>, RegistryPriorityManager) {
        let registry = Arc::new(InMemoryRegistry::new());
        let manager = RegistryPriorityManager::new(registry.clone(), Duration::from_secs(1));
        (registry, manager)
    }

    fn exe(name: &str) -> Vec<String> {
        vec![name.to_string()]
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let (_, manager) = manager();
        let target = exe("SGuard64.exe");

        manager.apply(&target, PriorityDirection::Raise).await;
        manager.apply(&target, PriorityDirection::Lower).await;
        let report = manager.check(&target).await;

        assert_eq!(
            report.state("SGuard64.exe"),
            Some(PriorityState::Overridden(PriorityDirection::Lower))
        );
        assert_eq!(report.message, "SGuard64.exe: lowered");
    }

    #[tokio::test]
    async fn test_reset_absent_key_succeeds() {
        let (_, manager) = manager();
        let target = exe("VALORANT-Win64-Shipping.exe");

        let reset = manager.reset(&target).await;
        assert!(reset.is_success());
        assert_eq!(
            manager.check(&target).await.state("VALORANT-Win64-Shipping.exe"),
            Some(PriorityState::Default)
        );
    }

    #[tokio::test]
    async fn test_check_is_read_only() {
        let (registry, manager) = manager();
        let target = exe("SGuard64.exe");
        manager.apply(&target, PriorityDirection::Lower).await;
        let writes = registry.write_count();

        let first = manager.check(&target).await;
        let second = manager.check(&target).await;
        assert_eq!(first, second);
        assert_eq!(registry.write_count(), writes);
    }

    #[tokio::test]
    async fn test_permission_denied_is_not_absent() {
        let (registry, manager) = manager();
        registry.deny_writes(true);

        let report = manager.reset(&exe("SGuard64.exe")).await;
        assert!(!report.is_success());
        assert_eq!(report.state("SGuard64.exe"), None);
        assert!(matches!(
            report.entries[0].outcome,
            RegistryOutcome::Failed {
                kind: FailureKind::PermissionDenied,
                ..
            }
        ));
        assert!(report.message.contains("run as administrator"));
    }

    #[tokio::test]
    async fn test_foreign_value_is_unrecognized() {
        let (registry, manager) = manager();
        registry
            .write_perf_options(
                "SGuard64.exe",
                PerfOptions {
                    cpu_priority_class: 5,
                    io_priority: None,
                },
            )
            .unwrap();

        let report = manager.check(&exe("SGuard64.exe")).await;
        assert_eq!(
            report.state("SGuard64.exe"),
            Some(PriorityState::Unrecognized(5))
        );
    }

    #[tokio::test]
    async fn test_profile_covers_every_executable() {
        let (registry, manager) = manager();
        let report = manager.apply_profile(&PriorityProfile::ACE).await;

        assert_eq!(report.entries.len(), 2);
        assert!(report.message.contains("SGuardSvc64.exe: priority lowered"));
        assert_eq!(
            registry.read_perf_options("sguardsvc64.exe").unwrap(),
            Some(PriorityDirection::Lower.perf_options())
        );
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_same_key_serialize() {
        let (_, manager) = manager();
        let manager = Arc::new(manager);
        let target = exe("DeltaForceClient-Win64-Shipping.exe");

        let raise = {
            let manager = Arc::clone(&manager);
            let target = target.clone();
            tokio::spawn(async move { manager.apply(&target, PriorityDirection::Raise).await })
        };
        let reset = {
            let manager = Arc::clone(&manager);
            let target = target.clone();
            tokio::spawn(async move { manager.reset(&target).await })
        };
        assert!(raise.await.unwrap().is_success());
        assert!(reset.await.unwrap().is_success());

        let state = manager
            .check(&target)
            .await
            .state("DeltaForceClient-Win64-Shipping.exe");
        assert!(matches!(
            state,
            Some(PriorityState::Default)
                | Some(PriorityState::Overridden(PriorityDirection::Raise))
        ));
    }
}
