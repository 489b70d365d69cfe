use crate::error::FailureKind;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Host facts read by the system probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub cpu_model: String,
    pub os_name: String,
    pub os_version: String,
    pub os_build: Option<u32>,
    pub cpu_logical_cores: usize,
    pub is_admin: bool,
    pub total_memory_gb: f64,
    pub available_memory_gb: f64,
    pub efficiency_mode_supported: bool,
}

impl SystemInfo {
    /// Last logical core, the one CPU affinity pins targets to.
    pub fn target_core(&self) -> u32 {
        self.cpu_logical_cores.max(1) as u32 - 1
    }
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            cpu_model: "Unknown".to_string(),
            os_name: "Unknown".to_string(),
            os_version: "Unknown".to_string(),
            os_build: None,
            cpu_logical_cores: 1,
            is_admin: false,
            total_memory_gb: 0.0,
            available_memory_gb: 0.0,
            efficiency_mode_supported: false,
        }
    }
}

/// Which directives a restriction run should attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestrictionConfig {
    pub cpu_affinity: bool,
    pub process_priority: bool,
    pub efficiency_mode: bool,
    pub io_priority: bool,
    pub memory_priority: bool,
}

impl RestrictionConfig {
    pub fn all() -> Self {
        Self {
            cpu_affinity: true,
            process_priority: true,
            efficiency_mode: true,
            io_priority: true,
            memory_priority: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.enabled_kinds().is_empty()
    }

    /// Enabled directive kinds in application order
    pub fn enabled_kinds(&self) -> Vec<DirectiveKind> {
        let flags = [
            (self.cpu_affinity, DirectiveKind::CpuAffinity),
            (self.process_priority, DirectiveKind::ProcessPriority),
            (self.efficiency_mode, DirectiveKind::EfficiencyMode),
            (self.io_priority, DirectiveKind::IoPriority),
            (self.memory_priority, DirectiveKind::MemoryPriority),
        ];
        flags
            .into_iter()
            .filter_map(|(on, kind)| on.then_some(kind))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveKind {
    CpuAffinity,
    ProcessPriority,
    EfficiencyMode,
    IoPriority,
    MemoryPriority,
}

impl DirectiveKind {
    pub fn label(&self) -> &'static str {
        match self {
            DirectiveKind::CpuAffinity => "cpu affinity",
            DirectiveKind::ProcessPriority => "process priority",
            DirectiveKind::EfficiencyMode => "efficiency mode",
            DirectiveKind::IoPriority => "i/o priority",
            DirectiveKind::MemoryPriority => "memory priority",
        }
    }
}

/// Storage I/O priority hint levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoPriorityLevel {
    VeryLow = 0,
    Low = 1,
    Normal = 2,
}

/// Page retention priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryPriorityLevel {
    VeryLow = 1,
    Low = 2,
    Medium = 3,
    BelowNormal = 4,
    Normal = 5,
}

/// A single OS mutation handed to a process adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Directive {
    /// Pin to one logical core
    CpuAffinity { core: u32 },
    IdlePriority,
    EfficiencyMode,
    IoPriority(IoPriorityLevel),
    MemoryPriority(MemoryPriorityLevel),
}

impl Directive {
    /// Restricting variant of `kind` for the given target core
    pub fn restricting(kind: DirectiveKind, core: u32) -> Self {
        match kind {
            DirectiveKind::CpuAffinity => Directive::CpuAffinity { core },
            DirectiveKind::ProcessPriority => Directive::IdlePriority,
            DirectiveKind::EfficiencyMode => Directive::EfficiencyMode,
            DirectiveKind::IoPriority => Directive::IoPriority(IoPriorityLevel::VeryLow),
            DirectiveKind::MemoryPriority => Directive::MemoryPriority(MemoryPriorityLevel::VeryLow),
        }
    }

    pub fn kind(&self) -> DirectiveKind {
        match self {
            Directive::CpuAffinity { .. } => DirectiveKind::CpuAffinity,
            Directive::IdlePriority => DirectiveKind::ProcessPriority,
            Directive::EfficiencyMode => DirectiveKind::EfficiencyMode,
            Directive::IoPriority(_) => DirectiveKind::IoPriority,
            Directive::MemoryPriority(_) => DirectiveKind::MemoryPriority,
        }
    }
}

/// Process instance found by the matcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandleInfo {
    pub pid: u32,
    pub name: String,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UnsupportedFeature,
    PermissionDenied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DirectiveOutcome {
    Applied,
    Skipped { reason: SkipReason, detail: String },
    Failed { kind: FailureKind, detail: String },
}

impl DirectiveOutcome {
    /// Counts toward a target being restricted
    pub fn is_acceptable(&self) -> bool {
        matches!(
            self,
            DirectiveOutcome::Applied
                | DirectiveOutcome::Skipped {
                    reason: SkipReason::UnsupportedFeature,
                    ..
                }
        )
    }
}

impl fmt::Display for DirectiveOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectiveOutcome::Applied => write!(f, "applied"),
            DirectiveOutcome::Skipped { reason, detail } => {
                let why = match reason {
                    SkipReason::UnsupportedFeature => "unsupported on this OS",
                    SkipReason::PermissionDenied => "requires administrator",
                };
                write!(f, "skipped ({}: {})", why, detail)
            }
            DirectiveOutcome::Failed { kind, detail } => {
                write!(f, "failed ({}: {})", kind.label(), detail)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceReport {
    pub pid: u32,
    pub outcomes: Vec<(DirectiveKind, DirectiveOutcome)>,
}

impl InstanceReport {
    pub fn restricted(&self) -> bool {
        !self.outcomes.is_empty()
            && self.outcomes.iter().all(|(_, o)| o.is_acceptable())
            && self
                .outcomes
                .iter()
                .any(|(_, o)| *o == DirectiveOutcome::Applied)
    }
}

/// found/restricted pair for one watched name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetReport {
    pub name: String,
    pub found: bool,
    pub restricted: bool,
    pub instances: Vec<InstanceReport>,
}

impl TargetReport {
    pub fn from_instances(name: String, instances: Vec<InstanceReport>) -> Self {
        let found = !instances.is_empty();
        let restricted = found && instances.iter().all(InstanceReport::restricted);
        Self {
            name,
            found,
            restricted,
            instances,
        }
    }
}

/// Whether a restriction run builds the human-readable report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportMode {
    #[default]
    Verbose,
    Silent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestrictionResult {
    pub target_core: u32,
    pub targets: Vec<TargetReport>,
    pub message: String,
    pub completed_at: DateTime<Local>,
}

impl RestrictionResult {
    pub fn target(&self, name: &str) -> Option<&TargetReport> {
        self.targets
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn found(&self, name: &str) -> bool {
        self.target(name).map(|t| t.found).unwrap_or(false)
    }

    pub fn restricted(&self, name: &str) -> bool {
        self.target(name).map(|t| t.restricted).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessPerformanceSample {
    pub pid: u32,
    pub name: String,
    /// Percent of total machine capacity
    pub cpu_usage: f64,
    pub memory_mb: f64,
}
