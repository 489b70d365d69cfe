//! Request/response command table
//!
//! One method per command a front end can issue. Restriction requests go
//! through the orchestrator's single-flight gate, so a manual run never
//! overlaps an automatic one.

use crate::orchestrator::{Orchestrator, OrchestratorSettings, OrchestratorStatus};
use pitaya_core::{
    Adapters, AutoStartManager, PriorityAction, PriorityProfile, PriorityReport,
    ProcessPerformanceSample, RegistryPriorityManager, ReportMode, RestrictionConfig,
    RestrictionResult, Result, SystemInfo, SystemProbe,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct CommandSurface {
    probe: SystemProbe,
    orchestrator: Orchestrator,
    registry: Arc<RegistryPriorityManager>,
    autostart: AutoStartManager,
}

impl CommandSurface {
    /// Surface whose autostart entry launches the running executable
    pub fn new(adapters: Adapters, settings: OrchestratorSettings) -> Result<Self> {
        let autostart =
            AutoStartManager::for_current_exe(Arc::clone(&adapters.autostart), settings.call_timeout)?;
        Ok(Self::with_autostart(adapters, settings, autostart))
    }

    pub fn with_autostart(
        adapters: Adapters,
        settings: OrchestratorSettings,
        autostart: AutoStartManager,
    ) -> Self {
        let registry =
            RegistryPriorityManager::new(Arc::clone(&adapters.registry), settings.call_timeout);
        Self {
            probe: SystemProbe::new(Arc::clone(&adapters.host)),
            orchestrator: Orchestrator::new(&adapters, settings),
            registry: Arc::new(registry),
            autostart,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn get_system_info(&self) -> SystemInfo {
        self.probe.get_system_info()
    }

    /// Waits for an in-flight automatic run, then restricts
    pub async fn restrict_processes(&self, config: RestrictionConfig) -> Result<RestrictionResult> {
        self.orchestrator
            .restrict_now(config, ReportMode::Verbose)
            .await
    }

    pub async fn get_process_performance(&self) -> Result<Vec<ProcessPerformanceSample>> {
        self.orchestrator.sample_now().await
    }

    pub fn status(&self) -> OrchestratorStatus {
        self.orchestrator.status()
    }

    pub async fn enable_autostart(&self) -> Result<()> {
        self.autostart.enable().await
    }

    pub async fn disable_autostart(&self) -> Result<()> {
        self.autostart.disable().await
    }

    pub async fn check_autostart(&self) -> Result<bool> {
        self.autostart.check().await
    }

    pub async fn lower_ace_priority(&self) -> PriorityReport {
        self.registry.apply_profile(&PriorityProfile::ACE).await
    }

    pub async fn reset_ace_priority(&self) -> PriorityReport {
        self.registry.reset_profile(&PriorityProfile::ACE).await
    }

    /// State of every known profile's executables
    pub async fn check_registry_priority(&self) -> PriorityReport {
        let mut reports = Vec::new();
        for profile in PriorityProfile::all() {
            reports.push(self.registry.check_profile(&profile).await);
        }
        PriorityReport::merge(PriorityAction::Check, reports)
    }

    pub async fn raise_delta_priority(&self) -> PriorityReport {
        self.registry.apply_profile(&PriorityProfile::DELTA_FORCE).await
    }

    pub async fn reset_delta_priority(&self) -> PriorityReport {
        self.registry.reset_profile(&PriorityProfile::DELTA_FORCE).await
    }

    pub async fn modify_valorant_registry_priority(&self) -> PriorityReport {
        self.registry.apply_profile(&PriorityProfile::VALORANT).await
    }

    pub async fn reset_valorant_priority(&self) -> PriorityReport {
        self.registry.reset_profile(&PriorityProfile::VALORANT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitaya_core::os::memory::{
        InMemoryAutoStart, InMemoryProcessTable, InMemoryRegistry, StaticHost,
    };
    use pitaya_core::{PriorityDirection, PriorityState, TargetPattern};
    use std::time::Duration;

    fn surface() -> CommandSurface {
        let table = Arc::new(InMemoryProcessTable::new());
        table.add_process(42, "SGuard64.exe");
        let autostart_store = Arc::new(InMemoryAutoStart::new());
        let adapters = Adapters {
            host: Arc::new(StaticHost::windows11(8)),
            processes: table,
            registry: Arc::new(InMemoryRegistry::new()),
            autostart: autostart_store.clone(),
        };
        let settings = OrchestratorSettings {
            restrict_targets: TargetPattern::parse_all(&["SGuard64.exe", "SGuardSvc64.exe"])
                .unwrap(),
            watch_list: TargetPattern::parse_all(&["SGuard64.exe"]).unwrap(),
            tick_interval: Duration::from_secs(60),
            call_timeout: Duration::from_secs(1),
            sample_window: Duration::from_millis(20),
            auto_restrict: None,
        };
        let autostart = AutoStartManager::new(
            autostart_store,
            "pitaya-daemon.exe".to_string(),
            Duration::from_secs(1),
        );
        CommandSurface::with_autostart(adapters, settings, autostart)
    }

    #[tokio::test]
    async fn test_restrict_processes_is_verbose() {
        let surface = surface();
        let result = surface
            .restrict_processes(RestrictionConfig::all())
            .await
            .unwrap();
        assert!(result.found("SGuard64.exe"));
        assert!(!result.message.is_empty());
        assert!(surface.status().last_restriction.is_some());
    }

    #[tokio::test]
    async fn test_ace_priority_cycle() {
        let surface = surface();

        assert!(surface.lower_ace_priority().await.is_success());
        let check = surface.check_registry_priority().await;
        assert_eq!(
            check.state("SGuard64.exe"),
            Some(PriorityState::Overridden(PriorityDirection::Lower))
        );
        assert_eq!(
            check.state("VALORANT-Win64-Shipping.exe"),
            Some(PriorityState::Default)
        );
        assert_eq!(check.entries.len(), 4);

        assert!(surface.reset_ace_priority().await.is_success());
        assert_eq!(
            surface.check_registry_priority().await.state("SGuardSvc64.exe"),
            Some(PriorityState::Default)
        );
    }

    #[tokio::test]
    async fn test_game_profiles_raise() {
        let surface = surface();
        surface.raise_delta_priority().await;
        surface.modify_valorant_registry_priority().await;

        let check = surface.check_registry_priority().await;
        assert_eq!(
            check.state("DeltaForceClient-Win64-Shipping.exe"),
            Some(PriorityState::Overridden(PriorityDirection::Raise))
        );
        assert_eq!(
            check.state("VALORANT-Win64-Shipping.exe"),
            Some(PriorityState::Overridden(PriorityDirection::Raise))
        );

        surface.reset_delta_priority().await;
        surface.reset_valorant_priority().await;
        let check = surface.check_registry_priority().await;
        assert!(check
            .entries
            .iter()
            .all(|e| check.state(&e.executable) == Some(PriorityState::Default)));
    }

    #[tokio::test]
    async fn test_autostart_commands() {
        let surface = surface();
        assert!(!surface.check_autostart().await.unwrap());
        surface.enable_autostart().await.unwrap();
        assert!(surface.check_autostart().await.unwrap());
        surface.disable_autostart().await.unwrap();
        surface.disable_autostart().await.unwrap();
        assert!(!surface.check_autostart().await.unwrap());
    }

    #[tokio::test]
    async fn test_performance_and_info() {
        let surface = surface();
        assert_eq!(surface.get_system_info().cpu_logical_cores, 8);
        let samples = surface.get_process_performance().await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].pid, 42);
    }
}
