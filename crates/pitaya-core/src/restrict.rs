use crate::blocking::run_settled;
use crate::error::{Error, Result};
use crate::matcher::{dedup_by_name, ProcessMatcher, TargetPattern};
use crate::probe::SystemProbe;
use crate::types::{
    Directive, DirectiveKind, DirectiveOutcome, InstanceReport, ProcessHandleInfo, ReportMode,
    RestrictionConfig, RestrictionResult, SkipReason, SystemInfo, TargetReport,
};
use chrono::Local;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Applies resource directives to matched target processes
#[derive(Clone)]
pub struct RestrictionApplier {
    probe: SystemProbe,
    matcher: ProcessMatcher,
}

impl RestrictionApplier {
    pub fn new(probe: SystemProbe, matcher: ProcessMatcher) -> Self {
        Self { probe, matcher }
    }

    /// Run one restriction pass over `targets`.
    ///
    /// Algorithm:
    /// 1. Fresh system probe (target core = last logical core)
    /// 2. One process-table enumeration for all targets
    /// 3. Every enabled directive on every instance, each bounded and
    ///    independent of its siblings
    /// 4. Fold outcomes into per-target found/restricted flags
    ///
    /// Repeated target names are reported once. An instance matched by
    /// several targets is restricted once and its outcomes are shared.
    /// Every mutation has finished (or been waited out) when this returns.
    ///
    /// Only an enumeration failure aborts the run.
    pub async fn apply(
        &self,
        config: &RestrictionConfig,
        targets: &[TargetPattern],
        mode: ReportMode,
    ) -> Result<RestrictionResult> {
        let system = self
            .probe
            .get_system_info_bounded(self.matcher.call_timeout())
            .await;
        let target_core = system.target_core();
        let kinds = config.enabled_kinds();

        let mut matches = self.matcher.find(targets).await?;

        let targets = dedup_by_name(targets);
        let mut done: HashMap<u32, InstanceReport> = HashMap::new();
        let mut reports = Vec::with_capacity(targets.len());
        for pattern in targets {
            let instances = matches.remove(pattern.name()).unwrap_or_default();
            let mut instance_reports = Vec::with_capacity(instances.len());
            for instance in &instances {
                if let Some(report) = done.get(&instance.pid) {
                    instance_reports.push(report.clone());
                    continue;
                }
                let report = self.restrict_instance(instance, &kinds, &system).await;
                done.insert(instance.pid, report.clone());
                instance_reports.push(report);
            }
            reports.push(TargetReport::from_instances(
                pattern.name().to_string(),
                instance_reports,
            ));
        }

        let message = match mode {
            ReportMode::Verbose => render_message(target_core, &kinds, &reports),
            ReportMode::Silent => String::new(),
        };

        let found = reports.iter().filter(|r| r.found).count();
        let restricted = reports.iter().filter(|r| r.restricted).count();
        match mode {
            ReportMode::Verbose => info!(
                "Restriction run: {}/{} targets found, {} restricted, core {}",
                found,
                reports.len(),
                restricted,
                target_core
            ),
            ReportMode::Silent => debug!(
                "Restriction run: {}/{} targets found, {} restricted, core {}",
                found,
                reports.len(),
                restricted,
                target_core
            ),
        }

        Ok(RestrictionResult {
            target_core,
            targets: reports,
            message,
            completed_at: Local::now(),
        })
    }

    async fn restrict_instance(
        &self,
        instance: &ProcessHandleInfo,
        kinds: &[DirectiveKind],
        system: &SystemInfo,
    ) -> InstanceReport {
        let mut outcomes = Vec::with_capacity(kinds.len());

        for &kind in kinds {
            let directive = Directive::restricting(kind, system.target_core());

            if kind == DirectiveKind::EfficiencyMode && !system.efficiency_mode_supported {
                outcomes.push((
                    kind,
                    DirectiveOutcome::Skipped {
                        reason: SkipReason::UnsupportedFeature,
                        detail: format!("{} {} has no EcoQoS", system.os_name, system.os_version),
                    },
                ));
                continue;
            }

            let outcome = self.apply_directive(instance.pid, directive).await;
            debug!("PID {} {}: {}", instance.pid, kind.label(), outcome);
            outcomes.push((kind, outcome));
        }

        InstanceReport {
            pid: instance.pid,
            outcomes,
        }
    }

    async fn apply_directive(&self, pid: u32, directive: Directive) -> DirectiveOutcome {
        let processes = Arc::clone(self.matcher.process_os());
        let operation = format!("{} on PID {}", directive.kind().label(), pid);

        match run_settled(&operation, self.matcher.call_timeout(), move || {
            processes.apply(pid, directive)
        })
        .await
        {
            Ok(()) => DirectiveOutcome::Applied,
            Err(e) => outcome_for_error(pid, &e),
        }
    }
}

fn outcome_for_error(pid: u32, err: &Error) -> DirectiveOutcome {
    match err {
        Error::PermissionDenied(detail) => DirectiveOutcome::Skipped {
            reason: SkipReason::PermissionDenied,
            detail: detail.clone(),
        },
        Error::UnsupportedFeature(detail) => DirectiveOutcome::Skipped {
            reason: SkipReason::UnsupportedFeature,
            detail: detail.clone(),
        },
        other => {
            warn!("PID {}: {}", pid, other);
            DirectiveOutcome::Failed {
                kind: other.kind(),
                detail: other.reason(),
            }
        }
    }
}

fn render_message(target_core: u32, kinds: &[DirectiveKind], reports: &[TargetReport]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Target core: {}", target_core);
    if kinds.is_empty() {
        let _ = writeln!(out, "No directives enabled; nothing was changed");
    }

    for report in reports {
        if !report.found {
            let _ = writeln!(out, "{}: not found", report.name);
            continue;
        }
        let _ = writeln!(
            out,
            "{}: found {} instance(s){}",
            report.name,
            report.instances.len(),
            if report.restricted { ", restricted" } else { "" }
        );
        for instance in &report.instances {
            let _ = writeln!(out, "  PID {}:", instance.pid);
            for (kind, outcome) in &instance.outcomes {
                let _ = writeln!(out, "    {}: {}", kind.label(), outcome);
            }
        }
    }

    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::os::memory::{InMemoryProcessTable, StaticHost};
    use std::time::Duration;

    fn applier(host: Arc<StaticHost>, table: Arc<InMemoryProcessTable>) -> RestrictionApplier {
        RestrictionApplier::new(
            SystemProbe::new(host),
            ProcessMatcher::new(table, Duration::from_secs(1)),
        )
    }

    fn ace_targets() -> Vec<TargetPattern> {
        TargetPattern::parse_all(&["SGuard64.exe", "SGuardSvc64.exe"]).unwrap()
    }

    #[tokio::test]
    async fn test_affinity_and_priority_on_eight_cores() {
        let table = Arc::new(InMemoryProcessTable::new());
        table.add_process(100, "SGuard64.exe");
        let config = RestrictionConfig {
            cpu_affinity: true,
            process_priority: true,
            ..Default::default()
        };

        let result = applier(Arc::new(StaticHost::windows11(8)), table.clone())
            .apply(&config, &ace_targets(), ReportMode::Verbose)
            .await
            .unwrap();

        assert_eq!(result.target_core, 7);
        assert!(result.found("SGuard64.exe"));
        assert!(result.restricted("SGuard64.exe"));
        assert!(!result.found("SGuardSvc64.exe"));
        assert!(!result.restricted("SGuardSvc64.exe"));
        assert_eq!(
            table.mutations(),
            vec![
                (100, Directive::CpuAffinity { core: 7 }),
                (100, Directive::IdlePriority)
            ]
        );
        assert!(result.message.contains("Target core: 7"));
        assert!(result.message.contains("SGuardSvc64.exe: not found"));
        assert!(result.message.contains("cpu affinity: applied"));
    }

    #[tokio::test]
    async fn test_all_false_config_changes_nothing() {
        let table = Arc::new(InMemoryProcessTable::new());
        table.add_process(100, "SGuard64.exe");

        let result = applier(Arc::new(StaticHost::windows11(8)), table.clone())
            .apply(
                &RestrictionConfig::default(),
                &ace_targets(),
                ReportMode::Verbose,
            )
            .await
            .unwrap();

        assert_eq!(table.mutation_count(), 0);
        assert!(result.found("SGuard64.exe"));
        assert!(!result.restricted("SGuard64.exe"));
        assert!(result.message.contains("No directives enabled"));
    }

    #[tokio::test]
    async fn test_target_core_follows_fresh_probe() {
        let host = Arc::new(StaticHost::windows11(4));
        let table = Arc::new(InMemoryProcessTable::new());
        table.add_process(1, "SGuard64.exe");
        let applier = applier(host.clone(), table.clone());
        let config = RestrictionConfig {
            cpu_affinity: true,
            ..Default::default()
        };

        let first = applier
            .apply(&config, &ace_targets(), ReportMode::Silent)
            .await
            .unwrap();
        host.set_logical_cores(16);
        let second = applier
            .apply(&config, &ace_targets(), ReportMode::Silent)
            .await
            .unwrap();

        assert_eq!(first.target_core, 3);
        assert_eq!(second.target_core, 15);
        assert!(first.message.is_empty());
    }

    #[tokio::test]
    async fn test_efficiency_skipped_without_os_call_on_windows_10() {
        let host = Arc::new(StaticHost::windows11(8));
        host.set_os_build(Some(19045));
        let table = Arc::new(InMemoryProcessTable::new());
        table.add_process(7, "SGuard64.exe");
        let config = RestrictionConfig {
            cpu_affinity: true,
            efficiency_mode: true,
            ..Default::default()
        };

        let result = applier(host, table.clone())
            .apply(&config, &ace_targets(), ReportMode::Verbose)
            .await
            .unwrap();

        assert_eq!(table.mutation_count(), 1);
        let outcomes = &result.target("SGuard64.exe").unwrap().instances[0].outcomes;
        assert!(matches!(
            outcomes[1].1,
            DirectiveOutcome::Skipped {
                reason: SkipReason::UnsupportedFeature,
                ..
            }
        ));
        assert!(result.restricted("SGuard64.exe"));
    }

    #[tokio::test]
    async fn test_permission_denied_is_skip_not_restricted() {
        let table = Arc::new(InMemoryProcessTable::new());
        table.add_process(5, "SGuard64.exe");
        table.deny(5, DirectiveKind::ProcessPriority);
        let config = RestrictionConfig {
            cpu_affinity: true,
            process_priority: true,
            io_priority: true,
            ..Default::default()
        };

        let result = applier(Arc::new(StaticHost::windows11(8)), table.clone())
            .apply(&config, &ace_targets(), ReportMode::Verbose)
            .await
            .unwrap();

        // Siblings still applied
        assert_eq!(table.mutation_count(), 2);
        assert!(result.found("SGuard64.exe"));
        assert!(!result.restricted("SGuard64.exe"));
        assert!(result
            .message
            .contains("process priority: skipped (requires administrator"));
    }

    #[tokio::test]
    async fn test_every_instance_is_restricted() {
        let table = Arc::new(InMemoryProcessTable::new());
        table.add_process(10, "SGuard64.exe");
        table.add_process(11, "SGuard64.exe");
        table.deny(11, DirectiveKind::CpuAffinity);
        let config = RestrictionConfig {
            cpu_affinity: true,
            ..Default::default()
        };

        let result = applier(Arc::new(StaticHost::windows11(2)), table.clone())
            .apply(&config, &ace_targets(), ReportMode::Verbose)
            .await
            .unwrap();

        let report = result.target("SGuard64.exe").unwrap();
        assert_eq!(report.instances.len(), 2);
        assert!(report.found);
        assert!(!report.restricted);
        assert_eq!(table.mutations(), vec![(10, Directive::CpuAffinity { core: 1 })]);
    }

    #[tokio::test]
    async fn test_timeout_is_failure_and_does_not_abort() {
        let table = Arc::new(InMemoryProcessTable::new());
        table.add_process(3, "SGuard64.exe");
        table.set_mutation_delay(Duration::from_millis(300));
        let applier = RestrictionApplier::new(
            SystemProbe::new(Arc::new(StaticHost::windows11(8))),
            ProcessMatcher::new(table, Duration::from_millis(30)),
        );
        let config = RestrictionConfig {
            cpu_affinity: true,
            memory_priority: true,
            ..Default::default()
        };

        let result = applier
            .apply(&config, &ace_targets(), ReportMode::Verbose)
            .await
            .unwrap();

        let outcomes = &result.target("SGuard64.exe").unwrap().instances[0].outcomes;
        assert_eq!(outcomes.len(), 2);
        for (_, outcome) in outcomes {
            assert!(matches!(
                outcome,
                DirectiveOutcome::Failed {
                    kind: FailureKind::Timeout,
                    ..
                }
            ));
        }
        assert!(!result.restricted("SGuard64.exe"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_timed_out_mutations_settle_before_return() {
        let table = Arc::new(InMemoryProcessTable::new());
        table.add_process(3, "SGuard64.exe");
        table.set_mutation_delay(Duration::from_millis(150));
        let applier = RestrictionApplier::new(
            SystemProbe::new(Arc::new(StaticHost::windows11(8))),
            ProcessMatcher::new(table.clone(), Duration::from_millis(20)),
        );
        let config = RestrictionConfig {
            cpu_affinity: true,
            process_priority: true,
            ..Default::default()
        };

        let result = applier
            .apply(&config, &ace_targets(), ReportMode::Silent)
            .await
            .unwrap();

        // Both calls landed late, one at a time, before apply returned
        assert_eq!(table.mutation_count(), 2);
        assert_eq!(table.max_concurrent_mutations(), 1);
        assert!(!result.restricted("SGuard64.exe"));
    }

    #[tokio::test]
    async fn test_os_rejected_efficiency_mode_still_restricts() {
        let table = Arc::new(InMemoryProcessTable::new());
        table.add_process(9, "SGuard64.exe");
        table.mark_unsupported(DirectiveKind::EfficiencyMode);
        let config = RestrictionConfig {
            cpu_affinity: true,
            efficiency_mode: true,
            ..Default::default()
        };

        let result = applier(Arc::new(StaticHost::windows11(8)), table.clone())
            .apply(&config, &ace_targets(), ReportMode::Verbose)
            .await
            .unwrap();

        let outcomes = &result.target("SGuard64.exe").unwrap().instances[0].outcomes;
        assert_eq!(outcomes[1].0, DirectiveKind::EfficiencyMode);
        assert!(matches!(
            outcomes[1].1,
            DirectiveOutcome::Skipped {
                reason: SkipReason::UnsupportedFeature,
                ..
            }
        ));
        assert!(result
            .message
            .contains("efficiency mode: skipped (unsupported"));
        assert!(result.restricted("SGuard64.exe"));
        assert_eq!(table.mutations(), vec![(9, Directive::CpuAffinity { core: 7 })]);
    }

    #[tokio::test]
    async fn test_overlapping_targets_restrict_instance_once() {
        let table = Arc::new(InMemoryProcessTable::new());
        table.add_process(10, "SGuard64.exe");
        let targets = TargetPattern::parse_all(&["SGuard64.exe", "re:^sguard"]).unwrap();
        let config = RestrictionConfig {
            cpu_affinity: true,
            process_priority: true,
            ..Default::default()
        };

        let result = applier(Arc::new(StaticHost::windows11(8)), table.clone())
            .apply(&config, &targets, ReportMode::Verbose)
            .await
            .unwrap();

        assert_eq!(table.mutation_count(), 2);
        assert!(result.restricted("SGuard64.exe"));
        assert!(result.restricted("re:^sguard"));
        assert_eq!(
            result.targets[0].instances,
            result.targets[1].instances
        );
    }

    #[tokio::test]
    async fn test_repeated_target_name_reported_once() {
        let table = Arc::new(InMemoryProcessTable::new());
        table.add_process(10, "SGuard64.exe");
        let targets = TargetPattern::parse_all(&["SGuard64.exe", "SGuard64.exe"]).unwrap();
        let config = RestrictionConfig {
            cpu_affinity: true,
            ..Default::default()
        };

        let result = applier(Arc::new(StaticHost::windows11(8)), table.clone())
            .apply(&config, &targets, ReportMode::Verbose)
            .await
            .unwrap();

        assert_eq!(result.targets.len(), 1);
        assert!(result.targets[0].found);
        assert!(result.targets[0].restricted);
        assert_eq!(table.mutation_count(), 1);
    }

    #[tokio::test]
    async fn test_enumeration_failure_aborts_run() {
        let table = Arc::new(InMemoryProcessTable::new());
        table.fail_enumeration(true);

        let err = applier(Arc::new(StaticHost::windows11(8)), table.clone())
            .apply(&RestrictionConfig::all(), &ace_targets(), ReportMode::Verbose)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Enumeration(_)));
        assert_eq!(table.mutation_count(), 0);
    }
}
