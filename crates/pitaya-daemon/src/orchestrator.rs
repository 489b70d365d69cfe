use crate::config::Config;
use chrono::{DateTime, Local};
use pitaya_core::{
    Adapters, Error, PerformanceSampler, ProcessMatcher, ProcessPerformanceSample, ReportMode,
    RestrictionApplier, RestrictionConfig, RestrictionResult, Result, SystemProbe, TargetPattern,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Resolved orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub restrict_targets: Vec<TargetPattern>,
    pub watch_list: Vec<TargetPattern>,
    pub tick_interval: Duration,
    pub call_timeout: Duration,
    pub sample_window: Duration,
    /// Directives applied on every tick; `None` disables automatic runs
    pub auto_restrict: Option<RestrictionConfig>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            restrict_targets: TargetPattern::parse_all(&config.targets.restrict)?,
            watch_list: TargetPattern::parse_all(&config.targets.watch)?,
            tick_interval: config.tick_interval(),
            call_timeout: config.call_timeout(),
            sample_window: config.sample_window(),
            auto_restrict: config
                .orchestrator
                .auto_restrict
                .then_some(config.restriction),
        })
    }
}

/// Indicator state kept from the latest restriction run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetStatus {
    pub name: String,
    pub found: bool,
    pub restricted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestrictionStatus {
    pub target_core: u32,
    pub targets: Vec<TargetStatus>,
    pub last_run: DateTime<Local>,
}

impl From<&RestrictionResult> for RestrictionStatus {
    fn from(result: &RestrictionResult) -> Self {
        Self {
            target_core: result.target_core,
            targets: result
                .targets
                .iter()
                .map(|t| TargetStatus {
                    name: t.name.clone(),
                    found: t.found,
                    restricted: t.restricted,
                })
                .collect(),
            last_run: result.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    pub auto_restrict: Option<RestrictionConfig>,
    pub ticks: u64,
    pub last_restriction: Option<RestrictionStatus>,
    pub last_sample_at: Option<DateTime<Local>>,
}

/// Work started by one tick
#[derive(Debug, Default)]
pub struct TickHandles {
    pub sample: Option<JoinHandle<()>>,
    pub restrict: Option<JoinHandle<()>>,
}

impl TickHandles {
    /// Wait for everything this tick started
    pub async fn join(self) {
        for handle in [self.sample, self.restrict].into_iter().flatten() {
            if let Err(e) = handle.await {
                error!("Tick task failed: {}", e);
            }
        }
    }
}

struct Inner {
    applier: RestrictionApplier,
    sampler: PerformanceSampler,
    restrict_targets: Vec<TargetPattern>,
    watch_list: Vec<TargetPattern>,
    tick_interval: Duration,

    restrict_gate: Arc<AsyncMutex<()>>,
    sample_gate: Arc<AsyncMutex<()>>,
    auto_restrict: RwLock<Option<RestrictionConfig>>,

    latest_samples: RwLock<Vec<ProcessPerformanceSample>>,
    last_sample_at: RwLock<Option<DateTime<Local>>>,
    last_restriction: RwLock<Option<RestrictionStatus>>,
    ticks: AtomicU64,

    cancel: Mutex<Option<CancellationToken>>,
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn write<T>(lock: &RwLock<T>, value: T) {
    *lock.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
}

/// Owns the periodic tick and single-flights restriction runs.
///
/// Manual and automatic restriction share one gate, so runs never
/// interleave. Sampling and restriction are independent of each other.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(adapters: &Adapters, settings: OrchestratorSettings) -> Self {
        let probe = SystemProbe::new(Arc::clone(&adapters.host));
        let matcher = ProcessMatcher::new(Arc::clone(&adapters.processes), settings.call_timeout);

        Self {
            inner: Arc::new(Inner {
                applier: RestrictionApplier::new(probe.clone(), matcher.clone()),
                sampler: PerformanceSampler::new(probe, matcher, settings.sample_window),
                restrict_targets: settings.restrict_targets,
                watch_list: settings.watch_list,
                tick_interval: settings.tick_interval,
                restrict_gate: Arc::new(AsyncMutex::new(())),
                sample_gate: Arc::new(AsyncMutex::new(())),
                auto_restrict: RwLock::new(settings.auto_restrict),
                latest_samples: RwLock::new(Vec::new()),
                last_sample_at: RwLock::new(None),
                last_restriction: RwLock::new(None),
                ticks: AtomicU64::new(0),
                cancel: Mutex::new(None),
            }),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.inner.tick_interval
    }

    /// Manual restriction; waits for an in-flight run to finish first
    pub async fn restrict_now(
        &self,
        config: RestrictionConfig,
        mode: ReportMode,
    ) -> Result<RestrictionResult> {
        let _guard = self.inner.restrict_gate.lock().await;
        self.inner.run_restriction(config, mode).await
    }

    /// Manual restriction; `Busy` if a run is in flight
    pub async fn try_restrict_now(
        &self,
        config: RestrictionConfig,
        mode: ReportMode,
    ) -> Result<RestrictionResult> {
        let _guard = self
            .inner
            .restrict_gate
            .try_lock()
            .map_err(|_| Error::Busy("a restriction run is already in progress".to_string()))?;
        self.inner.run_restriction(config, mode).await
    }

    /// Sample the watch list and keep the result as the latest snapshot
    pub async fn sample_now(&self) -> Result<Vec<ProcessPerformanceSample>> {
        self.inner.run_sampling().await
    }

    pub fn set_auto_restrict(&self, config: Option<RestrictionConfig>) {
        info!(
            "Automatic restriction {}",
            if config.is_some() { "enabled" } else { "disabled" }
        );
        write(&self.inner.auto_restrict, config);
    }

    pub fn latest_samples(&self) -> Vec<ProcessPerformanceSample> {
        read(&self.inner.latest_samples)
    }

    pub fn status(&self) -> OrchestratorStatus {
        let running = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map_or(false, |token| !token.is_cancelled());

        OrchestratorStatus {
            running,
            auto_restrict: read(&self.inner.auto_restrict),
            ticks: self.inner.ticks.load(Ordering::SeqCst),
            last_restriction: read(&self.inner.last_restriction),
            last_sample_at: read(&self.inner.last_sample_at),
        }
    }

    /// Start work for one tick.
    ///
    /// Each kind of work is skipped (not queued) while its previous run is
    /// still going.
    pub fn tick(&self) -> TickHandles {
        let tick = self.inner.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let mut handles = TickHandles::default();

        match Arc::clone(&self.inner.sample_gate).try_lock_owned() {
            Ok(guard) => {
                let inner = Arc::clone(&self.inner);
                handles.sample = Some(tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) = inner.sample_unguarded().await {
                        warn!("Sampling failed: {}", e);
                    }
                }));
            }
            Err(_) => debug!("Tick {}: sampling still running, skipped", tick),
        }

        if let Some(config) = read(&self.inner.auto_restrict) {
            match Arc::clone(&self.inner.restrict_gate).try_lock_owned() {
                Ok(guard) => {
                    let inner = Arc::clone(&self.inner);
                    handles.restrict = Some(tokio::spawn(async move {
                        let _guard = guard;
                        if let Err(e) = inner.run_restriction(config, ReportMode::Silent).await {
                            warn!("Automatic restriction failed: {}", e);
                        }
                    }));
                }
                Err(_) => debug!("Tick {}: restriction still running, skipped", tick),
            }
        }

        handles
    }

    /// Start the periodic loop. The first tick fires immediately.
    pub fn start(&self) -> JoinHandle<()> {
        let token = CancellationToken::new();
        {
            let mut slot = self
                .inner
                .cancel
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(previous) = slot.replace(token.clone()) {
                previous.cancel();
            }
        }

        let orchestrator = self.clone();
        let period = self.inner.tick_interval;
        info!("Orchestrator started: tick every {:?}", period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        in_flight.retain(|h| !h.is_finished());
                        let handles = orchestrator.tick();
                        in_flight.extend(handles.sample);
                        in_flight.extend(handles.restrict);
                    }
                }
            }

            // In-flight work finishes; no new ticks start
            for handle in in_flight {
                let _ = handle.await;
            }
            info!("Orchestrator stopped");
        })
    }

    /// Prevent future ticks
    pub fn stop(&self) {
        if let Some(token) = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            token.cancel();
        }
    }
}

impl Inner {
    async fn run_restriction(
        &self,
        config: RestrictionConfig,
        mode: ReportMode,
    ) -> Result<RestrictionResult> {
        let result = self
            .applier
            .apply(&config, &self.restrict_targets, mode)
            .await?;
        write(
            &self.last_restriction,
            Some(RestrictionStatus::from(&result)),
        );
        Ok(result)
    }

    async fn run_sampling(&self) -> Result<Vec<ProcessPerformanceSample>> {
        let _guard = self.sample_gate.lock().await;
        self.sample_unguarded().await
    }

    async fn sample_unguarded(&self) -> Result<Vec<ProcessPerformanceSample>> {
        let samples = self.sampler.sample(&self.watch_list).await?;
        debug!("Latest snapshot: {} sample(s)", samples.len());
        write(&self.latest_samples, samples.clone());
        write(&self.last_sample_at, Some(Local::now()));
        Ok(samples)
    }
}
