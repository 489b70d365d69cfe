use crate::blocking::run_bounded;
use crate::error::Result;
use crate::matcher::{ProcessMatcher, TargetPattern};
use crate::probe::SystemProbe;
use crate::types::{ProcessHandleInfo, ProcessPerformanceSample};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default spacing between the two CPU-time reads
pub const DEFAULT_SAMPLE_WINDOW: Duration = Duration::from_millis(500);

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// CPU%/memory snapshot for a watch list
#[derive(Clone)]
pub struct PerformanceSampler {
    probe: SystemProbe,
    matcher: ProcessMatcher,
    window: Duration,
}

impl PerformanceSampler {
    pub fn new(probe: SystemProbe, matcher: ProcessMatcher, window: Duration) -> Self {
        Self {
            probe,
            matcher,
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// One sample per running watched instance, busiest first.
    ///
    /// cpu_usage is normalised to total machine capacity: a process keeping
    /// one of N logical cores busy reports about 100/N.
    pub async fn sample(&self, watch_list: &[TargetPattern]) -> Result<Vec<ProcessPerformanceSample>> {
        let cores = self
            .probe
            .get_system_info_bounded(self.matcher.call_timeout())
            .await
            .cpu_logical_cores
            .max(1) as f64;

        // Overlapping watch entries share instances
        let mut seen = HashSet::new();
        let instances: Vec<ProcessHandleInfo> = self
            .matcher
            .find(watch_list)
            .await?
            .into_values()
            .flatten()
            .filter(|instance| seen.insert(instance.pid))
            .collect();

        if instances.is_empty() {
            return Ok(Vec::new());
        }

        let first = self.read_cpu_times(&instances).await;
        let started = Instant::now();
        tokio::time::sleep(self.window).await;
        let second = self.read_cpu_times(&instances).await;
        let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);

        let mut samples: Vec<ProcessPerformanceSample> = instances
            .iter()
            .zip(first.into_iter().zip(second))
            .filter_map(|(instance, times)| match times {
                (Some(t0), Some(t1)) => {
                    let busy = t1.saturating_sub(t0).as_secs_f64();
                    Some(ProcessPerformanceSample {
                        pid: instance.pid,
                        name: instance.name.clone(),
                        cpu_usage: (busy / elapsed / cores * 100.0).clamp(0.0, 100.0),
                        memory_mb: instance.memory_bytes as f64 / BYTES_PER_MB,
                    })
                }
                // Exited (or unreadable) between the two reads
                _ => None,
            })
            .collect();

        samples.sort_by(|a, b| b.cpu_usage.total_cmp(&a.cpu_usage));
        debug!(
            "Sampled {} of {} watched instance(s) over {}ms",
            samples.len(),
            instances.len(),
            self.window.as_millis()
        );
        Ok(samples)
    }

    async fn read_cpu_times(&self, instances: &[ProcessHandleInfo]) -> Vec<Option<Duration>> {
        let mut times = Vec::with_capacity(instances.len());
        for instance in instances {
            let processes = Arc::clone(self.matcher.process_os());
            let pid = instance.pid;
            let read = run_bounded(
                &format!("cpu time read for PID {}", pid),
                self.matcher.call_timeout(),
                move || processes.cpu_time(pid),
            )
            .await;
            if let Err(e) = &read {
                debug!("PID {} dropped from sample: {}", pid, e);
            }
            times.push(read.ok());
        }
        times
    }
}
