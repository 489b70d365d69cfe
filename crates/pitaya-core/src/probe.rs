use crate::blocking::run_bounded;
use crate::os::native::EFFICIENCY_MODE_MIN_BUILD;
use crate::os::HostOs;
use crate::types::SystemInfo;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Best-effort host snapshot. Never fails; unreadable fields keep the
/// defaults of [`SystemInfo::default`].
#[derive(Clone)]
pub struct SystemProbe {
    host: Arc<dyn HostOs>,
}

impl SystemProbe {
    pub fn new(host: Arc<dyn HostOs>) -> Self {
        Self { host }
    }

    pub fn get_system_info(&self) -> SystemInfo {
        let defaults = SystemInfo::default();

        let os_name = self.host.os_name().unwrap_or(defaults.os_name);
        let os_build = self.host.os_build();
        let (total, available) = self.host.memory_bytes().unwrap_or((0, 0));
        let efficiency_mode_supported = os_name.to_lowercase().contains("windows")
            && os_build.map_or(false, |b| b >= EFFICIENCY_MODE_MIN_BUILD);

        let info = SystemInfo {
            cpu_model: self.host.cpu_model().unwrap_or(defaults.cpu_model),
            os_version: self.host.os_version().unwrap_or(defaults.os_version),
            os_name,
            os_build,
            cpu_logical_cores: self
                .host
                .logical_cores()
                .filter(|&n| n >= 1)
                .unwrap_or(defaults.cpu_logical_cores),
            is_admin: self.host.is_elevated().unwrap_or(defaults.is_admin),
            total_memory_gb: total as f64 / BYTES_PER_GB,
            available_memory_gb: available as f64 / BYTES_PER_GB,
            efficiency_mode_supported,
        };

        debug!(
            "System probe: {} logical cores, admin={}, efficiency mode {}",
            info.cpu_logical_cores,
            info.is_admin,
            if info.efficiency_mode_supported { "available" } else { "unavailable" }
        );
        info
    }

    /// [`get_system_info`](Self::get_system_info) on the blocking pool.
    /// A read that outlives `limit` yields the defaults.
    pub async fn get_system_info_bounded(&self, limit: Duration) -> SystemInfo {
        let probe = self.clone();
        match run_bounded("system probe", limit, move || Ok(probe.get_system_info())).await {
            Ok(info) => info,
            Err(e) => {
                warn!("{}; using default host facts", e);
                SystemInfo::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::memory::StaticHost;

    #[test]
    fn test_probe_reads_host_facts() {
        let probe = SystemProbe::new(Arc::new(StaticHost::windows11(8)));
        let info = probe.get_system_info();

        assert_eq!(info.cpu_logical_cores, 8);
        assert_eq!(info.target_core(), 7);
        assert!(info.is_admin);
        assert!(info.efficiency_mode_supported);
        assert_eq!(info.total_memory_gb, 16.0);
        assert_eq!(info.available_memory_gb, 8.0);
    }

    #[test]
    fn test_probe_defaults_when_nothing_readable() {
        let probe = SystemProbe::new(Arc::new(StaticHost::unknown()));
        let info = probe.get_system_info();

        assert_eq!(info, SystemInfo::default());
        assert_eq!(info.cpu_logical_cores, 1);
        assert!(!info.is_admin);
    }

    #[test]
    fn test_efficiency_mode_requires_windows_11() {
        let host = Arc::new(StaticHost::windows11(4));
        host.set_os_build(Some(19045));
        let probe = SystemProbe::new(host.clone());
        assert!(!probe.get_system_info().efficiency_mode_supported);

        host.set_os_build(None);
        assert!(!probe.get_system_info().efficiency_mode_supported);
    }

    #[test]
    fn test_probe_is_fresh_on_every_call() {
        let host = Arc::new(StaticHost::windows11(4));
        let probe = SystemProbe::new(host.clone());
        assert_eq!(probe.get_system_info().target_core(), 3);

        host.set_logical_cores(12);
        assert_eq!(probe.get_system_info().target_core(), 11);
    }

    #[test]
    fn test_unelevated_host() {
        let host = Arc::new(StaticHost::windows11(8));
        host.set_elevated(false);
        assert!(!SystemProbe::new(host).get_system_info().is_admin);
    }

    #[tokio::test]
    async fn test_bounded_probe_reads_host() {
        let probe = SystemProbe::new(Arc::new(StaticHost::windows11(6)));
        let info = probe.get_system_info_bounded(Duration::from_secs(1)).await;
        assert_eq!(info.cpu_logical_cores, 6);
    }

    #[tokio::test]
    async fn test_slow_probe_falls_back_to_defaults() {
        let host = Arc::new(StaticHost::windows11(8));
        host.set_read_delay(Duration::from_millis(200));
        let probe = SystemProbe::new(host);

        let info = probe.get_system_info_bounded(Duration::from_millis(20)).await;
        assert_eq!(info, SystemInfo::default());
    }

    #[test]
    fn test_zero_cores_falls_back_to_one() {
        let host = Arc::new(StaticHost::windows11(0));
        let info = SystemProbe::new(host).get_system_info();
        assert_eq!(info.cpu_logical_cores, 1);
    }
}
