//! Adapters backed by the running host
//!
//! Process enumeration and host facts come from `sysinfo` on every platform.
//! Mutations, registry and login launch entries are Windows-only; other hosts
//! report them as unsupported so the engine still produces full reports.

use super::{AutoStartOs, HostOs, PerfOptions, ProcessEntry, ProcessOs, RegistryOs};
use crate::error::{Error, Result};
use crate::types::Directive;
use std::time::Duration;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

#[cfg(windows)]
use super::windows as win;

/// First Windows build with EcoQoS efficiency mode
pub const EFFICIENCY_MODE_MIN_BUILD: u32 = 22000;

#[derive(Debug, Default, Clone, Copy)]
pub struct NativeHost;

impl HostOs for NativeHost {
    fn cpu_model(&self) -> Option<String> {
        let sys =
            System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::everything()));
        sys.cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty())
    }

    fn os_name(&self) -> Option<String> {
        System::name()
    }

    fn os_version(&self) -> Option<String> {
        System::long_os_version().or_else(System::os_version)
    }

    fn os_build(&self) -> Option<u32> {
        if cfg!(windows) {
            System::kernel_version().and_then(|v| v.trim().parse().ok())
        } else {
            None
        }
    }

    fn logical_cores(&self) -> Option<usize> {
        let sys =
            System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::new()));
        match sys.cpus().len() {
            0 => std::thread::available_parallelism().ok().map(|n| n.get()),
            n => Some(n),
        }
    }

    fn is_elevated(&self) -> Option<bool> {
        #[cfg(windows)]
        {
            win::is_elevated()
        }
        #[cfg(unix)]
        {
            Some(unsafe { libc::geteuid() } == 0)
        }
        #[cfg(not(any(windows, unix)))]
        {
            None
        }
    }

    fn memory_bytes(&self) -> Option<(u64, u64)> {
        let sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::new().with_ram()),
        );
        match sys.total_memory() {
            0 => None,
            total => Some((total, sys.available_memory())),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NativeProcessOs;

impl ProcessOs for NativeProcessOs {
    fn list_processes(&self) -> Result<Vec<ProcessEntry>> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(Error::Enumeration(
                "process table is not readable on this platform".to_string(),
            ));
        }

        let mut sys = System::new();
        sys.refresh_processes();

        Ok(sys
            .processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string(),
                memory_bytes: process.memory(),
            })
            .collect())
    }

    fn cpu_time(&self, pid: u32) -> Result<Duration> {
        #[cfg(windows)]
        {
            win::cpu_time(pid)
        }
        #[cfg(target_os = "linux")]
        {
            linux_cpu_time(pid)
        }
        #[cfg(not(any(windows, target_os = "linux")))]
        {
            Err(Error::UnsupportedFeature(format!(
                "per-process CPU time for PID {} is not available on this platform",
                pid
            )))
        }
    }

    fn apply(&self, pid: u32, directive: Directive) -> Result<()> {
        #[cfg(windows)]
        {
            win::apply(pid, directive)
        }
        #[cfg(not(windows))]
        {
            Err(Error::UnsupportedFeature(format!(
                "{} on PID {} requires Windows",
                directive.kind().label(),
                pid
            )))
        }
    }
}

#[cfg(target_os = "linux")]
fn linux_cpu_time(pid: u32) -> Result<Duration> {
    use procfs::ProcError;

    let stat = procfs::process::Process::new(pid as i32)
        .and_then(|process| process.stat())
        .map_err(|e| match e {
            ProcError::NotFound(_) => Error::NotFound(format!("process {} has exited", pid)),
            ProcError::PermissionDenied(_) => {
                Error::PermissionDenied(format!("cannot read /proc/{}/stat", pid))
            }
            other => Error::TransientOsFailure(format!("/proc/{}/stat: {}", pid, other)),
        })?;

    let ticks_per_sec = match unsafe { libc::sysconf(libc::_SC_CLK_TCK) } {
        t if t > 0 => t as u64,
        _ => 100,
    };
    let ticks = stat.utime + stat.stime;
    Ok(Duration::from_secs(ticks / ticks_per_sec)
        + Duration::from_nanos((ticks % ticks_per_sec) * 1_000_000_000 / ticks_per_sec))
}

/// `HKLM\...\Image File Execution Options` on Windows
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeRegistry;

impl RegistryOs for NativeRegistry {
    fn read_perf_options(&self, executable: &str) -> Result<Option<PerfOptions>> {
        #[cfg(windows)]
        {
            win::read_perf_options(executable)
        }
        #[cfg(not(windows))]
        {
            Err(registry_unsupported(executable))
        }
    }

    fn write_perf_options(&self, executable: &str, options: PerfOptions) -> Result<()> {
        #[cfg(windows)]
        {
            win::write_perf_options(executable, options)
        }
        #[cfg(not(windows))]
        {
            let _ = options;
            Err(registry_unsupported(executable))
        }
    }

    fn delete_perf_options(&self, executable: &str) -> Result<bool> {
        #[cfg(windows)]
        {
            win::delete_perf_options(executable)
        }
        #[cfg(not(windows))]
        {
            Err(registry_unsupported(executable))
        }
    }
}

#[cfg(not(windows))]
fn registry_unsupported(executable: &str) -> Error {
    Error::UnsupportedFeature(format!(
        "persistent priority for {} requires the Windows registry",
        executable
    ))
}

/// Per-user `Run` key on Windows
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeAutoStart;

impl AutoStartOs for NativeAutoStart {
    fn register(&self, name: &str, command: &str) -> Result<()> {
        #[cfg(windows)]
        {
            win::register_autostart(name, command)
        }
        #[cfg(not(windows))]
        {
            let _ = command;
            Err(autostart_unsupported(name))
        }
    }

    fn unregister(&self, name: &str) -> Result<bool> {
        #[cfg(windows)]
        {
            win::unregister_autostart(name)
        }
        #[cfg(not(windows))]
        {
            Err(autostart_unsupported(name))
        }
    }

    fn registered_command(&self, name: &str) -> Result<Option<String>> {
        #[cfg(windows)]
        {
            win::autostart_command(name)
        }
        #[cfg(not(windows))]
        {
            let _ = name;
            Ok(None)
        }
    }
}

#[cfg(not(windows))]
fn autostart_unsupported(name: &str) -> Error {
    Error::UnsupportedFeature(format!("login launch entry {} requires Windows", name))
}
