//! Win32 / NT calls behind the native adapters

use super::PerfOptions;
use crate::error::{Error, Result};
use crate::types::Directive;
use std::ffi::c_void;
use std::mem;
use std::time::Duration;
use windows::core::HRESULT;
use windows::Win32::Foundation::{CloseHandle, E_ACCESSDENIED, E_INVALIDARG, FILETIME, HANDLE};
use windows::Win32::Security::{GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY};
use windows::Win32::System::Threading::{
    GetCurrentProcess, GetProcessTimes, OpenProcess, OpenProcessToken, ProcessMemoryPriority,
    ProcessPowerThrottling, SetPriorityClass, SetProcessAffinityMask, SetProcessInformation,
    IDLE_PRIORITY_CLASS, MEMORY_PRIORITY, MEMORY_PRIORITY_INFORMATION, PROCESS_ACCESS_RIGHTS,
    PROCESS_POWER_THROTTLING_EXECUTION_SPEED, PROCESS_POWER_THROTTLING_IGNORE_TIMER_RESOLUTION,
    PROCESS_POWER_THROTTLING_STATE, PROCESS_QUERY_INFORMATION, PROCESS_QUERY_LIMITED_INFORMATION,
    PROCESS_SET_INFORMATION,
};
use winreg::enums::{HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, KEY_READ, KEY_WRITE};
use winreg::RegKey;

const IFEO_PATH: &str =
    r"SOFTWARE\Microsoft\Windows NT\CurrentVersion\Image File Execution Options";
const RUN_PATH: &str = r"Software\Microsoft\Windows\CurrentVersion\Run";

const STATUS_ACCESS_DENIED: i32 = 0xC000_0022_u32 as i32;
const STATUS_PRIVILEGE_NOT_HELD: i32 = 0xC000_0061_u32 as i32;
const STATUS_INVALID_INFO_CLASS: i32 = 0xC000_0003_u32 as i32;
const STATUS_NOT_SUPPORTED: i32 = 0xC000_00BB_u32 as i32;

/// Process handle closed on drop
struct ScopedHandle(HANDLE);

impl ScopedHandle {
    fn open(pid: u32, access: PROCESS_ACCESS_RIGHTS) -> Result<Self> {
        if pid == 0 || pid == 4 {
            return Err(Error::PermissionDenied(format!(
                "PID {} is a system process",
                pid
            )));
        }
        let handle = unsafe { OpenProcess(access, false, pid) }.map_err(|e| {
            if e.code() == E_INVALIDARG {
                Error::NotFound(format!("process {} has exited", pid))
            } else {
                classify(e, &format!("OpenProcess({})", pid))
            }
        })?;
        if handle.is_invalid() {
            return Err(Error::TransientOsFailure(format!(
                "OpenProcess({}) returned an invalid handle",
                pid
            )));
        }
        Ok(Self(handle))
    }
}

impl Drop for ScopedHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn classify(err: windows::core::Error, context: &str) -> Error {
    let code: HRESULT = err.code();
    if code == E_ACCESSDENIED {
        Error::PermissionDenied(format!("{}: {}", context, err.message()))
    } else {
        Error::TransientOsFailure(format!("{}: {}", context, err.message()))
    }
}

pub(super) fn is_elevated() -> Option<bool> {
    unsafe {
        let mut token = HANDLE::default();
        OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token).ok()?;

        let mut elevation = TOKEN_ELEVATION::default();
        let mut size = 0u32;
        let result = GetTokenInformation(
            token,
            TokenElevation,
            Some(&mut elevation as *mut _ as *mut c_void),
            mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut size,
        );
        let _ = CloseHandle(token);

        result.ok().map(|_| elevation.TokenIsElevated != 0)
    }
}

fn filetime_to_duration(ft: &FILETIME) -> Duration {
    let hundred_ns = ((ft.dwHighDateTime as u64) << 32) | ft.dwLowDateTime as u64;
    Duration::from_nanos(hundred_ns.saturating_mul(100))
}

pub(super) fn cpu_time(pid: u32) -> Result<Duration> {
    let handle = ScopedHandle::open(pid, PROCESS_QUERY_LIMITED_INFORMATION)?;
    let mut creation = FILETIME::default();
    let mut exit = FILETIME::default();
    let mut kernel = FILETIME::default();
    let mut user = FILETIME::default();
    unsafe { GetProcessTimes(handle.0, &mut creation, &mut exit, &mut kernel, &mut user) }
        .map_err(|e| classify(e, &format!("GetProcessTimes({})", pid)))?;
    Ok(filetime_to_duration(&kernel) + filetime_to_duration(&user))
}

pub(super) fn apply(pid: u32, directive: Directive) -> Result<()> {
    let handle = ScopedHandle::open(pid, PROCESS_SET_INFORMATION | PROCESS_QUERY_INFORMATION)?;
    match directive {
        Directive::CpuAffinity { core } => {
            if core >= usize::BITS {
                return Err(Error::UnsupportedFeature(format!(
                    "core {} lies outside the first processor group",
                    core
                )));
            }
            unsafe { SetProcessAffinityMask(handle.0, 1usize << core) }
                .map_err(|e| classify(e, &format!("SetProcessAffinityMask({})", pid)))
        }
        Directive::IdlePriority => unsafe { SetPriorityClass(handle.0, IDLE_PRIORITY_CLASS) }
            .map_err(|e| classify(e, &format!("SetPriorityClass({})", pid))),
        Directive::EfficiencyMode => {
            // EcoQoS plus relaxed timer resolution
            let mask = PROCESS_POWER_THROTTLING_EXECUTION_SPEED
                | PROCESS_POWER_THROTTLING_IGNORE_TIMER_RESOLUTION;
            let state = PROCESS_POWER_THROTTLING_STATE {
                Version: 1,
                ControlMask: mask,
                StateMask: mask,
            };
            unsafe {
                SetProcessInformation(
                    handle.0,
                    ProcessPowerThrottling,
                    &state as *const _ as *const c_void,
                    mem::size_of::<PROCESS_POWER_THROTTLING_STATE>() as u32,
                )
            }
            .map_err(|e| {
                if e.code() == E_INVALIDARG {
                    Error::UnsupportedFeature("power throttling is not available".to_string())
                } else {
                    classify(e, &format!("ProcessPowerThrottling({})", pid))
                }
            })
        }
        Directive::IoPriority(level) => set_io_priority(&handle, pid, level as u32),
        Directive::MemoryPriority(level) => {
            let info = MEMORY_PRIORITY_INFORMATION {
                MemoryPriority: MEMORY_PRIORITY(level as u32),
            };
            unsafe {
                SetProcessInformation(
                    handle.0,
                    ProcessMemoryPriority,
                    &info as *const _ as *const c_void,
                    mem::size_of::<MEMORY_PRIORITY_INFORMATION>() as u32,
                )
            }
            .map_err(|e| classify(e, &format!("ProcessMemoryPriority({})", pid)))
        }
    }
}

/// Win32 exposes no setter for the I/O priority hint; it goes through NT.
fn set_io_priority(handle: &ScopedHandle, pid: u32, priority: u32) -> Result<()> {
    use ntapi::ntpsapi::{NtSetInformationProcess, ProcessIoPriority};

    let mut value = priority;
    let status = unsafe {
        NtSetInformationProcess(
            handle.0 .0.cast(),
            ProcessIoPriority,
            &mut value as *mut u32 as *mut _,
            mem::size_of::<u32>() as u32,
        )
    };
    match status {
        s if s >= 0 => Ok(()),
        STATUS_ACCESS_DENIED | STATUS_PRIVILEGE_NOT_HELD => Err(Error::PermissionDenied(
            format!("NtSetInformationProcess(IoPriority) on PID {}", pid),
        )),
        STATUS_INVALID_INFO_CLASS | STATUS_NOT_SUPPORTED => Err(Error::UnsupportedFeature(
            "I/O priority information class".to_string(),
        )),
        s => Err(Error::TransientOsFailure(format!(
            "NtSetInformationProcess(IoPriority) on PID {} returned {:#010x}",
            pid, s as u32
        ))),
    }
}

fn registry_error(err: std::io::Error, context: &str) -> Error {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => {
            Error::PermissionDenied(format!("{}: run as administrator", context))
        }
        std::io::ErrorKind::NotFound => Error::NotFound(context.to_string()),
        _ => Error::TransientOsFailure(format!("{}: {}", context, err)),
    }
}

fn perf_options_path(executable: &str) -> String {
    format!(r"{}\{}\PerfOptions", IFEO_PATH, executable)
}

pub(super) fn read_perf_options(executable: &str) -> Result<Option<PerfOptions>> {
    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    let key = match hklm.open_subkey_with_flags(perf_options_path(executable), KEY_READ) {
        Ok(key) => key,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(registry_error(e, executable)),
    };

    let cpu_priority_class: u32 = match key.get_value("CpuPriorityClass") {
        Ok(value) => value,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(registry_error(e, executable)),
    };
    let io_priority: Option<u32> = key.get_value("IoPriority").ok();

    Ok(Some(PerfOptions {
        cpu_priority_class,
        io_priority,
    }))
}

pub(super) fn write_perf_options(executable: &str, options: PerfOptions) -> Result<()> {
    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    let (key, _) = hklm
        .create_subkey(perf_options_path(executable))
        .map_err(|e| registry_error(e, executable))?;

    key.set_value("CpuPriorityClass", &options.cpu_priority_class)
        .map_err(|e| registry_error(e, executable))?;
    match options.io_priority {
        Some(io) => key
            .set_value("IoPriority", &io)
            .map_err(|e| registry_error(e, executable)),
        None => match key.delete_value("IoPriority") {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(registry_error(e, executable))
            }
            _ => Ok(()),
        },
    }
}

pub(super) fn delete_perf_options(executable: &str) -> Result<bool> {
    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    let exe_key = match hklm.open_subkey_with_flags(format!(r"{}\{}", IFEO_PATH, executable), KEY_WRITE) {
        Ok(key) => key,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(registry_error(e, executable)),
    };

    match exe_key.delete_subkey("PerfOptions") {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(registry_error(e, executable)),
    }
}

pub(super) fn register_autostart(name: &str, command: &str) -> Result<()> {
    let hkcu = RegKey::predef(HKEY_CURRENT_USER);
    let (key, _) = hkcu
        .create_subkey(RUN_PATH)
        .map_err(|e| registry_error(e, RUN_PATH))?;
    key.set_value(name, &command)
        .map_err(|e| registry_error(e, name))
}

pub(super) fn unregister_autostart(name: &str) -> Result<bool> {
    let hkcu = RegKey::predef(HKEY_CURRENT_USER);
    let key = match hkcu.open_subkey_with_flags(RUN_PATH, KEY_WRITE) {
        Ok(key) => key,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(registry_error(e, RUN_PATH)),
    };
    match key.delete_value(name) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(registry_error(e, name)),
    }
}

pub(super) fn autostart_command(name: &str) -> Result<Option<String>> {
    let hkcu = RegKey::predef(HKEY_CURRENT_USER);
    let key = match hkcu.open_subkey_with_flags(RUN_PATH, KEY_READ) {
        Ok(key) => key,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(registry_error(e, RUN_PATH)),
    };
    match key.get_value::<String, _>(name) {
        Ok(command) => Ok(Some(command)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(registry_error(e, name)),
    }
}
