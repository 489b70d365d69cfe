//! In-memory adapters
//!
//! Deterministic stand-ins for the OS: a process table with scripted CPU
//! load, per-directive failure injection and an optional per-call delay, an
//! IFEO-style registry and a login launch list.

use super::{AutoStartOs, HostOs, PerfOptions, ProcessEntry, ProcessOs, RegistryOs};
use crate::error::{Error, Result};
use crate::types::{Directive, DirectiveKind};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Host facts; every field may be left unknown
#[derive(Debug, Clone, Default)]
pub struct HostFacts {
    pub cpu_model: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub os_build: Option<u32>,
    pub logical_cores: Option<usize>,
    pub elevated: Option<bool>,
    pub memory_bytes: Option<(u64, u64)>,
}

pub struct StaticHost {
    facts: Mutex<HostFacts>,
    read_delay: Mutex<Duration>,
}

impl StaticHost {
    pub fn new(facts: HostFacts) -> Self {
        Self {
            facts: Mutex::new(facts),
            read_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Windows 11 desktop with `cores` logical cores, running elevated
    pub fn windows11(cores: usize) -> Self {
        Self::new(HostFacts {
            cpu_model: Some("Test CPU @ 3.60GHz".to_string()),
            os_name: Some("Windows".to_string()),
            os_version: Some("11 (22631)".to_string()),
            os_build: Some(22631),
            logical_cores: Some(cores),
            elevated: Some(true),
            memory_bytes: Some((16 << 30, 8 << 30)),
        })
    }

    /// Nothing can be read
    pub fn unknown() -> Self {
        Self::new(HostFacts::default())
    }

    pub fn set_logical_cores(&self, cores: usize) {
        lock(&self.facts).logical_cores = Some(cores);
    }

    pub fn set_os_build(&self, build: Option<u32>) {
        lock(&self.facts).os_build = build;
    }

    pub fn set_elevated(&self, elevated: bool) {
        lock(&self.facts).elevated = Some(elevated);
    }

    /// Sleep inside every fact read
    pub fn set_read_delay(&self, delay: Duration) {
        *lock(&self.read_delay) = delay;
    }

    fn facts(&self) -> MutexGuard<'_, HostFacts> {
        let delay = *lock(&self.read_delay);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        lock(&self.facts)
    }
}

impl HostOs for StaticHost {
    fn cpu_model(&self) -> Option<String> {
        self.facts().cpu_model.clone()
    }

    fn os_name(&self) -> Option<String> {
        self.facts().os_name.clone()
    }

    fn os_version(&self) -> Option<String> {
        self.facts().os_version.clone()
    }

    fn os_build(&self) -> Option<u32> {
        self.facts().os_build
    }

    fn logical_cores(&self) -> Option<usize> {
        self.facts().logical_cores
    }

    fn is_elevated(&self) -> Option<bool> {
        self.facts().elevated
    }

    fn memory_bytes(&self) -> Option<(u64, u64)> {
        self.facts().memory_bytes
    }
}

struct FakeProcess {
    name: String,
    memory_bytes: u64,
    busy_cores: f64,
    started: Instant,
}

#[derive(Default)]
struct TableState {
    processes: BTreeMap<u32, FakeProcess>,
    mutations: Vec<(u32, Directive)>,
    denied: HashSet<(u32, DirectiveKind)>,
    unsupported: HashSet<DirectiveKind>,
    fail_enumeration: bool,
    enumerations: usize,
}

/// Scriptable process table
#[derive(Default)]
pub struct InMemoryProcessTable {
    state: Mutex<TableState>,
    mutation_delay: Mutex<Duration>,
    listing_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle process using 64 MiB
    pub fn add_process(&self, pid: u32, name: &str) {
        self.add_busy_process(pid, name, 0.0);
    }

    /// Process keeping `busy_cores` logical cores fully busy
    pub fn add_busy_process(&self, pid: u32, name: &str, busy_cores: f64) {
        lock(&self.state).processes.insert(
            pid,
            FakeProcess {
                name: name.to_string(),
                memory_bytes: 64 << 20,
                busy_cores,
                started: Instant::now(),
            },
        );
    }

    pub fn remove_process(&self, pid: u32) {
        lock(&self.state).processes.remove(&pid);
    }

    /// `kind` on `pid` fails with access denied
    pub fn deny(&self, pid: u32, kind: DirectiveKind) {
        lock(&self.state).denied.insert((pid, kind));
    }

    /// `kind` is rejected as unsupported by the OS
    pub fn mark_unsupported(&self, kind: DirectiveKind) {
        lock(&self.state).unsupported.insert(kind);
    }

    pub fn fail_enumeration(&self, fail: bool) {
        lock(&self.state).fail_enumeration = fail;
    }

    /// Sleep inside every mutation call
    pub fn set_mutation_delay(&self, delay: Duration) {
        *lock(&self.mutation_delay) = delay;
    }

    /// Sleep inside every enumeration call
    pub fn set_listing_delay(&self, delay: Duration) {
        *lock(&self.listing_delay) = delay;
    }

    /// Successful mutations in call order
    pub fn mutations(&self) -> Vec<(u32, Directive)> {
        lock(&self.state).mutations.clone()
    }

    pub fn mutation_count(&self) -> usize {
        lock(&self.state).mutations.len()
    }

    pub fn enumeration_count(&self) -> usize {
        lock(&self.state).enumerations
    }

    /// Highest number of mutation calls observed running at once
    pub fn max_concurrent_mutations(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn mutate(&self, pid: u32, directive: Directive) -> Result<()> {
        let delay = *lock(&self.mutation_delay);
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut state = lock(&self.state);
        if !state.processes.contains_key(&pid) {
            return Err(Error::NotFound(format!("process {} has exited", pid)));
        }
        if state.unsupported.contains(&directive.kind()) {
            return Err(Error::UnsupportedFeature(format!(
                "{} is not available",
                directive.kind().label()
            )));
        }
        if state.denied.contains(&(pid, directive.kind())) {
            return Err(Error::PermissionDenied(format!(
                "access denied for PID {}",
                pid
            )));
        }
        state.mutations.push((pid, directive));
        Ok(())
    }
}

impl ProcessOs for InMemoryProcessTable {
    fn list_processes(&self) -> Result<Vec<ProcessEntry>> {
        let delay = *lock(&self.listing_delay);
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut state = lock(&self.state);
        state.enumerations += 1;
        if state.fail_enumeration {
            return Err(Error::Enumeration("process snapshot failed".to_string()));
        }
        Ok(state
            .processes
            .iter()
            .map(|(pid, p)| ProcessEntry {
                pid: *pid,
                name: p.name.clone(),
                memory_bytes: p.memory_bytes,
            })
            .collect())
    }

    fn cpu_time(&self, pid: u32) -> Result<Duration> {
        let state = lock(&self.state);
        let process = state
            .processes
            .get(&pid)
            .ok_or_else(|| Error::NotFound(format!("process {} has exited", pid)))?;
        Ok(process.started.elapsed().mul_f64(process.busy_cores))
    }

    fn apply(&self, pid: u32, directive: Directive) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.mutate(pid, directive);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// IFEO-style key store, keyed case-insensitively
#[derive(Default)]
pub struct InMemoryRegistry {
    keys: Mutex<HashMap<String, PerfOptions>>,
    deny_writes: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a non-elevated caller
    pub fn deny_writes(&self, deny: bool) {
        self.deny_writes.store(deny, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_writable(&self, executable: &str) -> Result<()> {
        if self.deny_writes.load(Ordering::SeqCst) {
            return Err(Error::PermissionDenied(format!(
                "cannot modify Image File Execution Options for {}",
                executable
            )));
        }
        Ok(())
    }
}

impl RegistryOs for InMemoryRegistry {
    fn read_perf_options(&self, executable: &str) -> Result<Option<PerfOptions>> {
        Ok(lock(&self.keys).get(&executable.to_lowercase()).copied())
    }

    fn write_perf_options(&self, executable: &str, options: PerfOptions) -> Result<()> {
        self.check_writable(executable)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        lock(&self.keys).insert(executable.to_lowercase(), options);
        Ok(())
    }

    fn delete_perf_options(&self, executable: &str) -> Result<bool> {
        self.check_writable(executable)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.keys).remove(&executable.to_lowercase()).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryAutoStart {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryAutoStart {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AutoStartOs for InMemoryAutoStart {
    fn register(&self, name: &str, command: &str) -> Result<()> {
        lock(&self.entries).insert(name.to_string(), command.to_string());
        Ok(())
    }

    fn unregister(&self, name: &str) -> Result<bool> {
        Ok(lock(&self.entries).remove(name).is_some())
    }

    fn registered_command(&self, name: &str) -> Result<Option<String>> {
        Ok(lock(&self.entries).get(name).cloned())
    }
}
