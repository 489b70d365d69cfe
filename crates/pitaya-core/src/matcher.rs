use crate::blocking::run_bounded;
use crate::error::{Error, Result};
use crate::os::ProcessOs;
use crate::types::ProcessHandleInfo;
use regex::{Regex, RegexBuilder};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Target name: an executable name (case-insensitive), or `re:<regex>`.
#[derive(Debug, Clone)]
pub enum TargetPattern {
    Exact(String),
    Regex { source: String, regex: Regex },
}

impl TargetPattern {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        match raw.strip_prefix("re:") {
            Some(expr) => {
                let regex = RegexBuilder::new(expr)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| Error::Pattern(format!("{}: {}", raw, e)))?;
                Ok(TargetPattern::Regex {
                    source: raw.to_string(),
                    regex,
                })
            }
            None if raw.is_empty() => Err(Error::Pattern("empty target name".to_string())),
            None => Ok(TargetPattern::Exact(raw.to_string())),
        }
    }

    pub fn parse_all<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Self>> {
        raw.iter().map(|s| Self::parse(s.as_ref())).collect()
    }

    /// Key used in match results and reports
    pub fn name(&self) -> &str {
        match self {
            TargetPattern::Exact(name) => name,
            TargetPattern::Regex { source, .. } => source,
        }
    }

    pub fn matches(&self, process_name: &str) -> bool {
        match self {
            TargetPattern::Exact(name) => name.eq_ignore_ascii_case(process_name),
            TargetPattern::Regex { regex, .. } => regex.is_match(process_name),
        }
    }
}

impl fmt::Display for TargetPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pattern name → live instances; every requested pattern has an entry
pub type MatchSet = BTreeMap<String, Vec<ProcessHandleInfo>>;

/// Resolves target patterns against one snapshot of the process table
#[derive(Clone)]
pub struct ProcessMatcher {
    processes: Arc<dyn ProcessOs>,
    call_timeout: Duration,
}

impl ProcessMatcher {
    pub fn new(processes: Arc<dyn ProcessOs>, call_timeout: Duration) -> Self {
        Self {
            processes,
            call_timeout,
        }
    }

    pub fn process_os(&self) -> &Arc<dyn ProcessOs> {
        &self.processes
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Enumerate once and bucket instances per pattern.
    ///
    /// Patterns sharing a name are one bucket. A process matching several
    /// distinct patterns appears in each of their buckets; callers that act
    /// on instances key by pid.
    ///
    /// A failed or timed-out enumeration is returned as the call's only
    /// error; nothing has been touched at that point.
    pub async fn find(&self, patterns: &[TargetPattern]) -> Result<MatchSet> {
        let processes = Arc::clone(&self.processes);
        let entries = run_bounded("process enumeration", self.call_timeout, move || {
            processes.list_processes()
        })
        .await
        .map_err(|e| match e {
            Error::Enumeration(_) => e,
            other => Error::Enumeration(other.to_string()),
        })?;

        let patterns = dedup_by_name(patterns);
        let mut matches: MatchSet = patterns
            .iter()
            .map(|p| (p.name().to_string(), Vec::new()))
            .collect();

        for entry in &entries {
            for pattern in &patterns {
                if pattern.matches(&entry.name) {
                    if let Some(bucket) = matches.get_mut(pattern.name()) {
                        bucket.push(ProcessHandleInfo {
                            pid: entry.pid,
                            name: entry.name.clone(),
                            memory_bytes: entry.memory_bytes,
                        });
                    }
                }
            }
        }

        for bucket in matches.values_mut() {
            bucket.sort_by_key(|p| p.pid);
        }

        debug!(
            "Matched {} pattern(s) against {} processes: {} instance(s)",
            patterns.len(),
            entries.len(),
            matches.values().map(Vec::len).sum::<usize>()
        );
        Ok(matches)
    }
}

/// First pattern of each name, in order
pub fn dedup_by_name(patterns: &[TargetPattern]) -> Vec<&TargetPattern> {
    let mut seen = HashSet::new();
    patterns
        .iter()
        .filter(|p| seen.insert(p.name()))
        .collect()
}
