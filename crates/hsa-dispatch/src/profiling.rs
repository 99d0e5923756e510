#[cfg(feature = "profiler")]
use std::collections::BTreeMap;
#[cfg(feature = "profiler")]
use std::sync::Mutex;
#[cfg(feature = "profiler")]
use std::time::{Duration, Instant};

#[cfg(feature = "profiler")]
use serde::Serialize;

#[cfg(feature = "profiler")]
#[derive(Default)]
struct Tables {
    cache_events: BTreeMap<&'static str, u64>,
    scopes: BTreeMap<&'static str, ScopeStat>,
}

#[cfg(feature = "profiler")]
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ScopeStat {
    pub calls: u64,
    pub total_ns: u128,
}

#[cfg(feature = "profiler")]
static TABLES: Mutex<Option<Tables>> = Mutex::new(None);

#[cfg(feature = "profiler")]
fn with_tables<R>(f: impl FnOnce(&mut Tables) -> R) -> R {
    let mut guard = TABLES.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(guard.get_or_insert_with(Tables::default))
}

#[inline(always)]
pub fn cache_event(name: &'static str) {
    #[cfg(feature = "profiler")]
    {
        with_tables(|tables| *tables.cache_events.entry(name).or_insert(0) += 1);
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
    }
}

/// Times the enclosing scope under `name` while alive.
pub struct ScopeGuard {
    #[cfg(feature = "profiler")]
    name: &'static str,
    #[cfg(feature = "profiler")]
    start: Instant,
}

impl ScopeGuard {
    #[inline(always)]
    fn new(name: &'static str) -> Self {
        #[cfg(feature = "profiler")]
        {
            Self {
                name,
                start: Instant::now(),
            }
        }
        #[cfg(not(feature = "profiler"))]
        {
            let _ = name;
            Self {}
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        #[cfg(feature = "profiler")]
        {
            let elapsed: Duration = self.start.elapsed();
            with_tables(|tables| {
                let stat = tables.scopes.entry(self.name).or_default();
                stat.calls = stat.calls.saturating_add(1);
                stat.total_ns = stat.total_ns.saturating_add(elapsed.as_nanos());
            });
        }
    }
}

#[inline(always)]
pub fn compile_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(name)
}

#[inline(always)]
pub fn dispatch_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(name)
}

#[cfg(feature = "profiler")]
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileReport {
    pub cache_events: BTreeMap<String, u64>,
    pub scopes: BTreeMap<String, ScopeStat>,
}

/// Drains the recorded counters. Returns `None` when nothing was recorded.
#[cfg(feature = "profiler")]
pub fn take_report() -> Option<ProfileReport> {
    let tables = TABLES
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()?;
    Some(ProfileReport {
        cache_events: tables
            .cache_events
            .into_iter()
            .map(|(name, count)| (name.to_string(), count))
            .collect(),
        scopes: tables
            .scopes
            .into_iter()
            .map(|(name, stat)| (name.to_string(), stat))
            .collect(),
    })
}

#[cfg(feature = "profiler")]
pub fn take_report_json() -> Option<String> {
    let report = take_report()?;
    serde_json::to_string_pretty(&report).ok()
}

#[cfg(all(test, feature = "profiler"))]
mod tests {
    use super::*;

    #[test]
    fn cache_events_and_scopes_are_reported() {
        cache_event("hsa.test.event");
        cache_event("hsa.test.event");
        {
            let _scope = compile_scope("hsa.test.scope");
        }
        let report = take_report().expect("events were recorded");
        assert!(report.cache_events["hsa.test.event"] >= 2);
        assert!(report.scopes["hsa.test.scope"].calls >= 1);
    }
}
