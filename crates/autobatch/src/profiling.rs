//! Process-wide profiling registry for scheduling and kernel activity.
//!
//! Profiling is off by default. When enabled, the graph records named counters (plan cache
//! hits, fallback executions) and timed scopes (planning, batched kernels) that can be
//! snapshotted into a serialisable [`ProfileReport`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::Serialize;

static ENABLED: AtomicBool = AtomicBool::new(false);

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| Mutex::new(Registry::default()));

#[derive(Default)]
struct Registry {
    counters: BTreeMap<&'static str, u64>,
    scopes: BTreeMap<&'static str, ScopeTotals>,
}

#[derive(Default, Clone, Copy)]
struct ScopeTotals {
    calls: u64,
    total: Duration,
}

pub fn enable(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Increments a named counter by one.
pub fn cache_event(name: &'static str) {
    counter_add(name, 1);
}

pub fn counter_add(name: &'static str, delta: u64) {
    if !is_enabled() {
        return;
    }
    let mut registry = REGISTRY.lock().expect("profiling registry poisoned");
    *registry.counters.entry(name).or_insert(0) += delta;
}

/// Starts a timed scope that is recorded when the returned guard drops.
pub fn scope(name: &'static str) -> ScopeGuard {
    ScopeGuard {
        active: is_enabled().then(|| (name, Instant::now())),
    }
}

pub struct ScopeGuard {
    active: Option<(&'static str, Instant)>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some((name, start)) = self.active.take() {
            let elapsed = start.elapsed();
            let mut registry = REGISTRY.lock().expect("profiling registry poisoned");
            let totals = registry.scopes.entry(name).or_default();
            totals.calls += 1;
            totals.total += elapsed;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ScopeReport {
    pub calls: u64,
    pub total_ms: f64,
}

/// Snapshot of every counter and scope recorded since the last [`reset`].
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ProfileReport {
    pub counters: BTreeMap<String, u64>,
    pub scopes: BTreeMap<String, ScopeReport>,
}

impl ProfileReport {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub fn snapshot() -> ProfileReport {
    let registry = REGISTRY.lock().expect("profiling registry poisoned");
    ProfileReport {
        counters: registry
            .counters
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect(),
        scopes: registry
            .scopes
            .iter()
            .map(|(name, totals)| {
                (
                    name.to_string(),
                    ScopeReport {
                        calls: totals.calls,
                        total_ms: totals.total.as_secs_f64() * 1e3,
                    },
                )
            })
            .collect(),
    }
}

pub fn reset() {
    let mut registry = REGISTRY.lock().expect("profiling registry poisoned");
    registry.counters.clear();
    registry.scopes.clear();
}
