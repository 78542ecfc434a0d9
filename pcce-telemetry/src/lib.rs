//! Counters and latency samples kept in process so tests can assert on the
//! engine's instrumentation without an exporter. Only names, counts and
//! durations are recorded; never ciphertext or key material.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Instant, SystemTime},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(any(
    all(feature = "dev", feature = "test"),
    all(feature = "dev", feature = "prod"),
    all(feature = "test", feature = "prod")
))]
compile_error!("Only one of the `dev`, `test`, or `prod` features may be enabled for pcce-telemetry.");

#[cfg(feature = "dev")]
const DEFAULT_FLUSH_MS: u64 = 1_000;
#[cfg(feature = "test")]
const DEFAULT_FLUSH_MS: u64 = 500;
#[cfg(any(feature = "prod", not(any(feature = "dev", feature = "test"))))]
const DEFAULT_FLUSH_MS: u64 = 5_000;

pub mod names {
    pub const CKKS_ENCRYPT: &str = "ckks.encrypt";
    pub const CKKS_MULTIPLY: &str = "ckks.multiply";
    pub const CKKS_REFRESH: &str = "ckks.refresh";
    pub const AUDIT_ROUNDS: &str = "audit.rounds";
    pub const AUDIT_FAILURES: &str = "audit.failures";
    pub const PSI_RUNS: &str = "psi.runs";
    pub const COMPARE_RUNS: &str = "compare.runs";
    pub const PROOF_ISSUED: &str = "proof.issued";
    pub const PROOF_VERIFIED: &str = "proof.verified";
    pub const DELETION_CERTIFIED: &str = "deletion.certified";
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_MS
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryConfig {
    /// Label identifying the emitting component.
    #[serde(default = "default_component")]
    pub component: String,
    /// Flush cadence in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Global labels appended to every snapshot.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_component() -> String {
    "pcce-engine".into()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            component: default_component(),
            flush_interval_ms: default_flush_interval_ms(),
            labels: BTreeMap::new(),
        }
    }
}

impl TelemetryConfig {
    pub fn sample(component: &str) -> Self {
        Self {
            component: component.to_owned(),
            flush_interval_ms: default_flush_interval_ms(),
            labels: BTreeMap::from([("tenant".into(), "demo".into())]),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("counter overflow for metric {0}")]
    CounterOverflow(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub timestamp: SystemTime,
    pub component: String,
    pub labels: BTreeMap<String, String>,
    pub counters: BTreeMap<String, u64>,
    pub latencies_ms: BTreeMap<String, Vec<u64>>,
}

impl TelemetrySnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Default)]
struct TelemetryState {
    counters: BTreeMap<String, u64>,
    latencies_ms: BTreeMap<String, Vec<u64>>,
}

#[derive(Clone)]
pub struct TelemetryHandle {
    config: TelemetryConfig,
    state: Arc<Mutex<TelemetryState>>,
}

impl Default for TelemetryHandle {
    fn default() -> Self {
        Self::from_config(TelemetryConfig::default())
    }
}

impl TelemetryHandle {
    pub fn from_config(config: TelemetryConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(TelemetryState::default())),
        }
    }

    pub fn record_counter(&self, name: &str, delta: u64) -> Result<(), TelemetryError> {
        let mut guard = self.state.lock();
        let entry = guard.counters.entry(name.to_owned()).or_default();
        *entry = entry
            .checked_add(delta)
            .ok_or_else(|| TelemetryError::CounterOverflow(name.to_owned()))?;
        Ok(())
    }

    /// Counter increment for hot paths where overflow saturates silently.
    pub fn incr(&self, name: &str) {
        let mut guard = self.state.lock();
        let entry = guard.counters.entry(name.to_owned()).or_default();
        *entry = entry.saturating_add(1);
    }

    pub fn record_latency_ms(&self, name: &str, value: u64) {
        self.state
            .lock()
            .latencies_ms
            .entry(name.to_owned())
            .or_default()
            .push(value);
    }

    /// Records the time elapsed since `start` under `name`.
    pub fn record_elapsed(&self, name: &str, start: Instant) {
        let elapsed = start.elapsed().as_millis().min(u64::MAX as u128) as u64;
        self.record_latency_ms(name, elapsed);
    }

    /// Current counters without clearing them.
    pub fn peek_counter(&self, name: &str) -> u64 {
        self.state.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn flush(&self) -> TelemetrySnapshot {
        let mut guard = self.state.lock();
        TelemetrySnapshot {
            timestamp: SystemTime::now(),
            component: self.config.component.clone(),
            labels: self.config.labels.clone(),
            counters: std::mem::take(&mut guard.counters),
            latencies_ms: std::mem::take(&mut guard.latencies_ms),
        }
    }

    pub fn flush_interval(&self) -> u64 {
        self.config.flush_interval_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> TelemetryHandle {
        TelemetryHandle::from_config(TelemetryConfig::sample("engine-test"))
    }

    #[test]
    fn records_counters_and_latencies() {
        let handle = handle();
        handle.record_counter(names::PSI_RUNS, 1).unwrap();
        handle.incr(names::PSI_RUNS);
        handle.record_latency_ms(names::AUDIT_ROUNDS, 42);
        let snapshot = handle.flush();
        assert_eq!(snapshot.counter(names::PSI_RUNS), 2);
        assert_eq!(snapshot.latencies_ms[names::AUDIT_ROUNDS], vec![42]);
        assert_eq!(snapshot.component, "engine-test");
    }

    #[test]
    fn detects_counter_overflow() {
        let handle = handle();
        handle.record_counter(names::PROOF_ISSUED, u64::MAX).unwrap();
        let err = handle.record_counter(names::PROOF_ISSUED, 1).unwrap_err();
        assert_eq!(err, TelemetryError::CounterOverflow(names::PROOF_ISSUED.into()));
    }

    #[test]
    fn flush_clears_state_and_serializes() {
        let handle = handle();
        handle.incr(names::CKKS_ENCRYPT);
        let first = handle.flush();
        assert!(first.to_json().unwrap().contains("ckks.encrypt"));
        assert!(handle.flush().counters.is_empty());
    }
}
