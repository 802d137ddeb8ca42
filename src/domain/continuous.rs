use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::clock::SharedClock;
use crate::domain::fusion::FusionRegistry;
use crate::domain::optimizer::{OptimizationCache, Optimizer};
use crate::domain::trace::TraceRegistry;
use crate::domain::unit::UnitRegistry;

#[derive(Debug, Clone)]
pub struct ContinuousConfig {
    /// Wall-clock tick of the background loop.
    pub tick_ms: u64,

    /// Invocation-count trigger interval bounds.
    pub initial_interval: u64,
    pub normal_interval: u64,
    pub min_interval: u64,

    /// Stable runs required before the interval doubles.
    pub stable_streak_bound: u32,

    /// Samples per side of the drift comparison window.
    pub drift_window: usize,

    /// Relative mean change that counts as drift.
    pub drift_threshold: f64,

    /// Retained run records.
    pub history_limit: usize,
}

impl Default for ContinuousConfig {
    fn default() -> Self {
        ContinuousConfig {
            tick_ms: 500,
            initial_interval: 100,
            normal_interval: 1_000,
            min_interval: 50,
            stable_streak_bound: 3,
            drift_window: 10,
            drift_threshold: 0.30,
            history_limit: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    IntervalReached,
    DriftDetected,
    Forced,
}

/// One retained optimization run, for reporting.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub at_ms: i64,
    pub fusion_id: String,
    pub reason: TriggerReason,
    pub changed: bool,
    pub setup_key: String,
    pub estimated_savings_ms: f64,
}

/// Adaptive invocation-count trigger.
///
/// The interval starts at `initial`, never drops below `min` and doubles
/// up to `normal` after every streak of stable runs, so a workload that
/// stopped changing is re-examined less often.
#[derive(Debug, Clone)]
pub struct AdaptiveTrigger {
    initial_interval: u64,
    normal_interval: u64,
    min_interval: u64,
    stable_streak_bound: u32,

    current_interval: u64,
    invocations_since_run: u64,
    stable_streak: u32,
}

impl AdaptiveTrigger {
    pub fn new(config: &ContinuousConfig) -> AdaptiveTrigger {
        let current = config.initial_interval.clamp(config.min_interval, config.normal_interval);
        AdaptiveTrigger {
            initial_interval: config.initial_interval,
            normal_interval: config.normal_interval,
            min_interval: config.min_interval,
            stable_streak_bound: config.stable_streak_bound.max(1),
            current_interval: current,
            invocations_since_run: 0,
            stable_streak: 0,
        }
    }

    pub fn record_invocation(&mut self) {
        self.invocations_since_run += 1;
    }

    pub fn interval(&self) -> u64 {
        self.current_interval
    }

    pub fn counter_reached(&self) -> bool {
        self.invocations_since_run >= self.current_interval
    }

    pub fn on_run_started(&mut self) {
        self.invocations_since_run = 0;
    }

    /// Feeds back whether the run changed the active configuration.
    pub fn on_run_result(&mut self, changed: bool) {
        if changed {
            self.stable_streak = 0;
            self.current_interval = self.initial_interval.clamp(self.min_interval, self.normal_interval);
            return;
        }
        self.stable_streak += 1;
        if self.stable_streak >= self.stable_streak_bound {
            let doubled = (self.current_interval * 2).min(self.normal_interval);
            log::debug!("Stable streak of {} reached; trigger interval {} -> {}", self.stable_streak, self.current_interval, doubled);
            self.current_interval = doubled.max(self.min_interval);
            self.stable_streak = 0;
        }
    }
}

/// Windowed latency drift detector: compares the mean of the most recent N
/// samples against the mean of the N before them.
#[derive(Debug, Clone)]
pub struct DriftDetector {
    samples: VecDeque<f64>,
    window: usize,
    threshold: f64,
}

impl DriftDetector {
    pub fn new(window: usize, threshold: f64) -> DriftDetector {
        DriftDetector { samples: VecDeque::with_capacity(2 * window.max(1)), window: window.max(1), threshold }
    }

    pub fn record(&mut self, latency_ms: f64) {
        self.samples.push_back(latency_ms);
        while self.samples.len() > 2 * self.window {
            self.samples.pop_front();
        }
    }

    pub fn drift_detected(&self) -> bool {
        if self.samples.len() < 2 * self.window {
            return false;
        }
        let recent: f64 = self.samples.iter().rev().take(self.window).sum::<f64>() / self.window as f64;
        let previous: f64 = self.samples.iter().rev().skip(self.window).take(self.window).sum::<f64>() / self.window as f64;
        if previous <= 0.0 {
            return false;
        }
        ((recent - previous) / previous).abs() > self.threshold
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

#[derive(Debug)]
struct ControlState {
    trigger: AdaptiveTrigger,
    drift: DriftDetector,
    history: VecDeque<RunRecord>,
}

/// Background control loop deciding when to re-run the optimization
/// phases (CSP-1-style sampling: count gate, drift gate, stability-based
/// interval stretching).
///
/// Optimization failures never escape to the invocation path; the previous
/// configuration simply stays active.
#[derive(Debug)]
pub struct ContinuousOptimizer {
    config: ContinuousConfig,
    clock: SharedClock,
    optimizer: Arc<Optimizer>,
    units: Arc<UnitRegistry>,
    fusions: Arc<FusionRegistry>,
    traces: Arc<TraceRegistry>,
    cache: Arc<OptimizationCache>,
    state: Mutex<ControlState>,
}

impl ContinuousOptimizer {
    pub fn new(
        config: ContinuousConfig,
        clock: SharedClock,
        optimizer: Arc<Optimizer>,
        units: Arc<UnitRegistry>,
        fusions: Arc<FusionRegistry>,
        traces: Arc<TraceRegistry>,
        cache: Arc<OptimizationCache>,
    ) -> ContinuousOptimizer {
        let state = ControlState {
            trigger: AdaptiveTrigger::new(&config),
            drift: DriftDetector::new(config.drift_window, config.drift_threshold),
            history: VecDeque::with_capacity(config.history_limit),
        };
        ContinuousOptimizer { config, clock, optimizer, units, fusions, traces, cache, state: Mutex::new(state) }
    }

    /// Called by the runtime after every completed invocation.
    pub fn record_invocation(&self, latency_ms: f64) {
        let mut state = self.state.lock().expect("continuous optimizer state poisoned");
        state.trigger.record_invocation();
        state.drift.record(latency_ms);
    }

    pub fn current_interval(&self) -> u64 {
        self.state.lock().expect("continuous optimizer state poisoned").trigger.interval()
    }

    pub fn history(&self) -> Vec<RunRecord> {
        self.state.lock().expect("continuous optimizer state poisoned").history.iter().cloned().collect()
    }

    /// Gate check performed on every tick.
    fn pending_trigger(&self) -> Option<TriggerReason> {
        let state = self.state.lock().expect("continuous optimizer state poisoned");
        if state.drift.drift_detected() {
            Some(TriggerReason::DriftDetected)
        } else if state.trigger.counter_reached() {
            Some(TriggerReason::IntervalReached)
        } else {
            None
        }
    }

    /// Manual trigger bypassing the counter and drift gates.
    pub fn force(&self, fusion_id: &str) -> Option<RunRecord> {
        self.run_for_fusion(fusion_id, TriggerReason::Forced)
    }

    /// Runs the phases for every registered fusion.
    fn run_all(&self, reason: TriggerReason) {
        {
            let mut state = self.state.lock().expect("continuous optimizer state poisoned");
            state.trigger.on_run_started();
            if reason == TriggerReason::DriftDetected {
                state.drift.reset();
            }
        }
        for fusion_id in self.fusions.ids() {
            self.run_for_fusion(&fusion_id, reason);
        }
    }

    fn run_for_fusion(&self, fusion_id: &str, reason: TriggerReason) -> Option<RunRecord> {
        let fusion = match self.fusions.get(fusion_id) {
            Ok(fusion) => fusion,
            Err(e) => {
                log::warn!("Continuous optimizer skipping '{}': {}", fusion_id, e);
                return None;
            }
        };

        // Snapshots only; the optimizer never sees a registry lock.
        let traces = self.traces.for_fusion(fusion_id);
        let units: Vec<_> = fusion.chain.iter().filter_map(|id| self.units.get(id).ok()).collect();
        let previous = self.cache.get(fusion_id);

        let result = self.optimizer.optimize(&fusion, &traces, &units);
        if result.is_noop && previous.is_some() {
            log::debug!("Run for '{}' produced no-op; retaining previous configuration", fusion_id);
            return None;
        }

        let changed = previous.as_ref().map(|p| p.setup_key != result.setup_key).unwrap_or(true);
        let estimated_savings_ms = previous
            .as_ref()
            .filter(|_| changed)
            .map(|p| p.score.estimated_latency_ms - result.score.estimated_latency_ms)
            .unwrap_or(0.0);

        if changed {
            let from = previous.as_ref().map(|p| p.setup_key.clone()).unwrap_or_else(|| "<none>".to_string());
            log::info!(
                "Fusion '{}' reconfigured: {} -> {} (estimated savings {:.1} ms)",
                fusion_id,
                from,
                result.setup_key,
                estimated_savings_ms
            );
            // Adopt the new memory configuration.
            for group in &result.groups {
                if let Some(&memory_mb) = result.memory_by_group.get(&group.key()) {
                    for member in &group.members {
                        if let Err(e) = self.units.set_memory(member, memory_mb) {
                            log::warn!("Could not apply memory for unit '{}': {}", member, e);
                        }
                    }
                }
            }
        } else {
            log::debug!("Fusion '{}' already optimal (setup {})", fusion_id, result.setup_key);
        }

        let record = RunRecord {
            at_ms: self.clock.now_ms(),
            fusion_id: fusion_id.to_string(),
            reason,
            changed,
            setup_key: result.setup_key.clone(),
            estimated_savings_ms,
        };
        self.cache.put(result);

        let mut state = self.state.lock().expect("continuous optimizer state poisoned");
        state.trigger.on_run_result(changed);
        state.history.push_back(record.clone());
        while state.history.len() > self.config.history_limit {
            state.history.pop_front();
        }
        Some(record)
    }

    /// Spawns the background loop. Abort the returned handle to stop it.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let tick = Duration::from_millis(self.config.tick_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Some(reason) = self.pending_trigger() {
                    log::debug!("Continuous optimization triggered: {:?}", reason);
                    self.run_all(reason);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ContinuousConfig {
        ContinuousConfig { initial_interval: 100, normal_interval: 1_000, min_interval: 50, stable_streak_bound: 3, ..ContinuousConfig::default() }
    }

    #[test]
    fn interval_doubles_after_stable_streaks_and_caps_at_normal() {
        let mut trigger = AdaptiveTrigger::new(&config());
        assert_eq!(trigger.interval(), 100);

        for _ in 0..3 {
            trigger.on_run_result(false);
        }
        assert_eq!(trigger.interval(), 200);

        for _ in 0..3 {
            trigger.on_run_result(false);
        }
        assert_eq!(trigger.interval(), 400);

        for _ in 0..30 {
            trigger.on_run_result(false);
        }
        assert_eq!(trigger.interval(), 1_000);
    }

    #[test]
    fn changed_result_resets_streak_and_interval() {
        let mut trigger = AdaptiveTrigger::new(&config());
        for _ in 0..3 {
            trigger.on_run_result(false);
        }
        assert_eq!(trigger.interval(), 200);

        trigger.on_run_result(true);
        assert_eq!(trigger.interval(), 100);

        // Two stables then a change: the streak never reaches the bound.
        trigger.on_run_result(false);
        trigger.on_run_result(false);
        trigger.on_run_result(true);
        assert_eq!(trigger.interval(), 100);
    }

    #[test]
    fn counter_gate_fires_at_interval() {
        let mut trigger = AdaptiveTrigger::new(&config());
        for _ in 0..99 {
            trigger.record_invocation();
        }
        assert!(!trigger.counter_reached());
        trigger.record_invocation();
        assert!(trigger.counter_reached());

        trigger.on_run_started();
        assert!(!trigger.counter_reached());
    }

    #[test]
    fn drift_detector_flags_significant_change() {
        let mut drift = DriftDetector::new(5, 0.30);
        for _ in 0..5 {
            drift.record(100.0);
        }
        assert!(!drift.drift_detected());

        // Second window 50% above the first.
        for _ in 0..5 {
            drift.record(150.0);
        }
        assert!(drift.drift_detected());

        drift.reset();
        assert!(!drift.drift_detected());
    }

    #[test]
    fn drift_detector_ignores_small_changes() {
        let mut drift = DriftDetector::new(5, 0.30);
        for _ in 0..5 {
            drift.record(100.0);
        }
        for _ in 0..5 {
            drift.record(110.0);
        }
        assert!(!drift.drift_detected());
    }
}
