use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

pub const DEFAULT_WINDOW: usize = 1000;

/// Sliding-window mean over the last `window` samples.
///
/// Thread-safe: `add` may be called concurrently from any number of workers.
/// Besides the windowed mean it keeps lifetime totals, so callers can also
/// read how many samples were ever recorded.
#[derive(Debug)]
pub struct RollingStatistic {
    window: usize,
    state: Mutex<RollingState>,
}

#[derive(Debug, Default)]
struct RollingState {
    samples: VecDeque<f64>,
    window_sum: f64,
    total_count: u64,
    total_sum: f64,
}

impl RollingStatistic {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            state: Mutex::new(RollingState {
                samples: VecDeque::with_capacity(window.min(DEFAULT_WINDOW)),
                ..RollingState::default()
            }),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Record a sample, evicting the oldest one once the window is full.
    pub fn add(&self, sample: f64) {
        let mut state = self.lock();
        if state.samples.len() == self.window
            && let Some(evicted) = state.samples.pop_front()
        {
            state.window_sum -= evicted;
        }
        state.samples.push_back(sample);
        state.window_sum += sample;
        state.total_count += 1;
        state.total_sum += sample;
    }

    /// Mean of the samples currently in the window, 0 when empty.
    pub fn mean(&self) -> f64 {
        let state = self.lock();
        if state.samples.is_empty() {
            return 0.0;
        }
        state.window_sum / state.samples.len() as f64
    }

    /// Number of samples currently in the window.
    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().samples.is_empty()
    }

    /// Number of samples recorded over the statistic's lifetime.
    pub fn count(&self) -> u64 {
        self.lock().total_count
    }

    /// Sum of all samples recorded over the statistic's lifetime.
    pub fn total(&self) -> f64 {
        self.lock().total_sum
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RollingState> {
        // A panic while holding the lock cannot leave the state torn:
        // every mutation above completes before the guard drops.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RollingStatistic {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

/// The three usage statistics every layer handle carries.
#[derive(Debug)]
pub struct LayerStatistics {
    pub invocations: RollingStatistic,
    pub execution_time_ms: RollingStatistic,
    pub errors: RollingStatistic,
}

impl LayerStatistics {
    pub fn new(window: usize) -> Self {
        Self {
            invocations: RollingStatistic::new(window),
            execution_time_ms: RollingStatistic::new(window),
            errors: RollingStatistic::new(window),
        }
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            invocation_count: self.invocations.count(),
            error_count: self.errors.count(),
            mean_execution_time_ms: self.execution_time_ms.mean(),
            execution_samples: self.execution_time_ms.count(),
        }
    }
}

impl Default for LayerStatistics {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

/// A point-in-time view of a layer's statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub invocation_count: u64,
    pub error_count: u64,
    pub mean_execution_time_ms: f64,
    pub execution_samples: u64,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn empty_mean_is_zero() {
        let stat = RollingStatistic::new(3);
        assert_eq!(stat.mean(), 0.0);
        assert!(stat.is_empty());
    }

    #[test]
    fn oldest_sample_is_evicted() {
        let stat = RollingStatistic::new(3);
        for sample in [1.0, 2.0, 3.0, 4.0] {
            stat.add(sample);
        }
        assert_eq!(stat.len(), 3);
        assert_eq!(stat.mean(), 3.0);
        assert_eq!(stat.count(), 4);
        assert_eq!(stat.total(), 10.0);
    }

    #[test]
    fn newest_sample_always_included() {
        let stat = RollingStatistic::new(1);
        stat.add(5.0);
        stat.add(9.0);
        assert_eq!(stat.mean(), 9.0);
    }

    #[test]
    fn zero_window_is_clamped() {
        let stat = RollingStatistic::new(0);
        assert_eq!(stat.window(), 1);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let stats = LayerStatistics::new(10);
        stats.invocations.add(1.0);
        stats.invocations.add(1.0);
        stats.execution_time_ms.add(4.0);
        stats.execution_time_ms.add(6.0);
        stats.errors.add(1.0);

        let snap = stats.snapshot();
        assert_eq!(snap.invocation_count, 2);
        assert_eq!(snap.error_count, 1);
        assert_eq!(snap.mean_execution_time_ms, 5.0);
        assert_eq!(snap.execution_samples, 2);
    }

    #[test]
    fn concurrent_adds() {
        let stat = Arc::new(RollingStatistic::new(100));
        let mut handles = vec![];

        for _ in 0..10 {
            let s = Arc::clone(&stat);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    s.add(1.0);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stat.count(), 1000);
        assert_eq!(stat.len(), 100);
        assert_eq!(stat.mean(), 1.0);
    }
}
