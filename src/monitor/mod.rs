//! Process-wide event-loop delay monitor
//!
//! A single sampler task repeatedly schedules a short sleep and measures how
//! late it wakes. Oversleep approximates scheduler delay the same way an
//! event-loop delay histogram does; the ratio of total oversleep to total
//! elapsed time stands in for loop utilization. Rooms read the published
//! snapshot; they never write.

use std::collections::VecDeque;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

/// Published metrics snapshot. All-zero until the sampler has run, or
/// forever when it could not start; zeros never trip the overload check.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopMetrics {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub utilization: f64,
}

static METRICS: OnceLock<RwLock<LoopMetrics>> = OnceLock::new();
static SAMPLER: OnceLock<bool> = OnceLock::new();

/// Intended sleep per sample
const SAMPLE_SLEEP: Duration = Duration::from_millis(10);
/// Samples kept in the sliding window (~5 s)
const WINDOW_SIZE: usize = 512;
/// Publish a fresh snapshot every this many samples
const PUBLISH_EVERY: u64 = 50;

/// Start the sampler if it is not already running. Safe to call from every
/// room start; only the first call does anything. Outside a runtime the
/// monitor stays disabled and metrics stay zero.
pub fn start() {
    SAMPLER.get_or_init(|| match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(sample_loop());
            true
        }
        Err(error) => {
            warn!(%error, "event-loop monitor unavailable, pressure control disabled");
            false
        }
    });
}

/// Latest published snapshot
pub fn metrics() -> LoopMetrics {
    METRICS
        .get()
        .and_then(|lock| lock.read().ok().map(|guard| *guard))
        .unwrap_or_default()
}

async fn sample_loop() {
    // (delay, actual elapsed) per sample, both in milliseconds
    let mut window: VecDeque<(f64, f64)> = VecDeque::with_capacity(WINDOW_SIZE);
    let mut iterations: u64 = 0;

    loop {
        let started = Instant::now();
        tokio::time::sleep(SAMPLE_SLEEP).await;
        let actual = started.elapsed();
        let delay = actual.saturating_sub(SAMPLE_SLEEP);

        if window.len() == WINDOW_SIZE {
            window.pop_front();
        }
        window.push_back((delay.as_secs_f64() * 1e3, actual.as_secs_f64() * 1e3));

        iterations += 1;
        if iterations % PUBLISH_EVERY == 0 {
            publish(&window);
        }
    }
}

fn publish(window: &VecDeque<(f64, f64)>) {
    if window.is_empty() {
        return;
    }

    let mut delays: Vec<f64> = window.iter().map(|(delay, _)| *delay).collect();
    delays.sort_unstable_by(|a, b| a.total_cmp(b));

    let total_delay: f64 = window.iter().map(|(delay, _)| *delay).sum();
    let total_elapsed: f64 = window.iter().map(|(_, actual)| *actual).sum();

    let snapshot = LoopMetrics {
        p50_ms: percentile(&delays, 0.50),
        p95_ms: percentile(&delays, 0.95),
        p99_ms: percentile(&delays, 0.99),
        utilization: if total_elapsed > 0.0 {
            (total_delay / total_elapsed).clamp(0.0, 1.0)
        } else {
            0.0
        },
    };

    let lock = METRICS.get_or_init(|| RwLock::new(LoopMetrics::default()));
    if let Ok(mut guard) = lock.write() {
        *guard = snapshot;
    }
}

/// Nearest-rank percentile over an ascending-sorted slice
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[index.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_over_sorted_samples() {
        let samples: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&samples, 0.50), 50.0);
        assert_eq!(percentile(&samples, 0.95), 95.0);
        assert_eq!(percentile(&samples, 0.99), 99.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn metrics_default_to_zero_before_sampling() {
        let metrics = metrics();
        assert_eq!(metrics.p95_ms, 0.0);
        assert_eq!(metrics.utilization, 0.0);
    }
}
