//! Load testing.
//!
//! Each load scenario runs `callers` concurrent synthetic clients against the
//! shared protocol client. Latencies are collected unsorted and summarised
//! with nearest-rank percentiles. While the scenarios run, a sampler records
//! the server's resident memory for leak detection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde_json::Value;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::config::{default_load_scenarios, LoadScenario, PerformanceConfig, TestConfig};
use crate::mcp::{ProtocolClient, ServerSession};
use crate::results::{LatencyStats, LoadTestMetric, MemoryCheck, MemoryStats, PerformanceTestResult};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Fewest second-half samples needed to call a trend a leak.
const LEAK_MIN_SAMPLES: usize = 4;

/// Nearest-rank percentile of ascending `sorted` samples.
///
/// `p(q) = sorted[ceil(q/100 · n) − 1]`, clamped to the sample range. An
/// empty slice yields `0.0`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = (q * n as f64 / 100.0).ceil().max(0.0) as usize;
    sorted[rank.saturating_sub(1).min(n - 1)]
}

/// Summarises latency samples.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn latency_stats(samples: &[Duration]) -> LatencyStats {
    if samples.is_empty() {
        return LatencyStats::default();
    }
    let mut ms: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
    ms.sort_by(f64::total_cmp);

    LatencyStats {
        samples: ms.len(),
        avg_ms: ms.iter().sum::<f64>() / ms.len() as f64,
        min_ms: ms[0],
        median_ms: percentile(&ms, 50.0),
        p95_ms: percentile(&ms, 95.0),
        p99_ms: percentile(&ms, 99.0),
        max_ms: ms[ms.len() - 1],
    }
}

/// Least-squares slope (bytes/second) over the second half of `samples`, and
/// whether that half looks like a leak.
///
/// A leak needs at least [`LEAK_MIN_SAMPLES`] points, no decrease between
/// consecutive points, at least one increase, and a slope above `threshold`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn detect_leak(samples: &[(f64, u64)], threshold: f64) -> (f64, bool) {
    let tail = &samples[samples.len() / 2..];
    if tail.len() < 2 {
        return (0.0, false);
    }

    let n = tail.len() as f64;
    let mean_t = tail.iter().map(|(t, _)| t).sum::<f64>() / n;
    let mean_m = tail.iter().map(|(_, m)| *m as f64).sum::<f64>() / n;
    let (mut num, mut den) = (0.0, 0.0);
    for (t, m) in tail {
        num += (t - mean_t) * (*m as f64 - mean_m);
        den += (t - mean_t).powi(2);
    }
    let slope = if den > 0.0 { num / den } else { 0.0 };

    let non_decreasing = tail.windows(2).all(|w| w[1].1 >= w[0].1);
    let grows = tail.windows(2).any(|w| w[1].1 > w[0].1);
    let leak = tail.len() >= LEAK_MIN_SAMPLES && non_decreasing && grows && slope > threshold;
    (slope, leak)
}

/// Summarises RSS samples.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn memory_stats(samples: &[(f64, u64)], threshold: f64) -> MemoryStats {
    if samples.is_empty() {
        return MemoryStats::default();
    }
    let (slope, leak_detected) = detect_leak(samples, threshold);
    let total: f64 = samples.iter().map(|(_, m)| *m as f64).sum();
    let peak = samples.iter().map(|(_, m)| *m).max().unwrap_or_default();
    MemoryStats {
        samples: samples.len(),
        avg_mb: total / samples.len() as f64 / BYTES_PER_MB,
        peak_mb: peak as f64 / BYTES_PER_MB,
        slope_bytes_per_sec: slope,
        leak_detected,
    }
}

/// Background RSS sampler for one process.
struct MemorySampler {
    stop: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<Vec<(f64, u64)>>,
}

impl MemorySampler {
    fn start(pid: u32, interval: Duration) -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let task = tokio::spawn(async move {
            let pid = Pid::from_u32(pid);
            let mut system = System::new();
            let started = Instant::now();
            let mut samples = Vec::new();
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        system.refresh_processes_specifics(
                            ProcessesToUpdate::Some(&[pid]),
                            true,
                            ProcessRefreshKind::nothing().with_memory(),
                        );
                        match system.process(pid) {
                            Some(process) => samples.push((started.elapsed().as_secs_f64(), process.memory())),
                            None => break,
                        }
                    }
                }
            }
            samples
        });
        Self { stop, task }
    }

    async fn finish(self) -> Vec<(f64, u64)> {
        let _ = self.stop.send(());
        self.task.await.unwrap_or_default()
    }
}

/// Load scenarios to run: the configured ones, else the built-in set.
#[must_use]
pub fn load_scenarios_for(config: &TestConfig) -> Vec<LoadScenario> {
    if config.performance.load_scenarios.is_empty() {
        default_load_scenarios(config.concurrency.max_concurrency)
    } else {
        config.performance.load_scenarios.clone()
    }
}

/// Runs every load scenario against a session.
pub async fn run(session: &ServerSession, cancel: &CancelSignal) -> PerformanceTestResult {
    let started = Instant::now();
    let config = session.config();
    let scenarios = load_scenarios_for(config);
    info!(server = %session.client().label(), scenarios = scenarios.len(), "Performance testing started");

    if let Err(e) = session.ready(cancel).await {
        warn!(server = %session.client().label(), error = %e, "Performance testing without a usable session");
        let reason = format!("session not ready: {e}");
        return PerformanceTestResult {
            success: false,
            latency: LatencyStats::default(),
            memory: None,
            memory_check: None,
            throughput_per_sec: 0.0,
            scenarios: scenarios
                .iter()
                .map(|s| (s.name.clone(), not_run(s, &reason)))
                .collect(),
            duration: started.elapsed(),
        };
    }

    let sampler = session
        .client()
        .process_id()
        .map(|pid| MemorySampler::start(pid, config.performance.memory_sample_interval()));

    let mut metrics = IndexMap::new();
    let mut all_latencies = Vec::new();
    let mut successful_total = 0usize;
    let load_started = Instant::now();
    for scenario in &scenarios {
        if cancel.is_cancelled() {
            metrics.insert(scenario.name.clone(), not_run(scenario, "cancelled"));
            continue;
        }
        let (metric, latencies) = run_scenario(session.client(), config, scenario, cancel).await;
        successful_total += metric.successful_calls;
        all_latencies.extend(latencies);
        metrics.insert(scenario.name.clone(), metric);
    }
    let load_elapsed = load_started.elapsed();

    let samples = match sampler {
        Some(sampler) => sampler.finish().await,
        None => Vec::new(),
    };
    let memory = (!samples.is_empty()).then(|| {
        memory_stats(
            &samples,
            config.performance.leak_slope_threshold_bytes_per_sec,
        )
    });
    let memory_check = memory.map(|m| memory_check(&m, &config.performance));

    let success = metrics.values().all(|m| m.success)
        && memory_check.as_ref().map_or(true, |c| c.success);
    let result = PerformanceTestResult {
        success,
        latency: latency_stats(&all_latencies),
        memory,
        memory_check,
        throughput_per_sec: per_second(successful_total, load_elapsed),
        scenarios: metrics,
        duration: started.elapsed(),
    };
    info!(
        server = %session.client().label(),
        success = result.success,
        p95_ms = result.latency.p95_ms,
        throughput = result.throughput_per_sec,
        "Performance testing finished"
    );
    result
}

fn memory_check(memory: &MemoryStats, thresholds: &PerformanceConfig) -> MemoryCheck {
    let mut failures = Vec::new();
    #[allow(clippy::cast_precision_loss)]
    let limit = thresholds.max_memory_mb as f64;
    if memory.peak_mb > limit {
        failures.push(format!(
            "peak memory {:.1}MB exceeds {limit:.0}MB",
            memory.peak_mb
        ));
    }
    if memory.leak_detected {
        failures.push(format!(
            "memory grows steadily at {:.1}KiB/s",
            memory.slope_bytes_per_sec / 1024.0
        ));
    }
    MemoryCheck {
        success: failures.is_empty(),
        failures,
    }
}

#[allow(clippy::cast_precision_loss)]
fn per_second(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

fn not_run(scenario: &LoadScenario, reason: &str) -> LoadTestMetric {
    LoadTestMetric {
        scenario: scenario.name.clone(),
        method: scenario.method.clone(),
        callers: scenario.callers,
        total_calls: 0,
        successful_calls: 0,
        failed_calls: 0,
        failure_rate: 0.0,
        throughput_per_sec: 0.0,
        latency: LatencyStats::default(),
        success: false,
        failures: vec![reason.to_string()],
        duration: Duration::ZERO,
    }
}

/// What one synthetic caller observed.
#[derive(Default)]
struct CallerReport {
    latencies: Vec<Duration>,
    successes: usize,
    failures: usize,
    first_error: Option<String>,
}

async fn run_caller(
    client: Arc<ProtocolClient>,
    method: String,
    params: Value,
    iterations: usize,
    deadline: Option<Instant>,
    timeout: Duration,
    cancel: CancelSignal,
) -> CallerReport {
    let mut report = CallerReport::default();
    let mut issued = 0usize;
    loop {
        if iterations > 0 && issued >= iterations {
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) || cancel.is_cancelled() {
            break;
        }
        issued += 1;
        let started = Instant::now();
        let outcome = client
            .call_bounded(&method, Some(params.clone()), timeout, &cancel)
            .await;
        report.latencies.push(started.elapsed());
        match outcome {
            Ok(_) => report.successes += 1,
            Err(e) => {
                report.failures += 1;
                report.first_error.get_or_insert_with(|| e.to_string());
            }
        }
    }
    report
}

#[allow(clippy::cast_precision_loss)]
async fn run_scenario(
    client: &Arc<ProtocolClient>,
    config: &TestConfig,
    scenario: &LoadScenario,
    cancel: &CancelSignal,
) -> (LoadTestMetric, Vec<Duration>) {
    let callers = scenario
        .callers
        .clamp(1, config.concurrency.max_concurrency.max(1));
    debug!(scenario = %scenario.name, callers, method = %scenario.method, "Load scenario started");

    let started = Instant::now();
    let deadline =
        (scenario.duration_ms > 0).then(|| started + Duration::from_millis(scenario.duration_ms));

    let mut tasks = JoinSet::new();
    for _ in 0..callers {
        tasks.spawn(run_caller(
            Arc::clone(client),
            scenario.method.clone(),
            scenario.params.clone(),
            scenario.iterations,
            deadline,
            config.timeouts.call(),
            cancel.clone(),
        ));
    }

    let mut latencies = Vec::new();
    let (mut successes, mut failed) = (0usize, 0usize);
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => {
                latencies.extend(report.latencies);
                successes += report.successes;
                failed += report.failures;
                if first_error.is_none() {
                    first_error = report.first_error;
                }
            }
            Err(e) => warn!(scenario = %scenario.name, error = %e, "Load caller panicked"),
        }
    }
    let elapsed = started.elapsed();

    let total = successes + failed;
    let failure_rate = if total > 0 {
        failed as f64 / total as f64
    } else {
        0.0
    };
    let latency = latency_stats(&latencies);

    let thresholds = &config.performance;
    let mut failures = Vec::new();
    if total == 0 {
        failures.push("no calls completed".to_string());
    }
    if failure_rate > thresholds.max_failure_rate {
        failures.push(format!(
            "failure rate {:.1}% exceeds {:.1}%{}",
            failure_rate * 100.0,
            thresholds.max_failure_rate * 100.0,
            first_error.map(|e| format!(" (first error: {e})")).unwrap_or_default()
        ));
    }
    if latency.p95_ms > thresholds.max_response_time_ms as f64 {
        failures.push(format!(
            "p95 latency {:.1}ms exceeds {}ms",
            latency.p95_ms, thresholds.max_response_time_ms
        ));
    }

    let metric = LoadTestMetric {
        scenario: scenario.name.clone(),
        method: scenario.method.clone(),
        callers,
        total_calls: total,
        successful_calls: successes,
        failed_calls: failed,
        failure_rate,
        throughput_per_sec: per_second(successes, elapsed),
        latency,
        success: failures.is_empty(),
        failures,
        duration: elapsed,
    };
    debug!(
        scenario = %metric.scenario,
        calls = metric.total_calls,
        failure_rate = metric.failure_rate,
        p95_ms = metric.latency.p95_ms,
        "Load scenario finished"
    );
    (metric, latencies)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_rank_percentiles() {
        let samples: Vec<f64> = (1..=10).map(|n| f64::from(n) * 10.0).collect();
        assert!((percentile(&samples, 95.0) - 100.0).abs() < f64::EPSILON);
        assert!((percentile(&samples, 99.0) - 100.0).abs() < f64::EPSILON);
        assert!((percentile(&samples, 50.0) - 50.0).abs() < f64::EPSILON);
        assert!((percentile(&samples, 0.0) - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn percentile_edge_cases() {
        assert!(percentile(&[], 95.0).abs() < f64::EPSILON);
        assert!((percentile(&[7.0], 99.0) - 7.0).abs() < f64::EPSILON);
        assert!((percentile(&[7.0], 1.0) - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn latency_stats_from_unsorted_samples() {
        let samples: Vec<Duration> = [30u64, 10, 100, 20, 90, 40, 80, 50, 70, 60]
            .into_iter()
            .map(Duration::from_millis)
            .collect();
        let stats = latency_stats(&samples);
        assert_eq!(stats.samples, 10);
        assert!((stats.avg_ms - 55.0).abs() < 1e-9);
        assert!((stats.median_ms - 50.0).abs() < 1e-9);
        assert!((stats.p95_ms - 100.0).abs() < 1e-9);
        assert!((stats.min_ms - 10.0).abs() < 1e-9);
        assert!((stats.max_ms - 100.0).abs() < 1e-9);
    }

    #[test]
    fn steady_growth_is_a_leak() {
        let samples: Vec<(f64, u64)> = (0..10u32)
            .map(|i| (f64::from(i) * 0.1, 50_000_000 + u64::from(i) * 1_000_000))
            .collect();
        let (slope, leak) = detect_leak(&samples, 262_144.0);
        assert!(leak);
        assert!((slope - 10_000_000.0).abs() < 1.0);
    }

    #[test]
    fn flat_or_noisy_memory_is_not_a_leak() {
        let flat: Vec<(f64, u64)> = (0..10u32).map(|i| (f64::from(i), 50_000_000)).collect();
        assert!(!detect_leak(&flat, 0.0).1);

        let noisy: Vec<(f64, u64)> = (0..10u32)
            .map(|i| (f64::from(i), 50_000_000 + u64::from(i % 2) * 4_000_000 + u64::from(i) * 1_000_000))
            .collect();
        assert!(!detect_leak(&noisy, 0.0).1);
    }

    #[test]
    fn too_few_samples_never_leak() {
        let samples = [(0.0, 1), (0.1, 2_000_000), (0.2, 4_000_000), (0.3, 8_000_000)];
        assert!(!detect_leak(&samples, 0.0).1);
    }

    #[test]
    fn memory_check_flags_peak() {
        let memory = MemoryStats {
            samples: 5,
            avg_mb: 600.0,
            peak_mb: 700.0,
            slope_bytes_per_sec: 0.0,
            leak_detected: false,
        };
        let check = memory_check(&memory, &PerformanceConfig::default());
        assert!(!check.success);
        assert!(check.failures[0].contains("700.0MB"));
    }
}
