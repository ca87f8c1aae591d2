//! Fixed-rate pump scheduler for Tether hosts.
//!
//! Links only surface data when someone drains them. A host drains its
//! transport on every pump, and the [`PumpScheduler`] decides when those
//! pumps happen: at a fixed rate while at least one connection is live,
//! and never while the host is idle.
//!
//! # Idle by default
//!
//! A fresh scheduler is idle and [`PumpScheduler::wait_for_pump`] pends
//! forever. The host calls [`wake`](PumpScheduler::wake) when the first
//! connection comes up and [`idle`](PumpScheduler::idle) when the last one
//! goes away. While idle, the host waits on the link's activity signal
//! instead.
//!
//! # Integration
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         Some(cmd) = cmd_rx.recv() => { /* handle commands */ }
//!         _ = pump.wait_for_pump() => {
//!             let drained = transport.pump();
//!             pump.record_pump_end(drained);
//!         }
//!     }
//! }
//! ```

use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant as TokioInstant};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the pump scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Pumps per second while live.
    pub rate_hz: u32,
    /// Fraction of the pump period (0.0–1.0) a single drain may take before
    /// a warning is logged.
    pub budget_warn_threshold: f64,
    /// Random delay (0–max µs) added to the first pump after each wake, so
    /// hosts started together do not drain in lockstep.
    pub initial_jitter_us: u64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            rate_hz: 60,
            budget_warn_threshold: 0.80,
            initial_jitter_us: 1_000,
        }
    }
}

impl PumpConfig {
    /// Fastest supported pump rate.
    pub const MAX_RATE_HZ: u32 = 1_000;

    /// Config with the given rate and default everything else.
    pub fn with_rate(rate_hz: u32) -> Self {
        Self {
            rate_hz,
            ..Default::default()
        }
    }

    /// Clamps out-of-range values.
    ///
    /// - `rate_hz` is forced into `1..=MAX_RATE_HZ`
    /// - `budget_warn_threshold` is clamped to `0.0..=1.0`
    pub fn validated(mut self) -> Self {
        if self.rate_hz == 0 {
            warn!("rate_hz of 0 would never pump; using 1");
            self.rate_hz = 1;
        } else if self.rate_hz > Self::MAX_RATE_HZ {
            warn!(
                rate = self.rate_hz,
                max = Self::MAX_RATE_HZ,
                "rate_hz exceeds maximum, clamping"
            );
            self.rate_hz = Self::MAX_RATE_HZ;
        }
        self.budget_warn_threshold = self.budget_warn_threshold.clamp(0.0, 1.0);
        self
    }

    /// Time between pumps.
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz.max(1) as f64)
    }
}

// ---------------------------------------------------------------------------
// Pump info
// ---------------------------------------------------------------------------

/// Returned by [`PumpScheduler::wait_for_pump`] when a pump is due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpInfo {
    /// Monotonic pump number, starting at 1.
    pub pump: u64,
    /// The wakeup came late by more than a tenth of the period.
    pub overrun: bool,
    /// Whole periods skipped because of the overrun.
    pub pumps_skipped: u64,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Running totals, updated by [`PumpScheduler::record_pump_end`].
#[derive(Debug, Clone, Default)]
pub struct PumpMetrics {
    pub total_pumps: u64,
    /// Link events drained across all pumps.
    pub total_events: u64,
    pub total_overruns: u64,
    pub total_skipped: u64,
    /// Exponential moving average of drain time (α = 0.1).
    pub avg_pump_time: Duration,
    pub max_pump_time: Duration,
    /// Last drain time as a fraction of the period.
    pub budget_utilization: f64,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Paces the transport pump for one host.
pub struct PumpScheduler {
    config: PumpConfig,
    period: Duration,
    pump_count: u64,
    next_pump: Option<TokioInstant>,
    pump_start: Option<Instant>,
    jittered: bool,
    metrics: PumpMetrics,
}

impl PumpScheduler {
    /// Creates an idle scheduler.
    pub fn new(config: PumpConfig) -> Self {
        let config = config.validated();
        let period = config.period();
        debug!(
            rate_hz = config.rate_hz,
            period_ms = period.as_secs_f64() * 1000.0,
            "pump scheduler created"
        );
        Self {
            config,
            period,
            pump_count: 0,
            next_pump: None,
            pump_start: None,
            jittered: false,
            metrics: PumpMetrics::default(),
        }
    }

    pub fn with_rate(rate_hz: u32) -> Self {
        Self::new(PumpConfig::with_rate(rate_hz))
    }

    /// Starts periodic pumping. No-op if already awake.
    ///
    /// The first pump after the very first wake is delayed by a random
    /// jitter of up to `initial_jitter_us`.
    pub fn wake(&mut self) {
        if self.next_pump.is_some() {
            return;
        }
        let mut first = TokioInstant::now() + self.period;
        if !self.jittered {
            self.jittered = true;
            if self.config.initial_jitter_us > 0 {
                let us = rand::rng().random_range(0..self.config.initial_jitter_us);
                first += Duration::from_micros(us);
            }
        }
        self.next_pump = Some(first);
        debug!(pump = self.pump_count, "pump scheduler awake");
    }

    /// Stops periodic pumping. No-op if already idle.
    pub fn idle(&mut self) {
        if self.next_pump.take().is_some() {
            self.pump_start = None;
            debug!(pump = self.pump_count, "pump scheduler idle");
        }
    }

    pub fn is_idle(&self) -> bool {
        self.next_pump.is_none()
    }

    /// Waits until the next pump is due.
    ///
    /// While idle this future never resolves; inside `tokio::select!` the
    /// other branches keep running.
    pub async fn wait_for_pump(&mut self) -> PumpInfo {
        let Some(next) = self.next_pump else {
            std::future::pending::<()>().await;
            unreachable!()
        };

        time::sleep_until(next).await;

        let now = TokioInstant::now();
        self.pump_count += 1;
        self.pump_start = Some(Instant::now());

        let late_by = now.saturating_duration_since(next);
        let overrun = late_by > self.period / 10;
        let mut pumps_skipped = 0;
        if overrun {
            pumps_skipped =
                (late_by.as_nanos() / self.period.as_nanos().max(1)) as u64;
            if pumps_skipped > 0 {
                warn!(
                    pump = self.pump_count,
                    skipped = pumps_skipped,
                    late_ms = late_by.as_secs_f64() * 1000.0,
                    "pump overrun, skipping ahead"
                );
            }
            self.metrics.total_overruns += 1;
        }
        // Always schedule from now, never from the missed deadline.
        self.next_pump = Some(now + self.period);
        self.metrics.total_skipped += pumps_skipped;
        self.metrics.total_pumps += 1;

        trace!(pump = self.pump_count, overrun, "pump due");

        PumpInfo {
            pump: self.pump_count,
            overrun,
            pumps_skipped,
        }
    }

    /// Records that the drain for the current pump finished, having
    /// processed `drained` link events.
    pub fn record_pump_end(&mut self, drained: usize) {
        self.metrics.total_events += drained as u64;
        let Some(start) = self.pump_start.take() else {
            return;
        };
        let elapsed = start.elapsed();

        let utilization = elapsed.as_secs_f64() / self.period.as_secs_f64();
        self.metrics.budget_utilization = utilization;
        if utilization >= self.config.budget_warn_threshold {
            warn!(
                pump = self.pump_count,
                drained,
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                period_ms = self.period.as_secs_f64() * 1000.0,
                "pump drain approaching period"
            );
        }

        if elapsed > self.metrics.max_pump_time {
            self.metrics.max_pump_time = elapsed;
        }
        let alpha = 0.1;
        let prev = self.metrics.avg_pump_time.as_secs_f64();
        self.metrics.avg_pump_time = Duration::from_secs_f64(
            prev * (1.0 - alpha) + elapsed.as_secs_f64() * alpha,
        );
    }

    pub fn pump_count(&self) -> u64 {
        self.pump_count
    }

    pub fn metrics(&self) -> &PumpMetrics {
        &self.metrics
    }

    pub fn rate_hz(&self) -> u32 {
        self.config.rate_hz
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}
