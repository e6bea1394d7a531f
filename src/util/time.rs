//! Time utilities for match simulation

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::time::{interval, Interval, MissedTickBehavior};

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Duration of one tick at `tps` ticks per second
pub fn tick_duration(tps: u32) -> Duration {
    Duration::from_micros(1_000_000 / tps.max(1) as u64)
}

/// Longest step a single tick may simulate, in tick periods
const MAX_TICK_STEPS: u32 = 4;

/// Seconds to simulate for `elapsed` wall time, capped at a few periods
pub fn clamp_dt(elapsed: Duration, period: Duration) -> f32 {
    elapsed.min(period * MAX_TICK_STEPS).as_secs_f32()
}

/// Fixed-rate ticker for a simulation loop.
///
/// Missed ticks are skipped rather than burst, so a slow tick never causes a
/// catch-up storm.
pub struct Ticker {
    interval: Interval,
    period: Duration,
    last: Instant,
}

impl Ticker {
    pub fn new(tps: u32) -> Self {
        let period = tick_duration(tps);
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            interval,
            period,
            last: Instant::now(),
        }
    }

    /// Wait for the next tick and return the time to simulate in seconds
    pub async fn tick(&mut self) -> f32 {
        self.interval.tick().await;
        let now = Instant::now();
        let dt = clamp_dt(now.duration_since(self.last), self.period);
        self.last = now;
        dt
    }
}

/// Rate gate for net sync, decoupled from the simulation rate
#[derive(Debug, Clone)]
pub struct SyncGate {
    period: Duration,
    last: Option<Instant>,
}

impl SyncGate {
    pub fn new(tps: u32) -> Self {
        Self {
            period: tick_duration(tps),
            last: None,
        }
    }

    /// True at most once per period. The schedule stays phase locked so the
    /// average rate matches `tps` even when the caller ticks unevenly.
    pub fn should_sync(&mut self, now: Instant) -> bool {
        let Some(last) = self.last else {
            self.last = Some(now);
            return true;
        };

        let next = last + self.period;
        if now < next {
            return false;
        }

        // after a long stall resync instead of bursting
        self.last = Some(if now.duration_since(next) >= self.period {
            now
        } else {
            next
        });
        true
    }
}

/// Tick timing collected over a reporting window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerfReport {
    pub ticks: u32,
    pub avg_ms: f64,
    pub max_ms: f64,
}

/// Accumulates tick durations and hands out a report once per period.
/// A zero period disables reporting.
#[derive(Debug)]
pub struct PerfLog {
    period: Option<Duration>,
    window_start: Instant,
    ticks: u32,
    total: Duration,
    max: Duration,
}

impl PerfLog {
    pub fn new(period_secs: u64) -> Self {
        Self {
            period: (period_secs > 0).then(|| Duration::from_secs(period_secs)),
            window_start: Instant::now(),
            ticks: 0,
            total: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.ticks += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
    }

    /// Report and reset if the window is over
    pub fn report(&mut self, now: Instant) -> Option<PerfReport> {
        let period = self.period?;
        if now.duration_since(self.window_start) < period || self.ticks == 0 {
            return None;
        }

        let report = PerfReport {
            ticks: self.ticks,
            avg_ms: self.total.as_secs_f64() * 1000.0 / self.ticks as f64,
            max_ms: self.max.as_secs_f64() * 1000.0,
        };
        self.window_start = now;
        self.ticks = 0;
        self.total = Duration::ZERO;
        self.max = Duration::ZERO;
        Some(report)
    }
}

/// A simple timer for measuring durations
#[derive(Debug, Clone)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_gate_bounds_rate() {
        let tps = 33;
        let mut gate = SyncGate::new(tps);
        let start = Instant::now();
        let window = Duration::from_secs(2);

        // simulate a 100 Hz tick loop
        let mut syncs = 0u32;
        let mut t = Duration::ZERO;
        while t <= window {
            if gate.should_sync(start + t) {
                syncs += 1;
            }
            t += Duration::from_millis(10);
        }

        assert!(syncs <= tps * 2 + 1, "synced {syncs} times");
        assert!(syncs >= tps * 2 * 9 / 10, "synced only {syncs} times");
    }

    #[test]
    fn test_perf_log_reports_once_per_window() {
        let mut perf = PerfLog::new(1);
        let start = Instant::now();
        perf.record(Duration::from_millis(2));
        perf.record(Duration::from_millis(4));
        assert!(perf.report(start).is_none());

        let report = perf.report(start + Duration::from_secs(2)).unwrap();
        assert_eq!(report.ticks, 2);
        assert!((report.avg_ms - 3.0).abs() < 1e-6);
        assert!((report.max_ms - 4.0).abs() < 1e-6);
        assert!(perf.report(start + Duration::from_secs(4)).is_none());
    }

    #[test]
    fn test_perf_log_disabled() {
        let mut perf = PerfLog::new(0);
        perf.record(Duration::from_millis(1));
        assert!(perf.report(Instant::now() + Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_tick_duration() {
        assert_eq!(tick_duration(100), Duration::from_millis(10));
        assert_eq!(tick_duration(0), Duration::from_secs(1));
    }

    #[test]
    fn test_stalled_tick_is_clamped() {
        let period = tick_duration(100);
        let normal = clamp_dt(Duration::from_millis(12), period);
        assert!((normal - 0.012).abs() < 1e-6);

        // a two second stall simulates at most four periods
        let stalled = clamp_dt(Duration::from_secs(2), period);
        assert!((stalled - 0.04).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_ticker_dt_never_exceeds_cap() {
        let mut ticker = Ticker::new(100);
        ticker.tick().await;
        std::thread::sleep(Duration::from_millis(120));
        let dt = ticker.tick().await;
        assert!(dt <= 0.04 + 1e-6, "dt {dt}");
        assert!(dt > 0.0);
    }
}
