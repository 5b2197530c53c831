//! Running workout metrics built from validated telemetry.

use serde::{Deserialize, Serialize};
use tokio::{sync::watch, time::Instant};
use tracing::{debug, trace};

use crate::{
    protocol::TelemetryFrame,
    types::{SpeedUnit, UserSettings},
};

/// Latest known state of the workout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Belt speed in `unit`
    pub speed: f64,
    /// Incline in percent
    pub incline: f64,
    /// Last power reading in watts
    pub power: u16,
    /// Power estimated from speed, incline and body weight
    pub corrected_power: u16,
    /// Cumulative calories (kcal)
    pub calories: f64,
    /// Cumulative distance in `unit` distance
    pub distance: f64,
    /// Heart rate from an external sensor
    pub heart_rate: Option<u8>,
    /// Console unit the figures are in
    pub unit: SpeedUnit,
    /// When the last sample was accepted
    #[serde(skip)]
    pub sampled_at: Option<Instant>,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            speed: 0.0,
            incline: 0.0,
            power: 0,
            corrected_power: 0,
            calories: 0.0,
            distance: 0.0,
            heart_rate: None,
            unit: SpeedUnit::Kilometers,
            sampled_at: None,
        }
    }
}

/// Where snapshots go once per poll tick
pub trait MetricsSink: Send + Sync + 'static {
    /// Publish a snapshot
    fn publish(&self, snapshot: &MetricsSnapshot);
}

impl MetricsSink for watch::Sender<MetricsSnapshot> {
    fn publish(&self, snapshot: &MetricsSnapshot) {
        self.send_replace(snapshot.clone());
    }
}

/// Sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn publish(&self, _snapshot: &MetricsSnapshot) {}
}

/// Result of feeding one frame to the accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Fields and totals updated
    Accepted,
    /// Power was implausible; only power was touched (zeroed)
    PowerRejected,
}

/// Integrates telemetry into running totals
#[derive(Debug, Clone)]
pub struct MetricsAccumulator {
    speed: f64,
    incline: f64,
    power: u16,
    calories: f64,
    distance: f64,
    heart_rate: Option<u8>,
    last_sample: Instant,
    sampled_at: Option<Instant>,
}

impl MetricsAccumulator {
    /// Start accumulating; the first sample integrates from `started_at`
    #[must_use]
    pub const fn new(started_at: Instant) -> Self {
        Self {
            speed: 0.0,
            incline: 0.0,
            power: 0,
            calories: 0.0,
            distance: 0.0,
            heart_rate: None,
            last_sample: started_at,
            sampled_at: None,
        }
    }

    /// Feed one decoded frame received at `now`
    pub fn ingest(
        &mut self,
        frame: &TelemetryFrame,
        now: Instant,
        weight_kg: f64,
    ) -> SampleOutcome {
        if !frame.is_power_plausible() {
            debug!(power = frame.power, "implausible power reading, sample ignored");
            self.power = 0;
            return SampleOutcome::PowerRejected;
        }

        let elapsed_ms = now.saturating_duration_since(self.last_sample).as_secs_f64() * 1000.0;

        self.power = frame.power;
        self.incline = frame.incline;
        self.speed = frame.speed;

        if self.power > 0 {
            self.calories += calories_for(self.power, weight_kg, elapsed_ms);
        }
        self.distance += self.speed / 3_600_000.0 * elapsed_ms;

        self.last_sample = now;
        self.sampled_at = Some(now);

        trace!(
            speed = self.speed,
            incline = self.incline,
            power = self.power,
            distance = self.distance,
            calories = self.calories,
            "sample accepted"
        );
        SampleOutcome::Accepted
    }

    /// Record the externally sourced heart rate
    pub fn set_heart_rate(&mut self, heart_rate: Option<u8>) {
        self.heart_rate = heart_rate;
    }

    /// Reference point for the next integration step
    #[must_use]
    pub const fn last_sample(&self) -> Instant {
        self.last_sample
    }

    /// Move the integration reference to `now` without touching totals
    pub fn rebase(&mut self, now: Instant) {
        self.last_sample = now;
    }

    /// Start a new workout: totals go back to zero
    pub fn reset(&mut self, now: Instant) {
        self.calories = 0.0;
        self.distance = 0.0;
        self.last_sample = now;
    }

    /// Current snapshot under `settings`
    #[must_use]
    pub fn snapshot(&self, settings: &UserSettings) -> MetricsSnapshot {
        MetricsSnapshot {
            speed: self.speed,
            incline: self.incline,
            power: self.power,
            corrected_power: corrected_power(self.speed, self.incline, settings.weight_kg),
            calories: self.calories,
            distance: self.distance,
            heart_rate: self.heart_rate,
            unit: settings.unit,
            sampled_at: self.sampled_at,
        }
    }
}

/// kcal burned at `power` watts over `elapsed_ms` (MET estimate)
#[must_use]
pub fn calories_for(power: u16, weight_kg: f64, elapsed_ms: f64) -> f64 {
    let per_minute = (0.048 * f64::from(power) + 1.19) * weight_kg * 3.5 / 200.0;
    per_minute * (elapsed_ms / 60_000.0)
}

/// Running power from belt speed, grade and body weight.
///
/// Horizontal work from the oxygen cost of running at `speed`, plus the
/// vertical work of lifting `weight_kg` up the grade.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn corrected_power(speed: f64, incline: f64, weight_kg: f64) -> u16 {
    if speed <= 0.0 {
        return 0;
    }
    let pace = 60.0 / speed;
    let vo2_relative = 210.0 / pace;
    let vo2_absolute = vo2_relative * weight_kg / 1000.0;
    let horizontal = 75.0 * vo2_absolute;
    let vertical = 9.8 * weight_kg * (incline / 100.0);
    (horizontal + vertical).max(0.0) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(speed: f64, incline: f64, power: u16) -> TelemetryFrame {
        TelemetryFrame {
            speed,
            incline,
            power,
        }
    }

    #[test]
    fn test_calorie_integration_over_one_second() {
        let t0 = Instant::now();
        let mut acc = MetricsAccumulator::new(t0);

        acc.ingest(&frame(6.0, 1.0, 120), t0, 80.0);
        let before = acc.snapshot(&UserSettings::default()).calories;
        acc.ingest(&frame(6.0, 1.0, 120), t0 + Duration::from_millis(1000), 80.0);
        let delta = acc.snapshot(&UserSettings::default()).calories - before;

        let expected = ((0.048 * 120.0 + 1.19) * 80.0 * 3.5 / 200.0) * (1000.0 / 60_000.0);
        assert!((delta - expected).abs() < 1e-9, "delta {delta}, expected {expected}");
        assert!((delta - 0.162_166_666).abs() < 1e-6);
    }

    #[test]
    fn test_distance_integration() {
        let t0 = Instant::now();
        let mut acc = MetricsAccumulator::new(t0);

        acc.ingest(&frame(12.0, 0.0, 100), t0 + Duration::from_secs(60), 75.0);
        let snapshot = acc.snapshot(&UserSettings::default());

        // 12 km/h for one minute
        assert!((snapshot.distance - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_corrupted_power_leaves_state_untouched() {
        let t0 = Instant::now();
        let mut acc = MetricsAccumulator::new(t0);
        acc.ingest(&frame(8.0, 2.0, 150), t0 + Duration::from_secs(10), 75.0);

        let before = acc.snapshot(&UserSettings::default());
        let last_before = acc.last_sample();

        let outcome = acc.ingest(&frame(20.0, 9.0, 3001), t0 + Duration::from_secs(20), 75.0);
        let after = acc.snapshot(&UserSettings::default());

        assert_eq!(outcome, SampleOutcome::PowerRejected);
        assert_eq!(after.power, 0);
        assert!((after.speed - before.speed).abs() < f64::EPSILON);
        assert!((after.incline - before.incline).abs() < f64::EPSILON);
        assert!((after.calories - before.calories).abs() < f64::EPSILON);
        assert!((after.distance - before.distance).abs() < f64::EPSILON);
        assert_eq!(after.sampled_at, before.sampled_at);
        assert_eq!(acc.last_sample(), last_before);
    }

    #[test]
    fn test_no_burst_after_rejected_sample() {
        let t0 = Instant::now();
        let mut acc = MetricsAccumulator::new(t0);
        acc.ingest(&frame(10.0, 0.0, 100), t0, 75.0);
        acc.ingest(&frame(10.0, 0.0, 5000), t0 + Duration::from_secs(5), 75.0);
        acc.ingest(&frame(10.0, 0.0, 100), t0 + Duration::from_secs(6), 75.0);

        // integrates across the whole 6 s gap, nothing more
        let distance = acc.snapshot(&UserSettings::default()).distance;
        assert!((distance - 10.0 / 3600.0 * 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_power_accrues_no_calories() {
        let t0 = Instant::now();
        let mut acc = MetricsAccumulator::new(t0);
        acc.ingest(&frame(3.0, 0.0, 0), t0 + Duration::from_secs(30), 75.0);

        let snapshot = acc.snapshot(&UserSettings::default());
        assert!(snapshot.calories.abs() < f64::EPSILON);
        assert!(snapshot.distance > 0.0);
    }

    #[test]
    fn test_totals_never_decrease() {
        let t0 = Instant::now();
        let mut acc = MetricsAccumulator::new(t0);
        let mut last = (0.0, 0.0);
        for i in 1..50u64 {
            let speed = if i % 7 == 0 { 0.0 } else { 9.5 };
            acc.ingest(&frame(speed, 1.0, 130), t0 + Duration::from_millis(i * 200), 70.0);
            let snapshot = acc.snapshot(&UserSettings::default());
            assert!(snapshot.distance >= last.0);
            assert!(snapshot.calories >= last.1);
            last = (snapshot.distance, snapshot.calories);
        }
    }

    #[test]
    fn test_reset_clears_totals_only() {
        let t0 = Instant::now();
        let mut acc = MetricsAccumulator::new(t0);
        acc.ingest(&frame(10.0, 3.0, 200), t0 + Duration::from_secs(60), 75.0);
        acc.reset(t0 + Duration::from_secs(61));

        let snapshot = acc.snapshot(&UserSettings::default());
        assert!(snapshot.distance.abs() < f64::EPSILON);
        assert!(snapshot.calories.abs() < f64::EPSILON);
        assert!((snapshot.speed - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_corrected_power() {
        assert_eq!(corrected_power(0.0, 5.0, 75.0), 0);
        // 10 km/h flat, 75 kg: 75 * (210 / 6) * 75 / 1000
        assert_eq!(corrected_power(10.0, 0.0, 75.0), 196);
        assert!(corrected_power(10.0, 5.0, 75.0) > corrected_power(10.0, 0.0, 75.0));
    }

    #[test]
    fn test_snapshot_carries_settings() {
        let mut acc = MetricsAccumulator::new(Instant::now());
        acc.set_heart_rate(Some(142));
        let settings = UserSettings {
            weight_kg: 90.0,
            unit: SpeedUnit::Miles,
        };
        let snapshot = acc.snapshot(&settings);
        assert_eq!(snapshot.heart_rate, Some(142));
        assert_eq!(snapshot.unit, SpeedUnit::Miles);
    }

    #[test]
    fn test_watch_sink() {
        let (tx, rx) = watch::channel(MetricsSnapshot::default());
        let snapshot = MetricsSnapshot {
            power: 99,
            ..MetricsSnapshot::default()
        };
        tx.publish(&snapshot);
        assert_eq!(rx.borrow().power, 99);
    }
}
