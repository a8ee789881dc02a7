use serde::Serialize;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Trapezoidal charge integrator with three independently reset totals.
///
/// Every update adds the same increment to the step, cycle and total
/// accumulators; they only differ by when they are zeroed.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AhIntegrator {
    pub step_ah: f64,
    pub cycle_ah: f64,
    pub total_ah: f64,
    #[serde(skip)]
    last: Option<(f64, i64)>,
}

impl AhIntegrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one `(current, timestamp)` pair. The first pair only sets the
    /// baseline.
    pub fn update(&mut self, current_a: f64, timestamp_ms: i64) {
        if let Some((last_current, last_ms)) = self.last {
            let dt_hours = (timestamp_ms - last_ms) as f64 / MS_PER_HOUR;
            let delta_ah = (current_a + last_current) / 2.0 * dt_hours;
            self.step_ah += delta_ah;
            self.cycle_ah += delta_ah;
            self.total_ah += delta_ah;
        }
        self.last = Some((current_a, timestamp_ms));
    }

    pub fn reset_step(&mut self) {
        self.step_ah = 0.0;
    }

    pub fn reset_cycle(&mut self) {
        self.cycle_ah = 0.0;
    }
}
