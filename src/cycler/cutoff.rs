//! Step termination rules.
//!
//! Checked in a fixed order; the first condition that holds ends the step:
//! mode-specific voltage, absolute voltage bounds, current, charge, time.

use std::fmt;

use crate::cycler::steps::{Cutoffs, Step};

/// Inputs observed at one tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepObservation {
    pub voltage_v: f64,
    pub current_a: f64,
    pub step_elapsed_s: f64,
    pub step_ah: f64,
    /// Current of the first data point recorded in this step, if any.
    pub first_current_a: Option<f64>,
}

/// Which rule ended a step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Cutoff {
    CcVoltage { voltage: f64, target: f64 },
    CvVoltageTolerance { voltage: f64, setpoint: f64, tolerance: f64 },
    VoltageMin { voltage: f64, min: f64 },
    VoltageMax { voltage: f64, max: f64 },
    Current { current: f64, cutoff: f64 },
    CvDirectionReversal { current: f64, direction: i8 },
    Charge { step_ah: f64, cutoff: f64 },
    Time { elapsed_s: f64, limit_s: f64 },
}

impl fmt::Display for Cutoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cutoff::CcVoltage { voltage, target } => {
                write!(f, "CC voltage cutoff reached: {voltage}V (target: {target}V)")
            }
            Cutoff::CvVoltageTolerance { voltage, setpoint, tolerance } => write!(
                f,
                "CV voltage tolerance exceeded: {voltage}V (target: {setpoint}V, tolerance: {tolerance}V)"
            ),
            Cutoff::VoltageMin { voltage, min } => {
                write!(f, "minimum voltage cutoff reached: {voltage}V (min: {min}V)")
            }
            Cutoff::VoltageMax { voltage, max } => {
                write!(f, "maximum voltage cutoff reached: {voltage}V (max: {max}V)")
            }
            Cutoff::Current { current, cutoff } => {
                write!(f, "current cutoff reached: {current}A (cutoff: {cutoff}A)")
            }
            Cutoff::CvDirectionReversal { current, direction } => write!(
                f,
                "CV direction change: {current}A (expected {})",
                if *direction > 0 { "charging" } else { "discharging" }
            ),
            Cutoff::Charge { step_ah, cutoff } => {
                write!(f, "capacity cutoff reached: {step_ah}Ah (target: {cutoff}Ah)")
            }
            Cutoff::Time { elapsed_s, limit_s } => {
                write!(f, "time cutoff reached: {elapsed_s}s (target: {limit_s}s)")
            }
        }
    }
}

/// Expected sign of the current in a CV step: `1` charging, `-1` discharging,
/// `0` when it cannot be told apart.
///
/// The first current seen in the step wins when it is non-zero; otherwise the
/// setpoint is compared with the measured voltage.
pub fn determine_cv_direction(step_voltage: f64, measured_voltage: f64, first_current: Option<f64>) -> i8 {
    if let Some(i) = first_current {
        if i > 0.0 {
            return 1;
        }
        if i < 0.0 {
            return -1;
        }
    }
    if step_voltage > measured_voltage {
        1
    } else if step_voltage < measured_voltage {
        -1
    } else {
        0
    }
}

pub fn is_step_complete(step: &Step, obs: &StepObservation) -> bool {
    evaluate(step, obs).is_some()
}

/// Returns the first cutoff that holds, or `None` if the step should continue.
pub fn evaluate(step: &Step, obs: &StepObservation) -> Option<Cutoff> {
    let cutoffs = step.cutoffs()?;
    voltage_cutoff(step, cutoffs, obs)
        .or_else(|| voltage_bounds(cutoffs, obs))
        .or_else(|| current_cutoff(step, cutoffs, obs))
        .or_else(|| charge_cutoff(step, cutoffs, obs))
        .or_else(|| time_cutoff(cutoffs, obs))
}

fn voltage_cutoff(step: &Step, cutoffs: &Cutoffs, obs: &StepObservation) -> Option<Cutoff> {
    let target = cutoffs.voltage?;
    let v = obs.voltage_v;
    match *step {
        Step::ConstantCurrent { current, .. } => {
            let crossed = (current > 0.0 && v >= target) || (current < 0.0 && v <= target);
            crossed.then_some(Cutoff::CcVoltage { voltage: v, target })
        }
        Step::ConstantVoltage { voltage, .. } => {
            ((v - voltage).abs() > target.abs()).then_some(Cutoff::CvVoltageTolerance {
                voltage: v,
                setpoint: voltage,
                tolerance: target,
            })
        }
        _ => None,
    }
}

fn voltage_bounds(cutoffs: &Cutoffs, obs: &StepObservation) -> Option<Cutoff> {
    let v = obs.voltage_v;
    if let Some(min) = cutoffs.voltage_min {
        if v <= min {
            return Some(Cutoff::VoltageMin { voltage: v, min });
        }
    }
    if let Some(max) = cutoffs.voltage_max {
        if v >= max {
            return Some(Cutoff::VoltageMax { voltage: v, max });
        }
    }
    None
}

fn current_cutoff(step: &Step, cutoffs: &Cutoffs, obs: &StepObservation) -> Option<Cutoff> {
    let cutoff = cutoffs.current?;
    let i = obs.current_a;
    let reached = Cutoff::Current { current: i, cutoff };
    match *step {
        Step::ConstantCurrent { .. } => (i.abs() <= cutoff.abs()).then_some(reached),
        Step::ConstantVoltage { voltage, .. } => {
            match determine_cv_direction(voltage, obs.voltage_v, obs.first_current_a) {
                1 => {
                    if cutoff > 0.0 && (0.0..=cutoff).contains(&i) {
                        Some(reached)
                    } else if i < 0.0 {
                        Some(Cutoff::CvDirectionReversal { current: i, direction: 1 })
                    } else {
                        None
                    }
                }
                -1 => {
                    if cutoff < 0.0 && (cutoff..=0.0).contains(&i) {
                        Some(reached)
                    } else if i > 0.0 {
                        Some(Cutoff::CvDirectionReversal { current: i, direction: -1 })
                    } else {
                        None
                    }
                }
                _ => (i.abs() <= cutoff.abs()).then_some(reached),
            }
        }
        _ => None,
    }
}

fn charge_cutoff(step: &Step, cutoffs: &Cutoffs, obs: &StepObservation) -> Option<Cutoff> {
    let cutoff = cutoffs.charge_ah?;
    let ah = obs.step_ah;
    let reached = Cutoff::Charge { step_ah: ah, cutoff };
    match *step {
        Step::ConstantCurrent { .. } => (ah.abs() >= cutoff.abs()).then_some(reached),
        Step::ConstantVoltage { voltage, .. } => {
            match determine_cv_direction(voltage, obs.voltage_v, obs.first_current_a) {
                1 => (cutoff > 0.0 && ah >= cutoff).then_some(reached),
                -1 => (cutoff < 0.0 && ah <= cutoff).then_some(reached),
                _ => (ah.abs() >= cutoff.abs()).then_some(reached),
            }
        }
        _ => None,
    }
}

fn time_cutoff(cutoffs: &Cutoffs, obs: &StepObservation) -> Option<Cutoff> {
    let limit_s = cutoffs.time_s?;
    (obs.step_elapsed_s >= limit_s).then_some(Cutoff::Time {
        elapsed_s: obs.step_elapsed_s,
        limit_s,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(voltage_v: f64, current_a: f64) -> StepObservation {
        StepObservation {
            voltage_v,
            current_a,
            step_elapsed_s: 0.0,
            step_ah: 0.0,
            first_current_a: None,
        }
    }

    fn cc(current: f64, cutoffs: Cutoffs) -> Step {
        Step::ConstantCurrent { current, cutoffs }
    }

    fn cv(voltage: f64, cutoffs: Cutoffs) -> Step {
        Step::ConstantVoltage { voltage, cutoffs }
    }

    #[test]
    fn cc_voltage_cutoff_follows_current_sign() {
        let cut = Cutoffs {
            voltage: Some(4.2),
            ..Default::default()
        };
        let charge = cc(1.0, cut);
        assert!(!is_step_complete(&charge, &obs(4.19, 1.0)));
        assert!(is_step_complete(&charge, &obs(4.2, 1.0)));
        assert!(is_step_complete(&charge, &obs(4.25, 1.0)));

        // same crossing while discharging is the wrong direction
        let discharge = cc(-1.0, cut);
        assert!(!is_step_complete(&discharge, &obs(4.25, -1.0)));
        assert!(is_step_complete(&discharge, &obs(4.15, -1.0)));

        let guarded = cc(
            -1.0,
            Cutoffs {
                voltage: Some(4.2),
                voltage_max: Some(4.2),
                ..Default::default()
            },
        );
        assert_eq!(
            evaluate(&guarded, &obs(4.25, -1.0)),
            Some(Cutoff::VoltageMax { voltage: 4.25, max: 4.2 })
        );
    }

    #[test]
    fn cc_zero_current_never_crosses() {
        let step = cc(
            0.0,
            Cutoffs {
                voltage: Some(3.0),
                ..Default::default()
            },
        );
        assert!(!is_step_complete(&step, &obs(2.0, 0.0)));
        assert!(!is_step_complete(&step, &obs(4.0, 0.0)));
    }

    #[test]
    fn cv_voltage_is_a_tolerance() {
        let step = cv(
            4.2,
            Cutoffs {
                voltage: Some(-0.05),
                ..Default::default()
            },
        );
        assert!(!is_step_complete(&step, &obs(4.23, 0.5)));
        assert!(matches!(
            evaluate(&step, &obs(4.3, 0.5)),
            Some(Cutoff::CvVoltageTolerance { .. })
        ));
    }

    #[test]
    fn cc_current_cutoff_is_absolute() {
        let step = cc(
            -1.0,
            Cutoffs {
                current: Some(0.1),
                ..Default::default()
            },
        );
        assert!(!is_step_complete(&step, &obs(3.7, -0.2)));
        assert!(is_step_complete(&step, &obs(3.7, -0.05)));
    }

    #[test]
    fn cv_charging_current_decays_to_cutoff() {
        let step = cv(
            4.2,
            Cutoffs {
                current: Some(0.05),
                ..Default::default()
            },
        );
        let mut o = obs(4.2, 1.0);
        o.first_current_a = Some(1.0);
        for i in [1.0, 0.5, 0.2, 0.06] {
            o.current_a = i;
            assert!(!is_step_complete(&step, &o), "{i}");
        }
        o.current_a = 0.04;
        assert_eq!(
            evaluate(&step, &o),
            Some(Cutoff::Current { current: 0.04, cutoff: 0.05 })
        );
    }

    #[test]
    fn cv_charging_reversal_ends_step() {
        let step = cv(
            4.2,
            Cutoffs {
                current: Some(0.05),
                ..Default::default()
            },
        );
        let mut o = obs(4.2, -0.01);
        o.first_current_a = Some(1.0);
        assert_eq!(
            evaluate(&step, &o),
            Some(Cutoff::CvDirectionReversal { current: -0.01, direction: 1 })
        );
        // magnitude above the cutoff still reverses
        o.current_a = -0.5;
        assert!(is_step_complete(&step, &o));
    }

    #[test]
    fn cv_discharging_uses_signed_cutoff() {
        let step = cv(
            3.0,
            Cutoffs {
                current: Some(-0.01),
                ..Default::default()
            },
        );
        // no first sample: direction inferred from setpoint below measured voltage
        assert!(!is_step_complete(&step, &obs(3.4, -0.5)));
        assert!(is_step_complete(&step, &obs(3.4, -0.005)));
        assert!(matches!(
            evaluate(&step, &obs(3.4, 0.02)),
            Some(Cutoff::CvDirectionReversal { direction: -1, .. })
        ));
    }

    #[test]
    fn cv_positive_cutoff_while_discharging_only_reverses() {
        let step = cv(
            3.0,
            Cutoffs {
                current: Some(0.01),
                ..Default::default()
            },
        );
        let mut o = obs(3.0, -0.001);
        o.first_current_a = Some(-0.4);
        assert!(!is_step_complete(&step, &o));
    }

    #[test]
    fn cv_direction_zero_falls_back_to_magnitude() {
        assert_eq!(determine_cv_direction(4.2, 4.2, None), 0);
        assert_eq!(determine_cv_direction(4.2, 4.2, Some(0.0)), 0);
        let step = cv(
            4.2,
            Cutoffs {
                current: Some(0.05),
                ..Default::default()
            },
        );
        // maintenance hold: either sign below the threshold ends the step
        assert!(is_step_complete(&step, &obs(4.2, -0.03)));
        assert!(is_step_complete(&step, &obs(4.2, 0.03)));
        assert!(!is_step_complete(&step, &obs(4.2, -0.3)));
    }

    #[test]
    fn cv_direction_prefers_first_current() {
        assert_eq!(determine_cv_direction(4.2, 3.8, Some(-0.1)), -1);
        assert_eq!(determine_cv_direction(3.0, 3.8, Some(0.1)), 1);
        assert_eq!(determine_cv_direction(4.2, 3.8, None), 1);
        assert_eq!(determine_cv_direction(3.0, 3.8, Some(0.0)), -1);
    }

    #[test]
    fn charge_cutoffs() {
        let cut = Cutoffs {
            charge_ah: Some(0.5),
            ..Default::default()
        };
        let mut o = obs(3.7, -1.0);
        o.step_ah = -0.5;
        assert!(is_step_complete(&cc(-1.0, cut), &o));

        let mut o = obs(4.2, 0.3);
        o.first_current_a = Some(0.3);
        o.step_ah = 0.49;
        assert!(!is_step_complete(&cv(4.2, cut), &o));
        o.step_ah = 0.5;
        assert!(is_step_complete(&cv(4.2, cut), &o));
        // discharging CV with a positive target never fires on charge
        o.first_current_a = Some(-0.3);
        o.step_ah = 5.0;
        assert!(!is_step_complete(&cv(4.2, cut), &o));
    }

    #[test]
    fn time_cutoff_applies_to_every_mode() {
        let rest = Step::Rest {
            cutoffs: Cutoffs {
                time_s: Some(300.0),
                ..Default::default()
            },
        };
        let mut o = obs(3.9, 0.0);
        o.step_elapsed_s = 299.9;
        assert!(!is_step_complete(&rest, &o));
        o.step_elapsed_s = 300.0;
        assert_eq!(
            evaluate(&rest, &o),
            Some(Cutoff::Time { elapsed_s: 300.0, limit_s: 300.0 })
        );
    }

    #[test]
    fn rest_ignores_mode_specific_cutoffs() {
        let rest = Step::OpenCircuit {
            cutoffs: Cutoffs {
                voltage: Some(1.0),
                current: Some(10.0),
                voltage_min: Some(2.5),
                ..Default::default()
            },
        };
        assert!(!is_step_complete(&rest, &obs(3.0, 0.0)));
        assert!(is_step_complete(&rest, &obs(2.4, 0.0)));
    }

    #[test]
    fn voltage_cutoff_wins_over_time() {
        let step = cc(
            1.0,
            Cutoffs {
                voltage: Some(4.2),
                time_s: Some(1.0),
                ..Default::default()
            },
        );
        let mut o = obs(4.3, 1.0);
        o.step_elapsed_s = 10.0;
        assert!(matches!(evaluate(&step, &o), Some(Cutoff::CcVoltage { .. })));
    }

    #[test]
    fn markers_never_complete() {
        assert!(!is_step_complete(&Step::CycleStart, &obs(4.0, 1.0)));
    }
}
