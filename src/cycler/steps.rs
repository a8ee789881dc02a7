use serde::{Deserialize, Serialize};

use crate::drivers::BridgeError;

/// One element of a user-supplied test sequence, as it arrives over the wire.
///
/// Either `cycle` (a `"start"`/`"end"` marker) or `mode` is set. Use
/// [`validate_steps`] to turn a sequence into typed [`Step`]s.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, alias = "current_A", skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    #[serde(default, alias = "voltage_V", skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(flatten)]
    pub cutoffs: Cutoffs,
}

impl StepDefinition {
    pub fn marker(which: &str) -> Self {
        Self {
            cycle: Some(which.to_owned()),
            ..Default::default()
        }
    }

    pub fn cc(current: f64, cutoffs: Cutoffs) -> Self {
        Self {
            mode: Some("cc".into()),
            current: Some(current),
            cutoffs,
            ..Default::default()
        }
    }

    pub fn cv(voltage: f64, cutoffs: Cutoffs) -> Self {
        Self {
            mode: Some("cv".into()),
            voltage: Some(voltage),
            cutoffs,
            ..Default::default()
        }
    }

    pub fn rest(cutoffs: Cutoffs) -> Self {
        Self {
            mode: Some("rest".into()),
            cutoffs,
            ..Default::default()
        }
    }
}

/// Conditions that end a step. Any subset may be configured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cutoffs {
    /// cc: directional crossing target. cv: allowed deviation from the setpoint.
    #[serde(rename = "cutoff_V", default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(rename = "cutoff_V_min", default, skip_serializing_if = "Option::is_none")]
    pub voltage_min: Option<f64>,
    #[serde(rename = "cutoff_V_max", default, skip_serializing_if = "Option::is_none")]
    pub voltage_max: Option<f64>,
    #[serde(rename = "cutoff_A", default, skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    #[serde(rename = "cutoff_Ah", default, skip_serializing_if = "Option::is_none")]
    pub charge_ah: Option<f64>,
    #[serde(rename = "cutoff_time_s", default, skip_serializing_if = "Option::is_none")]
    pub time_s: Option<f64>,
}

/// A validated sequence element.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(into = "StepDefinition")]
pub enum Step {
    CycleStart,
    CycleEnd,
    ConstantCurrent { current: f64, cutoffs: Cutoffs },
    ConstantVoltage { voltage: f64, cutoffs: Cutoffs },
    OpenCircuit { cutoffs: Cutoffs },
    Rest { cutoffs: Cutoffs },
}

impl From<Step> for StepDefinition {
    fn from(step: Step) -> Self {
        match step {
            Step::CycleStart => StepDefinition::marker("start"),
            Step::CycleEnd => StepDefinition::marker("end"),
            Step::ConstantCurrent { current, cutoffs } => StepDefinition::cc(current, cutoffs),
            Step::ConstantVoltage { voltage, cutoffs } => StepDefinition::cv(voltage, cutoffs),
            Step::OpenCircuit { cutoffs } => StepDefinition {
                mode: Some("ocv".into()),
                cutoffs,
                ..Default::default()
            },
            Step::Rest { cutoffs } => StepDefinition::rest(cutoffs),
        }
    }
}

impl Step {
    pub fn mode_name(&self) -> &'static str {
        match self {
            Step::CycleStart => "cycle:start",
            Step::CycleEnd => "cycle:end",
            Step::ConstantCurrent { .. } => "cc",
            Step::ConstantVoltage { .. } => "cv",
            Step::OpenCircuit { .. } => "ocv",
            Step::Rest { .. } => "rest",
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, Step::CycleStart | Step::CycleEnd)
    }

    pub fn cutoffs(&self) -> Option<&Cutoffs> {
        match self {
            Step::CycleStart | Step::CycleEnd => None,
            Step::ConstantCurrent { cutoffs, .. }
            | Step::ConstantVoltage { cutoffs, .. }
            | Step::OpenCircuit { cutoffs }
            | Step::Rest { cutoffs } => Some(cutoffs),
        }
    }
}

fn validate_one(index: usize, def: &StepDefinition) -> Result<Step, BridgeError> {
    if let Some(marker) = def.cycle.as_deref() {
        return match marker {
            "start" => Ok(Step::CycleStart),
            "end" => Ok(Step::CycleEnd),
            other => Err(BridgeError::validation(
                Some(index),
                format!("unknown cycle marker {other:?}"),
            )),
        };
    }
    let mode = def
        .mode
        .as_deref()
        .ok_or_else(|| BridgeError::validation(Some(index), "step has neither mode nor cycle marker"))?;
    let cutoffs = def.cutoffs;
    match mode {
        "cc" => {
            let current = def
                .current
                .ok_or_else(|| BridgeError::validation(Some(index), "CC step missing current"))?;
            Ok(Step::ConstantCurrent { current, cutoffs })
        }
        "cv" => {
            let voltage = def
                .voltage
                .ok_or_else(|| BridgeError::validation(Some(index), "CV step missing voltage"))?;
            Ok(Step::ConstantVoltage { voltage, cutoffs })
        }
        "ocv" => Ok(Step::OpenCircuit { cutoffs }),
        "rest" => Ok(Step::Rest { cutoffs }),
        other => Err(BridgeError::validation(
            Some(index),
            format!("invalid step mode: {other}"),
        )),
    }
}

/// Checks a sequence and returns its typed form.
///
/// Accepts iff there is exactly one `cycle:start`, exactly one `cycle:end`,
/// and every other element has a known mode with that mode's required field.
pub fn validate_steps(steps: &[StepDefinition]) -> Result<Vec<Step>, BridgeError> {
    let mut typed = Vec::with_capacity(steps.len());
    let mut starts = 0;
    let mut ends = 0;
    for (index, def) in steps.iter().enumerate() {
        let step = validate_one(index, def)?;
        match step {
            Step::CycleStart => {
                starts += 1;
                if starts > 1 {
                    return Err(BridgeError::validation(Some(index), "duplicate {\"cycle\":\"start\"}"));
                }
            }
            Step::CycleEnd => {
                ends += 1;
                if ends > 1 {
                    return Err(BridgeError::validation(Some(index), "duplicate {\"cycle\":\"end\"}"));
                }
            }
            _ => {}
        }
        typed.push(step);
    }
    if starts == 0 {
        return Err(BridgeError::validation(None, "cycle definition must include {\"cycle\":\"start\"}"));
    }
    if ends == 0 {
        return Err(BridgeError::validation(None, "cycle definition must include {\"cycle\":\"end\"}"));
    }
    Ok(typed)
}
