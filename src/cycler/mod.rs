pub mod cutoff;
pub mod integrator;
pub mod machine;
pub mod steps;
pub mod telemetry;

pub use cutoff::{determine_cv_direction, evaluate, is_step_complete, Cutoff, StepObservation};
pub use integrator::AhIntegrator;
pub use machine::{Cycler, DataPoint};
pub use steps::{validate_steps, Cutoffs, Step, StepDefinition};
pub use telemetry::{parse_line, parse_measurement, Measurement};
