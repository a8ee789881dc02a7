//! Battery cycler state machine.
//!
//! Runs a validated step sequence on one channel: issues the step's source
//! commands, integrates charge from each accepted measurement, evaluates
//! cutoffs and advances through the sequence, repeating the cycle body until
//! the cycle counter reaches the requested count.

use std::sync::mpsc::Sender;

use serde::Serialize;

use crate::config::TelemetryLimits;
use crate::cycler::cutoff::{evaluate, StepObservation};
use crate::cycler::integrator::AhIntegrator;
use crate::cycler::steps::{validate_steps, Step};
use crate::cycler::telemetry::{parse_measurement, Measurement};
use crate::drivers::{BridgeError, Classified};
use crate::recorder::{iso_millis, CyclerSink, RunHeader, RunOutcome, RunSummary, SinkOpener};
use crate::smu::Instrument;
use crate::types::{BridgeEvent, Channel, CyclerPhase, CyclerRequest, CyclerStatus};

/// One recorded tick of a cycler run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DataPoint {
    pub timestamp: String,
    pub unix_timestamp: i64,
    pub cycle: u32,
    pub step: usize,
    pub step_type: String,
    pub step_time_s: f64,
    pub total_time_s: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub step_ah: f64,
    pub cycle_ah: f64,
    pub total_ah: f64,
    pub temperature_c: Option<f64>,
    pub notes: Option<String>,
}

struct Run {
    channel: Channel,
    steps: Vec<Step>,
    index: usize,
    cycle: u32,
    total_cycles: u32,
    paused: bool,
    started_ms: i64,
    step_started_ms: i64,
    integrator: AhIntegrator,
    // Stands in for the step's point list: the CV direction is the only
    // thing ever read back from it.
    first_current: Option<f64>,
    last_measurement: Option<Measurement>,
    stream_due_ms: Option<i64>,
    sink: Option<Box<dyn CyclerSink>>,
}

fn emit(events: &Option<Sender<BridgeEvent>>, event: BridgeEvent) {
    if let Some(tx) = events {
        // nobody listening is fine
        let _ = tx.send(event);
    }
}

fn issue_step(step: &Step, channel: Channel, instrument: &mut dyn Instrument) {
    let result = match *step {
        Step::ConstantCurrent { current, .. } => instrument
            .enable_channel(channel)
            .and_then(|_| instrument.set_current(channel, current)),
        Step::ConstantVoltage { voltage, .. } => instrument
            .enable_channel(channel)
            .and_then(|_| instrument.set_voltage(channel, voltage)),
        Step::OpenCircuit { .. } | Step::Rest { .. } => instrument
            .set_current(channel, 0.0)
            .and_then(|_| instrument.enable_channel(channel)),
        Step::CycleStart | Step::CycleEnd => Ok(()),
    };
    if let Err(e) = result {
        log::error!("failed to issue {} step on channel {channel}: {e}", step.mode_name());
    }
}

pub struct Cycler {
    limits: TelemetryLimits,
    settle_ms: i64,
    opener: Option<Box<dyn SinkOpener>>,
    events: Option<Sender<BridgeEvent>>,
    run: Option<Run>,
}

impl Cycler {
    pub fn new(
        limits: TelemetryLimits,
        settle_ms: u64,
        opener: Option<Box<dyn SinkOpener>>,
        events: Option<Sender<BridgeEvent>>,
    ) -> Self {
        Self {
            limits,
            settle_ms: settle_ms as i64,
            opener,
            events,
            run: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.run.as_ref().is_some_and(|r| r.paused)
    }

    pub fn channel(&self) -> Option<Channel> {
        self.run.as_ref().map(|r| r.channel)
    }

    /// Validates and starts a run. Fails without touching the current state
    /// if a run is already active or the sequence is invalid.
    pub fn start(
        &mut self,
        request: CyclerRequest,
        instrument: &mut dyn Instrument,
        now_ms: i64,
    ) -> Result<(), BridgeError> {
        if self.run.is_some() {
            return Err(BridgeError::Lifecycle("cycler is already running".into()));
        }
        let steps = validate_steps(&request.steps)?;
        let first = steps
            .iter()
            .position(|s| !s.is_marker())
            .ok_or_else(|| BridgeError::validation(None, "sequence has no runnable steps"))?;

        let sink = if request.enable_logging {
            self.open_sink(&request, now_ms)
        } else {
            None
        };

        log::info!(
            "starting cycler on channel {} with {} steps, {} cycles",
            request.channel,
            steps.len(),
            if request.cycles == 0 {
                "unlimited".to_owned()
            } else {
                request.cycles.to_string()
            }
        );
        issue_step(&steps[first], request.channel, instrument);
        self.run = Some(Run {
            channel: request.channel,
            steps,
            index: first,
            cycle: 1,
            total_cycles: request.cycles,
            paused: false,
            started_ms: now_ms,
            step_started_ms: now_ms,
            integrator: AhIntegrator::new(),
            first_current: None,
            last_measurement: None,
            stream_due_ms: Some(now_ms + self.settle_ms),
            sink,
        });
        emit(&self.events, BridgeEvent::CyclerStatus(CyclerPhase::Running));
        Ok(())
    }

    fn open_sink(&self, request: &CyclerRequest, now_ms: i64) -> Option<Box<dyn CyclerSink>> {
        let opener = self.opener.as_ref()?;
        let header = RunHeader {
            channel: request.channel,
            total_cycles: request.cycles,
            steps: request.steps.clone(),
            metadata: request.metadata.clone(),
            started_ms: now_ms,
        };
        match opener.open(&header) {
            Ok(sink) => Some(sink),
            Err(e) => {
                log::error!("failed to initialize run logging, continuing without it: {e}");
                None
            }
        }
    }

    /// Runs deferred work: the stream start scheduled after the settle delay.
    pub fn poll(&mut self, instrument: &mut dyn Instrument, now_ms: i64) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.stream_due_ms.is_some_and(|due| now_ms >= due) {
            run.stream_due_ms = None;
            if let Err(e) = instrument.start_streaming(run.channel) {
                log::error!("failed to start streaming on channel {}: {e}", run.channel);
            }
        }
    }

    /// Offers one demultiplexed line. Inert while idle or paused.
    pub fn tick(
        &mut self,
        line: &str,
        classified: &Classified,
        instrument: &mut dyn Instrument,
        now_ms: i64,
    ) -> Option<DataPoint> {
        let run = self.run.as_ref()?;
        if run.paused {
            return None;
        }
        let measurement = parse_measurement(line, classified, run.channel, &self.limits, now_ms)?;
        self.record(measurement, instrument)
    }

    /// Integrates one accepted measurement and advances on a cutoff.
    pub fn record(&mut self, m: Measurement, instrument: &mut dyn Instrument) -> Option<DataPoint> {
        let run = self.run.as_mut()?;
        if run.paused {
            return None;
        }
        let step = run.steps[run.index];
        run.integrator.update(m.current_a, m.time_ms);
        run.first_current.get_or_insert(m.current_a);
        run.last_measurement = Some(m);

        let step_time_s = (m.time_ms - run.step_started_ms) as f64 / 1000.0;
        let point = DataPoint {
            timestamp: iso_millis(m.time_ms),
            unix_timestamp: m.time_ms,
            cycle: run.cycle,
            step: run.index,
            step_type: step.mode_name().to_owned(),
            step_time_s,
            total_time_s: (m.time_ms - run.started_ms) as f64 / 1000.0,
            voltage_v: m.voltage_v,
            current_a: m.current_a,
            step_ah: run.integrator.step_ah,
            cycle_ah: run.integrator.cycle_ah,
            total_ah: run.integrator.total_ah,
            temperature_c: None,
            notes: None,
        };
        if let Some(sink) = run.sink.as_mut() {
            sink.write_point(&point);
        }
        emit(&self.events, BridgeEvent::CyclerData(point.clone()));

        let observation = StepObservation {
            voltage_v: m.voltage_v,
            current_a: m.current_a,
            step_elapsed_s: step_time_s,
            step_ah: run.integrator.step_ah,
            first_current_a: run.first_current,
        };
        if let Some(cutoff) = evaluate(&step, &observation) {
            log::info!("step {} complete: {cutoff}", run.index);
            emit(
                &self.events,
                BridgeEvent::StepCompleted {
                    cycle: run.cycle,
                    step_index: run.index,
                    reason: cutoff.to_string(),
                },
            );
            self.advance(instrument, m.time_ms);
        }
        Some(point)
    }

    /// Moves to the next runnable step, wrapping at `cycle:end` while cycles
    /// remain and stopping when the sequence is exhausted.
    pub fn advance(&mut self, instrument: &mut dyn Instrument, now_ms: i64) {
        let next = {
            let Some(run) = self.run.as_mut() else {
                return;
            };
            run.integrator.reset_step();
            run.step_started_ms = now_ms;
            run.first_current = None;

            let mut idx = run.index + 1;
            let mut rewound = false;
            loop {
                match run.steps.get(idx) {
                    None => break None,
                    Some(Step::CycleStart) => idx += 1,
                    Some(Step::CycleEnd) => {
                        if rewound {
                            log::warn!("cycle body has no runnable step, stopping");
                            break None;
                        }
                        log::info!("cycle {} completed", run.cycle);
                        emit(&self.events, BridgeEvent::CycleCompleted(run.cycle));
                        run.cycle += 1;
                        run.integrator.reset_cycle();
                        if run.total_cycles != 0 && run.cycle >= run.total_cycles {
                            break None;
                        }
                        idx = run
                            .steps
                            .iter()
                            .position(|s| matches!(s, Step::CycleStart))
                            .map_or(run.steps.len(), |p| p + 1);
                        rewound = true;
                    }
                    Some(_) => break Some(idx),
                }
            }
        };

        match (next, self.run.as_mut()) {
            (Some(idx), Some(run)) => {
                run.index = idx;
                let step = run.steps[idx];
                log::info!("advancing to step {idx}: {}", step.mode_name());
                issue_step(&step, run.channel, instrument);
            }
            _ => {
                log::info!("all cycles completed");
                self.finish(instrument, now_ms, RunOutcome::Completed);
            }
        }
    }

    pub fn pause(&mut self) -> Result<(), BridgeError> {
        let run = self
            .run
            .as_mut()
            .ok_or_else(|| BridgeError::Lifecycle("cycler is not running".into()))?;
        run.paused = true;
        log::info!("cycler paused");
        emit(&self.events, BridgeEvent::CyclerStatus(CyclerPhase::Paused));
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), BridgeError> {
        match self.run.as_mut() {
            None => Err(BridgeError::Lifecycle("cycler is not running".into())),
            Some(run) if !run.paused => Err(BridgeError::Lifecycle("cycler is not paused".into())),
            Some(run) => {
                run.paused = false;
                log::info!("cycler resumed");
                emit(&self.events, BridgeEvent::CyclerStatus(CyclerPhase::Running));
                Ok(())
            }
        }
    }

    /// Stops the active run. Does nothing while idle.
    pub fn stop(&mut self, instrument: &mut dyn Instrument, now_ms: i64) {
        self.finish(instrument, now_ms, RunOutcome::Stopped);
    }

    fn finish(&mut self, instrument: &mut dyn Instrument, now_ms: i64, outcome: RunOutcome) {
        let Some(mut run) = self.run.take() else {
            log::debug!("stop requested while idle");
            return;
        };
        if let Err(e) = instrument.stop_streaming(run.channel) {
            log::warn!("failed to stop streaming on channel {}: {e}", run.channel);
        }
        if let Err(e) = instrument.disable_channel(run.channel) {
            log::warn!("failed to disable channel {}: {e}", run.channel);
        }
        if let Some(mut sink) = run.sink.take() {
            sink.finish(&RunSummary {
                ended_ms: now_ms,
                outcome,
                final_cycle_count: run.cycle,
                total_test_time_s: (now_ms - run.started_ms) as f64 / 1000.0,
            });
        }
        log::info!("cycler {}", outcome.as_str());
        emit(&self.events, BridgeEvent::CyclerStatus(CyclerPhase::Stopped));
    }

    pub fn status(&self, now_ms: i64) -> CyclerStatus {
        let Some(run) = &self.run else {
            return CyclerStatus::default();
        };
        CyclerStatus {
            is_running: true,
            is_paused: run.paused,
            channel: Some(run.channel),
            current_cycle: run.cycle,
            total_cycles: run.total_cycles,
            current_step_index: run.index,
            current_step: run.steps.get(run.index).copied(),
            step_time: (now_ms - run.step_started_ms) as f64 / 1000.0,
            total_time: (now_ms - run.started_ms) as f64 / 1000.0,
            step_ah: run.integrator.step_ah,
            cycle_ah: run.integrator.cycle_ah,
            total_ah: run.integrator.total_ah,
            log_file: run.sink.as_ref().map(|s| s.describe()),
            total_steps: run.steps.len(),
            last_measurement: run.last_measurement,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::cycler::steps::{Cutoffs, StepDefinition};
    use crate::recorder::TestMetadata;

    #[derive(Default)]
    struct FakeInstrument {
        calls: Vec<String>,
    }

    impl Instrument for FakeInstrument {
        fn set_current(&mut self, channel: Channel, amps: f64) -> Result<(), BridgeError> {
            self.calls.push(format!("current {channel} {amps}"));
            Ok(())
        }
        fn set_voltage(&mut self, channel: Channel, volts: f64) -> Result<(), BridgeError> {
            self.calls.push(format!("voltage {channel} {volts}"));
            Ok(())
        }
        fn enable_channel(&mut self, channel: Channel) -> Result<(), BridgeError> {
            self.calls.push(format!("enable {channel}"));
            Ok(())
        }
        fn disable_channel(&mut self, channel: Channel) -> Result<(), BridgeError> {
            self.calls.push(format!("disable {channel}"));
            Ok(())
        }
        fn start_streaming(&mut self, channel: Channel) -> Result<(), BridgeError> {
            self.calls.push(format!("stream on {channel}"));
            Ok(())
        }
        fn stop_streaming(&mut self, channel: Channel) -> Result<(), BridgeError> {
            self.calls.push(format!("stream off {channel}"));
            Ok(())
        }
    }

    struct DeadLink;

    impl Instrument for DeadLink {
        fn set_current(&mut self, _: Channel, _: f64) -> Result<(), BridgeError> {
            Err(BridgeError::Transport("port closed".into()))
        }
        fn set_voltage(&mut self, _: Channel, _: f64) -> Result<(), BridgeError> {
            Err(BridgeError::Transport("port closed".into()))
        }
        fn enable_channel(&mut self, _: Channel) -> Result<(), BridgeError> {
            Err(BridgeError::Transport("port closed".into()))
        }
        fn disable_channel(&mut self, _: Channel) -> Result<(), BridgeError> {
            Err(BridgeError::Transport("port closed".into()))
        }
        fn start_streaming(&mut self, _: Channel) -> Result<(), BridgeError> {
            Err(BridgeError::Transport("port closed".into()))
        }
        fn stop_streaming(&mut self, _: Channel) -> Result<(), BridgeError> {
            Err(BridgeError::Transport("port closed".into()))
        }
    }

    #[derive(Default)]
    struct SinkLog {
        points: Vec<DataPoint>,
        summary: Option<RunSummary>,
    }

    struct MemorySink(Arc<Mutex<SinkLog>>);

    impl CyclerSink for MemorySink {
        fn write_point(&mut self, point: &DataPoint) {
            self.0.lock().unwrap().points.push(point.clone());
        }
        fn finish(&mut self, summary: &RunSummary) {
            self.0.lock().unwrap().summary = Some(summary.clone());
        }
        fn describe(&self) -> String {
            "memory".into()
        }
    }

    struct MemoryOpener(Arc<Mutex<SinkLog>>);

    impl SinkOpener for MemoryOpener {
        fn open(&self, _header: &RunHeader) -> Result<Box<dyn CyclerSink>, BridgeError> {
            Ok(Box::new(MemorySink(self.0.clone())))
        }
    }

    struct FailingOpener;

    impl SinkOpener for FailingOpener {
        fn open(&self, _header: &RunHeader) -> Result<Box<dyn CyclerSink>, BridgeError> {
            Err(BridgeError::Persistence("disk full".into()))
        }
    }

    fn timed(seconds: f64) -> Cutoffs {
        Cutoffs {
            time_s: Some(seconds),
            ..Default::default()
        }
    }

    fn request(steps: Vec<StepDefinition>, cycles: u32) -> CyclerRequest {
        CyclerRequest {
            channel: Channel::One,
            steps,
            cycles,
            enable_logging: true,
            metadata: TestMetadata::default(),
        }
    }

    fn one_step(cycles: u32) -> CyclerRequest {
        request(
            vec![
                StepDefinition::marker("start"),
                StepDefinition::cc(0.5, timed(1.0)),
                StepDefinition::marker("end"),
            ],
            cycles,
        )
    }

    fn sample(t: i64) -> Measurement {
        Measurement {
            voltage_v: 3.7,
            current_a: 0.5,
            time_ms: t,
        }
    }

    fn cycler() -> (Cycler, Arc<Mutex<SinkLog>>) {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let cycler = Cycler::new(
            TelemetryLimits::default(),
            1000,
            Some(Box::new(MemoryOpener(log.clone()))),
            None,
        );
        (cycler, log)
    }

    #[test]
    fn start_issues_first_step_and_defers_streaming() {
        let (mut cycler, _) = cycler();
        let mut smu = FakeInstrument::default();
        cycler.start(one_step(1), &mut smu, 0).unwrap();
        assert_eq!(smu.calls, vec!["enable 1", "current 1 0.5"]);
        cycler.poll(&mut smu, 999);
        assert_eq!(smu.calls.len(), 2);
        cycler.poll(&mut smu, 1000);
        cycler.poll(&mut smu, 2000);
        assert_eq!(smu.calls.last().unwrap(), "stream on 1");
        assert_eq!(smu.calls.len(), 3);
    }

    #[test]
    fn single_cycle_stops_at_cycle_end() {
        let (mut cycler, log) = cycler();
        let mut smu = FakeInstrument::default();
        cycler.start(one_step(1), &mut smu, 0).unwrap();
        cycler.record(sample(500), &mut smu);
        assert!(cycler.is_running());
        cycler.record(sample(1000), &mut smu);
        assert!(!cycler.is_running());
        assert!(smu.calls.ends_with(&["stream off 1".to_owned(), "disable 1".to_owned()]));

        let log = log.lock().unwrap();
        assert_eq!(log.points.len(), 2);
        assert!(log.points.iter().all(|p| p.cycle == 1));
        let summary = log.summary.as_ref().unwrap();
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.final_cycle_count, 2);
    }

    fn cycles_visited(requested: u32) -> (Vec<u32>, u32) {
        let (mut cycler, log) = cycler();
        let mut smu = FakeInstrument::default();
        cycler.start(one_step(requested), &mut smu, 0).unwrap();
        let mut t = 0;
        while cycler.is_running() && t < 100_000 {
            t += 1000;
            cycler.record(sample(t), &mut smu);
        }
        assert!(!cycler.is_running());
        let log = log.lock().unwrap();
        let cycles = log.points.iter().map(|p| p.cycle).collect();
        (cycles, log.summary.as_ref().unwrap().final_cycle_count)
    }

    #[test]
    fn counter_is_bumped_before_the_rewind_check() {
        assert_eq!(cycles_visited(1), (vec![1], 2));
        assert_eq!(cycles_visited(2), (vec![1], 2));
        assert_eq!(cycles_visited(3), (vec![1, 2], 3));
        assert_eq!(cycles_visited(4), (vec![1, 2, 3], 4));
    }

    #[test]
    fn zero_cycles_repeats_until_stopped() {
        let (mut cycler, log) = cycler();
        let mut smu = FakeInstrument::default();
        cycler.start(one_step(0), &mut smu, 0).unwrap();
        for i in 1..=10 {
            cycler.record(sample(i * 1000), &mut smu);
        }
        assert!(cycler.is_running());
        assert_eq!(cycler.status(10_000).current_cycle, 11);
        cycler.stop(&mut smu, 10_500);
        assert!(!cycler.is_running());
        let log = log.lock().unwrap();
        assert_eq!(log.summary.as_ref().unwrap().outcome, RunOutcome::Stopped);
    }

    #[test]
    fn steps_before_and_after_the_cycle_body_run_once() {
        let (mut cycler, log) = cycler();
        let mut smu = FakeInstrument::default();
        let req = request(
            vec![
                StepDefinition::rest(timed(1.0)),
                StepDefinition::marker("start"),
                StepDefinition::cc(-0.5, timed(1.0)),
                StepDefinition::marker("end"),
                StepDefinition::cv(4.2, timed(1.0)),
            ],
            3,
        );
        cycler.start(req, &mut smu, 0).unwrap();
        assert_eq!(smu.calls, vec!["current 1 0", "enable 1"]);
        let mut t = 0;
        while cycler.is_running() && t < 100_000 {
            t += 1000;
            cycler.record(sample(t), &mut smu);
        }
        let log = log.lock().unwrap();
        let visited: Vec<(u32, &str)> = log.points.iter().map(|p| (p.cycle, p.step_type.as_str())).collect();
        assert_eq!(visited, vec![(1, "rest"), (1, "cc"), (2, "cc")]);
        assert!(!smu.calls.iter().any(|c| c.starts_with("voltage")));
    }

    #[test]
    fn empty_cycle_body_does_not_loop_forever() {
        let (mut cycler, _) = cycler();
        let mut smu = FakeInstrument::default();
        let req = request(
            vec![
                StepDefinition::cc(0.1, timed(1.0)),
                StepDefinition::marker("start"),
                StepDefinition::marker("end"),
            ],
            0,
        );
        cycler.start(req, &mut smu, 0).unwrap();
        cycler.record(sample(1000), &mut smu);
        assert!(!cycler.is_running());
    }

    #[test]
    fn start_while_running_leaves_state_untouched() {
        let (mut cycler, _) = cycler();
        let mut smu = FakeInstrument::default();
        cycler.start(one_step(5), &mut smu, 0).unwrap();
        cycler.record(sample(100), &mut smu);
        let before = cycler.status(200);
        let mut other = one_step(1);
        other.channel = Channel::Two;
        let err = cycler.start(other, &mut smu, 150).unwrap_err();
        assert!(matches!(err, BridgeError::Lifecycle(_)));
        let after = cycler.status(200);
        assert_eq!(after.channel, before.channel);
        assert_eq!(after.total_cycles, 5);
        assert_eq!(after.step_time, before.step_time);
    }

    #[test]
    fn invalid_sequences_are_rejected() {
        let (mut cycler, _) = cycler();
        let mut smu = FakeInstrument::default();
        let only_markers = request(vec![StepDefinition::marker("start"), StepDefinition::marker("end")], 1);
        assert!(matches!(
            cycler.start(only_markers, &mut smu, 0),
            Err(BridgeError::Validation { .. })
        ));
        let unbalanced = request(vec![StepDefinition::marker("start")], 1);
        assert!(cycler.start(unbalanced, &mut smu, 0).is_err());
        assert!(!cycler.is_running());
        assert!(smu.calls.is_empty());
    }

    #[test]
    fn paused_cycler_ignores_lines() {
        let (mut cycler, log) = cycler();
        let mut smu = FakeInstrument::default();
        cycler.start(one_step(1), &mut smu, 0).unwrap();
        cycler.pause().unwrap();
        assert!(cycler.tick("3.7,0.5", &Classified::Other("3.7,0.5".into()), &mut smu, 5000).is_none());
        assert!(cycler.record(sample(6000), &mut smu).is_none());
        assert!(cycler.is_running());
        assert!(log.lock().unwrap().points.is_empty());

        cycler.resume().unwrap();
        assert!(cycler.tick("3.7,0.5", &Classified::Other("3.7,0.5".into()), &mut smu, 500).is_some());
    }

    #[test]
    fn lifecycle_errors() {
        let (mut cycler, _) = cycler();
        let mut smu = FakeInstrument::default();
        assert!(matches!(cycler.pause(), Err(BridgeError::Lifecycle(_))));
        assert!(matches!(cycler.resume(), Err(BridgeError::Lifecycle(_))));
        cycler.start(one_step(1), &mut smu, 0).unwrap();
        assert!(matches!(cycler.resume(), Err(BridgeError::Lifecycle(_))));
        cycler.stop(&mut smu, 10);
        cycler.stop(&mut smu, 20);
        assert_eq!(smu.calls.iter().filter(|c| c.starts_with("disable")).count(), 1);
        assert!(!cycler.status(30).is_running);
    }

    #[test]
    fn telemetry_filter_applies_before_integration() {
        let (mut cycler, _) = cycler();
        let mut smu = FakeInstrument::default();
        cycler.start(one_step(1), &mut smu, 0).unwrap();
        for chatter in ["OK", "SOUR1:CURR 0.5", "1699999999123"] {
            let classified = Classified::Other(chatter.into());
            assert!(cycler.tick(chatter, &classified, &mut smu, 100).is_none());
        }
        assert!(cycler.status(100).last_measurement.is_none());
    }

    #[test]
    fn charge_is_integrated_across_steps_and_cycles() {
        let (mut cycler, _) = cycler();
        let mut smu = FakeInstrument::default();
        let req = request(
            vec![
                StepDefinition::marker("start"),
                StepDefinition::cc(1.0, timed(3600.0)),
                StepDefinition::marker("end"),
            ],
            3,
        );
        cycler.start(req, &mut smu, 0).unwrap();
        let one_amp = |t| Measurement {
            voltage_v: 3.7,
            current_a: 1.0,
            time_ms: t,
        };
        cycler.record(one_amp(0), &mut smu);
        cycler.record(one_amp(1_800_000), &mut smu);
        let mid = cycler.status(1_800_000);
        assert!((mid.step_ah - 0.5).abs() < 1e-9);
        let point = cycler.record(one_amp(3_600_000), &mut smu).unwrap();
        assert!((point.total_ah - 1.0).abs() < 1e-9);
        let next = cycler.status(3_600_000);
        assert_eq!(next.current_cycle, 2);
        assert_eq!(next.step_ah, 0.0);
        assert_eq!(next.cycle_ah, 0.0);
        assert!((next.total_ah - 1.0).abs() < 1e-9);
    }

    #[test]
    fn logging_failure_does_not_abort_start() {
        let mut cycler = Cycler::new(TelemetryLimits::default(), 0, Some(Box::new(FailingOpener)), None);
        let mut smu = FakeInstrument::default();
        cycler.start(one_step(1), &mut smu, 0).unwrap();
        assert!(cycler.is_running());
        assert_eq!(cycler.status(0).log_file, None);
    }

    #[test]
    fn stop_finishes_cleanup_when_the_link_fails() {
        let (tx, rx) = channel();
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let mut cycler = Cycler::new(
            TelemetryLimits::default(),
            0,
            Some(Box::new(MemoryOpener(log.clone()))),
            Some(tx),
        );
        let mut smu = DeadLink;
        cycler.start(one_step(0), &mut smu, 0).unwrap();
        cycler.poll(&mut smu, 10);
        assert!(cycler.record(sample(500), &mut smu).is_some());
        cycler.stop(&mut smu, 2000);

        assert!(!cycler.is_running());
        let log = log.lock().unwrap();
        assert_eq!(log.points.len(), 1);
        assert_eq!(log.summary.as_ref().unwrap().outcome, RunOutcome::Stopped);
        let events: Vec<BridgeEvent> = rx.try_iter().collect();
        assert!(matches!(
            events.last(),
            Some(BridgeEvent::CyclerStatus(CyclerPhase::Stopped))
        ));
    }

    #[test]
    fn completion_with_a_failing_link_still_closes_the_log() {
        let (mut cycler, log) = cycler();
        let mut smu = DeadLink;
        cycler.start(one_step(1), &mut smu, 0).unwrap();
        cycler.record(sample(1000), &mut smu);
        assert!(!cycler.is_running());
        assert_eq!(
            log.lock().unwrap().summary.as_ref().unwrap().outcome,
            RunOutcome::Completed
        );
    }

    #[test]
    fn events_follow_transitions() {
        let (tx, rx) = channel();
        let mut cycler = Cycler::new(TelemetryLimits::default(), 0, None, Some(tx));
        let mut smu = FakeInstrument::default();
        cycler.start(one_step(1), &mut smu, 0).unwrap();
        cycler.record(sample(1000), &mut smu);
        let events: Vec<BridgeEvent> = rx.try_iter().collect();
        assert!(matches!(events[0], BridgeEvent::CyclerStatus(CyclerPhase::Running)));
        assert!(matches!(events[1], BridgeEvent::CyclerData(_)));
        assert!(matches!(events[2], BridgeEvent::StepCompleted { step_index: 1, .. }));
        assert!(matches!(events[3], BridgeEvent::CycleCompleted(1)));
        assert!(matches!(events[4], BridgeEvent::CyclerStatus(CyclerPhase::Stopped)));
    }
}
