//! Aerotech fly-scanning stage.
//!
//! `AerotechFlyer` composes a [`Motor`] with a [`PsoController`] and the
//! [`Flyer`]/[`Stageable`] capabilities. Scan inputs live in read-only
//! observable signals that only [`AerotechFlyer::set_parameter`] and
//! [`AerotechFlyer::set_scan`] write; every write re-derives the trajectory
//! before anything can read it.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --stage--> Armed --kickoff--> Taxiing --ready--> ReadyToFly
//!   ^                ^                  |                   |
//!   |                +------failure-----+                complete
//!   |                ^                                      v
//!   +----unstage---- Landed <------------landed--------- Flying
//! ```
//!
//! Taxi and fly sequences run on a spawned task that the flyer owns until
//! `unstage` joins it. `abort()` trips a token checked between every sub-step;
//! an aborted or failed sequence fails its status and turns the PSO off.
//! `stage` and `kickoff` clear the token, so an aborted flyer can be kicked
//! off again from `Armed`. Dropping the flyer trips the token.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ControllerConfig, FlyerConfig};
use crate::error::{AppResult, DaqError};
use crate::experiment::document::{now_secs, DataKey, ProtoEvent};
use crate::hardware::capabilities::{
    CommandChannel, Flyer, Motor, Stageable, TriggerTiming,
};
use crate::hardware::pso::{check_unmasked_taxi, PsoController};
use crate::observable::Observable;
use crate::status::{Flag, Status};
use crate::trajectory::{DerivedTrajectory, ScanParameters, TrajectoryPlanner};

/// Stream key used by `describe_collect`
pub const POSITIONS_STREAM: &str = "positions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlyerState {
    Idle,
    Armed,
    Taxiing,
    ReadyToFly,
    Flying,
    Landed,
}

impl fmt::Display for FlyerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FlyerState::Idle => "idle",
            FlyerState::Armed => "armed",
            FlyerState::Taxiing => "taxiing",
            FlyerState::ReadyToFly => "ready to fly",
            FlyerState::Flying => "flying",
            FlyerState::Landed => "landed",
        };
        f.write_str(label)
    }
}

/// User-settable scan inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanParameter {
    StartPosition,
    EndPosition,
    StepSize,
    DwellTime,
    AccelerationTime,
    EncoderResolution,
    MotorDirection,
    EncoderDirection,
}

impl ScanParameter {
    /// Every input the derived trajectory depends on.
    pub const ALL: [ScanParameter; 8] = [
        ScanParameter::StartPosition,
        ScanParameter::EndPosition,
        ScanParameter::StepSize,
        ScanParameter::DwellTime,
        ScanParameter::AccelerationTime,
        ScanParameter::EncoderResolution,
        ScanParameter::MotorDirection,
        ScanParameter::EncoderDirection,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScanParameter::StartPosition => "start_position",
            ScanParameter::EndPosition => "end_position",
            ScanParameter::StepSize => "step_size",
            ScanParameter::DwellTime => "dwell_time",
            ScanParameter::AccelerationTime => "acceleration_time",
            ScanParameter::EncoderResolution => "encoder_resolution",
            ScanParameter::MotorDirection => "motor_direction",
            ScanParameter::EncoderDirection => "encoder_direction",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    fn signal(self, initial: f64, units: &str) -> Observable<f64> {
        let signal = Observable::new(self.name(), initial).read_only();
        match self {
            ScanParameter::StartPosition
            | ScanParameter::EndPosition
            | ScanParameter::StepSize => signal.with_units(units),
            ScanParameter::EncoderResolution => signal
                .with_units(units)
                .with_range(0.0, f64::MAX),
            ScanParameter::DwellTime => signal.with_units("s").with_range(0.0, f64::MAX),
            ScanParameter::AccelerationTime => signal.with_units("s"),
            ScanParameter::MotorDirection | ScanParameter::EncoderDirection => signal
                .with_validator(|value: &f64| {
                    if *value == 1.0 || *value == -1.0 {
                        Ok(())
                    } else {
                        Err(anyhow::anyhow!("direction must be +1 or -1, got {value}"))
                    }
                }),
        }
    }
}

/// Wall-clock times (seconds since epoch) of the current flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FlightLog {
    pub kickoff: Option<f64>,
    pub taxi_complete: Option<f64>,
    pub fly_start: Option<f64>,
    pub landed: Option<f64>,
}

#[derive(Debug, Default)]
struct TrajectoryCache {
    trajectory: Option<DerivedTrajectory>,
    stale_reason: Option<String>,
}

/// State shared between the flyer and its worker task.
#[derive(Debug)]
struct FlightShared {
    state: Mutex<FlyerState>,
    ready: Flag,
    complete: Flag,
    log: Mutex<FlightLog>,
}

impl FlightShared {
    fn set_state(&self, state: FlyerState) {
        *self.state.lock() = state;
    }
}

/// Fly-scanning Aerotech axis.
pub struct AerotechFlyer {
    name: String,
    motor: Arc<dyn Motor>,
    pso: Arc<PsoController>,
    trigger: Option<Arc<dyn TriggerTiming>>,
    planner: TrajectoryPlanner,
    move_timeout: Duration,
    signals: Vec<Observable<f64>>,
    cache: Mutex<TrajectoryCache>,
    derived: Observable<Option<DerivedTrajectory>>,
    shared: Arc<FlightShared>,
    saved_velocity: Mutex<Option<f64>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    abort: watch::Sender<bool>,
}

impl fmt::Debug for AerotechFlyer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AerotechFlyer")
            .field("name", &self.name)
            .field("pso", &self.pso)
            .field("state", &self.state())
            .finish()
    }
}

impl AerotechFlyer {
    pub fn new(name: impl Into<String>, motor: Arc<dyn Motor>, pso: PsoController) -> Self {
        let name = name.into();
        let units = motor.units().symbol();
        let defaults = ScanParameters::default();
        let signals = ScanParameter::ALL
            .iter()
            .map(|param| param.signal(param_value(&defaults, *param), units))
            .collect();
        let (abort, _) = watch::channel(false);

        Self {
            derived: Observable::new(format!("{name}_trajectory"), None).read_only(),
            name,
            motor,
            pso: Arc::new(pso),
            trigger: None,
            planner: TrajectoryPlanner::default(),
            move_timeout: Duration::from_secs(60),
            signals,
            cache: Mutex::new(TrajectoryCache::default()),
            shared: Arc::new(FlightShared {
                state: Mutex::new(FlyerState::Idle),
                ready: Flag::new("ready_to_fly"),
                complete: Flag::new("flight_complete"),
                log: Mutex::new(FlightLog::default()),
            }),
            saved_velocity: Mutex::new(None),
            worker: Mutex::new(None),
            abort,
        }
    }

    /// Build a flyer from its configuration entry.
    pub fn from_config(
        config: &FlyerConfig,
        controller: &ControllerConfig,
        motor: Arc<dyn Motor>,
        channel: Arc<dyn CommandChannel>,
    ) -> AppResult<Self> {
        let pso = PsoController::new(config.axis.clone(), config.encoder, channel)
            .with_output(controller.pso_output_axis)
            .with_command_timeout(Duration::from_millis(controller.command_timeout_ms));
        let flyer = Self::new(config.name.clone(), motor, pso)
            .with_planner(TrajectoryPlanner::new(controller.window_limits()))
            .with_move_timeout(Duration::from_millis(controller.move_timeout_ms));

        let resolution = config.resolution_in(flyer.motor.units())?;
        for (param, value) in [
            (ScanParameter::EncoderResolution, resolution),
            (ScanParameter::AccelerationTime, config.acceleration_time),
            (ScanParameter::EncoderDirection, f64::from(config.encoder_direction)),
            (ScanParameter::MotorDirection, f64::from(config.motor_direction)),
        ] {
            flyer.set_parameter(param, value)?;
        }
        Ok(flyer)
    }

    pub fn with_trigger(mut self, trigger: Arc<dyn TriggerTiming>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_planner(mut self, planner: TrajectoryPlanner) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_move_timeout(mut self, timeout: Duration) -> Self {
        self.move_timeout = timeout;
        self
    }

    pub fn motor(&self) -> &Arc<dyn Motor> {
        &self.motor
    }

    pub fn pso(&self) -> &PsoController {
        &self.pso
    }

    pub fn state(&self) -> FlyerState {
        *self.shared.state.lock()
    }

    pub fn flight_log(&self) -> FlightLog {
        *self.shared.log.lock()
    }

    /// "Ready to fly" flag, set once taxi has finished.
    pub fn ready_flag(&self) -> &Flag {
        &self.shared.ready
    }

    /// "Flight complete" flag, set once the motor has landed.
    pub fn complete_flag(&self) -> &Flag {
        &self.shared.complete
    }

    /// Read-only view of one scan input; write through `set_parameter`.
    pub fn signal(&self, param: ScanParameter) -> &Observable<f64> {
        &self.signals[param.index()]
    }

    /// Read-only signal carrying the latest successfully derived trajectory.
    pub fn trajectory_signal(&self) -> &Observable<Option<DerivedTrajectory>> {
        &self.derived
    }

    /// Current scan inputs, read from the signals.
    pub fn scan_parameters(&self) -> ScanParameters {
        let get = |param: ScanParameter| self.signal(param).get();
        ScanParameters {
            start_position: get(ScanParameter::StartPosition),
            end_position: get(ScanParameter::EndPosition),
            step_size: get(ScanParameter::StepSize),
            dwell_time: get(ScanParameter::DwellTime),
            acceleration_time: get(ScanParameter::AccelerationTime),
            encoder_resolution: get(ScanParameter::EncoderResolution),
            motor_direction: get(ScanParameter::MotorDirection) as i32,
            encoder_direction: get(ScanParameter::EncoderDirection) as i32,
        }
    }

    /// Write one scan input and re-derive the trajectory.
    ///
    /// Rejected writes return an error. Degenerate inputs are accepted but
    /// leave the trajectory stale until a later write makes it computable.
    pub fn set_parameter(&self, param: ScanParameter, value: f64) -> AppResult<()> {
        self.ensure_parameters_writable()?;
        self.signal(param)
            .update(value)
            .map_err(|e| DaqError::InvalidScanParameters(format!("{}: {e}", param.name())))?;
        self.recompute();
        Ok(())
    }

    /// Write every scan input, re-deriving once at the end.
    pub fn set_scan(&self, params: &ScanParameters) -> AppResult<()> {
        self.ensure_parameters_writable()?;
        for param in ScanParameter::ALL {
            self.signal(param)
                .update(param_value(params, param))
                .map_err(|e| DaqError::InvalidScanParameters(format!("{}: {e}", param.name())))?;
        }
        self.recompute();
        Ok(())
    }

    /// The trajectory for the current inputs. A stale trajectory is never
    /// returned.
    pub fn trajectory(&self) -> AppResult<DerivedTrajectory> {
        let cache = self.cache.lock();
        match (&cache.trajectory, &cache.stale_reason) {
            (Some(trajectory), None) => Ok(trajectory.clone()),
            (_, Some(reason)) => Err(DaqError::DegenerateParameters(format!(
                "{}: trajectory is stale ({reason})",
                self.name
            ))),
            (None, None) => Err(DaqError::DegenerateParameters(format!(
                "{}: no trajectory computed",
                self.name
            ))),
        }
    }

    pub fn is_trajectory_current(&self) -> bool {
        self.trajectory().is_ok()
    }

    /// Stop the in-flight sequence at the next sub-step boundary.
    pub fn abort(&self) {
        info!(flyer = %self.name, state = %self.state(), "Abort requested");
        self.abort.send_replace(true);
    }

    fn recompute(&self) {
        let inputs = self.scan_parameters();
        let mut cache = self.cache.lock();
        match self.planner.derive(&inputs) {
            Ok(trajectory) => {
                debug!(
                    flyer = %self.name,
                    taxi_start = trajectory.taxi_start,
                    taxi_end = trajectory.taxi_end,
                    slew_speed = trajectory.slew_speed,
                    pixels = trajectory.pixel_positions.len(),
                    "Derived fly-scan trajectory"
                );
                self.derived.set_unchecked(Some(trajectory.clone()));
                cache.trajectory = Some(trajectory);
                cache.stale_reason = None;
            }
            Err(err) => {
                warn!(flyer = %self.name, error = %err, "Skipping trajectory recompute");
                cache.stale_reason = Some(err.to_string());
            }
        }
    }

    fn ensure_parameters_writable(&self) -> AppResult<()> {
        let state = self.state();
        if matches!(
            state,
            FlyerState::Taxiing | FlyerState::ReadyToFly | FlyerState::Flying
        ) {
            return Err(DaqError::InvalidTransition {
                from: state.to_string(),
                action: "change scan parameters".into(),
            });
        }
        Ok(())
    }

    /// Atomically move from one of `allowed` to `next`.
    fn transition(&self, allowed: &[FlyerState], next: FlyerState, action: &str) -> AppResult<()> {
        let mut state = self.shared.state.lock();
        if !allowed.contains(&*state) {
            return Err(DaqError::InvalidTransition {
                from: state.to_string(),
                action: action.to_string(),
            });
        }
        *state = next;
        Ok(())
    }

    fn flight_task(&self, trajectory: DerivedTrajectory) -> FlightTask {
        FlightTask {
            name: self.name.clone(),
            motor: self.motor.clone(),
            pso: self.pso.clone(),
            trigger: self.trigger.clone(),
            move_timeout: self.move_timeout,
            shared: self.shared.clone(),
            abort: self.abort.subscribe(),
            trajectory,
        }
    }

    async fn join_worker(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(flyer = %self.name, error = %err, "Flight worker panicked");
            }
        }
    }
}

impl Drop for AerotechFlyer {
    fn drop(&mut self) {
        let running = self
            .worker
            .get_mut()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if running {
            warn!(flyer = %self.name, "Dropped with a flight in progress, aborting it");
            self.abort.send_replace(true);
        }
    }
}

fn param_value(params: &ScanParameters, param: ScanParameter) -> f64 {
    match param {
        ScanParameter::StartPosition => params.start_position,
        ScanParameter::EndPosition => params.end_position,
        ScanParameter::StepSize => params.step_size,
        ScanParameter::DwellTime => params.dwell_time,
        ScanParameter::AccelerationTime => params.acceleration_time,
        ScanParameter::EncoderResolution => params.encoder_resolution,
        ScanParameter::MotorDirection => f64::from(params.motor_direction),
        ScanParameter::EncoderDirection => f64::from(params.encoder_direction),
    }
}

#[async_trait]
impl Stageable for AerotechFlyer {
    async fn stage(&self) -> AppResult<()> {
        self.transition(&[FlyerState::Idle], FlyerState::Armed, "stage")?;
        match self.motor.velocity().await {
            Ok(velocity) => *self.saved_velocity.lock() = Some(velocity),
            Err(err) => {
                self.shared.set_state(FlyerState::Idle);
                return Err(DaqError::Motion(format!("{}: reading velocity: {err}", self.name)));
            }
        }
        self.abort.send_replace(false);
        self.shared.ready.set(false);
        self.shared.complete.set(false);
        *self.shared.log.lock() = FlightLog::default();
        info!(flyer = %self.name, "Staged");
        Ok(())
    }

    async fn unstage(&self) -> AppResult<()> {
        let running = self
            .worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if running {
            warn!(flyer = %self.name, "Unstaging with a flight in progress, aborting it");
            self.abort.send_replace(true);
        }
        self.join_worker().await;

        let saved = self.saved_velocity.lock().take();
        let restored = match saved {
            Some(velocity) => self
                .motor
                .set_velocity(velocity)
                .await
                .map_err(|e| DaqError::Motion(format!("{}: restoring velocity: {e}", self.name))),
            None => Ok(()),
        };

        self.shared.ready.fail_waiters("unstaged");
        self.shared.complete.fail_waiters("unstaged");
        self.shared.ready.set(false);
        self.shared.complete.set(false);
        *self.shared.log.lock() = FlightLog::default();
        self.shared.set_state(FlyerState::Idle);
        info!(flyer = %self.name, "Unstaged");
        restored
    }
}

#[async_trait]
impl Flyer for AerotechFlyer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn kickoff(&self) -> AppResult<Status> {
        let trajectory = self.trajectory()?;
        if !trajectory.encoder_use_window {
            check_unmasked_taxi(&trajectory)?;
        }
        self.transition(&[FlyerState::Armed], FlyerState::Taxiing, "kickoff")?;

        self.abort.send_replace(false);
        self.shared.ready.set(false);
        let status = self.shared.ready.when_set();
        *self.shared.log.lock() = FlightLog {
            kickoff: Some(now_secs()),
            ..FlightLog::default()
        };

        // A worker left over from a failed flight has already finished
        self.join_worker().await;
        let task = self.flight_task(trajectory);
        *self.worker.lock() = Some(tokio::spawn(task.taxi()));
        info!(flyer = %self.name, "Kicked off");
        Ok(status)
    }

    async fn complete(&self) -> AppResult<Status> {
        let trajectory = self.trajectory()?;
        self.transition(&[FlyerState::ReadyToFly], FlyerState::Flying, "complete")?;

        self.join_worker().await;
        self.shared.complete.set(false);
        let status = self.shared.complete.when_set();

        let task = self.flight_task(trajectory);
        *self.worker.lock() = Some(tokio::spawn(task.fly()));
        info!(flyer = %self.name, "Flying");
        Ok(status)
    }

    async fn collect(&self) -> AppResult<Vec<ProtoEvent>> {
        let state = self.state();
        if state != FlyerState::Landed {
            return Err(DaqError::InvalidTransition {
                from: state.to_string(),
                action: "collect".into(),
            });
        }
        let log = self.flight_log();
        let (Some(fly_start), Some(landed)) = (log.fly_start, log.landed) else {
            return Err(DaqError::StatusFailed(format!(
                "{}: flight times were not recorded",
                self.name
            )));
        };

        let trajectory = self.trajectory()?;
        let times = trajectory.pixel_timestamps(fly_start, landed);
        Ok(trajectory
            .pixel_positions
            .iter()
            .zip(times)
            .map(|(&position, time)| ProtoEvent::new(time).with_reading(&self.name, position, time))
            .collect())
    }

    async fn describe_collect(&self) -> AppResult<Map<String, Value>> {
        let (low, high) = self.motor.limits();
        let key = DataKey::scalar(self.motor.name(), self.motor.units().symbol())
            .with_limits(low, high)
            .with_precision(self.motor.precision());

        let mut positions = Map::new();
        positions.insert(self.name.clone(), key.to_value());
        let mut schema = Map::new();
        schema.insert(POSITIONS_STREAM.to_string(), Value::Object(positions));
        Ok(schema)
    }
}

/// Everything one taxi or fly sequence needs, owned by the worker task.
struct FlightTask {
    name: String,
    motor: Arc<dyn Motor>,
    pso: Arc<PsoController>,
    trigger: Option<Arc<dyn TriggerTiming>>,
    move_timeout: Duration,
    shared: Arc<FlightShared>,
    abort: watch::Receiver<bool>,
    trajectory: DerivedTrajectory,
}

impl FlightTask {
    async fn taxi(self) {
        match self.run_taxi().await {
            Ok(()) => {
                self.shared.log.lock().taxi_complete = Some(now_secs());
                self.shared.set_state(FlyerState::ReadyToFly);
                self.shared.ready.set(true);
                info!(flyer = %self.name, "Ready to fly");
            }
            Err(err) => {
                error!(flyer = %self.name, error = %err, "Taxi failed");
                self.recover().await;
                self.shared.ready.fail_waiters(&err.to_string());
            }
        }
    }

    async fn run_taxi(&self) -> AppResult<()> {
        let traj = &self.trajectory;
        self.step("disable PSO", self.pso.disable()).await?;
        self.move_motor(traj.pso_start, "move to PSO start").await?;
        self.step("enable PSO", self.pso.enable(traj)).await?;
        self.step("arm PSO", self.pso.arm()).await?;
        self.move_motor(traj.taxi_start, "taxi").await?;

        let set_slew = async {
            self.motor
                .set_velocity(traj.slew_speed)
                .await
                .map_err(|e| DaqError::Motion(e.to_string()))
        };
        self.step("set slew speed", set_slew).await?;

        if let Some(trigger) = &self.trigger {
            let configure = async {
                trigger
                    .configure(traj)
                    .await
                    .map_err(|e| DaqError::Command(format!("trigger timing: {e}")))
            };
            self.step("configure trigger timing", configure).await?;
        }
        Ok(())
    }

    async fn fly(self) {
        self.shared.log.lock().fly_start = Some(now_secs());
        let result = match self.move_motor(self.trajectory.taxi_end, "fly").await {
            Ok(()) => self.pso.disable().await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                self.shared.log.lock().landed = Some(now_secs());
                self.shared.set_state(FlyerState::Landed);
                self.shared.complete.set(true);
                info!(flyer = %self.name, "Landed");
            }
            Err(err) => {
                error!(flyer = %self.name, error = %err, "Flight failed");
                self.recover().await;
                self.shared.complete.fail_waiters(&err.to_string());
            }
        }
    }

    /// Leave the hardware safe after a failed sequence.
    async fn recover(&self) {
        if let Err(err) = self.pso.disable().await {
            error!(flyer = %self.name, error = %err, "Could not disable PSO after failure");
        }
        self.shared.set_state(FlyerState::Armed);
    }

    async fn move_motor(&self, target: f64, what: &str) -> AppResult<()> {
        let mv = async {
            tokio::time::timeout(self.move_timeout, self.motor.move_to(target))
                .await
                .map_err(|_| DaqError::ConnectionTimeout {
                    device: self.name.clone(),
                    timeout_ms: self.move_timeout.as_millis() as u64,
                })?
                .map_err(|e| DaqError::Motion(e.to_string()))
        };
        self.step(what, mv).await
    }

    /// Run one sub-step unless an abort is pending, cancelling it if one
    /// arrives while it runs.
    async fn step<T, F>(&self, what: &str, operation: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        let mut abort = self.abort.clone();
        if *abort.borrow_and_update() {
            return Err(DaqError::Aborted(format!("{}: before {what}", self.name)));
        }
        debug!(flyer = %self.name, step = what, "Flight step");
        tokio::select! {
            result = operation => result,
            _ = abort.wait_for(|aborted| *aborted) => {
                Err(DaqError::Aborted(format!("{}: during {what}", self.name)))
            }
        }
    }
}
