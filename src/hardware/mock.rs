//! Simulated hardware for tests and the demo binary.
//!
//! All mock devices use async-safe operations (`tokio::time::sleep`, never
//! `std::thread::sleep`) and record what was asked of them so tests can assert
//! on ordering.
//!
//! # Available Mocks
//!
//! - `SimMotor` - single axis with a velocity register, move log and failure injection
//! - `MockCommandChannel` - controller link with a command log, latency and failure injection
//! - `SimSignal` - baseline readable that counts its reads
//! - `RecordingTriggerTiming` - records every timing configuration
//! - `MockFlyer` - flyer replaying canned proto-events (e.g. a fly-scanned detector)

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::time::sleep;
use tracing::debug;

use crate::error::AppResult;
use crate::experiment::document::{now_secs, DataKey, ProtoEvent};
use crate::hardware::capabilities::{
    CommandChannel, Flyer, Motor, Readable, Stageable, TriggerTiming,
};
use crate::status::Status;
use crate::trajectory::DerivedTrajectory;
use crate::units::EngineeringUnit;

// =============================================================================
// SimMotor
// =============================================================================

/// One completed (or attempted) move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveRecord {
    pub from: f64,
    pub target: f64,
    pub velocity: f64,
}

#[derive(Debug)]
struct MotorState {
    position: f64,
    velocity: f64,
}

/// Simulated motor axis.
///
/// Moves take `distance / velocity * time_scale` seconds of real time, so a
/// time scale of zero makes every move instantaneous.
///
/// # Example
///
/// ```rust,ignore
/// let motor = SimMotor::new("aerotech_horiz", EngineeringUnit::Micrometer);
/// motor.move_to(10.0).await?;
/// assert_eq!(motor.position().await?, 10.0);
/// ```
#[derive(Debug)]
pub struct SimMotor {
    name: String,
    units: EngineeringUnit,
    limits: (f64, f64),
    precision: u32,
    time_scale: f64,
    state: Mutex<MotorState>,
    moves: Mutex<Vec<MoveRecord>>,
    velocity_writes: Mutex<Vec<f64>>,
    fail_at_move: AtomicUsize,
}

impl SimMotor {
    pub fn new(name: impl Into<String>, units: EngineeringUnit) -> Self {
        Self {
            name: name.into(),
            units,
            limits: (-1.0e6, 1.0e6),
            precision: 4,
            time_scale: 0.0,
            state: Mutex::new(MotorState {
                position: 0.0,
                velocity: 1.0,
            }),
            moves: Mutex::new(Vec::new()),
            velocity_writes: Mutex::new(Vec::new()),
            fail_at_move: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn with_limits(mut self, low: f64, high: f64) -> Self {
        self.limits = (low, high);
        self
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = precision;
        self
    }

    /// Real seconds per simulated second of travel
    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        self.time_scale = time_scale;
        self
    }

    pub fn with_position(self, position: f64) -> Self {
        self.state.lock().position = position;
        self
    }

    pub fn with_velocity(self, velocity: f64) -> Self {
        self.state.lock().velocity = velocity;
        self
    }

    /// Fail the move with this zero-based index (counting all moves so far).
    pub fn inject_failure_at_move(&self, index: usize) {
        self.fail_at_move.store(index, Ordering::SeqCst);
    }

    pub fn moves(&self) -> Vec<MoveRecord> {
        self.moves.lock().clone()
    }

    pub fn move_targets(&self) -> Vec<f64> {
        self.moves.lock().iter().map(|m| m.target).collect()
    }

    /// Every value written to the velocity register, in order
    pub fn velocity_writes(&self) -> Vec<f64> {
        self.velocity_writes.lock().clone()
    }

    pub fn current_position(&self) -> f64 {
        self.state.lock().position
    }

    pub fn current_velocity(&self) -> f64 {
        self.state.lock().velocity
    }
}

#[async_trait]
impl Motor for SimMotor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn move_to(&self, target: f64) -> Result<()> {
        let (low, high) = self.limits;
        if target < low || target > high {
            bail!(
                "{}: target {target} outside soft limits [{low}, {high}]",
                self.name
            );
        }

        let (from, velocity) = {
            let state = self.state.lock();
            (state.position, state.velocity)
        };
        let index = {
            let mut moves = self.moves.lock();
            moves.push(MoveRecord {
                from,
                target,
                velocity,
            });
            moves.len() - 1
        };
        if self.fail_at_move.load(Ordering::SeqCst) == index {
            bail!("{}: simulated following error moving to {target}", self.name);
        }

        let travel = if velocity > 0.0 {
            (target - from).abs() / velocity * self.time_scale
        } else {
            0.0
        };
        debug!(motor = %self.name, from, target, velocity, "SimMotor moving");
        if travel > 0.0 {
            sleep(Duration::from_secs_f64(travel)).await;
        } else {
            tokio::task::yield_now().await;
        }

        self.state.lock().position = target;
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.current_position())
    }

    async fn velocity(&self) -> Result<f64> {
        Ok(self.current_velocity())
    }

    async fn set_velocity(&self, velocity: f64) -> Result<()> {
        if !(velocity.is_finite() && velocity > 0.0) {
            bail!("{}: invalid velocity {velocity}", self.name);
        }
        self.velocity_writes.lock().push(velocity);
        self.state.lock().velocity = velocity;
        Ok(())
    }

    fn units(&self) -> EngineeringUnit {
        self.units
    }

    fn limits(&self) -> (f64, f64) {
        self.limits
    }

    fn precision(&self) -> u32 {
        self.precision
    }
}

// =============================================================================
// MockCommandChannel
// =============================================================================

/// Controller link that acknowledges every command after a fixed latency.
#[derive(Debug, Default)]
pub struct MockCommandChannel {
    latency: Duration,
    commands: Mutex<Vec<String>>,
    should_fail_next: AtomicBool,
}

impl MockCommandChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Inject a failure for the next command
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Acknowledged commands, in the order they were received
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl CommandChannel for MockCommandChannel {
    async fn send(&self, command: &str) -> Result<()> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            bail!("injected failure");
        }
        self.commands.lock().push(command.to_string());
        Ok(())
    }
}

// =============================================================================
// SimSignal
// =============================================================================

/// Scalar baseline signal such as a ring current or an ion chamber.
#[derive(Debug)]
pub struct SimSignal {
    name: String,
    units: String,
    value: f64,
    reads: AtomicUsize,
}

impl SimSignal {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            units: String::new(),
            value,
            reads: AtomicUsize::new(0),
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Readable for SimSignal {
    fn name(&self) -> &str {
        &self.name
    }

    async fn describe(&self) -> Result<Map<String, Value>> {
        let mut keys = Map::new();
        keys.insert(
            self.name.clone(),
            DataKey::scalar(&self.name, &self.units).to_value(),
        );
        Ok(keys)
    }

    async fn read(&self) -> Result<Map<String, Value>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut reading = Map::new();
        reading.insert(
            self.name.clone(),
            json!({"value": self.value, "timestamp": now_secs()}),
        );
        Ok(reading)
    }
}

// =============================================================================
// RecordingTriggerTiming
// =============================================================================

/// What a timing device was asked to do for one flight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingRecord {
    pub num_pulses: usize,
    pub dwell_time: f64,
    pub slew_speed: f64,
}

#[derive(Debug, Default)]
pub struct RecordingTriggerTiming {
    records: Mutex<Vec<TimingRecord>>,
}

impl RecordingTriggerTiming {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TimingRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl TriggerTiming for RecordingTriggerTiming {
    async fn configure(&self, trajectory: &DerivedTrajectory) -> Result<()> {
        self.records.lock().push(TimingRecord {
            num_pulses: trajectory.num_pulses(),
            dwell_time: trajectory.dwell_time,
            slew_speed: trajectory.slew_speed,
        });
        Ok(())
    }
}

// =============================================================================
// MockFlyer
// =============================================================================

/// Flyer that completes immediately and replays a fixed set of proto-events.
///
/// Every lifecycle call is appended to a call log.
#[derive(Debug)]
pub struct MockFlyer {
    name: String,
    units: String,
    events: Vec<ProtoEvent>,
    calls: Mutex<Vec<String>>,
}

impl MockFlyer {
    pub fn new(name: impl Into<String>, events: Vec<ProtoEvent>) -> Self {
        Self {
            name: name.into(),
            units: String::new(),
            events,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// One channel named after the flyer, one event per `(time, value)` pair.
    pub fn with_readings(name: impl Into<String>, readings: &[(f64, f64)]) -> Self {
        let name = name.into();
        let events = readings
            .iter()
            .map(|&(time, value)| ProtoEvent::new(time).with_reading(&name, value, time))
            .collect();
        Self::new(name, events)
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }
}

#[async_trait]
impl Flyer for MockFlyer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn kickoff(&self) -> AppResult<Status> {
        self.record("kickoff");
        Ok(Status::finished())
    }

    async fn complete(&self) -> AppResult<Status> {
        self.record("complete");
        Ok(Status::finished())
    }

    async fn collect(&self) -> AppResult<Vec<ProtoEvent>> {
        self.record("collect");
        Ok(self.events.clone())
    }

    async fn describe_collect(&self) -> AppResult<Map<String, Value>> {
        let mut positions = Map::new();
        let channels = self.events.first().map(|event| {
            event
                .channels()
                .map(str::to_string)
                .collect::<Vec<String>>()
        });
        for channel in channels.unwrap_or_else(|| vec![self.name.clone()]) {
            positions.insert(
                channel.clone(),
                DataKey::scalar(&self.name, &self.units).to_value(),
            );
        }
        let mut schema = Map::new();
        schema.insert("positions".to_string(), Value::Object(positions));
        Ok(schema)
    }
}

#[async_trait]
impl Stageable for MockFlyer {
    async fn stage(&self) -> AppResult<()> {
        self.record("stage");
        Ok(())
    }

    async fn unstage(&self) -> AppResult<()> {
        self.record("unstage");
        Ok(())
    }
}
