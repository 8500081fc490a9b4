//! Hardware capability traits for fly scanning.
//!
//! Devices implement the small traits they actually support instead of one
//! monolithic device trait. A flying stage is a [`Motor`] composed with a
//! [`Flyer`] capability; a baseline detector is only [`Readable`].
//!
//! Hardware-facing traits (`Motor`, `Readable`, `CommandChannel`,
//! `TriggerTiming`) are async, `Send + Sync`, and return `anyhow::Result`.
//! The scan-facing traits (`Flyer`, `Stageable`) return [`AppResult`] so plans
//! can classify failures.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::AppResult;
use crate::experiment::document::ProtoEvent;
use crate::status::Status;
use crate::trajectory::DerivedTrajectory;
use crate::units::EngineeringUnit;

/// Capability: single-axis motion.
///
/// `move_to` resolves once the axis is in position; the velocity register is
/// shared state and applies to every subsequent move.
#[async_trait]
pub trait Motor: Send + Sync {
    fn name(&self) -> &str;

    /// Move to an absolute position and wait for completion.
    async fn move_to(&self, position: f64) -> Result<()>;

    async fn position(&self) -> Result<f64>;

    async fn velocity(&self) -> Result<f64>;

    async fn set_velocity(&self, velocity: f64) -> Result<()>;

    fn units(&self) -> EngineeringUnit;

    /// Soft limits `(low, high)` in engineering units
    fn limits(&self) -> (f64, f64);

    /// Display precision in decimal places
    fn precision(&self) -> u32;
}

/// Capability: readable signal (baseline detectors, monitors).
///
/// `describe` returns channel -> serialized `DataKey`. `read` returns
/// channel -> `{"value": v, "timestamp": t}`. Both maps keep device order.
#[async_trait]
pub trait Readable: Send + Sync {
    fn name(&self) -> &str;

    async fn describe(&self) -> Result<Map<String, Value>>;

    async fn read(&self) -> Result<Map<String, Value>>;
}

/// Capability: ASCII command link to a motion controller.
///
/// `send` resolves once the controller acknowledges the command.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn send(&self, command: &str) -> Result<()>;
}

/// Capability: auxiliary timing hardware (detector gates, delay generators)
/// configured once the flight is known.
#[async_trait]
pub trait TriggerTiming: Send + Sync {
    async fn configure(&self, trajectory: &DerivedTrajectory) -> Result<()>;
}

/// Capability: continuous-motion acquisition.
///
/// `kickoff` and `complete` return immediately; the returned [`Status`] is the
/// only thing callers wait on.
#[async_trait]
pub trait Flyer: Send + Sync {
    fn name(&self) -> &str;

    async fn kickoff(&self) -> AppResult<Status>;

    async fn complete(&self) -> AppResult<Status>;

    /// Proto-events for the last flight, in acquisition order.
    async fn collect(&self) -> AppResult<Vec<ProtoEvent>>;

    /// Stream name -> channel -> data key.
    async fn describe_collect(&self) -> AppResult<Map<String, Value>>;
}

/// Capability: scan-scoped setup and teardown.
#[async_trait]
pub trait Stageable: Send + Sync {
    async fn stage(&self) -> AppResult<()>;

    /// Must be safe to call after a failed or aborted scan.
    async fn unstage(&self) -> AppResult<()>;
}

/// A device that can be flown in a fly scan.
pub trait FlyingDevice: Flyer + Stageable {}

impl<T: Flyer + Stageable> FlyingDevice for T {}
