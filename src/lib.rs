//! Fly-scan trajectory engine.
//!
//! Drives continuous ("fly") scans on an Aerotech stage: the trajectory
//! planner turns scan inputs into taxi, pulse and pixel geometry, the PSO
//! controller programs the position-synchronized pulse output, the flyer
//! state machine runs taxi and flight on a background task, and the collector
//! merges per-flyer readings into one event stream.
//!
//! ```text
//! config ──> instrument::AerotechFlyer ──> hardware::{Motor, PsoController}
//!                  │
//!                  └─> trajectory::TrajectoryPlanner
//! experiment::FlyScan ──> experiment::FlyerCollector ──> Document stream
//! ```

pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod instrument;
pub mod observable;
pub mod status;
pub mod trajectory;
pub mod units;

pub use error::{AppResult, DaqError};
