//! Hardware abstraction layer.
//!
//! - [`capabilities`]: async traits devices implement (`Motor`, `Readable`, `Flyer`, ...)
//! - [`pso`]: Aerotech position-synchronized-output programming
//! - [`mock`]: simulated devices for tests and the demo binary

pub mod capabilities;
pub mod mock;
pub mod pso;

pub use capabilities::{
    CommandChannel, Flyer, FlyingDevice, Motor, Readable, Stageable, TriggerTiming,
};
pub use pso::{PsoCommand, PsoController};
