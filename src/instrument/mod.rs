//! Concrete instruments and the device registry.

pub mod aerotech;
pub mod registry;

pub use aerotech::{AerotechFlyer, FlightLog, FlyerState, ScanParameter};
pub use registry::{DeviceHandle, InstrumentRegistry};
