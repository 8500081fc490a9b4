//! Experiment orchestration.
//!
//! - **Documents**: the structured stream a run emits (Start, Descriptor, Event, Stop)
//! - **Collector**: merges per-flyer events into one composite stream
//! - **Plans**: declarative runs that drive devices and emit documents

pub mod collector;
pub mod document;
pub mod plans;

pub use collector::{Collection, FlyerCollector, PRIMARY_STREAM};
pub use document::{DataKey, DescriptorDoc, Document, EventDoc, ProtoEvent, StartDoc, StopDoc};
pub use plans::{FlyScan, Plan, RunSummary};
