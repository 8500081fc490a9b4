//! Position Synchronized Output (PSO) programming for Aerotech controllers.
//!
//! Commands are planned as [`PsoCommand`] values and only rendered to the
//! controller's ASCII syntax when sent. Every command is awaited before the
//! next one goes out.
//!
//! Wire format, for axis `@0`, encoder input 6, output 1:
//!
//! ```text
//! PSOCONTROL @0 RESET
//! PSOOUTPUT @0 CONTROL 1
//! PSOPULSE @0 TIME 20,10
//! PSOOUTPUT @0 PULSE WINDOW MASK
//! PSOTRACK @0 INPUT 6
//! PSODISTANCE @0 FIXED 50
//! PSOWINDOW @0 1 INPUT 6
//! PSOWINDOW @0 1 RANGE -5,10000
//! PSOCONTROL @0 ARM
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::CommandChannel;
use crate::trajectory::DerivedTrajectory;

/// Total pulse period in microseconds
pub const PULSE_PERIOD_US: u32 = 20;
/// Pulse high time in microseconds
pub const PULSE_ON_US: u32 = 10;
/// Largest allowed taxi distance, in steps, when pulses cannot be masked
pub const UNMASKED_TAXI_LIMIT: f64 = 1.1;

/// One PSO instruction, independent of the axis it targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsoCommand {
    Reset,
    /// Route the output to an I/O terminal
    OutputControl { output: u32 },
    PulseTime { period_us: u32, on_us: u32 },
    /// Pulse on every distance match
    OutputPulse,
    /// Pulse only while the encoder is inside the window
    OutputPulseWindowMask,
    TrackInput { encoder: u32 },
    DistanceFixed { counts: i64 },
    WindowInput { window: u32, encoder: u32 },
    WindowRange { window: u32, low: i64, high: i64 },
    Arm,
    Off,
}

impl PsoCommand {
    /// Bind this command to a controller axis for sending.
    pub fn on_axis(self, axis: &str) -> AxisCommand<'_> {
        AxisCommand {
            axis,
            command: self,
        }
    }
}

/// A [`PsoCommand`] addressed to an axis; `Display` gives the wire string.
#[derive(Debug, Clone, Copy)]
pub struct AxisCommand<'a> {
    axis: &'a str,
    command: PsoCommand,
}

impl fmt::Display for AxisCommand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let axis = self.axis;
        match self.command {
            PsoCommand::Reset => write!(f, "PSOCONTROL {axis} RESET"),
            PsoCommand::OutputControl { output } => write!(f, "PSOOUTPUT {axis} CONTROL {output}"),
            PsoCommand::PulseTime { period_us, on_us } => {
                write!(f, "PSOPULSE {axis} TIME {period_us},{on_us}")
            }
            PsoCommand::OutputPulse => write!(f, "PSOOUTPUT {axis} PULSE"),
            PsoCommand::OutputPulseWindowMask => write!(f, "PSOOUTPUT {axis} PULSE WINDOW MASK"),
            PsoCommand::TrackInput { encoder } => write!(f, "PSOTRACK {axis} INPUT {encoder}"),
            PsoCommand::DistanceFixed { counts } => write!(f, "PSODISTANCE {axis} FIXED {counts}"),
            PsoCommand::WindowInput { window, encoder } => {
                write!(f, "PSOWINDOW {axis} {window} INPUT {encoder}")
            }
            PsoCommand::WindowRange { window, low, high } => {
                write!(f, "PSOWINDOW {axis} {window} RANGE {low},{high}")
            }
            PsoCommand::Arm => write!(f, "PSOCONTROL {axis} ARM"),
            PsoCommand::Off => write!(f, "PSOCONTROL {axis} OFF"),
        }
    }
}

/// Without window masking every distance match pulses, including during
/// taxi. Refuse flights whose run-up or run-out is longer than about one step.
pub fn check_unmasked_taxi(trajectory: &DerivedTrajectory) -> AppResult<()> {
    let limit = UNMASKED_TAXI_LIMIT * trajectory.step_size;
    for (label, distance) in [
        ("run-up", trajectory.taxi_run_up()),
        ("run-out", trajectory.taxi_run_out()),
    ] {
        if distance > limit {
            return Err(DaqError::InvalidScanParameters(format!(
                "encoder window {}..{} is outside the controller range and the taxi {label} \
                 ({distance}) exceeds {UNMASKED_TAXI_LIMIT} x step size ({limit}); \
                 unmasked pulses would fire during taxi",
                trajectory.encoder_window_start, trajectory.encoder_window_end
            )));
        }
    }
    Ok(())
}

/// Pulse generator on one controller axis.
pub struct PsoController {
    axis: String,
    encoder: u32,
    output: u32,
    channel: Arc<dyn CommandChannel>,
    command_timeout: Duration,
}

impl fmt::Debug for PsoController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PsoController")
            .field("axis", &self.axis)
            .field("encoder", &self.encoder)
            .field("output", &self.output)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl PsoController {
    pub fn new(axis: impl Into<String>, encoder: u32, channel: Arc<dyn CommandChannel>) -> Self {
        Self {
            axis: axis.into(),
            encoder,
            output: 1,
            channel,
            command_timeout: Duration::from_secs(5),
        }
    }

    /// Output terminal, also used as the window number.
    pub fn with_output(mut self, output: u32) -> Self {
        self.output = output;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn axis(&self) -> &str {
        &self.axis
    }

    pub fn encoder(&self) -> u32 {
        self.encoder
    }

    /// Commands that program the generator for `trajectory`, without arming.
    pub fn enable_sequence(&self, trajectory: &DerivedTrajectory) -> AppResult<Vec<PsoCommand>> {
        if !trajectory.encoder_use_window {
            check_unmasked_taxi(trajectory)?;
        }

        let mut commands = vec![
            PsoCommand::Reset,
            PsoCommand::OutputControl {
                output: self.output,
            },
            PsoCommand::PulseTime {
                period_us: PULSE_PERIOD_US,
                on_us: PULSE_ON_US,
            },
        ];
        if trajectory.encoder_use_window {
            commands.push(PsoCommand::OutputPulseWindowMask);
        } else {
            commands.push(PsoCommand::OutputPulse);
        }
        commands.push(PsoCommand::TrackInput {
            encoder: self.encoder,
        });
        commands.push(PsoCommand::DistanceFixed {
            counts: trajectory.encoder_step_size,
        });
        if trajectory.encoder_use_window {
            let (start, end) = (
                trajectory.encoder_window_start,
                trajectory.encoder_window_end,
            );
            commands.push(PsoCommand::WindowInput {
                window: self.output,
                encoder: self.encoder,
            });
            commands.push(PsoCommand::WindowRange {
                window: self.output,
                low: start.min(end),
                high: start.max(end),
            });
        }
        Ok(commands)
    }

    /// Program the generator. Fails before sending anything when the flight
    /// cannot be flown safely without window masking.
    pub async fn enable(&self, trajectory: &DerivedTrajectory) -> AppResult<()> {
        let commands = self.enable_sequence(trajectory)?;
        if !trajectory.encoder_use_window {
            warn!(
                axis = %self.axis,
                window_start = trajectory.encoder_window_start,
                window_end = trajectory.encoder_window_end,
                "Encoder window outside controller range, pulsing unmasked"
            );
        }
        for command in commands {
            self.send(command).await?;
        }
        info!(
            axis = %self.axis,
            step_counts = trajectory.encoder_step_size,
            "PSO enabled"
        );
        Ok(())
    }

    pub async fn arm(&self) -> AppResult<()> {
        self.send(PsoCommand::Arm).await
    }

    pub async fn disable(&self) -> AppResult<()> {
        self.send(PsoCommand::Off).await
    }

    async fn send(&self, command: PsoCommand) -> AppResult<()> {
        let line = command.on_axis(&self.axis).to_string();
        debug!(axis = %self.axis, command = %line, "PSO command");
        tokio::time::timeout(self.command_timeout, self.channel.send(&line))
            .await
            .map_err(|_| DaqError::ConnectionTimeout {
                device: format!("PSO {}", self.axis),
                timeout_ms: self.command_timeout.as_millis() as u64,
            })?
            .map_err(|e| DaqError::Command(format!("'{line}': {e}")))
    }
}
