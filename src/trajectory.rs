//! Fly-scan trajectory planning.
//!
//! Turns a user-level scan request (start, end, step, dwell) into everything the
//! motion controller needs to fly it: taxi positions that leave room to reach
//! slew speed, the pulse spacing in encoder counts, the encoder window that
//! masks pulses outside the scan, and the motor positions of every pixel
//! center.
//!
//! ```text
//!  taxi_start   pso_start                               pso_end    taxi_end
//!      |  run-up  |  pulse | pulse | pulse | ... | pulse  |  run-out  |
//!      |--------->|<----- encoder window (+/- 5 counts) ->|---------->|
//!                     ^pixel    ^pixel   ^pixel     ^pixel
//! ```
//!
//! The planner is pure: no I/O, no clocks, and identical inputs always give a
//! bit-identical [`DerivedTrajectory`].

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::units::{from_encoder_counts, to_encoder_counts};

/// Encoder counts added to each end of the window, in the direction of travel.
pub const WINDOW_BUFFER_COUNTS: i64 = 5;

/// Multiplier applied to the ideal acceleration distance.
pub const TAXI_SAFETY_FACTOR: f64 = 1.5;

/// Largest magnitude a 24-bit signed window counter can hold.
pub const DEFAULT_WINDOW_LIMIT: i64 = 8_388_607;

/// Most pulses a single flight may request.
pub const MAX_PULSES: usize = 1_000_000;

/// User-supplied inputs for one fly scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanParameters {
    /// Center of the first pixel, in motor engineering units
    pub start_position: f64,
    /// Center of the last pixel, in motor engineering units
    pub end_position: f64,
    /// Desired distance between pixel centers
    pub step_size: f64,
    /// Seconds spent traversing each pixel
    pub dwell_time: f64,
    /// Seconds the motor takes to reach slew speed
    pub acceleration_time: f64,
    /// Motor distance per encoder count
    pub encoder_resolution: f64,
    /// +1 or -1
    pub motor_direction: i32,
    /// +1 when encoder counts increase with positive user motion, else -1
    pub encoder_direction: i32,
}

impl Default for ScanParameters {
    fn default() -> Self {
        Self {
            start_position: 0.0,
            end_position: 0.0,
            step_size: 0.0,
            dwell_time: 0.0,
            acceleration_time: 0.0,
            encoder_resolution: 0.0,
            motor_direction: 1,
            encoder_direction: 1,
        }
    }
}

impl ScanParameters {
    /// Check that a trajectory can be derived from these parameters.
    pub fn check_computable(&self) -> AppResult<()> {
        for (name, value) in [
            ("start_position", self.start_position),
            ("end_position", self.end_position),
            ("step_size", self.step_size),
            ("dwell_time", self.dwell_time),
            ("acceleration_time", self.acceleration_time),
            ("encoder_resolution", self.encoder_resolution),
        ] {
            if !value.is_finite() {
                return Err(DaqError::DegenerateParameters(format!(
                    "{name} must be finite, got {value}"
                )));
            }
        }
        if self.dwell_time == 0.0 {
            return Err(DaqError::DegenerateParameters("dwell_time is zero".into()));
        }
        if self.encoder_resolution == 0.0 {
            return Err(DaqError::DegenerateParameters(
                "encoder_resolution is zero".into(),
            ));
        }
        if self.acceleration_time <= 0.0 {
            return Err(DaqError::DegenerateParameters(format!(
                "acceleration_time must be positive, got {}",
                self.acceleration_time
            )));
        }
        if self.step_size <= 0.0 {
            return Err(DaqError::DegenerateParameters(format!(
                "step_size must be positive, got {}",
                self.step_size
            )));
        }
        for (name, value) in [
            ("motor_direction", self.motor_direction),
            ("encoder_direction", self.encoder_direction),
        ] {
            if value != 1 && value != -1 {
                return Err(DaqError::DegenerateParameters(format!(
                    "{name} must be +1 or -1, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Range of encoder counts the controller's window comparator supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderWindowLimits {
    pub min: i64,
    pub max: i64,
}

impl Default for EncoderWindowLimits {
    fn default() -> Self {
        Self {
            min: -DEFAULT_WINDOW_LIMIT,
            max: DEFAULT_WINDOW_LIMIT,
        }
    }
}

impl EncoderWindowLimits {
    /// Strictly inside the supported range.
    pub fn contains(&self, counts: i64) -> bool {
        self.min < counts && counts < self.max
    }
}

/// Everything derived from [`ScanParameters`] for one flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedTrajectory {
    /// Sign of travel in user coordinates
    pub direction: i32,
    /// Sign of travel in encoder counts
    pub overall_sense: i32,
    pub step_size: f64,
    pub dwell_time: f64,
    pub encoder_resolution: f64,
    pub encoder_direction: i32,
    /// Encoder counts between pulses
    pub encoder_step_size: i64,
    pub pso_start: f64,
    pub pso_end: f64,
    pub slew_speed: f64,
    pub motor_accel: f64,
    pub taxi_start: f64,
    pub taxi_end: f64,
    /// Window bounds in counts relative to `pso_start`
    pub encoder_window_start: i64,
    pub encoder_window_end: i64,
    /// False when the window falls outside the controller's range
    pub encoder_use_window: bool,
    /// Pulse positions in counts relative to `pso_start`
    pub encoder_pso_positions: Vec<i64>,
    /// Pulse positions in motor units
    pub pso_positions: Vec<f64>,
    /// Pixel centers in motor units, one fewer than pulses
    pub pixel_positions: Vec<f64>,
}

impl DerivedTrajectory {
    pub fn num_pulses(&self) -> usize {
        self.pso_positions.len()
    }

    /// Distance covered before the first pulse.
    pub fn taxi_run_up(&self) -> f64 {
        (self.taxi_start - self.pso_start).abs()
    }

    /// Distance covered after the last pulse.
    pub fn taxi_run_out(&self) -> f64 {
        (self.taxi_end - self.pso_end).abs()
    }

    /// Time between leaving the taxi position and the center of the first
    /// pixel (and, symmetrically, between the last pixel and landing).
    pub fn extra_taxi_time(&self) -> f64 {
        (self.taxi_run_up() / 2.0) / self.slew_speed + self.dwell_time / 2.0
    }

    /// Wall-clock time of each pixel center for a flight that left the taxi
    /// position at `fly_start` and landed at `fly_end` (seconds since epoch).
    pub fn pixel_timestamps(&self, fly_start: f64, fly_end: f64) -> Vec<f64> {
        let extra = self.extra_taxi_time();
        linspace(
            fly_start + extra,
            fly_end - extra,
            self.pixel_positions.len(),
        )
    }
}

/// Derives [`DerivedTrajectory`] values for a controller with a given window range.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrajectoryPlanner {
    limits: EncoderWindowLimits,
}

impl TrajectoryPlanner {
    pub fn new(limits: EncoderWindowLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> EncoderWindowLimits {
        self.limits
    }

    /// Compute the full trajectory.
    ///
    /// Returns `DegenerateParameters` when the inputs cannot describe a flight
    /// (non-finite inputs, zero dwell, zero resolution, non-positive
    /// acceleration time, a step smaller than one encoder count, or more than
    /// [`MAX_PULSES`] pulses). Nothing is allocated before these checks pass.
    pub fn derive(&self, params: &ScanParameters) -> AppResult<DerivedTrajectory> {
        params.check_computable()?;

        let resolution = params.encoder_resolution;
        let encoder_direction = params.encoder_direction;
        let step_size = params.step_size;

        let direction: i32 = if params.start_position < params.end_position {
            1
        } else {
            -1
        };
        let overall_sense = direction * encoder_direction;
        let dir = f64::from(direction);

        let encoder_step_size = (step_size / resolution).floor() as i64;
        if encoder_step_size < 1 {
            return Err(DaqError::DegenerateParameters(format!(
                "step_size {step_size} is smaller than one encoder count ({resolution})"
            )));
        }
        let step_counts = encoder_step_size as f64;

        // Pulses sit half a step outside each pixel center
        let pso_start = params.start_position - dir * step_size / 2.0;
        let pso_end = params.end_position + dir * step_size / 2.0;

        let slew_speed = step_size / params.dwell_time;
        let motor_accel = slew_speed / params.acceleration_time;
        let taxi_distance = TAXI_SAFETY_FACTOR * slew_speed.powi(2) / (2.0 * motor_accel);

        // Snap both taxi positions to whole pulses, always away from the window
        let start_offset = to_encoder_counts(-dir * taxi_distance, resolution, encoder_direction)
            / step_counts;
        let start_offset = if overall_sense > 0 {
            start_offset.floor()
        } else {
            start_offset.ceil()
        };
        let taxi_start =
            pso_start + from_encoder_counts(start_offset * step_counts, resolution, encoder_direction);

        let end_offset =
            to_encoder_counts(dir * taxi_distance, resolution, encoder_direction) / step_counts;
        let end_offset = if overall_sense > 0 {
            end_offset.ceil()
        } else {
            end_offset.floor()
        };
        let taxi_end =
            pso_end + from_encoder_counts(end_offset * step_counts, resolution, encoder_direction);

        // Window counts are referenced to where the PSO is armed (pso_start)
        let encoder_distance = to_encoder_counts(pso_end - pso_start, resolution, encoder_direction);
        if !(encoder_distance.is_finite() && taxi_start.is_finite() && taxi_end.is_finite()) {
            return Err(DaqError::DegenerateParameters(format!(
                "scan from {} to {} overflows the encoder range",
                params.start_position, params.end_position
            )));
        }
        let pulses = (encoder_distance.abs() / step_counts).ceil() + 1.0;
        if pulses > MAX_PULSES as f64 {
            return Err(DaqError::DegenerateParameters(format!(
                "scan needs {pulses} pulses, more than the limit of {MAX_PULSES}"
            )));
        }
        let sense = i64::from(overall_sense);
        let encoder_window_start = -sense * WINDOW_BUFFER_COUNTS;
        let encoder_window_end = encoder_distance.round() as i64 + sense * WINDOW_BUFFER_COUNTS;
        let encoder_use_window = self.limits.contains(encoder_window_start)
            && self.limits.contains(encoder_window_end);

        let pulse_step = encoder_step_size * sense;
        let encoder_pso_positions = arange_counts(
            pulse_step,
            encoder_distance + 0.5 * pulse_step as f64,
            pulses as usize,
        );
        let pso_positions: Vec<f64> = encoder_pso_positions
            .iter()
            .map(|&counts| {
                pso_start + from_encoder_counts(counts as f64, resolution, encoder_direction)
            })
            .collect();
        let pixel_positions = pso_positions
            .windows(2)
            .map(|pair| (pair[0] + pair[1]) / 2.0)
            .collect();

        Ok(DerivedTrajectory {
            direction,
            overall_sense,
            step_size,
            dwell_time: params.dwell_time,
            encoder_resolution: resolution,
            encoder_direction,
            encoder_step_size,
            pso_start,
            pso_end,
            slew_speed,
            motor_accel,
            taxi_start,
            taxi_end,
            encoder_window_start,
            encoder_window_end,
            encoder_use_window,
            encoder_pso_positions,
            pso_positions,
            pixel_positions,
        })
    }
}

/// `0, step, 2*step, ...` strictly before `limit`.
fn arange_counts(step: i64, limit: f64, capacity: usize) -> Vec<i64> {
    let mut positions = Vec::with_capacity(capacity);
    let mut counts: i64 = 0;
    loop {
        let value = counts as f64;
        let inside = if step > 0 { value < limit } else { value > limit };
        if !inside {
            break;
        }
        positions.push(counts);
        counts += step;
    }
    positions
}

fn linspace(first: f64, last: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![first],
        _ => {
            let delta = (last - first) / (num - 1) as f64;
            (0..num).map(|i| first + delta * i as f64).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn reverse_scan() -> ScanParameters {
        ScanParameters {
            start_position: 20.0,
            end_position: 10.0,
            step_size: 0.1,
            dwell_time: 1.0,
            acceleration_time: 0.5,
            encoder_resolution: 0.001,
            motor_direction: 1,
            encoder_direction: 1,
        }
    }

    fn forward_scan() -> ScanParameters {
        ScanParameters {
            start_position: -1.0,
            end_position: 1.0,
            step_size: 0.0625,
            dwell_time: 0.0625,
            acceleration_time: 0.25,
            encoder_resolution: 0.0078125,
            motor_direction: 1,
            encoder_direction: 1,
        }
    }

    #[test]
    fn test_reverse_scan_parameters() {
        let traj = TrajectoryPlanner::default().derive(&reverse_scan()).unwrap();

        assert_eq!(traj.direction, -1);
        assert_eq!(traj.overall_sense, -1);
        assert!(approx(traj.slew_speed, 0.1));
        assert!(approx(traj.motor_accel, 0.2));
        assert_eq!(traj.encoder_step_size, 100);
        assert!(approx(traj.pso_start, 20.05));
        assert!(approx(traj.pso_end, 9.95));
        // 1.5 * v^2 / 2a = 0.0375, snapped out to one whole pulse (0.1)
        assert!(approx(traj.taxi_start, 20.15));
        assert!(approx(traj.taxi_end, 9.85));
        assert_eq!(traj.encoder_window_start, 5);
        assert_eq!(traj.encoder_window_end, -10105);
        assert!(traj.encoder_use_window);
    }

    #[test]
    fn test_pulses_and_pixels() {
        let traj = TrajectoryPlanner::default().derive(&reverse_scan()).unwrap();

        assert_eq!(traj.num_pulses(), 102);
        assert_eq!(traj.pixel_positions.len(), traj.num_pulses() - 1);
        assert_eq!(traj.encoder_pso_positions[0], 0);
        assert!(traj
            .encoder_pso_positions
            .windows(2)
            .all(|pair| pair[1] - pair[0] == -100));
        assert!(approx(traj.pso_positions[0], traj.pso_start));
        assert!(approx(traj.pixel_positions[0], 20.0));
        assert!(approx(*traj.pixel_positions.last().unwrap(), 10.0));
    }

    #[test]
    fn test_forward_pixel_count() {
        let params = forward_scan();
        let traj = TrajectoryPlanner::default().derive(&params).unwrap();
        let requested =
            ((params.end_position - params.start_position) / params.step_size).round() as i64;

        assert_eq!(
            traj.encoder_step_size,
            (params.step_size / params.encoder_resolution).floor() as i64
        );
        let pixels = traj.pixel_positions.len() as i64;
        assert!((pixels - requested).abs() <= 1, "{pixels} vs {requested}");
        assert!(traj.taxi_start < traj.pso_start);
        assert!(traj.taxi_end > traj.pso_end);
    }

    #[test]
    fn test_taxi_snapped_to_whole_pulses() {
        for params in [forward_scan(), reverse_scan()] {
            let traj = TrajectoryPlanner::default().derive(&params).unwrap();
            let pulses = traj.taxi_run_up() / traj.encoder_resolution
                / traj.encoder_step_size as f64;
            assert!((pulses - pulses.round()).abs() < 1e-6);
            // Never shorter than the safety-margin run-up
            let needed = TAXI_SAFETY_FACTOR * traj.slew_speed.powi(2) / (2.0 * traj.motor_accel);
            assert!(traj.taxi_run_up() + 1e-12 >= needed);
            assert!(traj.taxi_run_out() + 1e-12 >= needed);
        }
    }

    #[test]
    fn test_inverted_encoder() {
        let params = ScanParameters {
            encoder_direction: -1,
            ..forward_scan()
        };
        let traj = TrajectoryPlanner::default().derive(&params).unwrap();

        assert_eq!(traj.direction, 1);
        assert_eq!(traj.overall_sense, -1);
        assert_eq!(traj.encoder_window_start, 5);
        assert!(traj.encoder_window_end < 0);
        assert!(traj.taxi_start < traj.pso_start);
        assert!(traj.taxi_end > traj.pso_end);
        // Pulses still march forward in user coordinates
        assert!(traj.pso_positions.windows(2).all(|p| p[1] > p[0]));
    }

    #[test]
    fn test_window_outside_controller_range() {
        let planner = TrajectoryPlanner::new(EncoderWindowLimits { min: -1000, max: 1000 });
        let traj = planner.derive(&reverse_scan()).unwrap();
        assert!(!traj.encoder_use_window);
    }

    #[test]
    fn test_degenerate_parameters() {
        let planner = TrajectoryPlanner::default();
        for params in [
            ScanParameters {
                dwell_time: 0.0,
                ..reverse_scan()
            },
            ScanParameters {
                encoder_resolution: 0.0,
                ..reverse_scan()
            },
            ScanParameters {
                acceleration_time: 0.0,
                ..reverse_scan()
            },
            ScanParameters {
                acceleration_time: -1.0,
                ..reverse_scan()
            },
            ScanParameters {
                step_size: 0.0001,
                ..reverse_scan()
            },
        ] {
            assert!(matches!(
                planner.derive(&params),
                Err(DaqError::DegenerateParameters(_))
            ));
        }
    }

    #[test]
    fn test_non_finite_inputs_are_degenerate() {
        let planner = TrajectoryPlanner::default();
        for params in [
            ScanParameters {
                end_position: f64::INFINITY,
                ..reverse_scan()
            },
            ScanParameters {
                start_position: f64::NAN,
                ..reverse_scan()
            },
            ScanParameters {
                step_size: f64::INFINITY,
                ..reverse_scan()
            },
        ] {
            assert!(matches!(
                planner.derive(&params),
                Err(DaqError::DegenerateParameters(msg)) if msg.contains("finite")
            ));
        }
    }

    #[test]
    fn test_pulse_count_limit() {
        let planner = TrajectoryPlanner::default();
        // 1e6 mm at 0.001 mm per pixel would be a billion pulses
        let params = ScanParameters {
            start_position: 0.0,
            end_position: 1.0e6,
            step_size: 0.001,
            encoder_resolution: 1.0e-6,
            ..reverse_scan()
        };
        assert!(matches!(
            planner.derive(&params),
            Err(DaqError::DegenerateParameters(msg)) if msg.contains("pulses")
        ));

        // Huge but finite inputs whose count distance overflows
        let params = ScanParameters {
            start_position: -1.0e300,
            end_position: 1.0e300,
            step_size: 1.0e300,
            encoder_resolution: 1.0e-300,
            ..reverse_scan()
        };
        assert!(planner.derive(&params).is_err());
    }

    #[test]
    fn test_derive_is_deterministic() {
        let planner = TrajectoryPlanner::default();
        let a = planner.derive(&reverse_scan()).unwrap();
        let b = planner.derive(&reverse_scan()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.taxi_start.to_bits(), b.taxi_start.to_bits());
    }

    #[test]
    fn test_pixel_timestamps() {
        let traj = TrajectoryPlanner::default().derive(&reverse_scan()).unwrap();
        // run-up 0.1 / 2 / 0.1 mm/s + 1 s / 2 = 1.0 s
        assert!(approx(traj.extra_taxi_time(), 1.0));

        let times = traj.pixel_timestamps(1000.0, 1103.0);
        assert_eq!(times.len(), traj.pixel_positions.len());
        assert!(approx(times[0], 1001.0));
        assert!(approx(*times.last().unwrap(), 1102.0));
        assert!(times.windows(2).all(|t| t[1] > t[0]));
    }

    #[test]
    fn test_linspace_edges() {
        assert!(linspace(0.0, 1.0, 0).is_empty());
        assert_eq!(linspace(3.0, 9.0, 1), vec![3.0]);
        assert_eq!(linspace(0.0, 1.0, 3), vec![0.0, 0.5, 1.0]);
    }
}
