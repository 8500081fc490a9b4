//! Beamline configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/beamline.toml` by default)
//! 2. Environment variables (prefixed with `BEAMLINE_`)
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! BEAMLINE_APPLICATION__LOG_LEVEL=debug
//! BEAMLINE_CONTROLLER__MOVE_TIMEOUT_MS=120000
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "fly-scan"
//! log_level = "info"
//!
//! [controller]
//! command_timeout_ms = 5000
//!
//! [[flyers]]
//! name = "aerotech_horiz"
//! axis = "@0"
//! encoder = 6
//! units = "mm"
//! encoder_resolution = 0.001
//! # encoder_resolution_units = "nm"   # when not in `units`
//! acceleration_time = 0.5
//! limits = [-50.0, 50.0]
//!
//! [[baseline]]
//! name = "ring_current"
//! units = "mA"
//! ```

use std::collections::HashSet;
use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::trajectory::{EncoderWindowLimits, DEFAULT_WINDOW_LIMIT};
use crate::units::{convert, EngineeringUnit};

/// Top-level beamline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BeamlineConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    /// Fly-scanning axes
    pub flyers: Vec<FlyerConfig>,
    /// Signals read once per collection and attached to every event
    #[serde(default)]
    pub baseline: Vec<BaselineSignalConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

/// Motion controller settings shared by every axis
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    /// Lowest encoder count the PSO window hardware accepts
    #[serde(default = "default_window_min")]
    pub encoder_window_min: i64,
    #[serde(default = "default_window_max")]
    pub encoder_window_max: i64,
    /// Timeout for a single controller command acknowledgement
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// Timeout for a blocking move
    #[serde(default = "default_move_timeout")]
    pub move_timeout_ms: u64,
    /// PSO output selector (the controller's "num axis" argument)
    #[serde(default = "default_pso_output")]
    pub pso_output_axis: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            encoder_window_min: default_window_min(),
            encoder_window_max: default_window_max(),
            command_timeout_ms: default_command_timeout(),
            move_timeout_ms: default_move_timeout(),
            pso_output_axis: default_pso_output(),
        }
    }
}

impl ControllerConfig {
    pub fn window_limits(&self) -> EncoderWindowLimits {
        EncoderWindowLimits {
            min: self.encoder_window_min,
            max: self.encoder_window_max,
        }
    }
}

/// One fly-scanning axis
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlyerConfig {
    /// Unique device name, also the data channel name
    pub name: String,
    /// Controller axis (e.g., "@0")
    pub axis: String,
    /// Encoder input the PSO tracks
    pub encoder: u32,
    /// Motor record units (e.g., "mm", "um", "deg")
    #[serde(default = "default_units")]
    pub units: String,
    /// Distance per encoder count
    pub encoder_resolution: f64,
    /// Units of `encoder_resolution` when they differ from `units` (e.g., "nm")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoder_resolution_units: Option<String>,
    #[serde(default = "default_direction")]
    pub encoder_direction: i32,
    #[serde(default = "default_direction")]
    pub motor_direction: i32,
    /// Seconds to reach slew speed
    #[serde(default = "default_acceleration_time")]
    pub acceleration_time: f64,
    /// Soft limits `[low, high]` in motor units
    #[serde(default)]
    pub limits: Option<(f64, f64)>,
    #[serde(default = "default_precision")]
    pub precision: u32,
    /// Whether a connection failure aborts startup
    #[serde(default = "default_required")]
    pub required: bool,
}

impl FlyerConfig {
    pub fn engineering_units(&self) -> AppResult<EngineeringUnit> {
        self.units.parse()
    }

    /// Encoder resolution converted into `units`.
    pub fn resolution_in(&self, units: EngineeringUnit) -> AppResult<f64> {
        let from = match &self.encoder_resolution_units {
            Some(resolution_units) => resolution_units.parse()?,
            None => self.engineering_units()?,
        };
        convert(self.encoder_resolution, from, units)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BaselineSignalConfig {
    pub name: String,
    #[serde(default)]
    pub units: String,
    /// Value reported by the simulated signal
    #[serde(default)]
    pub sim_value: f64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "fly-scan".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_window_min() -> i64 {
    -DEFAULT_WINDOW_LIMIT
}

fn default_window_max() -> i64 {
    DEFAULT_WINDOW_LIMIT
}

fn default_command_timeout() -> u64 {
    5000
}

fn default_move_timeout() -> u64 {
    60_000
}

fn default_pso_output() -> u32 {
    1
}

fn default_units() -> String {
    "mm".to_string()
}

fn default_direction() -> i32 {
    1
}

fn default_acceleration_time() -> f64 {
    0.5
}

fn default_precision() -> u32 {
    4
}

fn default_required() -> bool {
    true
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Default for BeamlineConfig {
    /// A single simulated horizontal stage plus a ring-current baseline.
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            controller: ControllerConfig::default(),
            flyers: vec![FlyerConfig {
                name: "aerotech_horiz".to_string(),
                axis: "@0".to_string(),
                encoder: 6,
                units: default_units(),
                encoder_resolution: 0.001,
                encoder_resolution_units: None,
                encoder_direction: 1,
                motor_direction: 1,
                acceleration_time: default_acceleration_time(),
                limits: Some((-50.0, 50.0)),
                precision: default_precision(),
                required: true,
            }],
            baseline: vec![BaselineSignalConfig {
                name: "ring_current".to_string(),
                units: "mA".to_string(),
                sim_value: 102.3,
            }],
        }
    }
}

impl BeamlineConfig {
    /// Load from `config/beamline.toml` and `BEAMLINE_` environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/beamline.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables take precedence over the file. The result is
    /// validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BEAMLINE_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - The encoder window range is not inverted
    /// - At least one flyer, with unique names
    /// - Each flyer has known units, a positive encoder resolution and
    ///   acceleration time, and directions of +1 or -1
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.controller.encoder_window_min >= self.controller.encoder_window_max {
            return Err(DaqError::Configuration(format!(
                "Invalid encoder window: min {} must be below max {}",
                self.controller.encoder_window_min, self.controller.encoder_window_max
            )));
        }

        if self.flyers.is_empty() {
            return Err(DaqError::Configuration(
                "At least one flyer must be configured".into(),
            ));
        }

        let mut names = HashSet::new();
        for flyer in &self.flyers {
            if !names.insert(flyer.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate device name: '{}'",
                    flyer.name
                )));
            }
            self.validate_flyer(flyer)?;
        }
        for signal in &self.baseline {
            if !names.insert(signal.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate device name: '{}'",
                    signal.name
                )));
            }
        }

        Ok(())
    }

    fn validate_flyer(&self, flyer: &FlyerConfig) -> AppResult<()> {
        let units = flyer.engineering_units().map_err(|_| {
            DaqError::Configuration(format!(
                "Flyer '{}': unknown units '{}'",
                flyer.name, flyer.units
            ))
        })?;
        flyer.resolution_in(units).map_err(|e| {
            DaqError::Configuration(format!(
                "Flyer '{}': 'encoder_resolution_units': {e}",
                flyer.name
            ))
        })?;
        if flyer.axis.is_empty() {
            return Err(DaqError::Configuration(format!(
                "Flyer '{}': 'axis' cannot be empty",
                flyer.name
            )));
        }
        if !(flyer.encoder_resolution > 0.0) {
            return Err(DaqError::Configuration(format!(
                "Flyer '{}': 'encoder_resolution' must be > 0",
                flyer.name
            )));
        }
        if !(flyer.acceleration_time > 0.0) {
            return Err(DaqError::Configuration(format!(
                "Flyer '{}': 'acceleration_time' must be > 0",
                flyer.name
            )));
        }
        for (field, value) in [
            ("encoder_direction", flyer.encoder_direction),
            ("motor_direction", flyer.motor_direction),
        ] {
            if value != 1 && value != -1 {
                return Err(DaqError::Configuration(format!(
                    "Flyer '{}': '{field}' must be 1 or -1, got {value}",
                    flyer.name
                )));
            }
        }
        if let Some((low, high)) = flyer.limits {
            if low >= high {
                return Err(DaqError::Configuration(format!(
                    "Flyer '{}': soft limits [{low}, {high}] are inverted",
                    flyer.name
                )));
            }
        }
        Ok(())
    }

    /// Render as TOML, e.g. to seed a configuration file from the defaults.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("Cannot serialize configuration: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config_is_valid() {
        BeamlineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_load_minimal_file() {
        let file = write_config(
            r#"
[[flyers]]
name = "aerotech_vert"
axis = "@1"
encoder = 7
units = "um"
encoder_resolution = 0.1
"#,
        );
        let config = BeamlineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.controller.encoder_window_max, DEFAULT_WINDOW_LIMIT);
        assert_eq!(config.controller.pso_output_axis, 1);

        let flyer = &config.flyers[0];
        assert_eq!(flyer.name, "aerotech_vert");
        assert_eq!(flyer.engineering_units().unwrap(), EngineeringUnit::Micrometer);
        assert_eq!(flyer.encoder_direction, 1);
        assert!(flyer.required);
        assert!(config.baseline.is_empty());
    }

    #[test]
    fn test_defaults_written_as_toml_load_back() {
        let defaults = BeamlineConfig::default();
        let file = write_config(&defaults.to_toml().unwrap());
        assert_eq!(BeamlineConfig::load_from(file.path()).unwrap(), defaults);
    }

    #[test]
    fn test_window_limits() {
        let file = write_config(
            r#"
[controller]
encoder_window_min = -1000
encoder_window_max = 1000

[[flyers]]
name = "horiz"
axis = "@0"
encoder = 6
encoder_resolution = 0.001
"#,
        );
        let config = BeamlineConfig::load_from(file.path()).unwrap();
        let limits = config.controller.window_limits();
        assert_eq!((limits.min, limits.max), (-1000, 1000));
    }

    #[test]
    fn test_validation_rejects_bad_flyers() {
        let mut config = BeamlineConfig::default();
        config.flyers[0].encoder_direction = 0;
        assert!(matches!(
            config.validate(),
            Err(DaqError::Configuration(msg)) if msg.contains("encoder_direction")
        ));

        let mut config = BeamlineConfig::default();
        config.flyers[0].units = "furlong".into();
        assert!(config.validate().is_err());

        let mut config = BeamlineConfig::default();
        config.flyers[0].encoder_resolution = 0.0;
        assert!(config.validate().is_err());

        let mut config = BeamlineConfig::default();
        let duplicate = config.flyers[0].clone();
        config.flyers.push(duplicate);
        assert!(matches!(
            config.validate(),
            Err(DaqError::Configuration(msg)) if msg.contains("Duplicate")
        ));
    }

    #[test]
    fn test_resolution_units_are_converted() {
        let file = write_config(
            r#"
[[flyers]]
name = "aerotech_horiz"
axis = "@0"
encoder = 6
units = "mm"
encoder_resolution = 100.0
encoder_resolution_units = "nm"
"#,
        );
        let config = BeamlineConfig::load_from(file.path()).unwrap();
        let flyer = &config.flyers[0];
        let mm = flyer.resolution_in(EngineeringUnit::Millimeter).unwrap();
        assert!((mm - 1e-4).abs() < 1e-15);

        let mut config = BeamlineConfig::default();
        config.flyers[0].encoder_resolution_units = Some("deg".into());
        assert!(matches!(
            config.validate(),
            Err(DaqError::Configuration(msg)) if msg.contains("encoder_resolution_units")
        ));
    }

    #[test]
    fn test_validation_rejects_inverted_window() {
        let mut config = BeamlineConfig::default();
        config.controller.encoder_window_min = 10;
        config.controller.encoder_window_max = -10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_flyers_is_load_error() {
        let file = write_config("[application]\nlog_level = \"debug\"\n");
        assert!(matches!(
            BeamlineConfig::load_from(file.path()),
            Err(DaqError::Config(_))
        ));
    }
}
