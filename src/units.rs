//! Engineering-unit and encoder-count conversions.
//!
//! Motor records report their engineering units as free-form strings ("mm",
//! "micron", "deg", ...). `EngineeringUnit` parses those strings and maps each
//! one onto a `uom` length or angle unit, so a value in one unit becomes a typed
//! [`Quantity`] that can be read back in any compatible unit. Encoder helpers
//! translate motor distances into signed encoder counts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uom::si::angle::{degree, radian, second as arcsecond};
use uom::si::f64::{Angle, Length};
use uom::si::length::{meter, micrometer, millimeter, nanometer};

use crate::error::{AppResult, DaqError};

/// SI prefixes for the angle units `uom` has no named unit for.
const MILLI: f64 = 1e-3;
const MICRO: f64 = 1e-6;

/// Physical dimension of an engineering unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dimension {
    Length,
    Angle,
}

/// A motor-unit value lifted into a typed quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Quantity {
    Length(Length),
    Angle(Angle),
}

impl Quantity {
    pub fn dimension(&self) -> Dimension {
        match self {
            Quantity::Length(_) => Dimension::Length,
            Quantity::Angle(_) => Dimension::Angle,
        }
    }
}

/// Engineering units understood by the motion layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineeringUnit {
    Meter,
    Millimeter,
    Micrometer,
    Nanometer,
    Radian,
    Milliradian,
    Microradian,
    Degree,
    Millidegree,
    Arcsecond,
}

impl EngineeringUnit {
    pub fn dimension(&self) -> Dimension {
        match self {
            EngineeringUnit::Meter
            | EngineeringUnit::Millimeter
            | EngineeringUnit::Micrometer
            | EngineeringUnit::Nanometer => Dimension::Length,
            EngineeringUnit::Radian
            | EngineeringUnit::Milliradian
            | EngineeringUnit::Microradian
            | EngineeringUnit::Degree
            | EngineeringUnit::Millidegree
            | EngineeringUnit::Arcsecond => Dimension::Angle,
        }
    }

    /// `value` in this unit as a typed quantity.
    pub fn quantity(&self, value: f64) -> Quantity {
        match self {
            EngineeringUnit::Meter => Quantity::Length(Length::new::<meter>(value)),
            EngineeringUnit::Millimeter => Quantity::Length(Length::new::<millimeter>(value)),
            EngineeringUnit::Micrometer => Quantity::Length(Length::new::<micrometer>(value)),
            EngineeringUnit::Nanometer => Quantity::Length(Length::new::<nanometer>(value)),
            EngineeringUnit::Radian => Quantity::Angle(Angle::new::<radian>(value)),
            EngineeringUnit::Milliradian => Quantity::Angle(Angle::new::<radian>(value * MILLI)),
            EngineeringUnit::Microradian => Quantity::Angle(Angle::new::<radian>(value * MICRO)),
            EngineeringUnit::Degree => Quantity::Angle(Angle::new::<degree>(value)),
            EngineeringUnit::Millidegree => Quantity::Angle(Angle::new::<degree>(value * MILLI)),
            EngineeringUnit::Arcsecond => Quantity::Angle(Angle::new::<arcsecond>(value)),
        }
    }

    /// Read `quantity` back in this unit.
    pub fn value_of(&self, quantity: Quantity) -> AppResult<f64> {
        let value = match (self, quantity) {
            (EngineeringUnit::Meter, Quantity::Length(length)) => length.get::<meter>(),
            (EngineeringUnit::Millimeter, Quantity::Length(length)) => length.get::<millimeter>(),
            (EngineeringUnit::Micrometer, Quantity::Length(length)) => length.get::<micrometer>(),
            (EngineeringUnit::Nanometer, Quantity::Length(length)) => length.get::<nanometer>(),
            (EngineeringUnit::Radian, Quantity::Angle(angle)) => angle.get::<radian>(),
            (EngineeringUnit::Milliradian, Quantity::Angle(angle)) => angle.get::<radian>() / MILLI,
            (EngineeringUnit::Microradian, Quantity::Angle(angle)) => angle.get::<radian>() / MICRO,
            (EngineeringUnit::Degree, Quantity::Angle(angle)) => angle.get::<degree>(),
            (EngineeringUnit::Millidegree, Quantity::Angle(angle)) => angle.get::<degree>() / MILLI,
            (EngineeringUnit::Arcsecond, Quantity::Angle(angle)) => angle.get::<arcsecond>(),
            (unit, quantity) => {
                return Err(DaqError::IncompatibleUnits {
                    from: format!("{:?}", quantity.dimension()).to_lowercase(),
                    to: unit.to_string(),
                })
            }
        };
        Ok(value)
    }

    /// Canonical symbol used in data keys.
    pub fn symbol(&self) -> &'static str {
        match self {
            EngineeringUnit::Meter => "m",
            EngineeringUnit::Millimeter => "mm",
            EngineeringUnit::Micrometer => "um",
            EngineeringUnit::Nanometer => "nm",
            EngineeringUnit::Radian => "rad",
            EngineeringUnit::Milliradian => "mrad",
            EngineeringUnit::Microradian => "urad",
            EngineeringUnit::Degree => "deg",
            EngineeringUnit::Millidegree => "mdeg",
            EngineeringUnit::Arcsecond => "arcsec",
        }
    }
}

impl fmt::Display for EngineeringUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for EngineeringUnit {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unit = match s.trim().to_ascii_lowercase().as_str() {
            "m" | "meter" | "meters" | "metre" => EngineeringUnit::Meter,
            "mm" | "millimeter" | "millimeters" => EngineeringUnit::Millimeter,
            "um" | "µm" | "μm" | "micron" | "microns" | "micrometer" => {
                EngineeringUnit::Micrometer
            }
            "nm" | "nanometer" | "nanometers" => EngineeringUnit::Nanometer,
            "rad" | "radian" | "radians" => EngineeringUnit::Radian,
            "mrad" | "milliradian" => EngineeringUnit::Milliradian,
            "urad" | "µrad" | "μrad" | "microradian" => EngineeringUnit::Microradian,
            "deg" | "degree" | "degrees" => EngineeringUnit::Degree,
            "mdeg" | "millidegree" => EngineeringUnit::Millidegree,
            "arcsec" | "arcsecond" | "arcseconds" => EngineeringUnit::Arcsecond,
            _ => return Err(DaqError::UnknownUnit(s.to_string())),
        };
        Ok(unit)
    }
}

/// Convert `value` expressed in `from` into `to`.
pub fn convert(value: f64, from: EngineeringUnit, to: EngineeringUnit) -> AppResult<f64> {
    if from == to {
        return Ok(value);
    }
    to.value_of(from.quantity(value)).map_err(|_| DaqError::IncompatibleUnits {
        from: from.to_string(),
        to: to.to_string(),
    })
}

/// Motor distance to (fractional) encoder counts.
///
/// `encoder_direction` is +1 when the encoder counts up as the motor moves in
/// its positive direction, -1 otherwise.
pub fn to_encoder_counts(distance: f64, resolution: f64, encoder_direction: i32) -> f64 {
    distance / resolution * f64::from(encoder_direction)
}

/// Encoder counts back to a motor distance.
pub fn from_encoder_counts(counts: f64, resolution: f64, encoder_direction: i32) -> f64 {
    counts * resolution * f64::from(encoder_direction)
}
