//! Conversion from simulator units to the canonical units of the inventory.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{LcaError, Result};

const HOURS_PER_YEAR: f64 = 365.0 * 24.0;

/// Units the process simulator reports flows in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceUnit {
    #[serde(rename = "kg/hr")]
    KgPerHour,
    #[serde(rename = "l/min")]
    LitrePerMinute,
    #[serde(rename = "tonne/year")]
    TonnePerYear,
    #[serde(rename = "MJ/hr")]
    MegajoulePerHour,
}

impl SourceUnit {
    pub const ALL: [SourceUnit; 4] = [
        SourceUnit::KgPerHour,
        SourceUnit::LitrePerMinute,
        SourceUnit::TonnePerYear,
        SourceUnit::MegajoulePerHour,
    ];

    pub fn label(self) -> &'static str {
        match self {
            SourceUnit::KgPerHour => "kg/hr",
            SourceUnit::LitrePerMinute => "l/min",
            SourceUnit::TonnePerYear => "tonne/year",
            SourceUnit::MegajoulePerHour => "MJ/hr",
        }
    }

    pub fn factor(self) -> f64 {
        match self {
            SourceUnit::KgPerHour => 1.0,
            SourceUnit::LitrePerMinute => 0.001 * 60.0,
            SourceUnit::TonnePerYear => 1000.0 / HOURS_PER_YEAR,
            SourceUnit::MegajoulePerHour => 1.0,
        }
    }

    /// Parses a unit label from a sheet, naming `context` in the error.
    pub fn parse_for(label: &str, context: &str) -> Result<Self> {
        label.parse().map_err(|_| LcaError::UnsupportedUnit {
            unit: label.trim().to_string(),
            context: context.to_string(),
        })
    }
}

impl FromStr for SourceUnit {
    type Err = LcaError;

    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        SourceUnit::ALL
            .into_iter()
            .find(|unit| unit.label() == trimmed)
            .ok_or_else(|| LcaError::UnsupportedUnit {
                unit: trimmed.to_string(),
                context: "a flow".into(),
            })
    }
}

impl fmt::Display for SourceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Converts `value` from `unit` into its canonical unit.
pub fn convert(value: f64, unit: SourceUnit) -> f64 {
    value * unit.factor()
}

/// Unit declared by a resolved inventory activity.
///
/// `Unknown` keeps the raw label so a misconfigured activity can still be
/// reported by name; the normalizer maps it to a zero amount.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityUnit {
    Kilogram,
    CubicMeter,
    Megajoule,
    KilowattHour,
    Unknown(String),
}

impl ActivityUnit {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "kilogram" | "kg" => ActivityUnit::Kilogram,
            "cubic meter" | "m3" => ActivityUnit::CubicMeter,
            "megajoule" | "mj" => ActivityUnit::Megajoule,
            "kilowatt hour" | "kilowatt-hour" | "kwh" => ActivityUnit::KilowattHour,
            _ => ActivityUnit::Unknown(label.trim().to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            ActivityUnit::Kilogram => "kilogram",
            ActivityUnit::CubicMeter => "cubic meter",
            ActivityUnit::Megajoule => "megajoule",
            ActivityUnit::KilowattHour => "kilowatt hour",
            ActivityUnit::Unknown(label) => label,
        }
    }
}

impl fmt::Display for ActivityUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
