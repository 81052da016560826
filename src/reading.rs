use crate::prelude::*;

use serde::Serialize;
use std::collections::BTreeMap;

/// Coarse classification of a register block, used as the last topic level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Subtopic {
    VoltageCurrent,
    ActivePower,
    TotalExportedEnergy,
    TotalImportedEnergy,
    Unknown,
}

impl Subtopic {
    /// Classify by the first register of the master's request.
    ///
    /// EM340 layout: phase voltages and currents at 0x0000-0x0011, the power
    /// block from 0x0012, kWh(+) TOT from 0x0034 and kWh(-) TOT from 0x004E.
    pub fn from_address(address: u16) -> Self {
        match address {
            0x0000..=0x0011 => Self::VoltageCurrent,
            0x0012..=0x0033 => Self::ActivePower,
            0x0034..=0x004d => Self::TotalImportedEnergy,
            0x004e..=0x0053 => Self::TotalExportedEnergy,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::VoltageCurrent => "voltage_current",
            Self::ActivePower => "active_power",
            Self::TotalExportedEnergy => "total_exported_energy",
            Self::TotalImportedEnergy => "total_imported_energy",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Subtopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded register block, ready to publish.
///
/// Serializes to `{"timestamp": "...", "<id>": <value>, ...}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DecodedReading {
    pub timestamp: String,
    #[serde(skip)]
    pub subtopic: Subtopic,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

impl DecodedReading {
    pub fn new(subtopic: Subtopic, values: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self {
            timestamp: Self::now(),
            subtopic,
            values: values.into_iter().collect(),
        }
    }

    // ISO-8601 in local time, with offset
    fn now() -> String {
        chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
    }

    pub fn get(&self, id: &str) -> Option<f64> {
        self.values.get(id).copied()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
