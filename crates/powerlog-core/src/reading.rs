// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of PowerLog.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Device readings as produced by the fetchers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which device a reading came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Mandatory three-phase household meter, the clock of record
    Meter,
    Pv,
    Charger,
    DischargeSwitch,
    DischargeInverter,
}

impl SourceKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Meter => "meter",
            Self::Pv => "pv",
            Self::Charger => "charger",
            Self::DischargeSwitch => "discharge-switch",
            Self::DischargeInverter => "discharge-inverter",
        }
    }

    pub fn is_primary(self) -> bool {
        matches!(self, Self::Meter)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One parsed device response
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub kind: SourceKind,

    /// Device timestamp (unix seconds), `None` when the device has no clock
    pub timestamp: Option<i64>,

    /// Width of the device clock tick in seconds. Per-minute counters report
    /// the start of the minute, so their timestamp covers 60 seconds.
    pub timestamp_window: i64,

    /// Instantaneous active power (W)
    pub power: f64,

    /// Per-phase active power (W), only for the three-phase meter
    pub phases: Option<[f64; 3]>,

    /// DC side voltage, the battery voltage for a discharge inverter
    pub dc_voltage: Option<f64>,

    /// Remaining device fields as CSV, passed through to the status files
    pub status: String,
}

impl Reading {
    /// Reading with a one-second device clock
    pub fn new(kind: SourceKind, timestamp: Option<i64>, power: f64) -> Self {
        Self {
            kind,
            timestamp,
            timestamp_window: 1,
            power,
            phases: None,
            dc_voltage: None,
            status: String::new(),
        }
    }

    pub fn with_phases(mut self, phases: [f64; 3]) -> Self {
        self.phases = Some(phases);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Seconds between the device clock and `reference`, zero while inside the tick window
    pub fn clock_skew(&self, reference: i64) -> Option<i64> {
        let ts = self.timestamp?;
        let last = ts + self.timestamp_window - 1;
        Some(if reference < ts {
            reference - ts
        } else if reference > last {
            reference - last
        } else {
            0
        })
    }
}

/// Auxiliary readings gathered for one second; `None` means "no data this second"
#[derive(Debug, Clone, Default)]
pub struct AuxReadings {
    pub pv: Option<Reading>,
    pub charger: Option<Reading>,
    pub discharge_switch: Option<Reading>,
    pub discharge_inverter: Option<Reading>,
}
