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

//! Single-channel power metering switch (`Switch.GetStatus`)

use super::parse_json;
use crate::error::FetchResult;
use crate::reading::{Reading, SourceKind};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct SwitchStatus {
    apower: f64,
    voltage: f64,
    current: f64,
    aenergy: EnergyCounter,
    temperature: Temperature,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnergyCounter {
    total: f64,
    by_minute: Vec<f64>,
    /// Start of the current minute
    minute_ts: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Temperature {
    #[serde(rename = "tC")]
    celsius: Option<f64>,
    #[serde(rename = "tF")]
    #[expect(dead_code, reason = "accepted for shape validation only")]
    fahrenheit: Option<f64>,
}

pub fn parse_switch(kind: SourceKind, body: &str) -> FetchResult<Reading> {
    let status: SwitchStatus = parse_json(body)?;

    let last_minute_mwh = status.aenergy.by_minute.first().copied().unwrap_or_default();
    let temperature = status
        .temperature
        .celsius
        .map(|t| format!("{t:.1}"))
        .unwrap_or_default();

    let mut reading = Reading::new(kind, Some(status.aenergy.minute_ts), status.apower).with_status(
        format!(
            "{:.1},{:.3},{:.3},{:.3},{}",
            status.voltage, status.current, status.aenergy.total, last_minute_mwh, temperature
        ),
    );
    reading.timestamp_window = 60;
    Ok(reading)
}
