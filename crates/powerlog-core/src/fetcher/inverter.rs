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

//! Micro-inverter live data from a DTU (`/api/livedata/status`)
//!
//! The DTU reports every paired inverter; the battery discharge inverter is
//! picked by its serial number. The endpoint has no clock, so readings
//! inherit the meter timestamp.

use super::{parse_json, shape_error};
use crate::error::{FetchError, FetchResult};
use crate::reading::{Reading, SourceKind};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
struct LiveData {
    inverters: Vec<InverterData>,
}

#[derive(Debug, Deserialize)]
struct InverterData {
    serial: String,
    reachable: bool,
    producing: bool,
    limit_relative: f64,
    limit_absolute: f64,
    #[serde(rename = "AC")]
    ac: BTreeMap<String, AcChannel>,
    #[serde(rename = "DC")]
    dc: BTreeMap<String, DcChannel>,
    #[serde(rename = "INV", default)]
    inv: BTreeMap<String, InvChannel>,
}

/// A single measured quantity: value, unit, decimals
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Measurement {
    v: f64,
    #[serde(default)]
    #[expect(dead_code, reason = "unit is validated by shape only")]
    u: String,
    #[serde(default)]
    #[expect(dead_code, reason = "display precision is not used")]
    d: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AcChannel {
    power: Measurement,
    voltage: Measurement,
    current: Measurement,
    frequency: Measurement,
    power_factor: Measurement,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DcChannel {
    power: Measurement,
    voltage: Measurement,
    current: Measurement,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InvChannel {
    temperature: Option<Measurement>,
}

pub fn parse_inverter(body: &str, serial: &str) -> FetchResult<Reading> {
    let live: LiveData = parse_json(body)?;

    let inverter = live
        .inverters
        .into_iter()
        .find(|inv| inv.serial == serial)
        .ok_or_else(|| shape_error(format!("no inverter with serial {serial}"), body))?;

    if !inverter.reachable {
        return Err(FetchError::Network(format!(
            "inverter {serial} not reachable by the DTU"
        )));
    }

    let ac = inverter
        .ac
        .get("0")
        .ok_or_else(|| shape_error("missing AC channel 0".to_owned(), body))?;
    let dc = inverter
        .dc
        .get("0")
        .ok_or_else(|| shape_error("missing DC channel 0".to_owned(), body))?;
    let temperature = inverter
        .inv
        .get("0")
        .and_then(|inv| inv.temperature.as_ref())
        .map(|t| format!("{:.1}", t.v))
        .unwrap_or_default();

    let status = format!(
        "{:.1},{:.1},{:.2},{:.2},{:.3},{:.1},{:.1},{:.2},{},{:.0},{:.0},{}",
        ac.power.v,
        ac.voltage.v,
        ac.current.v,
        ac.frequency.v,
        ac.power_factor.v,
        dc.power.v,
        dc.voltage.v,
        dc.current.v,
        u8::from(inverter.producing),
        inverter.limit_relative,
        inverter.limit_absolute,
        temperature
    );

    let mut reading =
        Reading::new(SourceKind::DischargeInverter, None, ac.power.v).with_status(status);
    reading.dc_voltage = Some(dc.voltage.v);
    Ok(reading)
}
