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

//! Three-phase energy meter (`/status` of a 3EM style device)

use super::{DeviceClock, parse_json, shape_error};
use crate::error::{FetchError, FetchResult};
use crate::reading::{Reading, SourceKind};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct MeterStatus {
    unixtime: i64,
    uptime: u64,
    total_power: f64,
    emeters: Vec<PhaseMeter>,
}

/// One phase of the meter; unknown fields here mean a different firmware
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PhaseMeter {
    power: f64,
    pf: f64,
    current: f64,
    voltage: f64,
    is_valid: bool,
    total: f64,
    total_returned: f64,
}

pub fn parse_meter(body: &str, clock: &mut DeviceClock, system_now: Option<i64>) -> FetchResult<Reading> {
    let status: MeterStatus = parse_json(body)?;

    if status.emeters.len() != 3 {
        return Err(shape_error(
            format!("expected 3 phases, got {}", status.emeters.len()),
            body,
        ));
    }
    if let Some(phase) = status.emeters.iter().position(|p| !p.is_valid) {
        return Err(shape_error(format!("phase {} flagged invalid", phase + 1), body));
    }

    let timestamp = clock
        .resolve(status.unixtime, status.uptime, system_now)
        .ok_or(FetchError::MissingTimestamp)?;

    let phases = [
        status.emeters[0].power,
        status.emeters[1].power,
        status.emeters[2].power,
    ];
    let detail = status
        .emeters
        .iter()
        .map(|p| {
            format!(
                "{:.2},{:.2},{:.2},{:.1},{:.1},{:.1}",
                p.power, p.pf, p.current, p.voltage, p.total, p.total_returned
            )
        })
        .collect::<Vec<_>>()
        .join(",");

    Ok(Reading::new(SourceKind::Meter, Some(timestamp), status.total_power)
        .with_phases(phases)
        .with_status(detail))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meter_body(unixtime: i64, uptime: u64, powers: [f64; 3]) -> String {
        let phase = |p: f64| {
            format!(
                r#"{{"power":{p},"pf":0.95,"current":1.2,"voltage":231.4,"is_valid":true,"total":12345.6,"total_returned":789.1}}"#
            )
        };
        format!(
            r#"{{"wifi_sta":{{"connected":true}},"unixtime":{unixtime},"uptime":{uptime},"total_power":{},"emeters":[{},{},{}]}}"#,
            powers.iter().sum::<f64>(),
            phase(powers[0]),
            phase(powers[1]),
            phase(powers[2])
        )
    }

    #[test]
    fn test_parse_valid_meter() {
        let mut clock = DeviceClock::default();
        let body = meter_body(1_714_557_600, 500, [100.0, 50.0, -20.0]);
        let reading = parse_meter(&body, &mut clock, None).unwrap();

        assert_eq!(reading.kind, SourceKind::Meter);
        assert_eq!(reading.timestamp, Some(1_714_557_600));
        assert_eq!(reading.power, 130.0);
        assert_eq!(reading.phases, Some([100.0, 50.0, -20.0]));
        assert!(reading.status.starts_with("100.00,0.95,1.20,231.4"));
        assert_eq!(reading.status.split(',').count(), 18);
    }

    #[test]
    fn test_not_json_is_malformed() {
        let mut clock = DeviceClock::default();
        let result = parse_meter("<html>502 Bad Gateway</html>", &mut clock, None);
        assert!(matches!(result, Err(FetchError::Malformed { .. })));
    }

    #[test]
    fn test_unknown_phase_field_is_mismatch() {
        let mut clock = DeviceClock::default();
        let body = meter_body(1_714_557_600, 500, [1.0, 2.0, 3.0])
            .replacen(r#""pf":0.95"#, r#""pf":0.95,"reactive":3.0"#, 1);
        let result = parse_meter(&body, &mut clock, None);
        assert!(matches!(result, Err(FetchError::ParseMismatch { .. })));
    }

    #[test]
    fn test_two_phases_is_mismatch() {
        let mut clock = DeviceClock::default();
        let body = r#"{"unixtime":1,"uptime":1,"total_power":5,"emeters":[
            {"power":1,"pf":1,"current":1,"voltage":230,"is_valid":true,"total":1,"total_returned":0},
            {"power":1,"pf":1,"current":1,"voltage":230,"is_valid":true,"total":1,"total_returned":0}]}"#;
        let err = parse_meter(body, &mut clock, None).unwrap_err();
        assert!(err.to_string().contains("expected 3 phases"));
    }

    #[test]
    fn test_invalid_phase_rejected() {
        let mut clock = DeviceClock::default();
        let body = meter_body(1_714_557_600, 500, [1.0, 2.0, 3.0]).replacen(
            r#""is_valid":true"#,
            r#""is_valid":false"#,
            1,
        );
        let err = parse_meter(&body, &mut clock, None).unwrap_err();
        assert!(err.to_string().contains("phase 1 flagged invalid"));
    }

    #[test]
    fn test_missing_clock_approximated_from_uptime() {
        let mut clock = DeviceClock::default();
        parse_meter(&meter_body(1_714_557_600, 1_000, [1.0; 3]), &mut clock, None).unwrap();

        let reading = parse_meter(&meter_body(0, 1_007, [1.0; 3]), &mut clock, None).unwrap();
        assert_eq!(reading.timestamp, Some(1_714_557_607));
    }

    #[test]
    fn test_missing_clock_without_history_needs_system_clock() {
        let mut clock = DeviceClock::default();
        let result = parse_meter(&meter_body(0, 10, [1.0; 3]), &mut clock, None);
        assert!(matches!(result, Err(FetchError::MissingTimestamp)));

        let reading =
            parse_meter(&meter_body(0, 10, [1.0; 3]), &mut clock, Some(1_714_557_600)).unwrap();
        assert_eq!(reading.timestamp, Some(1_714_557_600));
    }
}
