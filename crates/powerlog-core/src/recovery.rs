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

//! Restart recovery
//!
//! The last line of today's load file is the hour that was in progress when
//! the previous run stopped. Its seconds are read back from the per-second
//! power file of the same day so the hour accumulators can be rebuilt. Without
//! a power file the load line and the status files are used instead.

use crate::composer::Sample;
use crate::config::CollectorConfig;
use crate::error::{RecoveryError, RecoveryResult};
use crate::output::{day_path, local_time};
use crate::reading::SourceKind;
use chrono::NaiveDate;
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How much of the load file end is read to find the last line
const TAIL_WINDOW: u64 = 1 << 20;

const SECONDS_PER_HOUR: usize = 3600;

/// The hour in progress at the previous shutdown
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredHour {
    /// First second of the load line
    pub start: i64,
    /// Next second the load line expects
    pub next: i64,
    pub samples: Vec<Sample>,
}

/// Read the unfinished hour of today's load file, if there is one
pub fn load_open_hour(config: &CollectorConfig, tz: Tz, now: i64) -> RecoveryResult<Option<RecoveredHour>> {
    let Some(prefix) = &config.outputs.load else {
        warn!("Load output disabled, hour accumulators start from zero");
        return Ok(None);
    };
    let Some(today) = local_time(tz, now).map(|t| t.date_naive()) else {
        warn!("System clock unusable, hour accumulators start from zero");
        return Ok(None);
    };

    let path = day_path(prefix, today);
    if !path.exists() {
        warn!("No load file {} to recover from, hour accumulators start from zero", path.display());
        return Ok(None);
    }

    let Some(line) = read_unfinished_line(&path)? else {
        info!("Load file {} has no unfinished hour", path.display());
        return Ok(None);
    };
    let (start, next, points) = parse_load_line(&path, &line)?;

    let mut rows = match config.outputs.power.as_deref() {
        Some(prefix) => power_rows(&day_path(prefix, today), start, next)?,
        None => BTreeMap::new(),
    };
    let covered = points.iter().filter(|(ts, _)| rows.contains_key(ts)).count();

    let fallback = if covered == points.len() {
        None
    } else {
        if config.outputs.power.is_some() {
            warn!(
                "Recovery inconsistency: power file covers {covered} of {} seconds, \
                 rebuilding the rest from load and status files",
                points.len()
            );
        }
        Some(from_load_and_status(config, today, &points)?)
    };

    let samples = points
        .iter()
        .enumerate()
        .filter_map(|(i, (ts, _))| {
            rows.remove(ts)
                .or_else(|| fallback.as_ref().map(|samples| samples[i].clone()))
        })
        .collect();

    Ok(Some(RecoveredHour {
        start,
        next,
        samples,
    }))
}

/// Samples rebuilt from the clean load line plus the auxiliary status files.
/// Suppressed seconds are interpolated, so substituted seconds only
/// approximate the live run.
fn from_load_and_status(
    config: &CollectorConfig,
    today: NaiveDate,
    points: &[(i64, Option<f64>)],
) -> RecoveryResult<Vec<Sample>> {
    let loads = fill_gaps(points);

    let discharge_configured = config.discharge_switch.is_some() || config.discharge_inverter.is_some();
    let pv = status_powers(
        SourceKind::Pv,
        config.pv.is_some(),
        config.outputs.pv_status.as_deref(),
        today,
        &loads,
    )?;
    let charge = status_powers(
        SourceKind::Charger,
        config.charger.is_some(),
        config.outputs.charger_status.as_deref(),
        today,
        &loads,
    )?;
    let discharge = status_powers(
        SourceKind::DischargeSwitch,
        discharge_configured,
        config.outputs.discharge_status.as_deref(),
        today,
        &loads,
    )?;

    Ok(loads
        .iter()
        .enumerate()
        .map(|(i, &(ts, load))| Sample::recovered(ts, load, pv[i], charge[i], discharge[i]))
        .collect())
}

/// Rows of the per-second power file in `[start, next)`. Every accumulated
/// second is there, substituted and interpolated ones included, with the
/// values the hour sums were built from.
fn power_rows(path: &Path, start: i64, next: i64) -> RecoveryResult<BTreeMap<i64, Sample>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let mut rows = BTreeMap::new();
    for record in reader.records() {
        let record = record?;
        let Some(sample) = power_sample(&record) else {
            debug!("Skipping unreadable power row in {}: {record:?}", path.display());
            continue;
        };
        if sample.timestamp >= next {
            break;
        }
        if sample.timestamp >= start {
            rows.insert(sample.timestamp, sample);
        }
    }
    Ok(rows)
}

/// `timestamp,time,load,meter,pv,charge,discharge,l1,l2,l3,own_use,flags`
fn power_sample(record: &csv::StringRecord) -> Option<Sample> {
    let number = |i: usize| record.get(i).and_then(|f| f.trim().parse::<f64>().ok());
    let flags = record.get(11).unwrap_or_default();
    let phases = match (number(7), number(8), number(9)) {
        (Some(l1), Some(l2), Some(l3)) => Some([l1, l2, l3]),
        _ => None,
    };

    Some(Sample {
        timestamp: record.get(0)?.trim().parse().ok()?,
        load: number(2)?,
        meter: number(3)?,
        pv: number(4)?,
        charge: number(5)?,
        discharge: number(6)?,
        phases,
        own_use: number(10)?,
        plausible: !flags.contains('s'),
        synthetic: flags.contains('i'),
        stale: false,
        battery_voltage: None,
    })
}

/// Last line of the file, `None` when the file ends with a complete line
fn read_unfinished_line(path: &Path) -> RecoveryResult<Option<String>> {
    let read_error = |source| RecoveryError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(read_error)?;
    let len = file.metadata().map_err(read_error)?.len();
    let offset = len.saturating_sub(TAIL_WINDOW);
    file.seek(SeekFrom::Start(offset)).map_err(read_error)?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail).map_err(read_error)?;

    if tail.is_empty() || tail.ends_with(b"\n") {
        return Ok(None);
    }

    let line_start = match tail.iter().rposition(|&b| b == b'\n') {
        Some(pos) => pos + 1,
        None if offset == 0 => 0,
        None => {
            return Err(RecoveryError::Malformed {
                path: path.to_path_buf(),
                reason: format!("last line longer than {TAIL_WINDOW} bytes"),
            });
        }
    };

    String::from_utf8(tail.split_off(line_start))
        .map(Some)
        .map_err(|_| RecoveryError::Malformed {
            path: path.to_path_buf(),
            reason: "last line is not valid UTF-8".to_owned(),
        })
}

/// Start second, next expected second and one point per written second.
/// `-` fields were never accumulated and are left out.
fn parse_load_line(path: &Path, line: &str) -> RecoveryResult<(i64, i64, Vec<(i64, Option<f64>)>)> {
    let malformed = |reason: String| RecoveryError::Malformed {
        path: path.to_path_buf(),
        reason,
    };

    let mut fields = line.trim_end_matches('\r').split(',');
    let start = fields
        .next()
        .and_then(|f| f.trim().parse::<i64>().ok())
        .ok_or_else(|| malformed(format!("line does not start with a timestamp: '{line}'")))?;

    let mut points = Vec::new();
    let mut count: i64 = 0;
    for (i, field) in fields.enumerate() {
        let ts = start + i as i64;
        count += 1;
        match field.trim() {
            "-" => {}
            "" => points.push((ts, None)),
            value => {
                let load = value
                    .parse::<f64>()
                    .map_err(|_| malformed(format!("bad load '{value}' at second {i}")))?;
                points.push((ts, Some(load)));
            }
        }
    }

    if count as usize > SECONDS_PER_HOUR {
        return Err(malformed(format!("{count} seconds on one hour line")));
    }
    Ok((start, start + count, points))
}

/// Linear fill of suppressed seconds from their neighbours
fn fill_gaps(points: &[(i64, Option<f64>)]) -> Vec<(i64, f64)> {
    let known: BTreeMap<i64, f64> = points
        .iter()
        .filter_map(|&(ts, load)| load.map(|l| (ts, l)))
        .collect();
    if known.is_empty() && !points.is_empty() {
        warn!("Recovered hour has no measured load, assuming 0 W");
    }

    points
        .iter()
        .map(|&(ts, load)| (ts, load.or_else(|| interpolate(&known, ts)).unwrap_or(0.0)))
        .collect()
}

/// Value at `ts` from the closest known points; a missing tail is `None`
fn interpolate(known: &BTreeMap<i64, f64>, ts: i64) -> Option<f64> {
    if let Some(value) = known.get(&ts) {
        return Some(*value);
    }
    let before = known.range(..ts).next_back();
    let after = known.range(ts + 1..).next();
    match (before, after) {
        (Some((&t0, &v0)), Some((&t1, &v1))) => {
            Some(v0 + (v1 - v0) * (ts - t0) as f64 / (t1 - t0) as f64)
        }
        (Some((_, &v0)), None) => Some(v0),
        (None, Some((_, &v1))) => Some(v1),
        (None, None) => None,
    }
}

/// One power value per recovered second from a status file
fn status_powers(
    kind: SourceKind,
    configured: bool,
    prefix: Option<&Path>,
    today: NaiveDate,
    loads: &[(i64, f64)],
) -> RecoveryResult<Vec<f64>> {
    let zeros = vec![0.0; loads.len()];
    if !configured || loads.is_empty() {
        return Ok(zeros);
    }
    let Some(prefix) = prefix else {
        warn!("{kind} status output disabled, recovering the hour with 0 W {kind}");
        return Ok(zeros);
    };
    let path: PathBuf = day_path(prefix, today);
    if !path.exists() {
        warn!("No {kind} status file {}, recovering the hour with 0 W {kind}", path.display());
        return Ok(zeros);
    }

    let (first, last) = (loads[0].0, loads[loads.len() - 1].0);
    let known = read_status_file(&path, first, last)?;

    let mut uncovered = 0usize;
    let powers: Vec<f64> = loads
        .iter()
        .map(|&(ts, _)| {
            let value = if let Some(value) = known.get(&ts) {
                Some(*value)
            } else if known.range(ts..).next().is_some() {
                interpolate(&known, ts)
            } else {
                None
            };
            value.unwrap_or_else(|| {
                uncovered += 1;
                0.0
            })
        })
        .collect();

    if uncovered > 0 {
        warn!(
            "Recovery inconsistency: {kind} status covers {} of {} seconds, assuming 0 W for the rest",
            loads.len() - uncovered,
            loads.len()
        );
    }
    Ok(powers)
}

/// Power column of the status rows between `first` and `last`
fn read_status_file(path: &Path, first: i64, last: i64) -> RecoveryResult<BTreeMap<i64, f64>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let mut known = BTreeMap::new();
    for record in reader.records() {
        let record = record?;
        let (Some(ts), Some(power)) = (
            record.get(0).and_then(|f| f.parse::<i64>().ok()),
            record.get(1).and_then(|f| f.parse::<f64>().ok()),
        ) else {
            debug!("Skipping unreadable status row in {}: {record:?}", path.display());
            continue;
        };
        if ts > last {
            break;
        }
        if ts >= first {
            known.insert(ts, power);
        }
    }
    Ok(known)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OutputPaths, SourceConfig};
    use std::fs;
    use tempfile::TempDir;

    /// 2024-05-01 10:00:00 UTC
    const T0: i64 = 1_714_557_600;

    fn config(dir: &Path) -> CollectorConfig {
        CollectorConfig {
            pv: Some(SourceConfig::new("http://pv/rpc/Switch.GetStatus")),
            outputs: OutputPaths {
                load: Some(dir.join("load")),
                pv_status: Some(dir.join("pv")),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_nothing_to_recover_after_complete_hour() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("load2024-05-01.csv"), "timestamp,loads\n1714557600,1,2\n").unwrap();
        let hour = load_open_hour(&config(dir.path()), Tz::UTC, T0 + 4000).unwrap();
        assert!(hour.is_none());
    }

    #[test]
    fn test_missing_load_file_starts_from_zero() {
        let dir = TempDir::new().unwrap();
        let hour = load_open_hour(&config(dir.path()), Tz::UTC, T0).unwrap();
        assert!(hour.is_none());
    }

    #[test]
    fn test_recover_with_pv() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("load2024-05-01.csv"),
            "timestamp,loads\n1714554000,5,5\n1714557600,100,,300,-,500",
        )
        .unwrap();
        fs::write(
            dir.path().join("pv2024-05-01.csv"),
            "timestamp,power,status\n\
             1714557599,9.0,x\n\
             1714557600,50.0,233.1,0.2,1.0,2.0,30.0\n\
             1714557601,60.0,\n\
             1714557602,70.0,233.1,0.3,1.0,2.0,30.0\n",
        )
        .unwrap();

        let hour = load_open_hour(&config(dir.path()), Tz::UTC, T0 + 10).unwrap().unwrap();
        assert_eq!(hour.start, T0);
        assert_eq!(hour.next, T0 + 5);

        let loads: Vec<f64> = hour.samples.iter().map(|s| s.load).collect();
        assert_eq!(loads, vec![100.0, 200.0, 300.0, 500.0]);
        let timestamps: Vec<i64> = hour.samples.iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![T0, T0 + 1, T0 + 2, T0 + 4]);

        // PV file ends at T0 + 2, the tail is assumed 0 W
        let pv: Vec<f64> = hour.samples.iter().map(|s| s.pv).collect();
        assert_eq!(pv, vec![50.0, 60.0, 70.0, 0.0]);
        assert_eq!(hour.samples[0].meter, 50.0);
    }

    #[test]
    fn test_missing_pv_file_recovers_load_only() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("load2024-05-01.csv"), "timestamp,loads\n1714557600,100,110").unwrap();

        let hour = load_open_hour(&config(dir.path()), Tz::UTC, T0 + 10).unwrap().unwrap();
        assert_eq!(hour.samples.len(), 2);
        assert!(hour.samples.iter().all(|s| s.pv == 0.0));
        assert_eq!(hour.samples[1].meter, 110.0);
    }

    #[test]
    fn test_power_file_preferred_over_load_line() {
        let dir = TempDir::new().unwrap();
        let config = CollectorConfig {
            outputs: OutputPaths {
                power: Some(dir.path().join("power")),
                ..config(dir.path()).outputs
            },
            ..config(dir.path())
        };
        fs::write(dir.path().join("load2024-05-01.csv"), "timestamp,loads\n1714557600,180,,-,").unwrap();
        fs::write(
            dir.path().join("power2024-05-01.csv"),
            "timestamp,time,load,meter,pv,charge,discharge,l1,l2,l3,own_use,flags\n\
             1714557599,09:59:59,150.0,50.0,100.0,0.0,0.0,50.0,0.0,0.0,100.0,\n\
             1714557600,10:00:00,180.0,80.0,100.0,0.0,0.0,80.0,0.0,0.0,100.0,\n\
             1714557601,10:00:01,190.0,90.0,100.0,0.0,0.0,,,,100.0,i\n\
             1714557603,10:00:03,180.0,-400.0,100.0,0.0,0.0,-400.0,0.0,0.0,100.0,s\n",
        )
        .unwrap();

        let hour = load_open_hour(&config, Tz::UTC, T0 + 10).unwrap().unwrap();
        assert_eq!(hour.next, T0 + 4);
        let timestamps: Vec<i64> = hour.samples.iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![T0, T0 + 1, T0 + 3]);

        assert!(hour.samples[1].synthetic);
        assert_eq!(hour.samples[1].phases, None);
        let substituted = &hour.samples[2];
        assert!(!substituted.plausible);
        assert_eq!(substituted.load, 180.0);
        assert_eq!(substituted.meter, -400.0);
        assert_eq!(substituted.phases, Some([-400.0, 0.0, 0.0]));
    }

    #[test]
    fn test_power_file_gap_falls_back_per_second() {
        let dir = TempDir::new().unwrap();
        let config = CollectorConfig {
            outputs: OutputPaths {
                power: Some(dir.path().join("power")),
                ..config(dir.path()).outputs
            },
            ..config(dir.path())
        };
        fs::write(dir.path().join("load2024-05-01.csv"), "timestamp,loads\n1714557600,180,200").unwrap();
        fs::write(
            dir.path().join("power2024-05-01.csv"),
            "timestamp,time,load,meter,pv,charge,discharge,l1,l2,l3,own_use,flags\n\
             1714557600,10:00:00,180.0,80.0,100.0,0.0,0.0,80.0,0.0,0.0,100.0,\n",
        )
        .unwrap();

        let hour = load_open_hour(&config, Tz::UTC, T0 + 10).unwrap().unwrap();
        assert_eq!(hour.samples.len(), 2);
        assert_eq!(hour.samples[0].meter, 80.0);
        // no pv status file, the second second comes from the load line alone
        assert_eq!(hour.samples[1].load, 200.0);
        assert_eq!(hour.samples[1].meter, 200.0);
    }

    #[test]
    fn test_malformed_line_is_fatal() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("load2024-05-01.csv"), "timestamp,loads\n1714557600,100,abc").unwrap();

        let result = load_open_hour(&config(dir.path()), Tz::UTC, T0 + 10);
        assert!(matches!(result, Err(RecoveryError::Malformed { .. })));
    }

    #[test]
    fn test_interior_status_hole_interpolated() {
        let mut known = BTreeMap::new();
        known.insert(10, 100.0);
        known.insert(14, 500.0);
        assert_eq!(interpolate(&known, 12), Some(300.0));
        assert_eq!(interpolate(&known, 20), Some(500.0));
        assert_eq!(interpolate(&BTreeMap::new(), 20), None);
    }

    #[test]
    fn test_trailing_suppressed_second_carries_previous() {
        let points = vec![(1, Some(100.0)), (2, Some(120.0)), (3, None)];
        assert_eq!(fill_gaps(&points), vec![(1, 100.0), (2, 120.0), (3, 120.0)]);
    }
}
