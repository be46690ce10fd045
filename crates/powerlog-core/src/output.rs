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

//! Output files
//!
//! Day scoped streams are named `<prefix><YYYY-MM-DD>.csv`, year scoped ones
//! `<prefix><YYYY>.csv`. Every stream is optional; a disabled stream writes
//! into a sink. Files are opened for append and get their header only while
//! empty.

use crate::composer::Sample;
use crate::config::OutputPaths;
use crate::error::{OutputError, OutputResult};
use crate::event_log::EventLog;
use crate::rollup::{HourSummary, MinuteSummary};
use chrono::{DateTime, Datelike, NaiveDate};
use chrono_tz::Tz;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const POWER_HEADER: &str = "timestamp,time,load,meter,pv,charge,discharge,l1,l2,l3,own_use,flags";
pub const METER_STATUS_HEADER: &str = "timestamp,\
    l1_power,l1_pf,l1_current,l1_voltage,l1_total,l1_total_returned,\
    l2_power,l2_pf,l2_current,l2_voltage,l2_total,l2_total_returned,\
    l3_power,l3_pf,l3_current,l3_voltage,l3_total,l3_total_returned";
pub const AUX_STATUS_HEADER: &str = "timestamp,power,status";
pub const LOAD_HEADER: &str = "timestamp,loads";
pub const MINUTE_HEADER: &str = "minute,avg_load";
pub const HOUR_HEADER: &str =
    "hour,consumed,produced,charged,discharged,own_used,balance,imported,exported,battery_voltage";

/// `<prefix><YYYY-MM-DD>.csv`
pub fn day_path(prefix: &Path, date: NaiveDate) -> PathBuf {
    suffixed(prefix, &format!("{}.csv", date.format("%Y-%m-%d")))
}

/// `<prefix><YYYY>.<extension>`
pub fn year_path(prefix: &Path, year: i32, extension: &str) -> PathBuf {
    suffixed(prefix, &format!("{year:04}.{extension}"))
}

fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

pub(crate) fn local_time(tz: Tz, timestamp: i64) -> Option<DateTime<Tz>> {
    DateTime::from_timestamp(timestamp, 0).map(|utc| utc.with_timezone(&tz))
}

fn format_local(tz: Tz, timestamp: i64, format: &str) -> String {
    local_time(tz, timestamp).map_or_else(|| timestamp.to_string(), |t| t.format(format).to_string())
}

/// Status of one auxiliary source for a genuine second
#[derive(Debug, Clone, Copy)]
pub struct AuxRecord<'a> {
    /// Power that went into the sample
    pub power: f64,
    /// Device fields, empty when the power was substituted
    pub status: &'a str,
}

/// Pass-through device data of a genuine (not interpolated) second
#[derive(Debug, Clone, Copy, Default)]
pub struct SecondRecord<'a> {
    pub meter_status: &'a str,
    pub pv: Option<AuxRecord<'a>>,
    pub charger: Option<AuxRecord<'a>>,
    pub discharge: Option<AuxRecord<'a>>,
}

#[derive(Debug)]
enum Sink {
    Discard,
    File { path: PathBuf, writer: BufWriter<File> },
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Discard => io::sink().write(buf),
            Self::File { writer, .. } => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Discard => Ok(()),
            Self::File { writer, .. } => writer.flush(),
        }
    }
}

#[derive(Debug)]
struct Stream {
    prefix: Option<PathBuf>,
    header: &'static str,
    sink: Sink,
}

impl Stream {
    fn new(prefix: Option<&PathBuf>, header: &'static str) -> Self {
        Self {
            prefix: prefix.cloned(),
            header,
            sink: Sink::Discard,
        }
    }

    /// Open `path`, returning whether it ended without a newline
    fn open(&mut self, path: PathBuf) -> OutputResult<bool> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|source| OutputError::Open {
                path: path.clone(),
                source,
            })?;

        let len = file.metadata()?.len();
        let mut unterminated = false;
        if len > 0 {
            file.seek(SeekFrom::End(-1))?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last)?;
            unterminated = last[0] != b'\n';
        }

        let mut writer = BufWriter::new(file);
        if len == 0 {
            writeln!(writer, "{}", self.header)?;
        }
        debug!("Opened {}", path.display());
        self.sink = Sink::File { path, writer };
        Ok(unterminated)
    }

    fn close(&mut self) -> OutputResult<()> {
        if let Sink::File { path, mut writer } = std::mem::replace(&mut self.sink, Sink::Discard) {
            writer.flush()?;
            debug!("Closed {}", path.display());
        }
        Ok(())
    }
}

/// Position of the per-hour line in the load file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LoadLine {
    start: i64,
    /// Next second expected on the line
    next: i64,
}

/// All output streams of the collector
#[derive(Debug)]
pub struct OutputSet {
    tz: Tz,
    day: Option<NaiveDate>,
    year: Option<i32>,

    power: Stream,
    meter_status: Stream,
    pv_status: Stream,
    charger_status: Stream,
    discharge_status: Stream,
    load: Stream,

    minute: Stream,
    hour: Stream,
    log_prefix: Option<PathBuf>,
    event_log: EventLog,

    load_line: Option<LoadLine>,
    resume: Option<LoadLine>,
}

impl OutputSet {
    pub fn new(paths: &OutputPaths, tz: Tz, event_log: EventLog) -> Self {
        Self {
            tz,
            day: None,
            year: None,
            power: Stream::new(paths.power.as_ref(), POWER_HEADER),
            meter_status: Stream::new(paths.meter_status.as_ref(), METER_STATUS_HEADER),
            pv_status: Stream::new(paths.pv_status.as_ref(), AUX_STATUS_HEADER),
            charger_status: Stream::new(paths.charger_status.as_ref(), AUX_STATUS_HEADER),
            discharge_status: Stream::new(paths.discharge_status.as_ref(), AUX_STATUS_HEADER),
            load: Stream::new(paths.load.as_ref(), LOAD_HEADER),
            minute: Stream::new(paths.minute.as_ref(), MINUTE_HEADER),
            hour: Stream::new(paths.hour.as_ref(), HOUR_HEADER),
            log_prefix: paths.log.clone(),
            event_log,
            load_line: None,
            resume: None,
        }
    }

    /// Continue an unterminated hour line of the load file on next open
    pub fn resume_load_line(&mut self, start: i64, next: i64) {
        self.resume = Some(LoadLine { start, next });
    }

    pub fn current_day(&self) -> Option<NaiveDate> {
        self.day
    }

    /// Make sure the streams for `date` are open
    pub fn rotate(&mut self, date: NaiveDate) -> OutputResult<()> {
        if self.day == Some(date) {
            return Ok(());
        }
        if let Some(previous) = self.day {
            info!("Day rollover {previous} -> {date}");
        }
        self.close_day()?;
        self.ensure_year(date.year())?;
        self.open_day(date)
    }

    /// Open the year scoped streams (minute, hour, event log) for `year`
    pub fn ensure_year(&mut self, year: i32) -> OutputResult<()> {
        if self.year != Some(year) {
            self.close_year()?;
            self.open_year(year)?;
        }
        Ok(())
    }

    fn day_streams(&mut self) -> [&mut Stream; 5] {
        [
            &mut self.power,
            &mut self.meter_status,
            &mut self.pv_status,
            &mut self.charger_status,
            &mut self.discharge_status,
        ]
    }

    fn open_day(&mut self, date: NaiveDate) -> OutputResult<()> {
        for stream in self.day_streams() {
            if let Some(prefix) = stream.prefix.clone() {
                stream.open(day_path(&prefix, date))?;
            }
        }

        let resume = self.resume.take();
        if let Some(prefix) = self.load.prefix.clone() {
            let unterminated = self.load.open(day_path(&prefix, date))?;
            if resume.is_some() {
                self.load_line = resume;
            } else if unterminated {
                warn!("Load file for {date} ends with an unfinished hour, terminating it");
                self.load.sink.write_all(b"\n")?;
            }
        }

        self.day = Some(date);
        Ok(())
    }

    /// Close the day scoped streams. An open load line stays unterminated so
    /// a restart can resume it.
    pub fn close_day(&mut self) -> OutputResult<()> {
        for stream in self.day_streams() {
            stream.close()?;
        }
        self.load.close()?;
        self.load_line = None;
        self.day = None;
        Ok(())
    }

    fn open_year(&mut self, year: i32) -> OutputResult<()> {
        for stream in [&mut self.minute, &mut self.hour] {
            if let Some(prefix) = stream.prefix.clone() {
                stream.open(year_path(&prefix, year, "csv"))?;
            }
        }
        if let Some(prefix) = &self.log_prefix {
            self.event_log.open(&year_path(prefix, year, "log"))?;
        }
        self.year = Some(year);
        Ok(())
    }

    pub fn close_year(&mut self) -> OutputResult<()> {
        self.minute.close()?;
        self.hour.close()?;
        self.event_log.close()?;
        self.year = None;
        Ok(())
    }

    pub fn flush(&mut self) -> OutputResult<()> {
        for stream in self.day_streams() {
            stream.sink.flush()?;
        }
        for stream in [&mut self.load, &mut self.minute, &mut self.hour] {
            stream.sink.flush()?;
        }
        Ok(())
    }

    /// Rows of one second: composite power, device status, clean load
    pub fn write_second(&mut self, sample: &Sample, record: Option<&SecondRecord<'_>>) -> OutputResult<()> {
        let ts = sample.timestamp;
        let phases = sample
            .phases
            .map(|p| format!("{:.1},{:.1},{:.1}", p[0], p[1], p[2]))
            .unwrap_or_else(|| ",,".to_owned());
        let flags = match (sample.synthetic, sample.plausible) {
            (true, true) => "i",
            (true, false) => "is",
            (false, false) => "s",
            (false, true) => "",
        };
        writeln!(
            self.power.sink,
            "{ts},{},{:.1},{:.1},{:.1},{:.1},{:.1},{phases},{:.1},{flags}",
            format_local(self.tz, ts, "%H:%M:%S"),
            sample.load,
            sample.meter,
            sample.pv,
            sample.charge,
            sample.discharge,
            sample.own_use,
        )?;

        if let Some(record) = record {
            writeln!(self.meter_status.sink, "{ts},{}", record.meter_status)?;
            for (stream, aux) in [
                (&mut self.pv_status, record.pv),
                (&mut self.charger_status, record.charger),
                (&mut self.discharge_status, record.discharge),
            ] {
                if let Some(aux) = aux {
                    writeln!(stream.sink, "{ts},{:.1},{}", aux.power, aux.status)?;
                }
            }
        }

        self.write_load(ts, sample.clean_load())
    }

    /// Append one second to the hour line; skipped seconds are padded with `-`
    fn write_load(&mut self, ts: i64, value: Option<i64>) -> OutputResult<()> {
        let mut line = match self.load_line {
            Some(line) if ts < line.next => {
                debug!("Load second {ts} already written");
                return Ok(());
            }
            Some(line) => line,
            None => {
                write!(self.load.sink, "{ts}")?;
                LoadLine { start: ts, next: ts }
            }
        };

        for _ in line.next..ts {
            self.load.sink.write_all(b",-")?;
        }
        match value {
            Some(load) => write!(self.load.sink, ",{load}")?,
            None => self.load.sink.write_all(b",")?,
        }
        line.next = ts + 1;
        self.load_line = Some(line);
        Ok(())
    }

    /// Terminate the hour line of the load file
    pub fn end_load_line(&mut self) -> OutputResult<()> {
        if let Some(line) = self.load_line.take() {
            debug!("Load line {} closed after {} seconds", line.start, line.next - line.start);
            self.load.sink.write_all(b"\n")?;
        }
        Ok(())
    }

    pub fn write_minute(&mut self, minute: &MinuteSummary) -> OutputResult<()> {
        writeln!(
            self.minute.sink,
            "{},{:.0}",
            format_local(self.tz, minute.start, "%Y-%m-%d %H:%M"),
            minute.average_load
        )?;
        Ok(())
    }

    pub fn write_hour(&mut self, hour: &HourSummary) -> OutputResult<()> {
        let e = &hour.energy;
        let voltage = hour
            .battery_voltage
            .map(|v| format!("{v:.1}"))
            .unwrap_or_default();
        writeln!(
            self.hour.sink,
            "{},{},{},{},{},{},{},{},{},{voltage}",
            format_local(self.tz, hour.start, "%Y-%m-%d %H:00"),
            e.consumed,
            e.produced,
            e.charged,
            e.discharged,
            e.own_used,
            e.balance,
            e.imported,
            e.exported,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// 2024-05-01 10:00:00 UTC
    const T0: i64 = 1_714_557_600;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn paths(dir: &Path) -> OutputPaths {
        OutputPaths {
            power: Some(dir.join("power")),
            load: Some(dir.join("load")),
            pv_status: Some(dir.join("pv")),
            minute: Some(dir.join("minute")),
            hour: Some(dir.join("hour")),
            ..Default::default()
        }
    }

    #[test]
    fn test_file_naming() {
        let prefix = Path::new("/var/log/power/load-");
        assert_eq!(
            day_path(prefix, date(2024, 5, 1)),
            PathBuf::from("/var/log/power/load-2024-05-01.csv")
        );
        assert_eq!(
            year_path(prefix, 2024, "log"),
            PathBuf::from("/var/log/power/load-2024.log")
        );
    }

    #[test]
    fn test_header_only_into_empty_file() {
        let dir = TempDir::new().unwrap();
        let mut outputs = OutputSet::new(&paths(dir.path()), Tz::UTC, EventLog::new());

        outputs.rotate(date(2024, 5, 1)).unwrap();
        outputs
            .write_second(&Sample::recovered(T0, 100.0, 0.0, 0.0, 0.0), None)
            .unwrap();
        outputs.close_day().unwrap();

        outputs.rotate(date(2024, 5, 1)).unwrap();
        outputs.close_day().unwrap();
        outputs.close_year().unwrap();

        let power = fs::read_to_string(dir.path().join("power2024-05-01.csv")).unwrap();
        assert_eq!(power.matches("timestamp,time").count(), 1);
        assert!(power.contains("1714557600,10:00:00,100.0,100.0,0.0,0.0,0.0,,,,0.0,\n"));
        assert!(dir.path().join("minute2024.csv").exists());
    }

    #[test]
    fn test_load_line_format() {
        let dir = TempDir::new().unwrap();
        let mut outputs = OutputSet::new(&paths(dir.path()), Tz::UTC, EventLog::new());
        outputs.rotate(date(2024, 5, 1)).unwrap();

        let mut synthetic = Sample::recovered(T0 + 2, 120.0, 0.0, 0.0, 0.0);
        synthetic.synthetic = true;
        outputs.write_second(&Sample::recovered(T0, 100.0, 0.0, 0.0, 0.0), None).unwrap();
        outputs.write_second(&Sample::recovered(T0 + 1, 110.0, 0.0, 0.0, 0.0), None).unwrap();
        outputs.write_second(&synthetic, None).unwrap();
        outputs.write_second(&Sample::recovered(T0 + 3, 130.0, 0.0, 0.0, 0.0), None).unwrap();
        outputs.write_second(&Sample::recovered(T0 + 6, 90.0, 0.0, 0.0, 0.0), None).unwrap();
        outputs.end_load_line().unwrap();
        outputs.close_day().unwrap();

        let load = fs::read_to_string(dir.path().join("load2024-05-01.csv")).unwrap();
        assert_eq!(load, "timestamp,loads\n1714557600,100,110,,130,-,-,90\n");
    }

    #[test]
    fn test_unfinished_line_kept_for_resume() {
        let dir = TempDir::new().unwrap();
        let mut outputs = OutputSet::new(&paths(dir.path()), Tz::UTC, EventLog::new());
        outputs.rotate(date(2024, 5, 1)).unwrap();
        outputs.write_second(&Sample::recovered(T0, 100.0, 0.0, 0.0, 0.0), None).unwrap();
        outputs.close_day().unwrap();

        let mut resumed = OutputSet::new(&paths(dir.path()), Tz::UTC, EventLog::new());
        resumed.resume_load_line(T0, T0 + 1);
        resumed.rotate(date(2024, 5, 1)).unwrap();
        resumed.write_second(&Sample::recovered(T0 + 2, 105.0, 0.0, 0.0, 0.0), None).unwrap();
        resumed.close_day().unwrap();

        let load = fs::read_to_string(dir.path().join("load2024-05-01.csv")).unwrap();
        assert_eq!(load, "timestamp,loads\n1714557600,100,-,105");
    }

    #[test]
    fn test_unfinished_line_terminated_without_resume() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("load2024-05-01.csv"), "timestamp,loads\n1714557600,100").unwrap();

        let mut outputs = OutputSet::new(&paths(dir.path()), Tz::UTC, EventLog::new());
        outputs.rotate(date(2024, 5, 1)).unwrap();
        outputs.write_second(&Sample::recovered(T0 + 3600, 7.0, 0.0, 0.0, 0.0), None).unwrap();
        outputs.close_day().unwrap();

        let load = fs::read_to_string(dir.path().join("load2024-05-01.csv")).unwrap();
        assert_eq!(load, "timestamp,loads\n1714557600,100\n1714561200,7");
    }

    #[test]
    fn test_aux_status_rows() {
        let dir = TempDir::new().unwrap();
        let mut outputs = OutputSet::new(&paths(dir.path()), Tz::UTC, EventLog::new());
        outputs.rotate(date(2024, 5, 1)).unwrap();

        let record = SecondRecord {
            meter_status: "",
            pv: Some(AuxRecord {
                power: 612.0,
                status: "233.1,2.6,1520.331,5189.200,41.3",
            }),
            charger: Some(AuxRecord { power: 0.0, status: "" }),
            discharge: None,
        };
        outputs
            .write_second(&Sample::recovered(T0, 100.0, 612.0, 0.0, 0.0), Some(&record))
            .unwrap();
        outputs.close_day().unwrap();

        let pv = fs::read_to_string(dir.path().join("pv2024-05-01.csv")).unwrap();
        assert_eq!(
            pv,
            "timestamp,power,status\n1714557600,612.0,233.1,2.6,1520.331,5189.200,41.3\n"
        );
        // charger output is disabled
        assert!(!dir.path().join("charger2024-05-01.csv").exists());
    }

    #[test]
    fn test_year_rotation_reopens_event_log() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new();
        let mut paths = paths(dir.path());
        paths.log = Some(dir.path().join("events"));
        let mut outputs = OutputSet::new(&paths, Tz::UTC, log.clone());

        outputs.rotate(date(2024, 12, 31)).unwrap();
        assert_eq!(log.path(), Some(dir.path().join("events2024.log")));

        outputs.rotate(date(2025, 1, 1)).unwrap();
        assert_eq!(log.path(), Some(dir.path().join("events2025.log")));
        assert!(dir.path().join("hour2025.csv").exists());
        assert_eq!(outputs.current_day(), Some(date(2025, 1, 1)));

        outputs.close_day().unwrap();
        outputs.close_year().unwrap();
        assert!(log.path().is_none());
    }

    #[test]
    fn test_summary_rows() {
        use crate::rollup::{EnergySums, HourEnergy};

        let dir = TempDir::new().unwrap();
        let mut outputs = OutputSet::new(&paths(dir.path()), Tz::UTC, EventLog::new());
        outputs.rotate(date(2024, 5, 1)).unwrap();
        outputs
            .write_minute(&MinuteSummary {
                start: T0,
                average_load: 101.4,
                samples: 60,
            })
            .unwrap();
        outputs
            .write_hour(&HourSummary {
                start: T0,
                sums: EnergySums::default(),
                energy: HourEnergy {
                    consumed: 500,
                    produced: 200,
                    charged: 100,
                    discharged: 0,
                    own_used: 200,
                    balance: 400,
                    imported: 400,
                    exported: 0,
                },
                battery_voltage: Some(51.84),
                samples: 3600,
            })
            .unwrap();
        outputs.close_year().unwrap();

        let minute = fs::read_to_string(dir.path().join("minute2024.csv")).unwrap();
        assert_eq!(minute, "minute,avg_load\n2024-05-01 10:00,101\n");
        let hour = fs::read_to_string(dir.path().join("hour2024.csv")).unwrap();
        assert!(hour.ends_with("2024-05-01 10:00,500,200,100,0,200,400,400,0,51.8\n"));
    }
}
