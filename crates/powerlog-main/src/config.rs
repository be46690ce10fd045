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

//! Command line and environment configuration.
//!
//! Every option can also be set through its environment variable. An empty
//! value disables the source or output.

use anyhow::{Context, bail};
use clap::Parser;
use powerlog_core::offline::DEFAULT_TOLERANCE_W;
use powerlog_core::{CollectorConfig, Credentials, InverterConfig, OutputPaths, SourceConfig};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "powerlog")]
#[command(author, version, about = "Per-second household load collector")]
#[command(
    long_about = "Polls a three-phase grid meter once per second, together with optional PV,\n\
    battery charger and battery discharge devices, and derives the household load.\n\
    \nWrites per-second, per-minute and per-hour CSV files and rebuilds the unfinished\n\
    hour after a restart.\n\
    \nExamples:\n  \
    powerlog --meter-url http://10.0.0.5/status --load-file /data/load-\n  \
    powerlog --offline capture.csv --hour-file /data/hour-"
)]
pub struct Cli {
    /// Three-phase meter status URL
    #[arg(long, env = "METER_URL")]
    pub meter_url: Option<String>,

    /// Meter credentials as user:password
    #[arg(long, env = "METER_AUTH")]
    pub meter_auth: Option<String>,

    /// PV switch status URL
    #[arg(long, env = "PV_URL")]
    pub pv_url: Option<String>,

    #[arg(long, env = "PV_AUTH")]
    pub pv_auth: Option<String>,

    /// Battery charger switch status URL
    #[arg(long, env = "CHARGER_URL")]
    pub charger_url: Option<String>,

    #[arg(long, env = "CHARGER_AUTH")]
    pub charger_auth: Option<String>,

    /// Battery discharge switch status URL
    #[arg(long, env = "DISCHARGE_URL")]
    pub discharge_url: Option<String>,

    #[arg(long, env = "DISCHARGE_AUTH")]
    pub discharge_auth: Option<String>,

    /// DTU live data URL of the battery discharge inverter
    #[arg(long, env = "INVERTER_URL")]
    pub inverter_url: Option<String>,

    #[arg(long, env = "INVERTER_AUTH")]
    pub inverter_auth: Option<String>,

    /// Serial number of the discharge inverter
    #[arg(long, env = "INVERTER_SERIAL")]
    pub inverter_serial: Option<String>,

    /// Prefix of the daily per-second power files
    #[arg(long, env = "POWER_FILE")]
    pub power_file: Option<PathBuf>,

    #[arg(long, env = "METER_STATUS_FILE")]
    pub meter_status_file: Option<PathBuf>,

    #[arg(long, env = "PV_STATUS_FILE")]
    pub pv_status_file: Option<PathBuf>,

    #[arg(long, env = "CHARGER_STATUS_FILE")]
    pub charger_status_file: Option<PathBuf>,

    #[arg(long, env = "DISCHARGE_STATUS_FILE")]
    pub discharge_status_file: Option<PathBuf>,

    /// Prefix of the daily clean load files, also used for recovery
    #[arg(long, env = "LOAD_FILE")]
    pub load_file: Option<PathBuf>,

    /// Prefix of the yearly per-minute load files
    #[arg(long, env = "MINUTE_FILE")]
    pub minute_file: Option<PathBuf>,

    /// Prefix of the yearly per-hour energy files
    #[arg(long, env = "HOUR_FILE")]
    pub hour_file: Option<PathBuf>,

    /// Prefix of the yearly event logs
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// IANA time zone for day and hour buckets
    #[arg(long, env = "TZ_NAME", default_value = "UTC")]
    pub timezone: String,

    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 900)]
    pub poll_interval_ms: u64,

    /// Per-request HTTP timeout
    #[arg(long, env = "HTTP_TIMEOUT_MS", default_value_t = 1000)]
    pub timeout_ms: u64,

    /// Longest meter clock gap that is filled by interpolation
    #[arg(long, env = "MAX_INTERPOLATION_SECS", default_value_t = 600)]
    pub max_interpolation_secs: i64,

    #[arg(long, env = "PV_STANDBY_W", default_value_t = 0.9)]
    pub pv_standby_w: f64,

    #[arg(long, env = "DISCHARGE_STANDBY_W", default_value_t = 0.5)]
    pub discharge_standby_w: f64,

    /// Replay `timestamp,load,pv,l1,l2,l3` rows instead of polling (stdin without inputs)
    #[arg(long, num_args = 0.., value_name = "INPUT")]
    pub offline: Option<Vec<PathBuf>>,

    /// Allowed difference between recorded and composed load in offline rows
    #[arg(long, default_value_t = DEFAULT_TOLERANCE_W)]
    pub offline_tolerance_w: f64,
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn path(value: Option<&PathBuf>) -> Option<PathBuf> {
    value.filter(|p| !p.as_os_str().is_empty()).cloned()
}

fn source(url: Option<&String>, auth: Option<&String>, name: &str) -> anyhow::Result<Option<SourceConfig>> {
    let Some(url) = non_empty(url) else {
        return Ok(None);
    };
    let credentials = non_empty(auth)
        .map(|a| a.parse::<Credentials>())
        .transpose()
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("invalid {name} credentials"))?;
    Ok(Some(SourceConfig {
        url: url.to_owned(),
        credentials,
    }))
}

impl Cli {
    pub fn is_offline(&self) -> bool {
        self.offline.is_some()
    }

    pub fn collector_config(&self) -> anyhow::Result<CollectorConfig> {
        let meter = source(self.meter_url.as_ref(), self.meter_auth.as_ref(), "meter")?;
        let meter = match meter {
            Some(meter) => meter,
            None if self.is_offline() => SourceConfig::new(""),
            None => bail!("a meter URL is required (--meter-url or METER_URL)"),
        };

        let discharge_inverter = match source(
            self.inverter_url.as_ref(),
            self.inverter_auth.as_ref(),
            "inverter",
        )? {
            Some(source) => {
                let serial = non_empty(self.inverter_serial.as_ref())
                    .context("the discharge inverter needs --inverter-serial")?;
                Some(InverterConfig {
                    source,
                    serial: serial.to_owned(),
                })
            }
            None => None,
        };

        Ok(CollectorConfig {
            meter,
            pv: source(self.pv_url.as_ref(), self.pv_auth.as_ref(), "pv")?,
            charger: source(self.charger_url.as_ref(), self.charger_auth.as_ref(), "charger")?,
            discharge_switch: source(
                self.discharge_url.as_ref(),
                self.discharge_auth.as_ref(),
                "discharge",
            )?,
            discharge_inverter,
            outputs: OutputPaths {
                power: path(self.power_file.as_ref()),
                meter_status: path(self.meter_status_file.as_ref()),
                pv_status: path(self.pv_status_file.as_ref()),
                charger_status: path(self.charger_status_file.as_ref()),
                discharge_status: path(self.discharge_status_file.as_ref()),
                load: path(self.load_file.as_ref()),
                minute: path(self.minute_file.as_ref()),
                hour: path(self.hour_file.as_ref()),
                log: path(self.log_file.as_ref()),
            },
            timezone: self.timezone.clone(),
            poll_interval_ms: self.poll_interval_ms,
            http_timeout_ms: self.timeout_ms,
            max_interpolation_secs: self.max_interpolation_secs,
            pv_standby_w: self.pv_standby_w,
            discharge_standby_w: self.discharge_standby_w,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("powerlog").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_minimal_live_config() {
        let cli = parse(&["--meter-url", "http://meter/status", "--meter-auth", "admin:pw"]);
        let config = cli.collector_config().unwrap();

        assert_eq!(config.meter.url, "http://meter/status");
        assert_eq!(config.meter.credentials.unwrap().password, "pw");
        assert!(config.pv.is_none());
        assert_eq!(config.poll_interval_ms, 900);
        assert_eq!(config.timezone, "UTC");
        assert!(!cli.is_offline());
    }

    #[test]
    fn test_empty_values_disable() {
        let cli = parse(&[
            "--meter-url",
            "http://meter/status",
            "--pv-url",
            "",
            "--load-file",
            "",
            "--hour-file",
            "/data/hour-",
        ]);
        let config = cli.collector_config().unwrap();
        assert!(config.pv.is_none());
        assert!(config.outputs.load.is_none());
        assert_eq!(config.outputs.hour, Some(PathBuf::from("/data/hour-")));
    }

    #[test]
    fn test_meter_required_outside_offline_mode() {
        let cli = parse(&[]);
        assert!(cli.collector_config().is_err());

        let cli = parse(&["--offline"]);
        assert!(cli.is_offline());
        assert_eq!(cli.offline.as_deref(), Some(&[][..]));
        assert!(cli.collector_config().is_ok());
    }

    #[test]
    fn test_offline_inputs() {
        let cli = parse(&["--offline", "a.csv", "b.csv", "--offline-tolerance-w", "5"]);
        assert_eq!(
            cli.offline,
            Some(vec![PathBuf::from("a.csv"), PathBuf::from("b.csv")])
        );
        assert_eq!(cli.offline_tolerance_w, 5.0);
    }

    #[test]
    fn test_inverter_needs_serial() {
        let cli = parse(&[
            "--meter-url",
            "http://meter/status",
            "--inverter-url",
            "http://dtu/api/livedata/status",
        ]);
        assert!(cli.collector_config().is_err());

        let cli = parse(&[
            "--meter-url",
            "http://meter/status",
            "--inverter-url",
            "http://dtu/api/livedata/status",
            "--inverter-serial",
            "116180012345",
        ]);
        let config = cli.collector_config().unwrap();
        assert_eq!(config.discharge_inverter.unwrap().serial, "116180012345");
    }
}
