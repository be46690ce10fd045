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

//! Collector configuration
//!
//! The binary fills this from command-line arguments and environment variables.
//! Every optional source or output left as `None` is disabled.

use crate::error::{CollectorError, CollectorResult};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// HTTP Basic credentials, written as `user:password`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl FromStr for Credentials {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("credentials must not be empty".to_owned());
        }
        let (username, password) = s.split_once(':').unwrap_or((s, ""));
        Ok(Self {
            username: username.to_owned(),
            password: password.to_owned(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

impl SourceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverterConfig {
    pub source: SourceConfig,
    /// Serial number selecting the inverter in the DTU live data
    pub serial: String,
}

/// Output file prefixes. `<prefix><YYYY-MM-DD>.csv` for daily files,
/// `<prefix><YYYY>.csv` (or `.log`) for yearly ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputPaths {
    pub power: Option<PathBuf>,
    pub meter_status: Option<PathBuf>,
    pub pv_status: Option<PathBuf>,
    pub charger_status: Option<PathBuf>,
    pub discharge_status: Option<PathBuf>,
    pub load: Option<PathBuf>,
    pub minute: Option<PathBuf>,
    pub hour: Option<PathBuf>,
    pub log: Option<PathBuf>,
}

fn default_timezone() -> String {
    "UTC".to_owned()
}

fn default_poll_interval_ms() -> u64 {
    900
}

fn default_http_timeout_ms() -> u64 {
    1000
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_max_interpolation_secs() -> i64 {
    600
}

fn default_clock_skew_tolerance_secs() -> i64 {
    3
}

fn default_pv_standby_w() -> f64 {
    0.9
}

fn default_discharge_standby_w() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub meter: SourceConfig,

    #[serde(default)]
    pub pv: Option<SourceConfig>,

    #[serde(default)]
    pub charger: Option<SourceConfig>,

    #[serde(default)]
    pub discharge_switch: Option<SourceConfig>,

    #[serde(default)]
    pub discharge_inverter: Option<InverterConfig>,

    #[serde(default)]
    pub outputs: OutputPaths,

    /// IANA zone used for day/hour bucketing and file names
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Fixed sleep between polling cycles
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    /// Pause before retrying the meter after a non-timeout failure
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Longest meter clock jump that is still filled by interpolation
    #[serde(default = "default_max_interpolation_secs")]
    pub max_interpolation_secs: i64,

    #[serde(default = "default_clock_skew_tolerance_secs")]
    pub clock_skew_tolerance_secs: i64,

    /// PV readings below this are inverter standby draw
    #[serde(default = "default_pv_standby_w")]
    pub pv_standby_w: f64,

    #[serde(default = "default_discharge_standby_w")]
    pub discharge_standby_w: f64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            meter: SourceConfig::new("http://127.0.0.1/status"),
            pv: None,
            charger: None,
            discharge_switch: None,
            discharge_inverter: None,
            outputs: OutputPaths::default(),
            timezone: default_timezone(),
            poll_interval_ms: default_poll_interval_ms(),
            http_timeout_ms: default_http_timeout_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            max_interpolation_secs: default_max_interpolation_secs(),
            clock_skew_tolerance_secs: default_clock_skew_tolerance_secs(),
            pv_standby_w: default_pv_standby_w(),
            discharge_standby_w: default_discharge_standby_w(),
        }
    }
}

impl CollectorConfig {
    pub fn tz(&self) -> CollectorResult<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| CollectorError::Config(format!("invalid timezone '{}': {e}", self.timezone)))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn validate(&self) -> CollectorResult<()> {
        if self.meter.url.is_empty() {
            return Err(CollectorError::Config("meter URL is required".to_owned()));
        }
        if self.http_timeout_ms == 0 {
            return Err(CollectorError::Config(
                "HTTP timeout must be greater than zero".to_owned(),
            ));
        }
        if self.max_interpolation_secs < 1 {
            return Err(CollectorError::Config(
                "max interpolation window must be at least one second".to_owned(),
            ));
        }
        if let Some(inverter) = &self.discharge_inverter
            && inverter.serial.is_empty()
        {
            return Err(CollectorError::Config(
                "discharge inverter needs a serial number".to_owned(),
            ));
        }
        self.tz()?;
        Ok(())
    }
}
