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

//! Minute and hour rollups
//!
//! Buckets follow the local time of the configured zone. A bucket closes on
//! its last second (`ss == 59`, `mm:ss == 59:59`); a bucket whose last second
//! never arrived is closed by the first sample of a later bucket.

use crate::composer::Sample;
use chrono::{DateTime, Timelike};
use chrono_tz::Tz;
use serde::Serialize;

/// Allowed deviation of the hourly balance identities, in Wh
pub const BALANCE_TOLERANCE_WH: f64 = 1.0;

const WS_PER_WH: f64 = 3600.0;

/// Energy sums in watt-seconds
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct EnergySums {
    pub consumed: f64,
    pub produced: f64,
    pub charged: f64,
    pub discharged: f64,
    pub own_used: f64,
    /// Net grid energy, import positive
    pub balance: f64,
    pub imported: f64,
    pub exported: f64,
}

impl EnergySums {
    pub fn add(&mut self, sample: &Sample) {
        self.consumed += sample.load;
        self.produced += sample.pv;
        self.charged += sample.charge;
        self.discharged += sample.discharge;
        self.own_used += sample.own_use;
        self.balance += sample.meter;
        self.imported += sample.meter.max(0.0);
        self.exported += (-sample.meter).max(0.0);
    }

    /// Deviation of `consumed + charged - discharged - produced` from the balance, in Wh
    pub fn flow_deviation_wh(&self) -> f64 {
        (self.consumed + self.charged - self.discharged - self.produced - self.balance) / WS_PER_WH
    }

    /// Deviation of `imported - exported` from the balance, in Wh
    pub fn grid_deviation_wh(&self) -> f64 {
        (self.imported - self.exported - self.balance) / WS_PER_WH
    }

    pub fn to_wh(&self) -> HourEnergy {
        let wh = |ws: f64| (ws / WS_PER_WH).round() as i64;
        HourEnergy {
            consumed: wh(self.consumed),
            produced: wh(self.produced),
            charged: wh(self.charged),
            discharged: wh(self.discharged),
            own_used: wh(self.own_used),
            balance: wh(self.balance),
            imported: wh(self.imported),
            exported: wh(self.exported),
        }
    }
}

/// Rounded watt-hours of one hour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HourEnergy {
    pub consumed: i64,
    pub produced: i64,
    pub charged: i64,
    pub discharged: i64,
    pub own_used: i64,
    pub balance: i64,
    pub imported: i64,
    pub exported: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MinuteSummary {
    /// First second of the minute
    pub start: i64,
    pub average_load: f64,
    pub samples: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HourSummary {
    /// First second of the hour
    pub start: i64,
    pub sums: EnergySums,
    pub energy: HourEnergy,
    /// Last battery voltage seen during the hour
    pub battery_voltage: Option<f64>,
    pub samples: u32,
}

impl HourSummary {
    pub fn is_balanced(&self) -> bool {
        self.sums.flow_deviation_wh().abs() <= BALANCE_TOLERANCE_WH
            && self.sums.grid_deviation_wh().abs() <= BALANCE_TOLERANCE_WH
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RollupEvent {
    MinuteClosed(MinuteSummary),
    HourClosed(HourSummary),
}

#[derive(Debug, Clone)]
struct MinuteAccumulator {
    start: i64,
    load: f64,
    samples: u32,
}

#[derive(Debug, Clone)]
struct HourAccumulator {
    start: i64,
    sums: EnergySums,
    battery_voltage: Option<f64>,
    samples: u32,
}

/// Open minute and hour of the rollup, owned by the collector
#[derive(Debug, Clone)]
pub struct Rollup {
    tz: Tz,
    minute: Option<MinuteAccumulator>,
    hour: Option<HourAccumulator>,
}

impl Rollup {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            minute: None,
            hour: None,
        }
    }

    fn local(&self, timestamp: i64) -> Option<DateTime<Tz>> {
        DateTime::from_timestamp(timestamp, 0).map(|utc| utc.with_timezone(&self.tz))
    }

    fn minute_start(&self, timestamp: i64) -> i64 {
        let second = self.local(timestamp).map_or(0, |t| i64::from(t.second()));
        timestamp - second
    }

    fn hour_start(&self, timestamp: i64) -> i64 {
        let offset = self
            .local(timestamp)
            .map_or(0, |t| i64::from(t.minute()) * 60 + i64::from(t.second()));
        timestamp - offset
    }

    /// Close buckets that `timestamp` no longer belongs to
    pub fn close_stale(&mut self, timestamp: i64) -> Vec<RollupEvent> {
        let mut events = Vec::new();
        let minute = self.minute_start(timestamp);
        if self.minute.as_ref().is_some_and(|m| m.start != minute) {
            events.extend(self.close_minute());
        }
        let hour = self.hour_start(timestamp);
        if self.hour.as_ref().is_some_and(|h| h.start != hour) {
            events.extend(self.close_hour());
        }
        events
    }

    /// Add a sample, closing its buckets when it is their last second
    pub fn accumulate(&mut self, sample: &Sample) -> Vec<RollupEvent> {
        let minute_start = self.minute_start(sample.timestamp);
        let minute = self.minute.get_or_insert(MinuteAccumulator {
            start: minute_start,
            load: 0.0,
            samples: 0,
        });
        minute.load += sample.load;
        minute.samples += 1;

        let hour_start = self.hour_start(sample.timestamp);
        let hour = self.hour.get_or_insert(HourAccumulator {
            start: hour_start,
            sums: EnergySums::default(),
            battery_voltage: None,
            samples: 0,
        });
        hour.sums.add(sample);
        hour.samples += 1;
        if sample.battery_voltage.is_some() {
            hour.battery_voltage = sample.battery_voltage;
        }

        let mut events = Vec::new();
        let Some(local) = self.local(sample.timestamp) else {
            return events;
        };
        if local.second() == 59 {
            events.extend(self.close_minute());
            if local.minute() == 59 {
                events.extend(self.close_hour());
            }
        }
        events
    }

    /// Replay a sample without caring about closed buckets
    pub fn fold(&mut self, sample: &Sample) {
        self.close_stale(sample.timestamp);
        self.accumulate(sample);
    }

    fn close_minute(&mut self) -> Option<RollupEvent> {
        let minute = self.minute.take()?;
        Some(RollupEvent::MinuteClosed(MinuteSummary {
            start: minute.start,
            average_load: minute.load / f64::from(minute.samples.max(1)),
            samples: minute.samples,
        }))
    }

    fn close_hour(&mut self) -> Option<RollupEvent> {
        let hour = self.hour.take()?;
        Some(RollupEvent::HourClosed(HourSummary {
            start: hour.start,
            sums: hour.sums,
            energy: hour.sums.to_wh(),
            battery_voltage: hour.battery_voltage,
            samples: hour.samples,
        }))
    }

    /// Sums of the hour in progress
    pub fn hour_sums(&self) -> EnergySums {
        self.hour.as_ref().map(|h| h.sums).unwrap_or_default()
    }

    /// Start of the hour in progress
    pub fn open_hour(&self) -> Option<i64> {
        self.hour.as_ref().map(|h| h.start)
    }
}
