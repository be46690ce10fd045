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

//! The collector loop
//!
//! One sequential cycle per second: poll the meter, poll the auxiliary
//! sources, compose the sample (filling clock gaps first), write it and
//! roll it up. All state is owned here.

use crate::composer::{AuxValues, Composer, LastKnownGood, Resolved, ResolvedAux, Sample};
use crate::config::{CollectorConfig, SourceConfig};
use crate::counters::EventCounters;
use crate::error::{CollectorError, CollectorResult};
use crate::event_log::EventLog;
use crate::fetcher::{DeviceFamily, HttpSource, PowerSource, fetch_optional, fetch_primary};
use crate::offline;
use crate::output::{AuxRecord, OutputSet, SecondRecord, local_time};
use crate::reading::{AuxReadings, Reading, SourceKind};
use crate::recovery;
use crate::rollup::{EnergySums, Rollup, RollupEvent};
use crate::sync::{ClockCheck, Inputs, Synchronizer};
use chrono::{Datelike, NaiveDate};
use chrono_tz::Tz;
use std::collections::BTreeSet;
use std::io::Read;
use tracing::{debug, info, warn};

/// The pollable devices of a collector
#[derive(Default)]
pub struct Sources {
    pub meter: Option<Box<dyn PowerSource>>,
    pub pv: Option<Box<dyn PowerSource>>,
    pub charger: Option<Box<dyn PowerSource>>,
    pub discharge_switch: Option<Box<dyn PowerSource>>,
    pub discharge_inverter: Option<Box<dyn PowerSource>>,
}

impl std::fmt::Debug for Sources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<SourceKind> = self.configured().into_iter().collect();
        f.debug_struct("Sources")
            .field("meter", &self.meter.is_some())
            .field("aux", &kinds)
            .finish()
    }
}

impl Sources {
    pub fn from_config(config: &CollectorConfig) -> CollectorResult<Self> {
        let timeout = config.http_timeout();
        let build = |kind: SourceKind,
                     family: DeviceFamily,
                     source: &SourceConfig|
         -> CollectorResult<Box<dyn PowerSource>> {
            let source = HttpSource::new(kind, family, source, timeout)
                .map_err(|e| CollectorError::Config(format!("{kind}: {e}")))?;
            Ok(Box::new(source))
        };

        Ok(Self {
            meter: Some(build(SourceKind::Meter, DeviceFamily::ThreePhaseMeter, &config.meter)?),
            pv: config
                .pv
                .as_ref()
                .map(|c| build(SourceKind::Pv, DeviceFamily::Switch, c))
                .transpose()?,
            charger: config
                .charger
                .as_ref()
                .map(|c| build(SourceKind::Charger, DeviceFamily::Switch, c))
                .transpose()?,
            discharge_switch: config
                .discharge_switch
                .as_ref()
                .map(|c| build(SourceKind::DischargeSwitch, DeviceFamily::Switch, c))
                .transpose()?,
            discharge_inverter: config
                .discharge_inverter
                .as_ref()
                .map(|c| {
                    build(
                        SourceKind::DischargeInverter,
                        DeviceFamily::Inverter {
                            serial: c.serial.clone(),
                        },
                        &c.source,
                    )
                })
                .transpose()?,
        })
    }

    /// Auxiliary sources that are present
    fn configured(&self) -> BTreeSet<SourceKind> {
        [
            (SourceKind::Pv, self.pv.is_some()),
            (SourceKind::Charger, self.charger.is_some()),
            (SourceKind::DischargeSwitch, self.discharge_switch.is_some()),
            (SourceKind::DischargeInverter, self.discharge_inverter.is_some()),
        ]
        .into_iter()
        .filter_map(|(kind, present)| present.then_some(kind))
        .collect()
    }
}

/// Per-source status strings of a genuine second
#[derive(Debug, Default)]
struct AuxStatus {
    pv: Option<String>,
    charger: Option<String>,
    discharge: Option<String>,
}

#[derive(Debug)]
pub struct Collector {
    config: CollectorConfig,
    tz: Tz,
    sources: Sources,
    configured: BTreeSet<SourceKind>,
    sync: Synchronizer,
    composer: Composer,
    rollup: Rollup,
    outputs: OutputSet,
    counters: EventCounters,
    /// Sums since start, for the final summary
    totals: EnergySums,
}

impl Collector {
    pub fn new(config: CollectorConfig, sources: Sources, event_log: EventLog) -> CollectorResult<Self> {
        let tz = config.tz()?;
        let configured = sources.configured();
        Ok(Self {
            tz,
            configured,
            sync: Synchronizer::default(),
            composer: Composer::new(config.pv_standby_w, config.discharge_standby_w),
            rollup: Rollup::new(tz),
            outputs: OutputSet::new(&config.outputs, tz, event_log),
            counters: EventCounters::default(),
            totals: EnergySums::default(),
            sources,
            config,
        })
    }

    /// Collector polling the configured devices over HTTP
    pub fn from_config(config: CollectorConfig, event_log: EventLog) -> CollectorResult<Self> {
        config.validate()?;
        let sources = Sources::from_config(&config)?;
        Self::new(config, sources, event_log)
    }

    pub fn counters(&self) -> &EventCounters {
        &self.counters
    }

    /// Sums of the hour in progress
    pub fn hour_sums(&self) -> EnergySums {
        self.rollup.hour_sums()
    }

    pub fn totals(&self) -> EnergySums {
        self.totals
    }

    fn local_date(&self, timestamp: i64) -> CollectorResult<NaiveDate> {
        local_time(self.tz, timestamp)
            .map(|t| t.date_naive())
            .ok_or_else(|| CollectorError::Invariant(format!("timestamp {timestamp} out of range")))
    }

    /// Rebuild the unfinished hour of a previous run and open the outputs
    pub fn recover(&mut self, now: i64) -> CollectorResult<()> {
        let today = self.local_date(now)?;
        // Year log first, so a recovery failure still reaches it
        self.outputs.ensure_year(today.year())?;

        if let Some(hour) = recovery::load_open_hour(&self.config, self.tz, now)? {
            for sample in &hour.samples {
                self.rollup.fold(sample);
            }
            if let Some(last) = hour.samples.last() {
                self.composer.seed(LastKnownGood {
                    pv: last.pv,
                    charge: last.charge,
                    discharge: last.discharge,
                    load: hour
                        .samples
                        .iter()
                        .rev()
                        .find(|s| s.plausible && !s.synthetic)
                        .map(|s| s.load),
                });
                self.sync.advance(
                    last.timestamp,
                    Inputs {
                        meter: last.meter,
                        phases: last.phases,
                        pv: last.pv,
                        charge: last.charge,
                        discharge: last.discharge,
                    },
                );
            }
            self.outputs.resume_load_line(hour.start, hour.next);
            let sums = self.rollup.hour_sums().to_wh();
            info!(
                "Recovered {} seconds of the hour starting {}: consumed {} Wh, produced {} Wh",
                hour.samples.len(),
                hour.start,
                sums.consumed,
                sums.produced
            );
        }

        self.outputs.rotate(today)?;
        Ok(())
    }

    /// Poll forever, one cycle per interval
    pub async fn run(&mut self) -> CollectorResult<()> {
        info!(
            "Polling {} every {} ms with {} auxiliary sources",
            self.config.meter.url,
            self.config.poll_interval_ms,
            self.configured.len()
        );
        loop {
            self.tick().await?;
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// One polling cycle
    pub async fn tick(&mut self) -> CollectorResult<()> {
        let retry_delay = self.config.retry_delay();
        let meter = self
            .sources
            .meter
            .as_deref_mut()
            .ok_or_else(|| CollectorError::Invariant("no meter source".to_owned()))?;
        let primary = fetch_primary(meter, &mut self.counters, retry_delay).await;
        let Some(timestamp) = primary.timestamp else {
            warn!("Meter reading without timestamp discarded");
            return Ok(());
        };
        if !self.admit(timestamp) {
            return Ok(());
        }

        let mut aux = AuxReadings::default();
        for (slot, source) in [
            (&mut aux.pv, &mut self.sources.pv),
            (&mut aux.charger, &mut self.sources.charger),
            (&mut aux.discharge_switch, &mut self.sources.discharge_switch),
            (&mut aux.discharge_inverter, &mut self.sources.discharge_inverter),
        ] {
            if let Some(source) = source.as_deref_mut() {
                *slot = fetch_optional(source).await;
            }
        }

        self.process_admitted(timestamp, &primary, aux)
    }

    /// Feed one meter reading with its auxiliary readings
    pub fn process(&mut self, primary: &Reading, aux: AuxReadings) -> CollectorResult<()> {
        let Some(timestamp) = primary.timestamp else {
            warn!("Meter reading without timestamp discarded");
            return Ok(());
        };
        if self.admit(timestamp) {
            self.process_admitted(timestamp, primary, aux)?;
        }
        Ok(())
    }

    /// Replay captured rows without pacing
    pub fn run_offline<R: Read>(&mut self, input: R, tolerance_w: f64) -> CollectorResult<()> {
        self.configured.insert(SourceKind::Pv);
        for row in offline::rows(input) {
            let row = row?;
            let deviation = row.deviation();
            if deviation.abs() > tolerance_w {
                self.counters.offline_inconsistencies += 1;
                warn!(
                    "Offline row {}: load {:.1} W differs from pv + phases by {deviation:.1} W",
                    row.timestamp, row.load
                );
            }
            let (meter, aux) = row.readings();
            self.process(&meter, aux)?;
        }
        Ok(())
    }

    /// Apply the meter clock checks; `false` means the second is dropped
    fn admit(&mut self, timestamp: i64) -> bool {
        match self.sync.check(timestamp) {
            ClockCheck::Duplicate => {
                self.counters.duplicates += 1;
                debug!("Duplicate meter second {timestamp} discarded");
                false
            }
            ClockCheck::Backward { by } => {
                self.counters.backward_jumps += 1;
                warn!("Meter clock went back {by} s to {timestamp}, sample discarded");
                false
            }
            ClockCheck::First | ClockCheck::Next | ClockCheck::Gap { .. } => true,
        }
    }

    fn aux_value(&mut self, kind: SourceKind, reading: Option<&Reading>) -> Option<f64> {
        if !self.configured.contains(&kind) {
            return Some(0.0);
        }
        let value = reading.map(|r| r.power);
        if value.is_none() {
            self.counters.record_miss(kind);
        }
        value
    }

    fn process_admitted(&mut self, timestamp: i64, primary: &Reading, aux: AuxReadings) -> CollectorResult<()> {
        let tolerance = self.config.clock_skew_tolerance_secs;
        for reading in [&aux.pv, &aux.charger, &aux.discharge_switch, &aux.discharge_inverter]
            .into_iter()
            .flatten()
        {
            if let Some(skew) = reading.clock_skew(timestamp)
                && skew.abs() > tolerance
            {
                warn!("{} clock is {skew} s off the meter at {timestamp}", reading.kind);
            }
        }

        let pv = self.aux_value(SourceKind::Pv, aux.pv.as_ref());
        let charge = self.aux_value(SourceKind::Charger, aux.charger.as_ref());
        let switch = self.aux_value(SourceKind::DischargeSwitch, aux.discharge_switch.as_ref());
        let inverter = self.aux_value(SourceKind::DischargeInverter, aux.discharge_inverter.as_ref());
        let discharge = match (
            self.configured.contains(&SourceKind::DischargeSwitch),
            self.configured.contains(&SourceKind::DischargeInverter),
        ) {
            (true, true) => switch.or(inverter),
            (true, false) => switch,
            (false, true) => inverter,
            (false, false) => Some(0.0),
        };

        let status = AuxStatus {
            pv: aux.pv.map(|r| r.status),
            charger: aux.charger.map(|r| r.status),
            discharge: aux
                .discharge_inverter
                .as_ref()
                .or(aux.discharge_switch.as_ref())
                .map(|r| r.status.clone()),
        };
        let battery_voltage = aux.discharge_inverter.as_ref().and_then(|r| r.dc_voltage);

        let resolved = self.composer.resolve(AuxValues { pv, charge, discharge }, &mut self.counters);
        let inputs = Inputs {
            meter: primary.power,
            phases: primary.phases,
            pv: resolved.pv.value,
            charge: resolved.charge.value,
            discharge: resolved.discharge.value,
        };

        if let ClockCheck::Gap { missing } = self.sync.check(timestamp) {
            self.fill_gap(timestamp, missing, &inputs)?;
        }

        let mut sample = self.composer.compose(
            timestamp,
            &inputs,
            resolved.is_implausible(),
            false,
            &mut self.counters,
        );
        sample.stale = resolved.is_stale();
        sample.battery_voltage = battery_voltage;

        let record = self.second_record(primary, &resolved, &status);
        self.emit(&sample, Some(&record))?;
        self.sync.advance(timestamp, inputs);
        Ok(())
    }

    fn fill_gap(&mut self, timestamp: i64, missing: i64, inputs: &Inputs) -> CollectorResult<()> {
        self.counters.gaps += 1;
        self.counters.gap_seconds += missing.unsigned_abs();
        let limit = self.config.max_interpolation_secs;
        if missing > limit {
            warn!(
                "Meter skipped {missing} s before {timestamp}, longer than {limit} s, not interpolated; \
                 hour totals exclude these seconds"
            );
            return Ok(());
        }
        warn!("Meter skipped {missing} s before {timestamp}, interpolating");

        for (ts, filled) in self.sync.interpolate(timestamp, inputs) {
            let sample = self.composer.compose(ts, &filled, false, true, &mut self.counters);
            self.counters.interpolated += 1;
            self.emit(&sample, None)?;
        }
        Ok(())
    }

    fn second_record<'a>(
        &self,
        primary: &'a Reading,
        resolved: &ResolvedAux,
        status: &'a AuxStatus,
    ) -> SecondRecord<'a> {
        let record = |kinds: &[SourceKind], value: &Resolved, status: &'a Option<String>| {
            kinds
                .iter()
                .any(|kind| self.configured.contains(kind))
                .then(|| AuxRecord {
                    power: value.value,
                    status: match status {
                        Some(status) if value.is_measured() => status.as_str(),
                        Some(_) | None => "",
                    },
                })
        };
        SecondRecord {
            meter_status: &primary.status,
            pv: record(&[SourceKind::Pv], &resolved.pv, &status.pv),
            charger: record(&[SourceKind::Charger], &resolved.charge, &status.charger),
            discharge: record(
                &[SourceKind::DischargeSwitch, SourceKind::DischargeInverter],
                &resolved.discharge,
                &status.discharge,
            ),
        }
    }

    /// Write one sample and everything that closes around it
    fn emit(&mut self, sample: &Sample, record: Option<&SecondRecord<'_>>) -> CollectorResult<()> {
        for event in self.rollup.close_stale(sample.timestamp) {
            self.write_event(&event)?;
        }

        let date = self.local_date(sample.timestamp)?;
        self.outputs.rotate(date)?;
        self.outputs.write_second(sample, record)?;
        self.counters.samples += 1;
        self.totals.add(sample);

        for event in self.rollup.accumulate(sample) {
            self.write_event(&event)?;
        }
        Ok(())
    }

    fn write_event(&mut self, event: &RollupEvent) -> CollectorResult<()> {
        match event {
            RollupEvent::MinuteClosed(minute) => {
                self.outputs.write_minute(minute)?;
                self.outputs.flush()?;
            }
            RollupEvent::HourClosed(hour) => {
                self.outputs.end_load_line()?;
                self.outputs.write_hour(hour)?;
                let e = &hour.energy;
                info!(
                    "Hour {} closed: consumed {} Wh, produced {} Wh, charged {} Wh, discharged {} Wh, imported {} Wh, exported {} Wh ({} samples)",
                    hour.start, e.consumed, e.produced, e.charged, e.discharged, e.imported, e.exported, hour.samples
                );
                if !hour.is_balanced() {
                    warn!(
                        "Hour {} out of balance: flow deviation {:.2} Wh, grid deviation {:.2} Wh",
                        hour.start,
                        hour.sums.flow_deviation_wh(),
                        hour.sums.grid_deviation_wh()
                    );
                }
            }
        }
        Ok(())
    }

    /// Close day streams, log the summary, close year streams
    pub fn shutdown(&mut self) -> CollectorResult<()> {
        let day_result = self.outputs.close_day();

        let totals = self.totals.to_wh();
        info!(
            "Collector stopped: consumed {} Wh, produced {} Wh, charged {} Wh, discharged {} Wh, imported {} Wh, exported {} Wh; {}",
            totals.consumed,
            totals.produced,
            totals.charged,
            totals.discharged,
            totals.imported,
            totals.exported,
            self.counters
        );

        let year_result = self.outputs.close_year();
        day_result?;
        year_result?;
        Ok(())
    }
}
