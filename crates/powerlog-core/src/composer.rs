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

//! Load composer
//!
//! The household load is not measured directly. It is what the grid meter
//! sees plus what the PV and battery paths hide from it:
//!
//! `load = meter + pv - charge + discharge`
//!
//! Implausible values are replaced by the last known good ones, which are
//! only ever taken from genuine measurements.

use crate::counters::EventCounters;
use crate::reading::SourceKind;
use crate::sync::Inputs;
use tracing::{debug, warn};

/// Auxiliary powers for one second. `None` means the source had no data.
/// Sources that are not configured are reported as `Some(0.0)`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AuxValues {
    pub pv: Option<f64>,
    pub charge: Option<f64>,
    pub discharge: Option<f64>,
}

/// Where a resolved auxiliary value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Provenance {
    #[default]
    Measured,
    /// Source had no data, last known good used
    Stale,
    /// Source reported a negative value, last known good used
    Implausible,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolved {
    pub value: f64,
    pub provenance: Provenance,
}

impl Resolved {
    pub fn is_measured(&self) -> bool {
        self.provenance == Provenance::Measured
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedAux {
    pub pv: Resolved,
    pub charge: Resolved,
    pub discharge: Resolved,
}

impl ResolvedAux {
    fn any(&self, provenance: Provenance) -> bool {
        [self.pv, self.charge, self.discharge]
            .iter()
            .any(|r| r.provenance == provenance)
    }

    pub fn is_stale(&self) -> bool {
        self.any(Provenance::Stale)
    }

    pub fn is_implausible(&self) -> bool {
        self.any(Provenance::Implausible)
    }
}

/// Most recent plausible values
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LastKnownGood {
    pub pv: f64,
    pub charge: f64,
    pub discharge: f64,
    /// Previous accepted load, `None` until the first plausible sample
    pub load: Option<f64>,
}

/// One composed second
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: i64,
    pub load: f64,
    pub meter: f64,
    pub pv: f64,
    pub charge: f64,
    pub discharge: f64,
    pub phases: Option<[f64; 3]>,
    /// Part of the load covered by PV
    pub own_use: f64,
    /// Load and every auxiliary value were accepted as measured
    pub plausible: bool,
    /// Produced by gap interpolation
    pub synthetic: bool,
    /// At least one auxiliary source had no data this second
    pub stale: bool,
    pub battery_voltage: Option<f64>,
}

impl Sample {
    /// A second rebuilt from the files of a previous run
    pub fn recovered(timestamp: i64, load: f64, pv: f64, charge: f64, discharge: f64) -> Self {
        Self {
            timestamp,
            load,
            meter: load - pv + charge - discharge,
            pv,
            charge,
            discharge,
            phases: None,
            own_use: load.min(pv).max(0.0),
            plausible: true,
            synthetic: false,
            stale: false,
            battery_voltage: None,
        }
    }

    /// Value for the clean per-second load file, `None` when suppressed
    pub fn clean_load(&self) -> Option<i64> {
        (self.plausible && !self.synthetic).then(|| self.load.round() as i64)
    }
}

#[derive(Debug, Clone)]
pub struct Composer {
    pv_standby_w: f64,
    discharge_standby_w: f64,
    lkg: LastKnownGood,
}

impl Composer {
    pub fn new(pv_standby_w: f64, discharge_standby_w: f64) -> Self {
        Self {
            pv_standby_w,
            discharge_standby_w,
            lkg: LastKnownGood::default(),
        }
    }

    pub fn last_known_good(&self) -> &LastKnownGood {
        &self.lkg
    }

    pub fn seed(&mut self, lkg: LastKnownGood) {
        self.lkg = lkg;
    }

    /// Replace missing and implausible auxiliary values, floor standby draw
    pub fn resolve(&mut self, aux: AuxValues, counters: &mut EventCounters) -> ResolvedAux {
        ResolvedAux {
            pv: resolve_one(
                SourceKind::Pv,
                aux.pv,
                self.pv_standby_w,
                &mut self.lkg.pv,
                counters,
            ),
            charge: resolve_one(
                SourceKind::Charger,
                aux.charge,
                0.0,
                &mut self.lkg.charge,
                counters,
            ),
            discharge: resolve_one(
                SourceKind::DischargeSwitch,
                aux.discharge,
                self.discharge_standby_w,
                &mut self.lkg.discharge,
                counters,
            ),
        }
    }

    /// Compose one second. `aux_implausible` marks inputs that already had a
    /// value substituted; such a second does not produce an accepted load.
    pub fn compose(
        &mut self,
        timestamp: i64,
        inputs: &Inputs,
        aux_implausible: bool,
        synthetic: bool,
        counters: &mut EventCounters,
    ) -> Sample {
        let raw_load = inputs.meter + inputs.pv - inputs.charge + inputs.discharge;
        let plausible = raw_load > 0.0 && !aux_implausible;

        let load = if plausible {
            if !synthetic {
                self.lkg.load = Some(raw_load);
            }
            raw_load
        } else {
            let previous = self.lkg.load.unwrap_or(0.0);
            counters.substitutions += 1;
            if synthetic {
                debug!("Interpolated load {raw_load:.1} W at {timestamp} replaced by {previous:.1} W");
            } else {
                warn!("Load {raw_load:.1} W at {timestamp} not plausible, using previous {previous:.1} W");
            }
            previous
        };

        Sample {
            timestamp,
            load,
            meter: inputs.meter,
            pv: inputs.pv,
            charge: inputs.charge,
            discharge: inputs.discharge,
            phases: inputs.phases,
            own_use: load.min(inputs.pv).max(0.0),
            plausible,
            synthetic,
            stale: false,
            battery_voltage: None,
        }
    }
}

fn resolve_one(
    kind: SourceKind,
    raw: Option<f64>,
    standby_w: f64,
    lkg: &mut f64,
    counters: &mut EventCounters,
) -> Resolved {
    match raw {
        None => Resolved {
            value: *lkg,
            provenance: Provenance::Stale,
        },
        Some(value) if value.is_nan() || value < 0.0 => {
            warn!("{kind} reported {value:.1} W, using last known good {:.1} W", *lkg);
            counters.substitutions += 1;
            Resolved {
                value: *lkg,
                provenance: Provenance::Implausible,
            }
        }
        Some(value) => {
            let value = if value < standby_w { 0.0 } else { value };
            *lkg = value;
            Resolved {
                value,
                provenance: Provenance::Measured,
            }
        }
    }
}
