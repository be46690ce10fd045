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

use crate::reading::SourceKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Event counters reported in the shutdown summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventCounters {
    /// Seconds folded into the accumulators, interpolated ones included
    pub samples: u64,
    pub interpolated: u64,
    /// Forward jumps of the meter clock by more than one second
    pub gaps: u64,
    pub gap_seconds: u64,
    pub duplicates: u64,
    pub backward_jumps: u64,
    pub meter_retries: u64,
    /// Implausible values replaced by a last known good one
    pub substitutions: u64,
    pub offline_inconsistencies: u64,
    misses: BTreeMap<SourceKind, u64>,
}

impl EventCounters {
    pub fn record_miss(&mut self, kind: SourceKind) {
        *self.misses.entry(kind).or_default() += 1;
    }

    pub fn misses(&self, kind: SourceKind) -> u64 {
        self.misses.get(&kind).copied().unwrap_or_default()
    }
}

impl fmt::Display for EventCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "samples={} interpolated={} gaps={} gap_seconds={} duplicates={} backward={} meter_retries={} substitutions={}",
            self.samples,
            self.interpolated,
            self.gaps,
            self.gap_seconds,
            self.duplicates,
            self.backward_jumps,
            self.meter_retries,
            self.substitutions
        )?;
        if self.offline_inconsistencies > 0 {
            write!(f, " offline_inconsistencies={}", self.offline_inconsistencies)?;
        }
        for (kind, count) in &self.misses {
            write!(f, " {kind}_misses={count}")?;
        }
        Ok(())
    }
}
