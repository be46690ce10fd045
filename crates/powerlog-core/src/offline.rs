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

//! Offline input
//!
//! Previously captured seconds as `timestamp,load,pv,l1,l2,l3` rows. The
//! phase powers stand in for the meter and the PV column for the PV source.

use crate::reading::{AuxReadings, Reading, SourceKind};
use csv::{ReaderBuilder, StringRecord, Trim};
use std::io::Read;
use tracing::debug;

/// Default tolerance of the `load = pv + l1 + l2 + l3` check, in W
pub const DEFAULT_TOLERANCE_W: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OfflineRow {
    pub timestamp: i64,
    pub load: f64,
    pub pv: f64,
    pub phases: [f64; 3],
}

impl OfflineRow {
    fn from_record(record: &StringRecord) -> Option<Self> {
        let field = |i: usize| record.get(i).and_then(|f| f.parse::<f64>().ok());
        Some(Self {
            timestamp: record.get(0)?.parse().ok()?,
            load: field(1)?,
            pv: field(2)?,
            phases: [field(3)?, field(4)?, field(5)?],
        })
    }

    /// Difference between the recorded load and the one composed from meter and PV
    pub fn deviation(&self) -> f64 {
        self.load - (self.pv + self.phases.iter().sum::<f64>())
    }

    pub fn readings(&self) -> (Reading, AuxReadings) {
        let meter = Reading::new(
            SourceKind::Meter,
            Some(self.timestamp),
            self.phases.iter().sum(),
        )
        .with_phases(self.phases);
        let aux = AuxReadings {
            pv: Some(Reading::new(SourceKind::Pv, Some(self.timestamp), self.pv)),
            ..Default::default()
        };
        (meter, aux)
    }
}

/// Rows of one input; header and other non-numeric rows are skipped
pub fn rows<R: Read>(input: R) -> impl Iterator<Item = csv::Result<OfflineRow>> {
    ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .comment(Some(b'#'))
        .from_reader(input)
        .into_records()
        .filter_map(|record| match record {
            Ok(record) => {
                let row = OfflineRow::from_record(&record);
                if row.is_none() {
                    debug!("Skipping offline row {record:?}");
                }
                row.map(Ok)
            }
            Err(err) => Some(Err(err)),
        })
}
