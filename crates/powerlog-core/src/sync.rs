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

//! Sample synchronizer
//!
//! The meter timestamp is the clock of record. Each new second is compared
//! with the previous accepted one; forward jumps are filled by linear
//! interpolation of the power inputs.

/// Power inputs of one second, after last-known-good resolution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Inputs {
    pub meter: f64,
    pub phases: Option<[f64; 3]>,
    pub pv: f64,
    pub charge: f64,
    pub discharge: f64,
}

impl Inputs {
    /// Point `step` of `steps` on the line from `self` to `next`
    fn lerp(&self, next: &Self, step: i64, steps: i64) -> Self {
        let k = step as f64 / steps as f64;
        let mix = |a: f64, b: f64| a + (b - a) * k;
        Self {
            meter: mix(self.meter, next.meter),
            phases: match (self.phases, next.phases) {
                (Some(a), Some(b)) => Some([mix(a[0], b[0]), mix(a[1], b[1]), mix(a[2], b[2])]),
                (None | Some(_), later) => later,
            },
            pv: mix(self.pv, next.pv),
            charge: mix(self.charge, next.charge),
            discharge: mix(self.discharge, next.discharge),
        }
    }
}

/// Outcome of comparing a meter timestamp with the previous accepted one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockCheck {
    /// Nothing accepted yet
    First,
    /// Exactly one second later
    Next,
    /// `missing` seconds were skipped
    Gap { missing: i64 },
    Duplicate,
    Backward { by: i64 },
}

#[derive(Debug, Clone, Default)]
pub struct Synchronizer {
    previous: Option<(i64, Inputs)>,
}

impl Synchronizer {
    pub fn check(&self, timestamp: i64) -> ClockCheck {
        let Some((previous, _)) = self.previous else {
            return ClockCheck::First;
        };
        match timestamp - previous {
            0 => ClockCheck::Duplicate,
            1 => ClockCheck::Next,
            diff if diff > 1 => ClockCheck::Gap { missing: diff - 1 },
            diff => ClockCheck::Backward { by: -diff },
        }
    }

    /// Record an accepted second. Never moves backwards.
    pub fn advance(&mut self, timestamp: i64, inputs: Inputs) {
        if self.previous.is_some_and(|(previous, _)| timestamp <= previous) {
            return;
        }
        self.previous = Some((timestamp, inputs));
    }

    pub fn previous_timestamp(&self) -> Option<i64> {
        self.previous.map(|(ts, _)| ts)
    }

    /// Synthetic inputs for every second strictly between the previous
    /// accepted second and `timestamp`
    pub fn interpolate(&self, timestamp: i64, current: &Inputs) -> Vec<(i64, Inputs)> {
        let Some((previous, from)) = self.previous else {
            return Vec::new();
        };
        let steps = timestamp - previous;
        (1..steps)
            .map(|step| (previous + step, from.lerp(current, step, steps)))
            .collect()
    }
}
