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

//! PowerLog core
//!
//! Per-second household load collection: device polling, gap filling, load
//! composition, minute/hour rollups, rotating CSV outputs and restart
//! recovery.

pub mod collector;
pub mod composer;
pub mod config;
pub mod counters;
pub mod error;
pub mod event_log;
pub mod fetcher;
pub mod offline;
pub mod output;
pub mod reading;
pub mod recovery;
pub mod rollup;
pub mod sync;

pub use collector::{Collector, Sources};
pub use composer::Sample;
pub use config::{CollectorConfig, Credentials, InverterConfig, OutputPaths, SourceConfig};
pub use counters::EventCounters;
pub use error::{CollectorError, CollectorResult, FetchError, FetchResult};
pub use event_log::EventLog;
pub use fetcher::PowerSource;
pub use reading::{AuxReadings, Reading, SourceKind};
pub use rollup::{EnergySums, HourEnergy};
