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

mod config;
mod lifecycle;

use clap::Parser;
use config::Cli;
use lifecycle::Outcome;
use powerlog_core::EventLog;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Yearly event log receives INFO and above, console follows RUST_LOG
    let event_log = EventLog::new();
    tracing_subscriber::registry()
        .with(
            fmt::layer().with_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            ),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(event_log.clone())
                .with_filter(LevelFilter::INFO),
        )
        .init();

    match lifecycle::run(cli, event_log).await {
        Ok(Outcome::Finished) => ExitCode::SUCCESS,
        Ok(Outcome::Signalled(signal)) => lifecycle::exit_with(signal),
        Err(e) => {
            error!("Fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}
