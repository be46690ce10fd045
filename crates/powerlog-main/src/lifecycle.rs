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

use crate::config::Cli;
use anyhow::Context;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use powerlog_core::{Collector, EventLog, Sources};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::process::ExitCode;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tracing::{error, info, warn};

/// How a run ended once outputs were closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Signalled(Signal),
}

/// Waits for SIGINT, SIGTERM or SIGHUP.
pub async fn shutdown_signal() -> io::Result<Signal> {
    let mut terminate = unix_signal(SignalKind::terminate())?;
    let mut hangup = unix_signal(SignalKind::hangup())?;

    let received = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Signal::SIGINT
        }
        _ = terminate.recv() => Signal::SIGTERM,
        _ = hangup.recv() => Signal::SIGHUP,
    };
    info!("Received {received}, shutting down");
    Ok(received)
}

/// Terminates the process with `signal` under its default disposition so
/// the parent sees the real cause. Falls back to the shell convention
/// `128 + signo` when the signal does not end the process.
pub fn exit_with(signal: Signal) -> ExitCode {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    // SAFETY: installs the default disposition; no handler code runs.
    match unsafe { signal::sigaction(signal, &default) } {
        Ok(_) => {
            if let Err(e) = signal::raise(signal) {
                warn!("Failed to re-raise {signal}: {e}");
            }
        }
        Err(e) => warn!("Failed to restore default action for {signal}: {e}"),
    }
    ExitCode::from(u8::try_from(128 + signal as i32).unwrap_or(u8::MAX))
}

/// Runs the collector in the mode selected on the command line and closes
/// every output before returning.
pub async fn run(cli: Cli, event_log: EventLog) -> anyhow::Result<Outcome> {
    let config = cli.collector_config()?;

    if let Some(inputs) = cli.offline.as_deref() {
        let mut collector = Collector::new(config, Sources::default(), event_log)
            .context("invalid configuration")?;
        let result = replay(&mut collector, inputs, cli.offline_tolerance_w);
        if let Err(e) = &result {
            error!("Offline replay failed: {e:#}");
        }
        collector.shutdown()?;
        return result.map(|()| Outcome::Finished);
    }

    let mut collector = Collector::from_config(config, event_log).context("invalid configuration")?;
    info!("PowerLog {} starting", env!("CARGO_PKG_VERSION"));

    let outcome: anyhow::Result<Outcome> = match collector.recover(chrono::Utc::now().timestamp()) {
        Err(e) => Err(e).context("recovery failed"),
        Ok(()) => tokio::select! {
            result = collector.run() => result
                .map(|()| Outcome::Finished)
                .context("collector stopped"),
            received = shutdown_signal() => received
                .map(Outcome::Signalled)
                .context("failed to install signal handlers"),
        },
    };

    if let Err(e) = &outcome {
        error!("{e:#}");
    }
    if let Err(e) = collector.shutdown() {
        error!("Failed to close outputs: {e}");
        if outcome.is_ok() {
            return Err(e.into());
        }
    }
    outcome
}

fn replay(collector: &mut Collector, inputs: &[impl AsRef<Path>], tolerance_w: f64) -> anyhow::Result<()> {
    if inputs.is_empty() {
        info!("Replaying offline rows from stdin");
        collector.run_offline(io::stdin().lock(), tolerance_w)?;
        return Ok(());
    }
    for input in inputs {
        let input = input.as_ref();
        info!("Replaying offline rows from {}", input.display());
        let file = File::open(input).with_context(|| format!("cannot open {}", input.display()))?;
        collector
            .run_offline(BufReader::new(file), tolerance_w)
            .with_context(|| format!("replay of {} failed", input.display()))?;
    }
    Ok(())
}
