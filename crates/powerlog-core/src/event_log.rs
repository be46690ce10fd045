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

//! Yearly event log
//!
//! A `tracing` writer whose target file is swapped at year rotation. While
//! no file is open, events only reach the console.

use crate::error::{OutputError, OutputResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug, Default)]
struct Target {
    path: Option<PathBuf>,
    writer: Option<LineWriter<File>>,
}

/// Shared handle, cloned into the subscriber and the output set
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    target: Arc<Mutex<Target>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, path: &Path) -> OutputResult<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| OutputError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let mut target = self.target.lock();
        if let Some(mut previous) = target.writer.take() {
            previous.flush()?;
        }
        target.path = Some(path.to_path_buf());
        target.writer = Some(LineWriter::new(file));
        Ok(())
    }

    pub fn close(&self) -> OutputResult<()> {
        let mut target = self.target.lock();
        target.path = None;
        if let Some(mut writer) = target.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.target.lock().path.clone()
    }
}

impl Write for EventLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.target.lock().writer.as_mut() {
            Some(writer) => writer.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.target.lock().writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for EventLog {
    type Writer = EventLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
