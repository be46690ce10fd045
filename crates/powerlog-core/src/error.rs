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

//! Error types for the collector

use std::path::PathBuf;
use thiserror::Error;

/// Classified failure of a single device poll
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection refused, reset or unreachable
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("device returned HTTP status {0}")]
    HttpStatus(u16),

    /// Body is not JSON at all
    #[error("malformed response: {excerpt}")]
    Malformed { excerpt: String },

    /// Body is JSON but does not have the shape of the device family
    #[error("unexpected payload shape ({reason}): {excerpt}")]
    ParseMismatch { reason: String, excerpt: String },

    /// Device has no clock and there is nothing to approximate one from
    #[error("device reported no usable timestamp")]
    MissingTimestamp,
}

impl FetchError {
    /// Whether the failure is a plain connectivity issue rather than a bad payload
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout | Self::HttpStatus(_) | Self::MissingTimestamp
        )
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err.to_string())
        }
    }
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type OutputResult<T> = std::result::Result<T, OutputError>;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed recovery data in {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("status file error: {0}")]
    Csv(#[from] csv::Error),
}

pub type RecoveryResult<T> = std::result::Result<T, RecoveryError>;

/// Top-level error; any of these terminates the collector after cleanup
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error("offline input error: {0}")]
    Offline(#[from] csv::Error),

    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

pub type CollectorResult<T> = std::result::Result<T, CollectorError>;
