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

//! Device polling
//!
//! One bounded-timeout GET per source and second. Each device family has a
//! strict typed parser; anything that does not fit its shape is reported as
//! a parse mismatch with a bounded excerpt of the payload.

pub mod inverter;
pub mod meter;
pub mod switch;

use crate::config::{Credentials, SourceConfig};
use crate::counters::EventCounters;
use crate::error::{FetchError, FetchResult};
use crate::reading::{Reading, SourceKind};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, trace, warn};

pub use inverter::parse_inverter;
pub use meter::parse_meter;
pub use switch::parse_switch;

/// Longest payload excerpt put into a log line
const EXCERPT_CHARS: usize = 160;

/// Anything earlier is an unset RTC, not a real time
const MIN_PLAUSIBLE_UNIX: i64 = 1_500_000_000;

/// Log every n-th consecutive meter failure at warn level
const RETRY_WARN_EVERY: u64 = 30;

pub(crate) fn excerpt(body: &str) -> String {
    let mut chars = body.chars();
    let head: String = chars.by_ref().take(EXCERPT_CHARS).collect();
    let head = head.replace(['\n', '\r'], " ");
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

pub(crate) fn shape_error(reason: String, body: &str) -> FetchError {
    FetchError::ParseMismatch {
        reason,
        excerpt: excerpt(body),
    }
}

/// Not JSON at all is malformed; JSON of the wrong shape is a mismatch
pub(crate) fn parse_json<T: DeserializeOwned>(body: &str) -> FetchResult<T> {
    let value: serde_json::Value = serde_json::from_str(body).map_err(|_| FetchError::Malformed {
        excerpt: excerpt(body),
    })?;
    serde_json::from_value(value).map_err(|e| shape_error(e.to_string(), body))
}

pub(crate) fn system_now() -> Option<i64> {
    Some(chrono::Utc::now().timestamp()).filter(|now| *now > MIN_PLAUSIBLE_UNIX)
}

/// Reconstructs a timestamp for devices that lost their RTC sync
#[derive(Debug, Clone, Default)]
pub struct DeviceClock {
    /// Last genuine (unixtime, uptime) pair
    anchor: Option<(i64, u64)>,
}

impl DeviceClock {
    pub fn resolve(&mut self, unixtime: i64, uptime: u64, system_now: Option<i64>) -> Option<i64> {
        if unixtime > MIN_PLAUSIBLE_UNIX {
            self.anchor = Some((unixtime, uptime));
            return Some(unixtime);
        }

        if let Some((ts, anchor_uptime)) = self.anchor
            && uptime >= anchor_uptime
        {
            let approximated = ts + i64::try_from(uptime - anchor_uptime).ok()?;
            debug!("Device clock unset, approximated {approximated} from uptime {uptime}");
            return Some(approximated);
        }

        system_now.filter(|now| *now > MIN_PLAUSIBLE_UNIX)
    }
}

/// A pollable power source
#[async_trait]
pub trait PowerSource: Send {
    fn kind(&self) -> SourceKind;

    async fn fetch(&mut self) -> FetchResult<Reading>;
}

#[derive(Debug, Clone)]
pub enum DeviceFamily {
    ThreePhaseMeter,
    Switch,
    Inverter { serial: String },
}

/// HTTP polled device
#[derive(Debug)]
pub struct HttpSource {
    kind: SourceKind,
    family: DeviceFamily,
    url: String,
    credentials: Option<Credentials>,
    client: Client,
    clock: DeviceClock,
}

impl HttpSource {
    pub fn new(
        kind: SourceKind,
        family: DeviceFamily,
        config: &SourceConfig,
        timeout: Duration,
    ) -> FetchResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            kind,
            family,
            url: config.url.clone(),
            credentials: config.credentials.clone(),
            client,
            clock: DeviceClock::default(),
        })
    }

    fn parse(&mut self, body: &str) -> FetchResult<Reading> {
        match &self.family {
            DeviceFamily::ThreePhaseMeter => parse_meter(body, &mut self.clock, system_now()),
            DeviceFamily::Switch => parse_switch(self.kind, body),
            DeviceFamily::Inverter { serial } => parse_inverter(body, serial),
        }
    }
}

#[async_trait]
impl PowerSource for HttpSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&mut self) -> FetchResult<Reading> {
        let mut request = self.client.get(&self.url);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let body = response.text().await?;
        trace!("{} responded: {}", self.kind, excerpt(&body));
        self.parse(&body)
    }
}

/// Poll the mandatory source until it answers.
///
/// Timeouts are retried at once, other failures after `retry_delay`.
pub async fn fetch_primary(
    source: &mut dyn PowerSource,
    counters: &mut EventCounters,
    retry_delay: Duration,
) -> Reading {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        let err = match source.fetch().await {
            Ok(reading) => {
                if attempt > 1 {
                    warn!("{} answered again after {} attempts", source.kind(), attempt);
                }
                return reading;
            }
            Err(err) => err,
        };

        counters.meter_retries += 1;
        if attempt == 1 || attempt % RETRY_WARN_EVERY == 0 {
            warn!("{} poll failed (attempt {attempt}): {err}", source.kind());
        } else {
            debug!("{} poll failed (attempt {attempt}): {err}", source.kind());
        }

        if !matches!(err, FetchError::Timeout) {
            tokio::time::sleep(retry_delay).await;
        }
    }
}

/// Poll an auxiliary source once; a failure means no data this second
pub async fn fetch_optional(source: &mut dyn PowerSource) -> Option<Reading> {
    match source.fetch().await {
        Ok(reading) => Some(reading),
        Err(err) if err.is_transient() => {
            debug!("{} unavailable: {err}", source.kind());
            None
        }
        Err(err) => {
            warn!("{} sent an unusable response: {err}", source.kind());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    const PLUG_BODY: &str = r#"{"id":0,"apower":120.5,"voltage":230.0,"current":0.52,
        "aenergy":{"total":10.0,"by_minute":[1.0,2.0,3.0],"minute_ts":1714557600},
        "temperature":{"tC":30.0,"tF":86.0}}"#;

    fn source(kind: SourceKind, family: DeviceFamily, url: String) -> HttpSource {
        HttpSource::new(
            kind,
            family,
            &SourceConfig::new(url),
            Duration::from_millis(1000),
        )
        .unwrap()
    }

    /// Fails a fixed number of times, then answers
    struct Flaky {
        failures: Vec<FetchError>,
        calls: usize,
    }

    #[async_trait]
    impl PowerSource for Flaky {
        fn kind(&self) -> SourceKind {
            SourceKind::Meter
        }

        async fn fetch(&mut self) -> FetchResult<Reading> {
            self.calls += 1;
            match self.failures.pop() {
                Some(err) => Err(err),
                None => Ok(Reading::new(SourceKind::Meter, Some(1_714_557_600), 250.0)),
            }
        }
    }

    #[test]
    fn test_excerpt_is_bounded() {
        let long = "x".repeat(10_000);
        let short = excerpt(&long);
        assert_eq!(short.chars().count(), EXCERPT_CHARS + 1);
        assert!(short.ends_with('…'));
        assert_eq!(excerpt("a\nb"), "a b");
    }

    #[test]
    fn test_device_clock_ignores_reboot() {
        let mut clock = DeviceClock::default();
        assert_eq!(clock.resolve(1_714_557_600, 100, None), Some(1_714_557_600));
        // uptime went backwards: the device rebooted, the anchor is useless
        assert_eq!(clock.resolve(0, 5, None), None);
        assert_eq!(clock.resolve(0, 5, Some(1_714_557_700)), Some(1_714_557_700));
    }

    #[tokio::test]
    async fn test_fetch_switch_with_basic_auth() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/rpc/Switch.GetStatus")
            .match_header("authorization", "Basic YWRtaW46c2VjcmV0")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(PLUG_BODY)
            .create_async()
            .await;

        let config = SourceConfig {
            url: format!("{}/rpc/Switch.GetStatus", server.url()),
            credentials: Some("admin:secret".parse().unwrap()),
        };
        let mut pv = HttpSource::new(
            SourceKind::Pv,
            DeviceFamily::Switch,
            &config,
            Duration::from_secs(1),
        )
        .unwrap();

        let reading = pv.fetch().await.unwrap();
        assert_eq!(reading.power, 120.5);
        assert_eq!(reading.kind, SourceKind::Pv);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_http_error_status() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/status")
            .with_status(503)
            .create_async()
            .await;

        let mut meter = source(
            SourceKind::Meter,
            DeviceFamily::ThreePhaseMeter,
            format!("{}/status", server.url()),
        );
        let result = meter.fetch().await;
        assert!(matches!(result, Err(FetchError::HttpStatus(503))));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_garbage_is_malformed() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/status")
            .with_status(200)
            .with_body("not json at all")
            .create_async()
            .await;

        let mut pv = source(
            SourceKind::Pv,
            DeviceFamily::Switch,
            format!("{}/status", server.url()),
        );
        let result = pv.fetch().await;
        assert!(matches!(result, Err(FetchError::Malformed { .. })));
    }

    #[tokio::test]
    async fn test_fetch_optional_gives_up_after_one_attempt() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/status")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let mut charger = source(
            SourceKind::Charger,
            DeviceFamily::Switch,
            format!("{}/status", server.url()),
        );
        assert!(fetch_optional(&mut charger).await.is_none());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_unreachable_host_is_network_error() {
        // Nothing listens on port 9 locally
        let mut pv = source(
            SourceKind::Pv,
            DeviceFamily::Switch,
            "http://127.0.0.1:9/status".to_owned(),
        );
        let err = pv.fetch().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_primary_retries_until_success() {
        let mut meter = Flaky {
            failures: vec![
                FetchError::Network("connection refused".to_owned()),
                FetchError::Timeout,
                FetchError::Malformed {
                    excerpt: "<html>".to_owned(),
                },
            ],
            calls: 0,
        };
        let mut counters = EventCounters::default();

        let reading = fetch_primary(&mut meter, &mut counters, Duration::from_millis(200)).await;

        assert_eq!(reading.power, 250.0);
        assert_eq!(meter.calls, 4);
        assert_eq!(counters.meter_retries, 3);
    }
}
