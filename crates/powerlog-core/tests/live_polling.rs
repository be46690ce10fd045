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

use mockito::{Server, ServerGuard};
use powerlog_core::{Collector, CollectorConfig, EventLog, InverterConfig, OutputPaths, SourceConfig, SourceKind};
use std::fs;
use tempfile::TempDir;

fn meter_body(unixtime: i64, powers: [f64; 3]) -> String {
    let phase = |p: f64| {
        format!(
            r#"{{"power":{p},"pf":0.98,"current":1.1,"voltage":230.2,"is_valid":true,"total":1000.0,"total_returned":10.0}}"#
        )
    };
    format!(
        r#"{{"unixtime":{unixtime},"uptime":3600,"total_power":{},"emeters":[{},{},{}]}}"#,
        powers.iter().sum::<f64>(),
        phase(powers[0]),
        phase(powers[1]),
        phase(powers[2])
    )
}

const PV_BODY: &str = r#"{"id":0,"source":"init","output":true,"apower":412.0,"voltage":231.0,
    "current":1.8,"aenergy":{"total":88.1,"by_minute":[6000.0,6100.0,6050.0],"minute_ts":1714557600},
    "temperature":{"tC":40.0,"tF":104.0}}"#;

const DTU_BODY: &str = r#"{"inverters":[{"serial":"116180012345","reachable":true,"producing":true,
    "limit_relative":100,"limit_absolute":800,
    "AC":{"0":{"Power":{"v":150.0,"u":"W","d":1},"Voltage":{"v":230.0,"u":"V","d":1},
               "Current":{"v":0.65,"u":"A","d":2},"Frequency":{"v":50.0,"u":"Hz","d":2},
               "PowerFactor":{"v":0.99,"u":"","d":3}}},
    "DC":{"0":{"Power":{"v":160.0,"u":"W","d":1},"Voltage":{"v":52.3,"u":"V","d":1},
               "Current":{"v":3.06,"u":"A","d":2}}},
    "INV":{"0":{"Temperature":{"v":35.0,"u":"°C","d":1}}}}]}"#;

async fn json_mock(server: &mut ServerGuard, path: &str, body: String, hits: usize) -> mockito::Mock {
    server
        .mock("GET", path)
        .expect(hits)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body)
        .create_async()
        .await
}

#[tokio::test]
async fn test_tick_polls_all_sources_and_writes_status() {
    let mut server = Server::new_async().await;
    let meter = json_mock(&mut server, "/status", meter_body(1_714_557_600, [100.0, 50.0, -30.0]), 2).await;
    let pv = json_mock(&mut server, "/rpc/Switch.GetStatus", PV_BODY.to_owned(), 1).await;
    let dtu = json_mock(&mut server, "/api/livedata/status", DTU_BODY.to_owned(), 1).await;

    let dir = TempDir::new().unwrap();
    let config = CollectorConfig {
        meter: SourceConfig::new(format!("{}/status", server.url())),
        pv: Some(SourceConfig::new(format!("{}/rpc/Switch.GetStatus", server.url()))),
        discharge_inverter: Some(InverterConfig {
            source: SourceConfig::new(format!("{}/api/livedata/status", server.url())),
            serial: "116180012345".to_owned(),
        }),
        outputs: OutputPaths {
            pv_status: Some(dir.path().join("pv")),
            discharge_status: Some(dir.path().join("battery")),
            meter_status: Some(dir.path().join("meter")),
            ..Default::default()
        },
        ..Default::default()
    };

    let mut collector = Collector::from_config(config, EventLog::new()).unwrap();
    collector.tick().await.unwrap();
    // same meter second again: discarded before the auxiliary sources are polled
    collector.tick().await.unwrap();
    collector.shutdown().unwrap();

    meter.assert_async().await;
    pv.assert_async().await;
    dtu.assert_async().await;

    let counters = collector.counters();
    assert_eq!(counters.samples, 1);
    assert_eq!(counters.duplicates, 1);
    assert_eq!(counters.misses(SourceKind::Pv), 0);

    let totals = collector.totals();
    assert_eq!(totals.consumed, 120.0 + 412.0 + 150.0);
    assert_eq!(totals.produced, 412.0);
    assert_eq!(totals.discharged, 150.0);

    let battery = fs::read_to_string(dir.path().join("battery2024-05-01.csv")).unwrap();
    assert!(battery.contains("1714557600,150.0,150.0,230.0,0.65,50.00,0.990,160.0,52.3,3.06,1,100,800,35.0\n"));
    let meter_status = fs::read_to_string(dir.path().join("meter2024-05-01.csv")).unwrap();
    assert_eq!(meter_status.lines().count(), 2);
}

#[test]
fn test_from_config_rejects_missing_meter_url() {
    let config = CollectorConfig {
        meter: SourceConfig::new(""),
        ..Default::default()
    };
    assert!(Collector::from_config(config, EventLog::new()).is_err());
}
