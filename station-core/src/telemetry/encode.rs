// Upload body encoders: one JSON document or InfluxDB line protocol

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt::Write as _;
use std::str::FromStr;

use super::TelemetryRecord;
use crate::sensors::SENSORS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFormat {
    Json,
    Influx,
}

impl UploadFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadFormat::Json => "JSON",
            UploadFormat::Influx => "InfluxDB",
        }
    }
}

impl FromStr for UploadFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" | "" => Ok(UploadFormat::Json),
            "influxdb" | "influx" => Ok(UploadFormat::Influx),
            other => Err(format!("unknown upload type '{}'", other)),
        }
    }
}

/// Station-wide fields that accompany every batch
#[derive(Debug, Clone, Copy)]
pub struct BatchContext<'a> {
    pub station: &'a str,
    pub group: &'a str,
    pub version: &'a str,
    pub build: &'a str,
    /// Wall-clock time of the epoch anchor; record time = anchor + uptime
    pub anchor_ms: i64,
    pub uptime_ms: i64,
    pub cycles: u32,
    pub ntp_delta_ms: i64,
    pub power_save: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBatch {
    pub url: String,
    pub content_type: &'static str,
    pub body: String,
    pub records: usize,
}

#[derive(Serialize)]
struct JsonBatch<'a> {
    station: &'a str,
    group: &'a str,
    version: &'a str,
    build: &'a str,
    uptime: i64,
    cycles: u32,
    ntp_delta: i64,
    data: Vec<JsonEntry>,
}

#[derive(Serialize)]
struct JsonEntry {
    time: i64,
    offset: i64,
    status: u16,
    #[serde(flatten)]
    sensors: Map<String, Value>,
}

fn rounded(value: f32) -> Value {
    let v = (f64::from(value) * 10_000.0).round() / 10_000.0;
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

pub fn encode_json<'r>(
    ctx: &BatchContext,
    records: impl IntoIterator<Item = &'r TelemetryRecord>,
) -> Result<(String, usize), serde_json::Error> {
    let data: Vec<JsonEntry> = records
        .into_iter()
        .filter(|r| r.occupied)
        .map(|r| JsonEntry {
            time: ctx.anchor_ms + r.uptime_ms,
            offset: ctx.uptime_ms - r.uptime_ms,
            status: r.status,
            sensors: SENSORS
                .iter()
                .enumerate()
                .map(|(i, spec)| {
                    let value = r.value(i).map(rounded).unwrap_or(Value::Null);
                    (spec.key.to_string(), value)
                })
                .collect(),
        })
        .collect();
    let count = data.len();
    let batch = JsonBatch {
        station: ctx.station,
        group: ctx.group,
        version: ctx.version,
        build: ctx.build,
        uptime: ctx.uptime_ms,
        cycles: ctx.cycles,
        ntp_delta: ctx.ntp_delta_ms,
        data,
    };
    Ok((serde_json::to_string(&batch)?, count))
}

/// Tag values may not contain unescaped spaces, commas or equals signs
fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ' ' | ',' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn encode_influx<'r>(
    ctx: &BatchContext,
    records: impl IntoIterator<Item = &'r TelemetryRecord>,
) -> (String, usize) {
    let group = escape_tag(ctx.group);
    let station = escape_tag(ctx.station);
    let mut body = String::new();
    let mut count = 0;

    for record in records.into_iter().filter(|r| r.occupied) {
        let _ = write!(body, "{}_sensors,station={} status={}", group, station, record.status);
        for (i, spec) in SENSORS.iter().enumerate() {
            if let Some(v) = record.value(i).filter(|v| v.is_finite()) {
                let _ = write!(body, ",{}={:.4}", spec.key, v);
            }
        }
        let _ = writeln!(body, " {}", ctx.anchor_ms + record.uptime_ms);
        count += 1;
    }

    let _ = write!(
        body,
        "{}_status,station={},version={},build={} ntp_delta={},data_points={},power_save={},cycles={},uptime={} {}",
        group,
        station,
        escape_tag(ctx.version),
        escape_tag(ctx.build),
        ctx.ntp_delta_ms,
        count,
        u8::from(ctx.power_save),
        ctx.cycles,
        ctx.uptime_ms,
        ctx.anchor_ms + ctx.uptime_ms,
    );
    (body, count)
}

pub fn encode_batch<'r>(
    format: UploadFormat,
    base_url: &str,
    database: &str,
    ctx: &BatchContext,
    records: impl IntoIterator<Item = &'r TelemetryRecord>,
) -> Result<EncodedBatch, serde_json::Error> {
    match format {
        UploadFormat::Json => {
            let (body, records) = encode_json(ctx, records)?;
            Ok(EncodedBatch {
                url: base_url.to_string(),
                content_type: "application/json",
                body,
                records,
            })
        }
        UploadFormat::Influx => {
            let (body, records) = encode_influx(ctx, records);
            Ok(EncodedBatch {
                url: format!("{}/write?db={}&precision=ms", base_url.trim_end_matches('/'), database),
                content_type: "text/plain",
                body,
                records,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::{sensor_index, SensorSample};

    fn ctx() -> BatchContext<'static> {
        BatchContext {
            station: "Ridge Top",
            group: "weather",
            version: "0.3.2",
            build: "dev",
            anchor_ms: 1_700_000_000_000,
            uptime_ms: 120_000,
            cycles: 3,
            ntp_delta_ms: -42,
            power_save: false,
        }
    }

    fn record() -> TelemetryRecord {
        let mut sample = SensorSample::all_invalid();
        sample.values[0] = 3.91;
        sample.status &= !1;
        let t1 = sensor_index("t1").unwrap();
        sample.values[t1] = 21.25;
        sample.status &= !(1 << t1);
        TelemetryRecord::capture(60_000, 2, &sample)
    }

    #[test]
    fn test_format_names_parse() {
        assert_eq!("InfluxDB".parse::<UploadFormat>().unwrap(), UploadFormat::Influx);
        assert_eq!("json".parse::<UploadFormat>().unwrap(), UploadFormat::Json);
        assert!("csv".parse::<UploadFormat>().is_err());
    }

    #[test]
    fn test_json_nulls_invalid_sensors() {
        let records = [record()];
        let (body, count) = encode_json(&ctx(), &records).unwrap();
        assert_eq!(count, 1);

        let doc: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(doc["station"], "Ridge Top");
        assert_eq!(doc["cycles"], 3);
        assert_eq!(doc["ntp_delta"], -42);
        let entry = &doc["data"][0];
        assert_eq!(entry["time"], 1_700_000_060_000i64);
        assert_eq!(entry["offset"], 60_000);
        assert_eq!(entry["bat"], 3.91);
        assert_eq!(entry["t1"], 21.25);
        assert!(entry["h1"].is_null());
        assert!(entry["rain"].is_null());
    }

    #[test]
    fn test_json_skips_empty_slots() {
        let records = [TelemetryRecord::EMPTY, record(), TelemetryRecord::EMPTY];
        let (_, count) = encode_json(&ctx(), &records).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_influx_omits_invalid_sensors() {
        let records = [record()];
        let (body, count) = encode_influx(&ctx(), &records);
        assert_eq!(count, 1);

        let mut lines = body.lines();
        let first = lines.next().unwrap();
        assert!(first.starts_with("weather_sensors,station=Ridge\\ Top status="));
        assert!(first.contains(",bat=3.9100"));
        assert!(first.contains(",t1=21.2500"));
        assert!(!first.contains("h1="));
        assert!(first.ends_with(" 1700000060000"));

        let status = lines.next().unwrap();
        assert!(status.starts_with("weather_status,station=Ridge\\ Top,version=0.3.2,build=dev "));
        assert!(status.contains("data_points=1"));
        assert!(status.ends_with(" 1700000120000"));
    }

    #[test]
    fn test_influx_url() {
        let batch = encode_batch(
            UploadFormat::Influx,
            "http://influx.local:8086/",
            "station",
            &ctx(),
            &[record()],
        )
        .unwrap();
        assert_eq!(batch.url, "http://influx.local:8086/write?db=station&precision=ms");
    }
}
