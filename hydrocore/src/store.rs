use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::errors::StoreError;
use crate::model::{ConnectionState, ConnectionStatus, SensorKind, SensorReading};
use crate::replay::{ReplayChannel, ReplayReceiver};

/// Filters for a historical range query. All fields optional and ANDed.
#[derive(Debug, Clone, Default)]
pub struct SensorQuery {
    pub kind: Option<SensorKind>,
    pub device_id: Option<String>,
    pub device_node: Option<String>,
}

impl SensorQuery {
    pub fn for_kind(kind: SensorKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }
}

/// Seam between the repositories and the time-series database.
///
/// Contract: every read/write against an uninitialized session returns
/// `StoreError::NotInitialized`. Outages surface to callers; nothing here
/// substitutes synthetic data.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Opens the session, verifying reachability before reporting connected.
    async fn initialize(&self) -> Result<(), StoreError>;

    /// Releases the session. Idempotent.
    async fn close(&self);

    /// Lightweight reachability probe, usable while initialized.
    async fn health(&self) -> Result<(), StoreError>;

    async fn write_sensor_data(&self, reading: &SensorReading) -> Result<(), StoreError>;
    async fn write_sensor_data_batch(&self, readings: &[SensorReading]) -> Result<(), StoreError>;

    /// Time-windowed query, sorted descending by time, bounded by `limit`.
    async fn query_sensor_data(
        &self,
        filters: &SensorQuery,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SensorReading>, StoreError>;

    /// Most recent sample per (kind, device id) within the lookback window.
    async fn query_latest_sensor_data(&self) -> Result<Vec<SensorReading>, StoreError>;

    fn connection_stream(&self) -> ReplayReceiver<ConnectionState>;
}

/// InfluxDB v2 HTTP client: line-protocol writes, Flux queries.
pub struct InfluxStoreClient {
    cfg: StoreConfig,
    http: reqwest::Client,
    initialized: AtomicBool,
    connection: ReplayChannel<ConnectionState>,
}

impl InfluxStoreClient {
    pub fn new(cfg: StoreConfig) -> Self {
        Self {
            cfg,
            http: reqwest::Client::new(),
            initialized: AtomicBool::new(false),
            connection: ReplayChannel::new(),
        }
    }

    fn ensure_initialized(&self) -> Result<(), StoreError> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    async fn probe(&self) -> Result<(), StoreError> {
        let url = format!("{}/health", self.cfg.url);
        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("Token {}", self.cfg.token))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            Err(StoreError::Unauthorized(format!("health probe: {status}")))
        } else {
            Err(StoreError::Unavailable(format!("health probe returned {status}")))
        }
    }

    async fn write_lines(&self, lines: String) -> Result<(), StoreError> {
        let url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ms",
            self.cfg.url, self.cfg.org, self.cfg.bucket
        );
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Token {}", self.cfg.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(lines)
            .send()
            .await
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            Err(StoreError::Unauthorized(format!("write: {status}")))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(StoreError::WriteFailed(format!("{status}: {body}")))
        }
    }

    async fn run_query(&self, flux: String) -> Result<Vec<SensorReading>, StoreError> {
        let url = format!("{}/api/v2/query?org={}", self.cfg.url, self.cfg.org);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Token {}", self.cfg.token))
            .header("Content-Type", "application/vnd.flux")
            .header("Accept", "application/csv")
            .body(flux)
            .send()
            .await
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            let body = response
                .text()
                .await
                .map_err(|e| StoreError::QueryFailed(e.to_string()))?;
            Ok(parse_query_csv(&body))
        } else if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            Err(StoreError::Unauthorized(format!("query: {status}")))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(StoreError::QueryFailed(format!("{status}: {body}")))
        }
    }
}

#[async_trait]
impl StoreClient for InfluxStoreClient {
    async fn initialize(&self) -> Result<(), StoreError> {
        self.connection
            .publish(ConnectionState::new(ConnectionStatus::Connecting));
        match self.probe().await {
            Ok(()) => {
                self.initialized.store(true, Ordering::SeqCst);
                self.connection
                    .publish(ConnectionState::new(ConnectionStatus::Connected));
                info!(url = %self.cfg.url, bucket = %self.cfg.bucket, "store session open");
                Ok(())
            }
            Err(e) => {
                self.connection.publish(ConnectionState::with_error(
                    ConnectionStatus::Failed,
                    e.to_string(),
                ));
                warn!(error = %e, "store initialize failed");
                Err(e)
            }
        }
    }

    async fn close(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        self.connection
            .publish(ConnectionState::new(ConnectionStatus::Disconnected));
    }

    async fn health(&self) -> Result<(), StoreError> {
        self.probe().await
    }

    async fn write_sensor_data(&self, reading: &SensorReading) -> Result<(), StoreError> {
        self.ensure_initialized()?;
        self.write_lines(line_protocol(reading, &self.cfg.project))
            .await
    }

    async fn write_sensor_data_batch(&self, readings: &[SensorReading]) -> Result<(), StoreError> {
        self.ensure_initialized()?;
        if readings.is_empty() {
            return Ok(());
        }
        let lines: Vec<String> = readings
            .iter()
            .map(|r| line_protocol(r, &self.cfg.project))
            .collect();
        debug!(points = lines.len(), "writing batch");
        self.write_lines(lines.join("\n")).await
    }

    async fn query_sensor_data(
        &self,
        filters: &SensorQuery,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SensorReading>, StoreError> {
        self.ensure_initialized()?;
        self.run_query(build_range_query(&self.cfg.bucket, filters, start, end, limit))
            .await
    }

    async fn query_latest_sensor_data(&self) -> Result<Vec<SensorReading>, StoreError> {
        self.ensure_initialized()?;
        self.run_query(build_latest_query(
            &self.cfg.bucket,
            self.cfg.latest_lookback.as_secs(),
        ))
        .await
    }

    fn connection_stream(&self) -> ReplayReceiver<ConnectionState> {
        self.connection.subscribe()
    }
}

fn escape_tag(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn escape_flux_str(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// One reading as an InfluxDB line-protocol point (millisecond precision).
fn line_protocol(reading: &SensorReading, project: &str) -> String {
    format!(
        "{},deviceType={},deviceID={},location={},deviceNode={},project={} value={} {}",
        reading.kind.wire_name(),
        escape_tag(reading.kind.wire_name()),
        escape_tag(&reading.device_id),
        escape_tag(&reading.location),
        escape_tag(&reading.device_node),
        escape_tag(project),
        reading.value,
        reading.timestamp.timestamp_millis()
    )
}

fn build_range_query(
    bucket: &str,
    filters: &SensorQuery,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: usize,
) -> String {
    let mut flux = format!(
        "from(bucket: \"{}\") |> range(start: {}, stop: {})",
        escape_flux_str(bucket),
        start.to_rfc3339_opts(SecondsFormat::Millis, true),
        end.to_rfc3339_opts(SecondsFormat::Millis, true)
    );
    flux.push_str(" |> filter(fn: (r) => r._field == \"value\")");
    if let Some(kind) = filters.kind {
        flux.push_str(&format!(
            " |> filter(fn: (r) => r._measurement == \"{}\")",
            kind.wire_name()
        ));
    }
    if let Some(device_id) = &filters.device_id {
        flux.push_str(&format!(
            " |> filter(fn: (r) => r.deviceID == \"{}\")",
            escape_flux_str(device_id)
        ));
    }
    if let Some(node) = &filters.device_node {
        flux.push_str(&format!(
            " |> filter(fn: (r) => r.deviceNode == \"{}\")",
            escape_flux_str(node)
        ));
    }
    flux.push_str(&format!(
        " |> sort(columns: [\"_time\"], desc: true) |> limit(n: {limit})"
    ));
    flux
}

fn build_latest_query(bucket: &str, lookback_secs: u64) -> String {
    format!(
        "from(bucket: \"{}\") |> range(start: -{}s) \
         |> filter(fn: (r) => r._field == \"value\") \
         |> group(columns: [\"_measurement\", \"deviceID\"]) \
         |> last()",
        escape_flux_str(bucket),
        lookback_secs
    )
}

/// Splits one CSV row, honoring double-quoted fields (embedded commas,
/// doubled quotes).
fn split_csv_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// Parses an annotated-CSV Flux response into readings. Rows that cannot be
/// mapped (unknown measurement, bad value) are skipped.
fn parse_query_csv(body: &str) -> Vec<SensorReading> {
    let mut readings = Vec::new();
    let mut columns: Option<Vec<String>> = None;

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            // Table boundary: the next non-annotation line is a new header.
            columns = None;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        let fields = split_csv_row(line);
        let Some(cols) = &columns else {
            columns = Some(fields);
            continue;
        };

        let get = |name: &str| -> Option<&str> {
            cols.iter()
                .position(|c| c == name)
                .and_then(|i| fields.get(i).map(String::as_str))
        };

        let Some(kind) = get("_measurement").and_then(SensorKind::from_wire) else {
            continue;
        };
        let Some(value) = get("_value").and_then(|v| v.parse::<f64>().ok()) else {
            continue;
        };
        let Some(timestamp) = get("_time")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
        else {
            continue;
        };
        readings.push(SensorReading::new(
            kind,
            value,
            timestamp,
            get("deviceID").unwrap_or(""),
            get("deviceNode").unwrap_or(""),
            get("location").unwrap_or(""),
        ));
    }
    readings
}
