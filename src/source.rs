use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use crate::weather::WeatherRecord;
use crate::{PipelineError, RetryExecutor, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub records: Vec<WeatherRecord>,
    /// Rows the provider sent but that could not be ingested.
    pub dropped_rows: usize,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<FetchOutcome, PipelineError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            name: "Brazzaville".to_string(),
            latitude: -4.2661,
            longitude: 15.2832,
        }
    }
}

/// Daily variables requested from the archive API, in the same order as
/// [`crate::weather::NUMERIC_COLUMNS`].
const DAILY_VARIABLES: [&str; 12] = [
    "temperature_2m_max",
    "temperature_2m_min",
    "rain_sum",
    "relative_humidity_2m_max",
    "relative_humidity_2m_min",
    "wind_speed_10m_max",
    "wind_speed_10m_min",
    "wind_speed_10m_mean",
    "relative_humidity_2m_mean",
    "cloudcover_mean",
    "surface_pressure_mean",
    "precipitation_hours",
];

pub struct OpenMeteoSource {
    client: reqwest::Client,
    base_url: String,
    location: Location,
    retry: RetryPolicy,
}

impl OpenMeteoSource {
    pub fn new(
        base_url: impl Into<String>,
        location: Location,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            location,
            retry,
        })
    }

    async fn request(&self, start: NaiveDate, end: NaiveDate) -> Result<Value, PipelineError> {
        let query = [
            ("latitude", self.location.latitude.to_string()),
            ("longitude", self.location.longitude.to_string()),
            ("start_date", start.to_string()),
            ("end_date", end.to_string()),
            ("daily", DAILY_VARIABLES.join(",")),
            ("wind_speed_unit", "ms".to_string()),
            ("temperature_unit", "celsius".to_string()),
        ];

        let url = reqwest::Url::parse_with_params(&self.base_url, &query)
            .map_err(|e| PipelineError::Configuration(format!("provider url: {}", e)))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::UpstreamUnavailable(format!("open-meteo: {}", e)))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "open-meteo responded with {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(PipelineError::Configuration(format!(
                "open-meteo rejected the request with {}",
                status
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| PipelineError::UpstreamUnavailable(format!("open-meteo body: {}", e)))
    }
}

#[async_trait]
impl DataSource for OpenMeteoSource {
    async fn fetch(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<FetchOutcome, PipelineError> {
        if end < start {
            return Err(PipelineError::Configuration(format!(
                "fetch range is inverted: {} > {}",
                start, end
            )));
        }

        let executor = RetryExecutor::new(Some(self.retry.clone()));
        let body = executor
            .execute_with_retry(CancellationToken::new(), "open-meteo", |_| self.request(start, end))
            .await
            .map_err(|e| match e {
                PipelineError::RetryFailed { .. } => PipelineError::UpstreamUnavailable(e.to_string()),
                other => other,
            })?;

        let outcome = parse_daily(&body)?;
        info!(
            location = %self.location.name,
            %start, %end,
            rows = outcome.records.len(),
            dropped = outcome.dropped_rows,
            "weather data fetched"
        );
        Ok(outcome)
    }
}

/// Turns the `daily` block of an archive response into records. A row with
/// any missing or non-numeric variable is dropped and counted.
pub fn parse_daily(body: &Value) -> Result<FetchOutcome, PipelineError> {
    let daily = body
        .get("daily")
        .ok_or_else(|| PipelineError::UpstreamUnavailable("response has no daily block".into()))?;
    let times = daily
        .get("time")
        .and_then(Value::as_array)
        .ok_or_else(|| PipelineError::UpstreamUnavailable("daily block has no time axis".into()))?;

    let mut series = Vec::with_capacity(DAILY_VARIABLES.len());
    for variable in DAILY_VARIABLES {
        let values = daily.get(variable).and_then(Value::as_array).ok_or_else(|| {
            PipelineError::UpstreamUnavailable(format!("daily block has no {}", variable))
        })?;
        series.push(values);
    }

    let mut records = Vec::with_capacity(times.len());
    let mut dropped_rows = 0;
    'rows: for (i, time) in times.iter().enumerate() {
        let Some(date) = time
            .as_str()
            .and_then(|t| NaiveDate::parse_from_str(t, "%Y-%m-%d").ok())
        else {
            dropped_rows += 1;
            continue;
        };

        let mut values = [0.0; 12];
        for (slot, column) in values.iter_mut().zip(&series) {
            match column.get(i).and_then(Value::as_f64) {
                Some(v) => *slot = v,
                None => {
                    dropped_rows += 1;
                    continue 'rows;
                }
            }
        }
        records.push(WeatherRecord::from_values(date, values));
    }

    if dropped_rows > 0 {
        warn!(dropped_rows, "rows dropped while parsing provider response");
    }
    Ok(FetchOutcome {
        records,
        dropped_rows,
    })
}
