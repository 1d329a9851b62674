//! HTTP JSON source.
//!
//! Issues one GET per work unit against a URL template, authenticates with a
//! bearer token read from the environment, and maps a JSON array of objects
//! onto the dataset's record schema. Status codes map onto [`FetchError`]:
//! 429 is rate limiting, 401/403 is a block, 404 is an unknown entity, and
//! everything else that is not a success is a network error.

use super::{FetchError, Fetcher, WorkUnit};
use crate::error::ConfigError;
use crate::record::{FieldKind, FieldValue, Record, RecordSchema, Table};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;
use std::time::Duration;

fn default_timeout_secs() -> u64 {
    30
}

fn default_query_date_format() -> String {
    "%Y%m%d".to_string()
}

fn default_period_field() -> String {
    "period_key".to_string()
}

fn default_retry_after_secs() -> u64 {
    60
}

/// Connection and response-shape parameters for an HTTP source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSourceConfig {
    /// e.g. `https://api.example.com/daily?ts_code={entity}&start={start}&end={end}`
    pub url_template: String,
    /// Environment variable holding the bearer token, if the source needs one.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Format of `{start}` and `{end}` in the URL.
    #[serde(default = "default_query_date_format")]
    pub query_date_format: String,
    /// JSON pointer to the record array (e.g. `/data`); the body itself when absent.
    #[serde(default)]
    pub records_pointer: Option<String>,
    /// Object key that holds the entity id; the unit's id is used when absent.
    #[serde(default)]
    pub entity_field: Option<String>,
    #[serde(default = "default_period_field")]
    pub period_field: String,
    /// Object key holding the revision (RFC 3339, a date, or epoch millis).
    /// Records without one are stamped with the fetch time.
    #[serde(default)]
    pub revision_field: Option<String>,
    #[serde(default = "default_retry_after_secs")]
    pub default_retry_after_secs: u64,
}

impl HttpSourceConfig {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
            token_env: None,
            timeout_secs: default_timeout_secs(),
            query_date_format: default_query_date_format(),
            records_pointer: None,
            entity_field: None,
            period_field: default_period_field(),
            revision_field: None,
            default_retry_after_secs: default_retry_after_secs(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.url_template.contains("{entity}") {
            return Err(ConfigError::invalid(
                "source.url_template",
                "must contain the {entity} placeholder",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::invalid("source.timeout_secs", "must be positive"));
        }
        if let Some(pointer) = &self.records_pointer {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                return Err(ConfigError::invalid(
                    "source.records_pointer",
                    "a JSON pointer must start with '/'",
                ));
            }
        }
        Ok(())
    }
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    config: HttpSourceConfig,
    schema: RecordSchema,
}

impl HttpFetcher {
    pub fn new(config: HttpSourceConfig, schema: RecordSchema) -> Result<Self, ConfigError> {
        config.validate()?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("quarry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::invalid("source", format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            schema,
        })
    }

    pub fn url_for(&self, unit: &WorkUnit) -> String {
        let fmt = &self.config.query_date_format;
        self.config
            .url_template
            .replace("{entity}", &unit.entity_id)
            .replace("{start}", &unit.range.start.format(fmt).to_string())
            .replace("{end}", &unit.range.end.format(fmt).to_string())
    }

    fn token(&self) -> Result<Option<String>, ConfigError> {
        match &self.config.token_env {
            None => Ok(None),
            Some(var) => match env::var(var) {
                Ok(token) if !token.trim().is_empty() => Ok(Some(token)),
                _ => Err(ConfigError::MissingCredential { var: var.clone() }),
            },
        }
    }

    /// Turn a decoded body into a table for `unit`.
    pub fn parse_body(
        &self,
        unit: &WorkUnit,
        body: &Value,
        fetched_at: DateTime<Utc>,
    ) -> Result<Table, FetchError> {
        let items = match self.config.records_pointer.as_deref() {
            None | Some("") => body,
            Some(pointer) => body.pointer(pointer).ok_or_else(|| {
                FetchError::ResponseFormat(format!("no value at {pointer}"))
            })?,
        };

        // `null` is how several APIs spell "nothing in this range".
        let items = match items {
            Value::Null => return Ok(Table::new(self.schema.clone())),
            Value::Array(items) => items,
            other => {
                return Err(FetchError::ResponseFormat(format!(
                    "expected an array of records, got {}",
                    json_type(other)
                )))
            }
        };

        let mut table = Table::new(self.schema.clone());
        for item in items {
            let object = item.as_object().ok_or_else(|| {
                FetchError::ResponseFormat(format!("expected an object, got {}", json_type(item)))
            })?;
            table.push(record_from_json(
                object,
                &self.schema,
                &self.config,
                &unit.entity_id,
                fetched_at,
            )?);
        }
        Ok(table)
    }
}

impl Fetcher for HttpFetcher {
    fn name(&self) -> &str {
        "http"
    }

    fn preflight(&self) -> Result<(), ConfigError> {
        self.token().map(|_| ())
    }

    fn fetch(&self, unit: &WorkUnit) -> Result<Table, FetchError> {
        let token = self
            .token()
            .map_err(|e| FetchError::Blocked(e.to_string()))?;

        let mut request = self.client.get(self.url_for(unit));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().map_err(|e| FetchError::Network(e.to_string()))?;
        let status = resp.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(self.config.default_retry_after_secs);
            return Err(FetchError::RateLimited { retry_after_secs });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(FetchError::Blocked(format!("HTTP {status}")));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                entity_id: unit.entity_id.clone(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Network(format!("HTTP {status} for {unit}")));
        }

        let fetched_at = Utc::now();
        let body: Value = resp
            .json()
            .map_err(|e| FetchError::ResponseFormat(format!("undecodable body for {unit}: {e}")))?;
        self.parse_body(unit, &body, fetched_at)
    }
}

/// Map one JSON object onto a record of `schema`. Keys that are not schema
/// fields are ignored; `null` values are nulls.
pub fn record_from_json(
    object: &Map<String, Value>,
    schema: &RecordSchema,
    config: &HttpSourceConfig,
    default_entity: &str,
    fetched_at: DateTime<Utc>,
) -> Result<Record, FetchError> {
    let entity_id = match &config.entity_field {
        Some(key) => match object.get(key) {
            Some(value) => scalar_text(value).ok_or_else(|| bad_value(key, value))?,
            None => default_entity.to_string(),
        },
        None => default_entity.to_string(),
    };

    let period_value = object
        .get(&config.period_field)
        .ok_or_else(|| FetchError::ResponseFormat(format!("missing '{}'", config.period_field)))?;
    let period_key =
        scalar_text(period_value).ok_or_else(|| bad_value(&config.period_field, period_value))?;

    let revision = match config.revision_field.as_ref().and_then(|k| object.get(k).map(|v| (k, v))) {
        Some((_, Value::Null)) | None => fetched_at,
        Some((key, value)) => parse_revision(value).ok_or_else(|| bad_value(key, value))?,
    };

    let mut record = Record::new(entity_id, period_key, revision);
    for spec in &schema.fields {
        let Some(value) = object.get(&spec.name) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let converted = match spec.kind {
            FieldKind::Float => value.as_f64().map(FieldValue::Float),
            FieldKind::Int => value
                .as_i64()
                .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(FieldValue::Int),
            FieldKind::Text | FieldKind::Date => scalar_text(value).map(FieldValue::Text),
        };
        let converted = converted.ok_or_else(|| bad_value(&spec.name, value))?;
        record.values.insert(spec.name.clone(), converted);
    }
    Ok(record)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_revision(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                ["%Y%m%d", "%Y-%m-%d"]
                    .iter()
                    .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| dt.and_utc())
            }),
        _ => None,
    }
}

fn bad_value(key: &str, value: &Value) -> FetchError {
    FetchError::ResponseFormat(format!("unexpected {} for '{key}'", json_type(value)))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
