//! HTTP access to the Polymarket Gamma and Data APIs
//!
//! ## API Reference
//!
//! Gamma (`GAMMA_API_URL`): `/events`, `/markets`, `/series`, `/tags`,
//! `/comments`, plus `/{collection}/{id}` detail endpoints.
//!
//! Data (`DATA_API_URL`): `/holders`, `/value`, `/trades`, `/activity`,
//! `/positions`, `/closed-positions`, `/live-volume`, `/oi`.
//!
//! Every response is a JSON array or a single JSON object. Missing fields are
//! never an error here; callers map them to NULL.

use super::config::ScanConfig;
use super::error::ScanError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Which upstream service an endpoint lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Api {
    Gamma,
    Data,
}

/// Query string as ordered key/value pairs
pub type Query = Vec<(String, String)>;

/// Build a `Query` from anything displayable
pub fn query<K, V, I>(pairs: I) -> Query
where
    I: IntoIterator<Item = (K, V)>,
    K: ToString,
    V: ToString,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Seam between the pipeline and the network
///
/// The reqwest implementation is used in production; tests script responses.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// GET `path` on `api` and decode the body as JSON
    async fn get_json(&self, api: Api, path: &str, query: &[(String, String)])
        -> Result<Value, ScanError>;

    /// GET a collection endpoint and return its records
    ///
    /// Accepts a bare array or an object wrapping one under `data`.
    async fn get_list(
        &self,
        api: Api,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Vec<Value>, ScanError> {
        match self.get_json(api, path, query).await? {
            Value::Array(items) => Ok(items),
            Value::Object(mut obj) => match obj.remove("data") {
                Some(Value::Array(items)) => Ok(items),
                _ => Err(ScanError::Decode(format!("{} returned an object, expected array", path))),
            },
            Value::Null => Ok(Vec::new()),
            other => Err(ScanError::Decode(format!(
                "{} returned {}, expected array",
                path,
                type_name(&other)
            ))),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// reqwest-backed client with a per-request timeout
pub struct HttpApiClient {
    client: reqwest::Client,
    gamma_url: String,
    data_url: String,
}

impl HttpApiClient {
    pub fn new(config: &ScanConfig) -> Result<Self, ScanError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("polyscan/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            gamma_url: config.gamma_api_url.trim_end_matches('/').to_string(),
            data_url: config.data_api_url.trim_end_matches('/').to_string(),
        })
    }

    fn base(&self, api: Api) -> &str {
        match api {
            Api::Gamma => &self.gamma_url,
            Api::Data => &self.data_url,
        }
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn get_json(
        &self,
        api: Api,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Value, ScanError> {
        let url = format!("{}{}", self.base(api), path);

        let response = self.client.get(&url).query(query).send().await?;

        if !response.status().is_success() {
            return Err(ScanError::Status {
                url,
                status: response.status().as_u16(),
            });
        }

        Ok(response.json::<Value>().await?)
    }
}

/// Enforces a fixed minimum spacing between calls
///
/// Shared by every task that performs rate-limited lookups; waiting callers
/// are released one interval apart.
pub struct RateLimiter {
    delay: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last: Mutex::new(None),
        }
    }

    /// Wait for the next free slot
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let next = prev + self.delay;
            if next > Instant::now() {
                tokio::time::sleep_until(next).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Read a field as f64, accepting numbers and numeric strings
pub fn json_f64(record: &Value, field: &str) -> Option<f64> {
    match record.get(field)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Read a field as a string, accepting strings and numbers
pub fn json_string(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
