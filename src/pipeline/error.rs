//! Error taxonomy shared by every pipeline component
//!
//! Component operations return `Result<_, ScanError>`; the scan orchestrator
//! folds failures into per-phase results instead of aborting the run.
//! Nothing in the pipeline retries a failed call: the unit is simply absent
//! until the next scheduled scan.

#[derive(Debug)]
pub enum ScanError {
    /// Transport failure (connect, timeout, body read)
    Http(reqwest::Error),
    /// Non-2xx response from an upstream endpoint
    Status { url: String, status: u16 },
    /// Response body did not have the expected shape
    Decode(String),
    Database(rusqlite::Error),
    Json(serde_json::Error),
    Io(std::io::Error),
    /// Association writer thread is gone or dropped the reply
    Actor(String),
    Config(String),
}

impl From<reqwest::Error> for ScanError {
    fn from(err: reqwest::Error) -> Self {
        ScanError::Http(err)
    }
}

impl From<rusqlite::Error> for ScanError {
    fn from(err: rusqlite::Error) -> Self {
        ScanError::Database(err)
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(err: serde_json::Error) -> Self {
        ScanError::Json(err)
    }
}

impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self {
        ScanError::Io(err)
    }
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Http(e) => write!(f, "HTTP error: {}", e),
            ScanError::Status { url, status } => {
                write!(f, "API error: {} returned status {}", url, status)
            }
            ScanError::Decode(msg) => write!(f, "Unexpected response shape: {}", msg),
            ScanError::Database(e) => write!(f, "Database error: {}", e),
            ScanError::Json(e) => write!(f, "JSON error: {}", e),
            ScanError::Io(e) => write!(f, "IO error: {}", e),
            ScanError::Actor(msg) => write!(f, "Association writer error: {}", msg),
            ScanError::Config(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ScanError {}
