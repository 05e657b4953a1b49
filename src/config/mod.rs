use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Interpreter used to run the OCR script (e.g., a venv python)
    #[serde(default = "default_ocr_python")]
    pub ocr_python: String,

    /// Path to the OCR extraction script
    pub ocr_script: String,

    /// Auxiliary resource paths passed to the OCR script after the image
    /// (alignment mask, manual mask, coordinates file, ...)
    #[serde(default)]
    pub ocr_resources: Vec<String>,

    /// Hard limit on a single OCR subprocess run, in seconds
    #[serde(default = "default_ocr_timeout_secs")]
    pub ocr_timeout_secs: u64,

    /// Directory where uploaded images are staged until processed
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,

    /// Worker poll interval when the queue is empty, in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub worker_poll_interval_secs: u64,

    /// Worker backoff after an infrastructure error (e.g. the claim query
    /// itself failing), in seconds
    #[serde(default = "default_error_backoff_secs")]
    pub worker_error_backoff_secs: u64,

    /// Declared retry budget for failed jobs. The worker does not requeue
    /// automatically; failures are terminal until an operator resubmits.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Number of events the bus retains for reconciliation
    #[serde(default = "default_event_history_limit")]
    pub event_history_limit: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_ocr_python() -> String {
    "python3".to_string()
}

fn default_ocr_timeout_secs() -> u64 {
    30
}

fn default_upload_dir() -> String {
    "./uploads".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_error_backoff_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_event_history_limit() -> usize {
    1000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
