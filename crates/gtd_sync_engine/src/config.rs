//! Configuration for the sync engine.

use crate::channel::PinnedCertificate;
use crate::error::{SyncError, SyncResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for sync rounds against one server.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Server address, `host:port`.
    pub address: String,
    /// Name presented for SNI.
    pub server_name: String,
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
    /// Maximum commands per download page.
    pub download_page_size: u32,
    /// Maximum commands per upload request.
    pub upload_batch_size: usize,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Interval for automatic sync after a successful round.
    pub sync_interval: Option<Duration>,
    /// Connect, read and write timeout.
    pub timeout: Duration,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    ///
    /// The SNI name defaults to the host part of `address`.
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        let server_name = host_of(&address).to_string();
        Self {
            address,
            server_name,
            username: String::new(),
            password: String::new(),
            download_page_size: 100,
            upload_batch_size: 500,
            retry: RetryConfig::default(),
            sync_interval: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the SNI name.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Sets the account credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Sets the download page size.
    pub fn with_download_page_size(mut self, size: u32) -> Self {
        self.download_page_size = size.max(1);
        self
    }

    /// Sets the upload batch size.
    pub fn with_upload_batch_size(mut self, size: usize) -> Self {
        self.upload_batch_size = size.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the sync interval for automatic sync.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Sets the network timeout. A zero timeout is ignored.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.timeout = timeout;
        }
        self
    }
}

pub(crate) fn host_of(address: &str) -> &str {
    match address.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => {
            host.trim_start_matches('[').trim_end_matches(']')
        }
        _ => address,
    }
}

/// Backoff between failed sync rounds.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates the default backoff: 1s doubling up to 5 minutes.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    ///
    /// Values below 1.0, and NaN, become 1.0 (a constant delay).
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = if multiplier >= 1.0 { multiplier } else { 1.0 };
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Delay before retrying after `failures` consecutive failures.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let multiplier = self.backoff_multiplier.max(1.0);
        let base_delay = self.initial_delay.as_secs_f64() * multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        let total = if self.add_jitter {
            // Up to 25% extra.
            delay_secs + delay_secs * 0.25 * rand::random::<f64>()
        } else {
            delay_secs
        };
        Duration::try_from_secs_f64(total).unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Client settings as stored in a JSON file.
///
/// ```json
/// {
///   "server": "gtd.example.com:7443",
///   "username": "ana",
///   "password": "secret",
///   "pinned_hostname": "gtd.example.com",
///   "certificate": "server.der",
///   "data_dir": "/home/ana/.gtd"
/// }
/// ```
///
/// Without `server`, sync is disabled and every sync request is a no-op.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Server address, `host:port`.
    pub server: Option<String>,
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
    /// Expected server hostname; defaults to the host part of `server`.
    pub pinned_hostname: Option<String>,
    /// Path to the pinned DER certificate, relative to the settings file.
    pub certificate: Option<PathBuf>,
    /// Replica data directory.
    pub data_dir: Option<PathBuf>,
    /// Network timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Automatic sync interval in seconds.
    pub sync_interval_secs: Option<u64>,
    /// Download page size.
    pub page_size: Option<u32>,
    /// Upload batch size.
    pub upload_batch_size: Option<usize>,
    /// Backoff settings.
    pub retry: RetrySettings,
}

/// Backoff section of [`ClientSettings`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Delay after the first failure, in milliseconds.
    pub initial_delay_ms: Option<u64>,
    /// Upper bound on the delay, in milliseconds.
    pub max_delay_ms: Option<u64>,
    /// Backoff multiplier.
    pub multiplier: Option<f64>,
}

impl ClientSettings {
    /// Loads settings from a JSON file.
    ///
    /// A relative `certificate` path is resolved against the file's
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        let mut settings = Self::from_json(&text)?;
        if let (Some(cert), Some(base)) = (&settings.certificate, path.parent()) {
            if cert.is_relative() {
                settings.certificate = Some(base.join(cert));
            }
        }
        Ok(settings)
    }

    /// Parses settings from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] on malformed JSON.
    pub fn from_json(text: &str) -> SyncResult<Self> {
        serde_json::from_str(text).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Builds the sync configuration, or `None` when no server is set.
    pub fn sync_config(&self) -> Option<SyncConfig> {
        let address = self.server.as_deref().filter(|s| !s.is_empty())?;
        let mut config =
            SyncConfig::new(address).with_credentials(&self.username, &self.password);
        if let Some(name) = &self.pinned_hostname {
            config = config.with_server_name(name);
        }
        if let Some(secs) = self.timeout_secs.filter(|s| *s > 0) {
            config = config.with_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.sync_interval_secs.filter(|s| *s > 0) {
            config = config.with_sync_interval(Duration::from_secs(secs));
        }
        if let Some(size) = self.page_size {
            config = config.with_download_page_size(size);
        }
        if let Some(size) = self.upload_batch_size {
            config = config.with_upload_batch_size(size);
        }

        let mut retry = RetryConfig::new();
        if let Some(ms) = self.retry.initial_delay_ms {
            retry = retry.with_initial_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = self.retry.max_delay_ms {
            retry = retry.with_max_delay(Duration::from_millis(ms));
        }
        if let Some(multiplier) = self.retry.multiplier {
            retry = retry.with_backoff_multiplier(multiplier);
        }
        Some(config.with_retry(retry))
    }

    /// Loads the pinned certificate for `config`.
    ///
    /// The pin holds `pinned_hostname` when set, otherwise the host part of
    /// the server address. The channel compares it against the host it
    /// actually dials.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if no certificate is configured or it
    /// cannot be read.
    pub fn pinned_certificate(&self, config: &SyncConfig) -> SyncResult<PinnedCertificate> {
        let path = self
            .certificate
            .as_deref()
            .ok_or_else(|| SyncError::Config("no pinned certificate configured".into()))?;
        let hostname = match &self.pinned_hostname {
            Some(name) => name.clone(),
            None => host_of(&config.address).to_string(),
        };
        PinnedCertificate::from_der_file(path, hostname)
    }
}
