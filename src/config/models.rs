use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::queue::{BrokerConfig, JobOptions};
use crate::worker::http::HttpConfig;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerSettings,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub stages: StagesConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub instagram: InstagramSettings,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Operator HTTP surface
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Job store location and worker tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub path: PathBuf,
    pub poll_interval_ms: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub event_capacity: usize,
    pub worker_slots: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/queue"),
            poll_interval_ms: 1000,
            backoff_base_secs: 5,
            backoff_max_secs: 300,
            event_capacity: 256,
            worker_slots: 1,
        }
    }
}

impl BrokerSettings {
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            backoff_base: Duration::from_secs(self.backoff_base_secs),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
            event_capacity: self.event_capacity,
            worker_slots: self.worker_slots,
        }
    }
}

/// When the fetch trigger fires
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    /// Five-field (minute) or six/seven-field (second) cron expression
    pub cron: String,
    /// IANA timezone the cron expression is evaluated in
    pub timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: "15 10 * * *".to_string(),
            timezone: "America/Los_Angeles".to_string(),
        }
    }
}

/// Attempts, timeout and fan-out of one stage
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StagePolicy {
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub concurrency: usize,
}

impl StagePolicy {
    pub const fn new(max_attempts: u32, timeout_secs: u64, concurrency: usize) -> Self {
        Self {
            max_attempts,
            timeout_secs,
            concurrency,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn job_options(&self) -> JobOptions {
        JobOptions::new(self.max_attempts, self.timeout())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StagesConfig {
    pub fetch: StagePolicy,
    pub download: StagePolicy,
    pub upload: StagePolicy,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            fetch: StagePolicy::new(1, 30, 4),
            download: StagePolicy::new(3, 30 * 60, 10),
            upload: StagePolicy::new(3, 30 * 60, 5),
        }
    }
}

/// Local download root and asset HTTP client
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub root: PathBuf,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        let http = HttpConfig::default();
        Self {
            root: PathBuf::from("data/instagram"),
            user_agent: http.user_agent,
            connect_timeout_secs: http.connect_timeout.as_secs(),
            request_timeout_secs: http.request_timeout.as_secs(),
        }
    }
}

impl DownloadConfig {
    pub fn http_config(&self) -> HttpConfig {
        HttpConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            user_agent: self.user_agent.clone(),
        }
    }
}

/// Story source endpoint and account
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InstagramSettings {
    pub api_base: String,
    pub session_path: PathBuf,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    /// Usernames to harvest; nobody when empty (`IG_WHITELIST` overrides)
    pub whitelist: Vec<String>,
    /// Loaded from `IG_USERNAME`, never from the config file
    #[serde(skip)]
    pub username: Option<String>,
    /// Loaded from `IG_PASSWORD`, never from the config file
    #[serde(skip)]
    pub password: Option<String>,
    /// Loaded from `IG_PROXY`
    #[serde(skip)]
    pub proxy: Option<String>,
}

impl Default for InstagramSettings {
    fn default() -> Self {
        Self {
            api_base: "https://i.instagram.com/api/v1".to_string(),
            session_path: PathBuf::from("data/session.json"),
            user_agent: "Instagram 219.0.0.12.117 Android".to_string(),
            request_timeout_secs: 30,
            whitelist: Vec::new(),
            username: None,
            password: None,
            proxy: None,
        }
    }
}

/// Blob storage target
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub container: String,
    /// Loaded from `AZURE_STORAGE_CONNECTION_STRING`
    #[serde(skip)]
    pub connection_string: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            container: "instagram".to_string(),
            connection_string: None,
        }
    }
}

/// Failure alerts
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub webhook_base: String,
    pub channel: String,
    pub timeout_secs: u64,
    /// Loaded from `IFTTT_TOKEN`
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_base: "https://maker.ifttt.com".to_string(),
            channel: "tg".to_string(),
            timeout_secs: 10,
            token: None,
        }
    }
}
