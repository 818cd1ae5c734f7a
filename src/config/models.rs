//! Process configuration of the apps proxy.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files and
//! `APPS_PROXY__*` environment variables. Every section has defaults so that a
//! minimal config only carries the control-plane API and the cookie salt.
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_public_url() -> String {
    "https://hub.keboola.local".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Public base URL; its host is the domain app subdomains live under.
    #[serde(default = "default_public_url")]
    pub public_url: String,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub wakeup: WakeupConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub log: LogConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            public_url: default_public_url(),
            api: ApiConfig::default(),
            auth: AuthConfig::default(),
            notify: NotifyConfig::default(),
            wakeup: WakeupConfig::default(),
            upstream: UpstreamConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Host of [`ProxyConfig::public_url`], without port.
    pub fn public_domain(&self) -> Option<String> {
        url::Url::parse(&self.public_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
    }
}

/// Control-plane API used to load app configs and report usage.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub url: String,
    pub token: String,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            timeout_secs: 30,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    /// Server salt mixed into every per-(app, provider) cookie secret.
    pub cookie_secret_salt: String,
    /// Session cookie lifetime; the selection cookie mirrors it.
    pub session_ttl_secs: u64,
    /// Inbound headers with this prefix are dropped; identity headers use it.
    pub header_prefix: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cookie_secret_salt: String::new(),
            session_ttl_secs: 7 * 24 * 60 * 60,
            header_prefix: "X-Kbc-".to_string(),
        }
    }
}

impl AuthConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// Usage reports: at most one per app per interval.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 30,
        }
    }
}

/// Wakeup requests for apps without a DNS record.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct WakeupConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for WakeupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1,
            timeout_secs: 30,
        }
    }
}

macro_rules! debounce_durations {
    ($($config:ty),+) => {$(
        impl $config {
            pub fn interval(&self) -> Duration {
                Duration::from_secs(self.interval_secs)
            }

            pub fn timeout(&self) -> Duration {
                Duration::from_secs(self.timeout_secs)
            }
        }
    )+};
}

debounce_durations!(NotifyConfig, WakeupConfig);

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    pub connect_timeout_secs: u64,
    /// 504 once the upstream takes longer than this to send headers.
    pub response_header_timeout_secs: u64,
    /// Bound on draining background control-plane calls at exit.
    pub shutdown_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            response_header_timeout_secs: 60,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}
