use anyhow::{anyhow, Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub transport: TransportKind,
    pub server_url: String,
    pub polling: PollingConfig,
    pub transfer: TransferConfig,
    pub request_timeout: Duration,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let transport = match env::var("LANCHAT_TRANSPORT") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .parse()
                .with_context(|| "invalid LANCHAT_TRANSPORT".to_string())?,
            _ => TransportKind::Http,
        };
        let server_url = env::var("LANCHAT_SERVER_URL")
            .ok()
            .filter(|raw| !raw.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        let request_timeout = env_u64("LANCHAT_REQUEST_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(15));
        Ok(Self {
            transport,
            server_url,
            polling: PollingConfig::from_env(),
            transfer: TransferConfig::from_env(),
            request_timeout,
        })
    }

    pub fn http(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Http,
            server_url: DEFAULT_SERVER_URL.to_string(),
            polling: PollingConfig::default(),
            transfer: TransferConfig::default(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Which backend answers facade calls. Chosen once per running client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// In-process host bridge with push events.
    Native,
    /// Remote HTTP server, polling only.
    Http,
}

impl TransportKind {
    pub fn supports_push(self) -> bool {
        self == TransportKind::Native
    }
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "native" | "tauri" => Ok(TransportKind::Native),
            "http" | "web" => Ok(TransportKind::Http),
            other => Err(anyhow!("unknown transport '{other}' (expected 'native' or 'http')")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub peer_interval: Duration,
    pub message_interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            peer_interval: Duration::from_millis(3000),
            message_interval: Duration::from_millis(3000),
        }
    }
}

impl PollingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            peer_interval: env_u64("LANCHAT_PEER_POLL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.peer_interval),
            message_interval: env_u64("LANCHAT_MESSAGE_POLL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.message_interval),
        }
    }
}

/// Whether inbound files wait for the user or are accepted as soon as they
/// show up in the open conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptPolicy {
    #[default]
    Explicit,
    Automatic,
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub accept_backoff: Duration,
    pub accept_policy: AcceptPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            accept_backoff: Duration::from_millis(2000),
            accept_policy: AcceptPolicy::Explicit,
        }
    }
}

impl TransferConfig {
    pub fn from_env() -> Self {
        let accept_backoff = env_u64("LANCHAT_ACCEPT_BACKOFF_MS")
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(2000));

        // Explicit accept unless automatic accept is switched on
        let accept_policy = env::var("LANCHAT_AUTO_ACCEPT")
            .ok()
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .map(|auto| {
                if auto {
                    AcceptPolicy::Automatic
                } else {
                    AcceptPolicy::Explicit
                }
            })
            .unwrap_or_default();

        Self {
            accept_backoff,
            accept_policy,
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|raw| raw.trim().parse().ok())
}
