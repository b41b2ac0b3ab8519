use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Limits applied by the realtime hub.
#[derive(Debug, Clone)]
pub struct ChatLimits {
    pub max_message_len: usize,
    pub preview_len: usize,
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for ChatLimits {
    fn default() -> Self {
        Self {
            max_message_len: 4000,
            preview_len: 80,
            default_page_size: 30,
            max_page_size: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_path: PathBuf,
    /// HS256 secret shared with the marketplace auth service. `None` means
    /// claimed identities are trusted, which is only acceptable in development.
    pub jwt_secret: Option<String>,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
    pub event_bus_capacity: usize,
    pub limits: ChatLimits,
}

impl Config {
    /// Read configuration from the process environment. Call
    /// `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("CHAT_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3000".into())
            .parse()
            .context("CHAT_BIND_ADDR is not a valid socket address")?;

        let database_path = match env::var("CHAT_DATABASE_PATH") {
            Ok(path) => PathBuf::from(path),
            Err(_) => {
                let home_dir = env::var("HOME").unwrap_or_else(|_| ".".into());
                PathBuf::from(home_dir)
                    .join(".marketplace-chat")
                    .join("chat.db")
            }
        };

        let jwt_secret = env::var("CHAT_JWT_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let defaults = ChatLimits::default();
        let limits = ChatLimits {
            max_message_len: parse_var("CHAT_MAX_MESSAGE_LEN", defaults.max_message_len)?,
            preview_len: parse_var("CHAT_PREVIEW_LEN", defaults.preview_len)?,
            default_page_size: parse_var("CHAT_DEFAULT_PAGE_SIZE", defaults.default_page_size)?,
            max_page_size: parse_var("CHAT_MAX_PAGE_SIZE", defaults.max_page_size)?,
        };

        let heartbeat_interval = Duration::from_secs(parse_var("CHAT_HEARTBEAT_SECS", 15u64)?);
        let client_timeout = Duration::from_secs(parse_var("CHAT_CLIENT_TIMEOUT_SECS", 45u64)?);
        if client_timeout <= heartbeat_interval {
            anyhow::bail!(
                "CHAT_CLIENT_TIMEOUT_SECS ({}s) must be longer than CHAT_HEARTBEAT_SECS ({}s)",
                client_timeout.as_secs(),
                heartbeat_interval.as_secs()
            );
        }

        Ok(Self {
            bind_addr,
            database_path,
            jwt_secret,
            heartbeat_interval,
            client_timeout,
            event_bus_capacity: parse_var("CHAT_EVENT_BUS_CAPACITY", 256usize)?,
            limits,
        })
    }
}

fn parse_var<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has an invalid value {:?}: {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_falls_back_and_rejects_garbage() {
        assert_eq!(parse_var("CHAT_TEST_UNSET_VAR", 30u32).unwrap(), 30);

        env::set_var("CHAT_TEST_PAGE_SIZE", " 12 ");
        assert_eq!(parse_var("CHAT_TEST_PAGE_SIZE", 30u32).unwrap(), 12);

        env::set_var("CHAT_TEST_BAD_SIZE", "lots");
        let err = parse_var("CHAT_TEST_BAD_SIZE", 30u32).unwrap_err();
        assert!(err.to_string().contains("CHAT_TEST_BAD_SIZE"));
    }
}
