use std::time::Duration;

use anyhow::Context;

#[derive(Clone, Debug)]
pub struct Config {
    pub push_url: String,
    pub api_base_url: String,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub handshake_timeout: Duration,
    pub notify_buffer: usize,
    pub session_token: Option<String>,
    /// Menu whose orders the admin view follows, as `menu_id@date`.
    pub admin_menu: Option<(String, String)>,
    /// Package whose detail view a customer keeps open.
    pub watch_package: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let push_url = var("SYNC_PUSH_URL").unwrap_or_else(|| "ws://localhost:5000/ws".into());
        let api_base_url =
            var("API_BASE_URL").unwrap_or_else(|| "http://localhost:5000/api".into());
        let backoff_initial_ms: u64 = var("SYNC_BACKOFF_INITIAL_MS")
            .unwrap_or_else(|| "1000".into())
            .parse()
            .context("SYNC_BACKOFF_INITIAL_MS must be a number")?;
        let backoff_max_ms: u64 = var("SYNC_BACKOFF_MAX_MS")
            .unwrap_or_else(|| "5000".into())
            .parse()
            .context("SYNC_BACKOFF_MAX_MS must be a number")?;
        let handshake_timeout_ms: u64 = var("SYNC_HANDSHAKE_TIMEOUT_MS")
            .unwrap_or_else(|| "10000".into())
            .parse()
            .context("SYNC_HANDSHAKE_TIMEOUT_MS must be a number")?;
        let notify_buffer = var("SYNC_NOTIFY_BUFFER")
            .unwrap_or_else(|| "64".into())
            .parse()
            .context("SYNC_NOTIFY_BUFFER must be a number")?;
        let session_token = var("SYNC_TOKEN").filter(|t| !t.is_empty());
        let watch_package = var("SYNC_PACKAGE_ID").filter(|p| !p.is_empty());
        let admin_menu = match var("SYNC_ADMIN_MENU").filter(|m| !m.is_empty()) {
            Some(value) => {
                let (menu_id, date) = value
                    .split_once('@')
                    .context("SYNC_ADMIN_MENU must look like menu_id@date")?;
                Some((menu_id.to_string(), date.to_string()))
            }
            None => None,
        };

        anyhow::ensure!(backoff_initial_ms > 0, "SYNC_BACKOFF_INITIAL_MS must be positive");
        anyhow::ensure!(
            handshake_timeout_ms > 0,
            "SYNC_HANDSHAKE_TIMEOUT_MS must be positive"
        );
        anyhow::ensure!(
            backoff_initial_ms <= backoff_max_ms,
            "SYNC_BACKOFF_INITIAL_MS must not exceed SYNC_BACKOFF_MAX_MS"
        );

        Ok(Self {
            push_url,
            api_base_url,
            backoff_initial: Duration::from_millis(backoff_initial_ms),
            backoff_max: Duration::from_millis(backoff_max_ms),
            handshake_timeout: Duration::from_millis(handshake_timeout_ms),
            notify_buffer,
            session_token,
            admin_menu,
            watch_package,
        })
    }
}
