use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::{anyhow, Result};
use tracing::warn;
use url::Url;

const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub server_url: String,
    pub auth_token: Option<String>,
    pub page_size: u32,
    pub typing_expiry: Duration,
    pub typing_debounce: Duration,
    pub send_error_display: Duration,
    pub rate_limit_banner: Duration,
    pub transport_reconnect_delay: Duration,
    pub command_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            auth_token: None,
            page_size: 50,
            typing_expiry: Duration::from_millis(5000),
            typing_debounce: Duration::from_millis(3000),
            send_error_display: Duration::from_millis(4000),
            rate_limit_banner: Duration::from_millis(3000),
            transport_reconnect_delay: Duration::from_millis(2000),
            command_timeout: Duration::from_secs(10),
        }
    }
}

/// Defaults, then `client.toml` in the working directory, then `APP__*` env vars.
pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub(crate) fn load_settings_from(
    file: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(file) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => {
                for (key, value) in file_cfg {
                    let value = match value {
                        toml::Value::String(text) => text,
                        other => other.to_string(),
                    };
                    apply_setting(&mut settings, &key, &value);
                }
            }
            Err(err) => warn!("config: ignoring unreadable {}: {err}", file.display()),
        }
    }

    for (key, env_key) in [
        ("server_url", "APP__SERVER_URL"),
        ("auth_token", "APP__AUTH_TOKEN"),
        ("page_size", "APP__PAGE_SIZE"),
        ("typing_expiry_ms", "APP__TYPING_EXPIRY_MS"),
        ("typing_debounce_ms", "APP__TYPING_DEBOUNCE_MS"),
        ("send_error_display_ms", "APP__SEND_ERROR_DISPLAY_MS"),
        ("rate_limit_banner_ms", "APP__RATE_LIMIT_BANNER_MS"),
        ("transport_reconnect_delay_ms", "APP__TRANSPORT_RECONNECT_DELAY_MS"),
        ("command_timeout_ms", "APP__COMMAND_TIMEOUT_MS"),
    ] {
        if let Some(value) = env(env_key) {
            apply_setting(&mut settings, key, &value);
        }
    }

    settings.server_url = normalize_server_url(&settings.server_url);
    settings
}

fn apply_setting(settings: &mut ClientSettings, key: &str, value: &str) {
    let millis = || value.trim().parse::<u64>().map(Duration::from_millis);
    let applied = match key {
        "server_url" => {
            settings.server_url = value.to_string();
            true
        }
        "auth_token" => {
            settings.auth_token = Some(value.to_string()).filter(|token| !token.is_empty());
            true
        }
        "page_size" => match value.trim().parse::<u32>() {
            Ok(size) if size > 0 => {
                settings.page_size = size;
                true
            }
            _ => false,
        },
        "typing_expiry_ms" => millis().map(|d| settings.typing_expiry = d).is_ok(),
        "typing_debounce_ms" => millis().map(|d| settings.typing_debounce = d).is_ok(),
        "send_error_display_ms" => millis().map(|d| settings.send_error_display = d).is_ok(),
        "rate_limit_banner_ms" => millis().map(|d| settings.rate_limit_banner = d).is_ok(),
        "transport_reconnect_delay_ms" => millis()
            .map(|d| settings.transport_reconnect_delay = d)
            .is_ok(),
        "command_timeout_ms" => millis().map(|d| settings.command_timeout = d).is_ok(),
        _ => {
            warn!("config: unknown setting '{key}'");
            return;
        }
    };
    if !applied {
        warn!("config: ignoring invalid value for '{key}': {value}");
    }
}

pub fn normalize_server_url(raw: &str) -> String {
    let raw = raw.trim().trim_end_matches('/');
    if raw.is_empty() {
        return ClientSettings::default().server_url;
    }
    if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    }
}

/// Streaming endpoint for a server base url: `http` becomes `ws`, `https` becomes `wss`.
pub fn websocket_url(server_url: &str) -> Result<Url> {
    let mut url = Url::parse(&normalize_server_url(server_url))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(anyhow!("unsupported server url scheme: {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("failed to derive websocket scheme for {server_url}"))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}
