use std::fs;

/// Client tuning. Defaults are overridden by `client.toml` in the working
/// directory, then by environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_base_url: String,
    pub socket_url: String,
    pub heartbeat_seconds: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    /// Delay before refreshing the directory after messaging an interlocutor
    /// the directory does not know yet.
    pub directory_refresh_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api/v1".into(),
            socket_url: "ws://localhost:8000/ws/".into(),
            heartbeat_seconds: 30,
            reconnect_base_ms: 500,
            reconnect_cap_ms: 30_000,
            directory_refresh_delay_ms: 500,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        apply_toml(&mut settings, &raw);
    }

    if let Ok(v) = std::env::var("CHAT_API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_SOCKET_URL") {
        settings.socket_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_HEARTBEAT_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.heartbeat_seconds = parsed;
        }
    }
    if let Ok(v) = std::env::var("CHAT_RECONNECT_BASE_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_base_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("CHAT_RECONNECT_CAP_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_cap_ms = parsed;
        }
    }

    settings
}

fn apply_toml(settings: &mut Settings, raw: &str) {
    let Ok(value) = raw.parse::<toml::Value>() else {
        return;
    };

    if let Some(v) = value.get("api_base_url").and_then(toml::Value::as_str) {
        settings.api_base_url = v.to_string();
    }
    if let Some(v) = value.get("socket_url").and_then(toml::Value::as_str) {
        settings.socket_url = v.to_string();
    }
    if let Some(v) = value
        .get("heartbeat_seconds")
        .and_then(toml::Value::as_integer)
    {
        settings.heartbeat_seconds = v.max(1) as u64;
    }
    if let Some(v) = value
        .get("reconnect_base_ms")
        .and_then(toml::Value::as_integer)
    {
        settings.reconnect_base_ms = v.max(1) as u64;
    }
    if let Some(v) = value
        .get("reconnect_cap_ms")
        .and_then(toml::Value::as_integer)
    {
        settings.reconnect_cap_ms = v.max(1) as u64;
    }
    if let Some(v) = value
        .get("directory_refresh_delay_ms")
        .and_then(toml::Value::as_integer)
    {
        settings.directory_refresh_delay_ms = v.max(0) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_backend() {
        let settings = Settings::default();
        assert_eq!(settings.api_base_url, "http://localhost:8000/api/v1");
        assert_eq!(settings.socket_url, "ws://localhost:8000/ws/");
        assert_eq!(settings.reconnect_cap_ms, 30_000);
    }

    #[test]
    fn toml_overrides_known_keys_and_ignores_garbage() {
        let mut settings = Settings::default();
        apply_toml(
            &mut settings,
            r#"
            api_base_url = "https://art.example/api/v1"
            socket_url = "wss://art.example/ws/"
            heartbeat_seconds = 10
            unknown_key = true
            "#,
        );
        assert_eq!(settings.api_base_url, "https://art.example/api/v1");
        assert_eq!(settings.socket_url, "wss://art.example/ws/");
        assert_eq!(settings.heartbeat_seconds, 10);

        // A file that does not parse leaves the settings untouched.
        apply_toml(&mut settings, "not [valid toml");
        assert_eq!(settings.heartbeat_seconds, 10);
    }
}
