// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::utils::add_ice_url_scheme;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Сколько ждём окончания сбора ICE кандидатов перед выдачей кода
pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_millis(3000);

pub const DEFAULT_CHANNEL_LABEL: &str = "chat";

pub const ENV_ICE_SERVERS: &str = "LANCALL_ICE_SERVERS";
pub const ENV_GATHER_TIMEOUT_MS: &str = "LANCALL_GATHER_TIMEOUT_MS";

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl ServerConfig {
    pub fn stun(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            r#type: "stun".into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    /// URL со схемой протокола
    pub fn normalized_url(&self) -> String {
        add_ice_url_scheme(self)
    }
}

/// Как печатать код сигнализации
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodeEncoding {
    /// gzip + base64, короче и безопасно для копирования
    #[default]
    Compact,
    /// Читаемый JSON
    Json,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub gather_timeout: Duration,
    pub channel_label: String,
    pub encoding: CodeEncoding,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
            channel_label: DEFAULT_CHANNEL_LABEL.into(),
            encoding: CodeEncoding::default(),
        }
    }
}

impl SessionConfig {
    /// Дефолты, поверх которых накладываются переменные окружения
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var(ENV_ICE_SERVERS) {
            let servers: Vec<ServerConfig> = raw
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .enumerate()
                .map(|(i, url)| ServerConfig::stun(format!("env-{i}"), url))
                .collect();
            match validate_servers(&servers) {
                Ok(()) if !servers.is_empty() => config.ice_servers = servers,
                Ok(()) => {}
                Err(reason) => warn!("ignoring {ENV_ICE_SERVERS}: {reason}"),
            }
        }

        if let Ok(raw) = std::env::var(ENV_GATHER_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.gather_timeout = Duration::from_millis(ms),
                Err(e) => warn!("ignoring {ENV_GATHER_TIMEOUT_MS}={raw}: {e}"),
            }
        }

        config
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
}

/// Валидация пользовательских серверов
pub fn validate_servers(servers: &[ServerConfig]) -> Result<(), String> {
    for server in servers {
        if server.url.is_empty() {
            return Err(format!("server {} has an empty URL", server.id));
        }

        if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
            return Err(format!(
                "TURN server {} requires username and credential",
                server.id
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_public_stun() {
        let config = SessionConfig::default();
        assert_eq!(config.gather_timeout, Duration::from_millis(3000));
        assert_eq!(config.channel_label, "chat");
        assert_eq!(config.ice_servers.len(), 2);
        assert!(validate_servers(&config.ice_servers).is_ok());
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let turn = ServerConfig {
            id: "relay".into(),
            r#type: "turn".into(),
            url: "relay.example.org:3478".into(),
            username: Some("user".into()),
            credential: None,
        };
        assert!(validate_servers(&[turn]).is_err());
        assert!(validate_servers(&[ServerConfig::stun("empty", "")]).is_err());
    }
}
