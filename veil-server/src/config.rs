use std::path::PathBuf;

pub const DEFAULT_ADDR: &str = "0.0.0.0:9001";
pub const DEFAULT_DATABASE_PATH: &str = "veil.db";

/// Relay server settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub database_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            addr: lookup("VEIL_SERVER_ADDR").unwrap_or(defaults.addr),
            database_path: lookup("VEIL_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        let config = ServerConfig::from_lookup(|_| None);
        assert_eq!(config.addr, "0.0.0.0:9001");
        assert_eq!(config.database_path, PathBuf::from("veil.db"));
    }

    #[test]
    fn reads_overrides() {
        let config = ServerConfig::from_lookup(|key| match key {
            "VEIL_SERVER_ADDR" => Some("127.0.0.1:4000".to_string()),
            "VEIL_DATABASE_PATH" => Some("/tmp/veil-test.db".to_string()),
            _ => None,
        });
        assert_eq!(config.addr, "127.0.0.1:4000");
        assert_eq!(config.database_path, PathBuf::from("/tmp/veil-test.db"));
    }
}
