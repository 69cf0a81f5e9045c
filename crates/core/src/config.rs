use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Process configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    /// Coordination store DSN. Absent means single-node: the in-memory
    /// coordination backend is used and cross-instance mirroring is off.
    pub coord_url: Option<String>,
    pub auth: AuthConfig,
    pub frontend_url: Option<String>,
    pub providers: ProviderDefaults,
    pub storage_path: PathBuf,
    pub port: u16,
    pub ingest: WorkerPoolConfig,
    pub outbound: WorkerPoolConfig,
    pub provider_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HMAC key for session tokens.
    pub secret: String,
    pub base_url: Option<String>,
}

/// Fallback webhook HMAC secrets used when a channel has no `app_secret` of
/// its own.
#[derive(Debug, Clone, Default)]
pub struct ProviderDefaults {
    pub whatsapp_secret: Option<String>,
    pub messenger_secret: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub queue_depth: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary lookup so tests do not touch process env.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = match get("DATABASE_URL") {
            Some(v) if !v.is_empty() => v,
            _ => bail!("DATABASE_URL is required"),
        };
        let auth_secret = match get("AUTH_SECRET") {
            Some(v) if !v.is_empty() => v,
            _ => bail!("AUTH_SECRET is required"),
        };

        let port = match get("PORT") {
            Some(v) => v.parse::<u16>().context("PORT must be a port number")?,
            None => 3000,
        };

        let storage_path = get("STORAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./storage"));

        Ok(Self {
            database_url,
            coord_url: get("COORD_URL").filter(|v| !v.is_empty()),
            auth: AuthConfig {
                secret: auth_secret,
                base_url: get("AUTH_URL").filter(|v| !v.is_empty()),
            },
            frontend_url: get("FRONTEND_URL").filter(|v| !v.is_empty()),
            providers: ProviderDefaults {
                whatsapp_secret: get("PROVIDER_A_SECRET").filter(|v| !v.is_empty()),
                messenger_secret: get("PROVIDER_B_SECRET").filter(|v| !v.is_empty()),
            },
            storage_path,
            port,
            ingest: WorkerPoolConfig {
                workers: 16,
                queue_depth: 1024,
                max_attempts: 3,
                backoff_base: Duration::from_secs(1),
            },
            outbound: WorkerPoolConfig {
                workers: 16,
                queue_depth: 1024,
                max_attempts: 3,
                backoff_base: Duration::from_secs(2),
            },
            provider_timeout: Duration::from_secs(30),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn minimal_env_fills_defaults() {
        let vars = env(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("AUTH_SECRET", "s3cret"),
        ]);
        let cfg = AppConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();

        assert_eq!(cfg.port, 3000);
        assert!(cfg.coord_url.is_none());
        assert_eq!(cfg.ingest.workers, 16);
        assert_eq!(cfg.ingest.backoff_base, Duration::from_secs(1));
        assert_eq!(cfg.outbound.backoff_base, Duration::from_secs(2));
        assert_eq!(cfg.provider_timeout, Duration::from_secs(30));
    }

    #[test]
    fn missing_database_url_is_rejected() {
        let vars = env(&[("AUTH_SECRET", "s3cret")]);
        assert!(AppConfig::from_lookup(|k| vars.get(k).cloned()).is_err());
    }

    #[test]
    fn full_env_is_carried_through() {
        let vars = env(&[
            ("DATABASE_URL", "sqlite://inbox.db"),
            ("COORD_URL", "redis://127.0.0.1:6379"),
            ("AUTH_SECRET", "s3cret"),
            ("AUTH_URL", "https://auth.example.com"),
            ("FRONTEND_URL", "https://console.example.com"),
            ("PROVIDER_A_SECRET", "wa-secret"),
            ("PROVIDER_B_SECRET", "fb-secret"),
            ("STORAGE_PATH", "/var/lib/relaydesk"),
            ("PORT", "8080"),
        ]);
        let cfg = AppConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();

        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.coord_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(cfg.providers.whatsapp_secret.as_deref(), Some("wa-secret"));
        assert_eq!(cfg.providers.messenger_secret.as_deref(), Some("fb-secret"));
        assert_eq!(cfg.storage_path, PathBuf::from("/var/lib/relaydesk"));
        assert_eq!(cfg.frontend_url.as_deref(), Some("https://console.example.com"));
    }

    #[test]
    fn bad_port_is_rejected() {
        let vars = env(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("AUTH_SECRET", "s3cret"),
            ("PORT", "not-a-port"),
        ]);
        assert!(AppConfig::from_lookup(|k| vars.get(k).cloned()).is_err());
    }
}
