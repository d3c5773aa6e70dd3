use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// When unset the broker runs on the in-memory store.
    pub redis_url: Option<String>,
    pub auth_secret: String,
    pub auth_bypass: bool,
    /// Default lifetime of an instant session when the request does not
    /// supply one.
    pub instant_ttl_seconds: u64,
    /// Hard ceiling on request-supplied instant TTLs.
    pub max_instant_ttl_seconds: u64,
    /// How long an expired record stays readable before the reaper deletes
    /// it.
    pub expired_grace_seconds: u64,
    /// How long an ended record stays readable before deletion.
    pub ended_retention_seconds: u64,
    /// Retention hint stamped onto audit events for the downstream sink.
    pub audit_retention_days: u64,
    pub reap_interval_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("SKYLIGHT_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            auth_secret: env::var("SKYLIGHT_AUTH_SECRET")
                .unwrap_or_else(|_| "change-me-in-production".to_string()),
            auth_bypass: env::var("SKYLIGHT_AUTH_BYPASS")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            instant_ttl_seconds: env::var("SKYLIGHT_INSTANT_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(600), // 10 minutes
            max_instant_ttl_seconds: env::var("SKYLIGHT_MAX_INSTANT_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(3_600),
            expired_grace_seconds: env::var("SKYLIGHT_EXPIRED_GRACE")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(300),
            ended_retention_seconds: env::var("SKYLIGHT_ENDED_RETENTION")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(3_600),
            audit_retention_days: env::var("SKYLIGHT_AUDIT_RETENTION_DAYS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(90),
            reap_interval_seconds: env::var("SKYLIGHT_REAP_INTERVAL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(30),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: None,
            auth_secret: "change-me-in-production".to_string(),
            auth_bypass: false,
            instant_ttl_seconds: 600,
            max_instant_ttl_seconds: 3_600,
            expired_grace_seconds: 300,
            ended_retention_seconds: 3_600,
            audit_retention_days: 90,
            reap_interval_seconds: 30,
        }
    }
}
