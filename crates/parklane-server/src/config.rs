//! Server configuration.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `PARKLANE_*` environment variables;
//! `PORT`, `DATABASE_URL`, and `REDIS_URL` follow platform conventions.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Rate limit settings: a refill rate and a burst, per bucket kind.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    /// Webhook uplinks per second per tenant.
    pub ingest_per_tenant: f64,
    pub ingest_per_tenant_burst: f64,
    /// Webhook uplinks per second per source IP.
    pub ingest_per_ip: f64,
    pub ingest_per_ip_burst: f64,
    /// Distinct orphan EUIs per minute per source IP.
    pub orphan_euis_per_minute: f64,
    /// Downlink dispatches per second per gateway.
    pub dispatch_per_gateway: f64,
    /// Downlink dispatches per second per tenant.
    pub dispatch_per_tenant: f64,
    /// Reservation creates per second per tenant.
    pub reservations_per_tenant: f64,
    pub reservations_per_tenant_burst: f64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            ingest_per_tenant: 50.0,
            ingest_per_tenant_burst: 200.0,
            ingest_per_ip: 100.0,
            ingest_per_ip_burst: 400.0,
            orphan_euis_per_minute: 10.0,
            dispatch_per_gateway: 30.0,
            dispatch_per_tenant: 100.0,
            reservations_per_tenant: 5.0,
            reservations_per_tenant_burst: 20.0,
        }
    }
}

/// Retention windows for append-only data, in days.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub sensor_readings_days: i64,
    pub state_changes_days: i64,
    pub orphan_inactive_days: i64,
    pub refresh_tokens_grace_days: i64,
    pub audit_days: i64,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            sensor_readings_days: 30,
            state_changes_days: 90,
            orphan_inactive_days: 30,
            refresh_tokens_grace_days: 7,
            audit_days: 365,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Postgres connection string.
    pub database_url: String,
    /// Maximum Postgres pool connections.
    pub db_max_connections: u32,
    /// Redis URL; `None` selects the in-memory coordination store.
    pub redis_url: Option<String>,
    /// Log level filter (e.g. `info`, `debug`).
    pub log_level: String,
    /// HMAC signing secret for access tokens.
    pub token_secret: String,
    /// Access token lifetime in seconds.
    pub access_token_ttl_secs: i64,
    /// Refresh token lifetime in days.
    pub refresh_token_ttl_days: i64,
    /// Maximum webhook timestamp skew in seconds.
    pub webhook_replay_window_secs: i64,
    /// Stuck-downlink detection timeout in seconds.
    pub downlink_monitor_timeout_secs: i64,
    /// Per-attempt downlink deferral schedule in seconds.
    pub downlink_retry_backoff_secs: Vec<i64>,
    /// Terminal downlink attempt budget.
    pub downlink_max_attempts: i32,
    /// LNS base URL.
    pub lns_base_url: String,
    /// LNS bearer token.
    pub lns_api_token: String,
    /// Root of the on-disk webhook spool.
    pub spool_dir: PathBuf,
    /// Number of trusted reverse proxies in front of the server.
    ///
    /// With 0 (the default), `X-Forwarded-For` is ignored entirely and
    /// the socket peer is the client address — anything else would let
    /// callers mint themselves fresh rate-limit buckets per request.
    pub trusted_proxy_hops: usize,
    /// Rate limit settings.
    pub rate_limits: RateLimits,
    /// Retention windows.
    pub retention: Retention,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT` — port to bind on (binds `0.0.0.0`)
    /// - `PARKLANE_BIND_ADDR` — full bind address (overrides `PORT`, default `127.0.0.1:8080`)
    /// - `DATABASE_URL` — Postgres connection string (required)
    /// - `PARKLANE_DB_MAX_CONNECTIONS` — pool size (default `10`)
    /// - `REDIS_URL` — Redis connection string (optional; in-memory store if unset)
    /// - `PARKLANE_LOG_LEVEL` — log filter (default `info`)
    /// - `PARKLANE_TOKEN_SECRET` — access-token signing secret (required in production)
    /// - `PARKLANE_ACCESS_TOKEN_TTL` — seconds (default `900`)
    /// - `PARKLANE_REFRESH_TOKEN_TTL_DAYS` — days (default `30`)
    /// - `PARKLANE_WEBHOOK_REPLAY_WINDOW` — seconds (default `300`)
    /// - `PARKLANE_DOWNLINK_MONITOR_TIMEOUT` — seconds (default `15`)
    /// - `PARKLANE_DOWNLINK_MAX_ATTEMPTS` — default `5`
    /// - `PARKLANE_LNS_URL` / `PARKLANE_LNS_TOKEN` — LNS endpoint and bearer
    /// - `PARKLANE_SPOOL_DIR` — spool root (default `./spool`)
    /// - `PARKLANE_TRUSTED_PROXY_HOPS` — reverse proxies in front (default `0`)
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = if let Ok(addr) = std::env::var("PARKLANE_BIND_ADDR") {
            addr.parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8080)))
        } else if let Ok(port_str) = std::env::var("PORT") {
            let port: u16 = port_str.parse().unwrap_or(8080);
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 8080))
        };

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is required"))?;

        let token_secret = std::env::var("PARKLANE_TOKEN_SECRET").unwrap_or_else(|_| {
            tracing::warn!("PARKLANE_TOKEN_SECRET unset — using an ephemeral secret, sessions will not survive restart");
            uuid::Uuid::new_v4().as_simple().to_string()
        });

        let downlink_retry_backoff_secs = std::env::var("PARKLANE_DOWNLINK_RETRY_BACKOFF")
            .ok()
            .map(|v| {
                v.split(',')
                    .filter_map(|s| s.trim().parse().ok())
                    .collect::<Vec<i64>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| vec![30, 60, 120]);

        Ok(Self {
            bind_addr,
            database_url,
            db_max_connections: env_parse("PARKLANE_DB_MAX_CONNECTIONS", 10),
            redis_url: std::env::var("REDIS_URL").ok(),
            log_level: std::env::var("PARKLANE_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()),
            token_secret,
            access_token_ttl_secs: env_parse("PARKLANE_ACCESS_TOKEN_TTL", 900),
            refresh_token_ttl_days: env_parse("PARKLANE_REFRESH_TOKEN_TTL_DAYS", 30),
            webhook_replay_window_secs: env_parse("PARKLANE_WEBHOOK_REPLAY_WINDOW", 300),
            downlink_monitor_timeout_secs: env_parse("PARKLANE_DOWNLINK_MONITOR_TIMEOUT", 15),
            downlink_retry_backoff_secs,
            downlink_max_attempts: env_parse("PARKLANE_DOWNLINK_MAX_ATTEMPTS", 5),
            lns_base_url: std::env::var("PARKLANE_LNS_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8090".to_owned()),
            lns_api_token: std::env::var("PARKLANE_LNS_TOKEN").unwrap_or_default(),
            spool_dir: std::env::var("PARKLANE_SPOOL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./spool")),
            trusted_proxy_hops: env_parse("PARKLANE_TRUSTED_PROXY_HOPS", 0),
            rate_limits: RateLimits::default(),
            retention: Retention::default(),
        })
    }

    /// Deferral for a downlink with no reachable gateway, by attempt number.
    #[must_use]
    pub fn downlink_backoff(&self, attempt: i32) -> i64 {
        let idx = usize::try_from(attempt.max(0)).unwrap_or(0);
        self.downlink_retry_backoff_secs
            .get(idx)
            .or_else(|| self.downlink_retry_backoff_secs.last())
            .copied()
            .unwrap_or(120)
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_follows_attempts_and_caps() {
        let config = ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            database_url: String::new(),
            db_max_connections: 10,
            redis_url: None,
            log_level: "info".to_owned(),
            token_secret: "s".to_owned(),
            access_token_ttl_secs: 900,
            refresh_token_ttl_days: 30,
            webhook_replay_window_secs: 300,
            downlink_monitor_timeout_secs: 15,
            downlink_retry_backoff_secs: vec![30, 60, 120],
            downlink_max_attempts: 5,
            lns_base_url: String::new(),
            lns_api_token: String::new(),
            spool_dir: PathBuf::from("./spool"),
            trusted_proxy_hops: 0,
            rate_limits: RateLimits::default(),
            retention: Retention::default(),
        };
        assert_eq!(config.downlink_backoff(0), 30);
        assert_eq!(config.downlink_backoff(1), 60);
        assert_eq!(config.downlink_backoff(2), 120);
        assert_eq!(config.downlink_backoff(3), 120);
        assert_eq!(config.downlink_backoff(-1), 30);
    }
}
