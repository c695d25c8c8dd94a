//! Shared application state.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers and background jobs via `Arc`. It holds the Postgres
//! pool, the coordination store, the LNS client, the webhook spool, the
//! configuration, and the process counters — never per-request state.

use std::sync::Arc;

use sqlx::PgPool;

use parklane_coord::CoordStore;
use parklane_core::spool::Spool;

use crate::config::ServerConfig;
use crate::lns::LnsClient;
use crate::metrics::Metrics;

/// Shared application state passed to all HTTP handlers and jobs.
pub struct AppState {
    /// Source of truth.
    pub pool: PgPool,
    /// Short-lived coordination state (nonces, locks, buckets, caches).
    pub coord: Arc<dyn CoordStore>,
    /// Outbound LoRaWAN network server client.
    pub lns: Arc<dyn LnsClient>,
    /// On-disk webhook spool.
    pub spool: Spool,
    /// Immutable configuration.
    pub config: ServerConfig,
    /// Process counters for `/metrics`.
    pub metrics: Metrics,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
