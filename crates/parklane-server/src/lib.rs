//! Parklane HTTP control plane.
//!
//! Binds the domain logic in `parklane-core` to Postgres, the
//! coordination store, and the LoRaWAN network server, and exposes the
//! HTTP surface: webhook ingest, auth, reservations, space actuation,
//! orphan management, health, and metrics.

pub mod audit;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod evaluator;
pub mod ingest;
pub mod jobs;
pub mod lns;
pub mod metrics;
pub mod models;
pub mod repository;
pub mod routes;
pub mod state;
