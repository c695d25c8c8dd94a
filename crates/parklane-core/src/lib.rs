//! Core domain logic for the Parklane control plane.
//!
//! Everything in this crate is independent of the durable store: it can be
//! exercised with plain values in unit tests. The server crate wires these
//! pieces to Postgres, the coordination store, and the LoRaWAN network
//! server.
//!
//! Subsystems:
//!
//! - [`eui`] — the 64-bit LoRaWAN device identifier
//! - [`signature`] — webhook HMAC verification with replay-window checks
//! - [`decode`] — per-device-type uplink decoders
//! - [`encode`] — display payload encoding and downlink content hashes
//! - [`policy`] — per-tenant display colors and thresholds
//! - [`debounce`] — sensor hysteresis
//! - [`statemachine`] — the priority-ordered display state machine
//! - [`auth`] — principals, roles, scopes, tokens, password hashing
//! - [`spool`] — the on-disk webhook spool

pub mod auth;
pub mod debounce;
pub mod decode;
pub mod encode;
pub mod error;
pub mod eui;
pub mod policy;
pub mod signature;
pub mod spool;
pub mod statemachine;

pub use error::{AuthError, DecodeError, SignatureError, SpoolError};
pub use eui::Eui;
