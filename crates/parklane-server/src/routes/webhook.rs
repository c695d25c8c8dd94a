//! Webhook ingress.
//!
//! The uplink endpoint is authenticated by HMAC signature, not by the
//! bearer middleware — the LNS is not a platform principal. Every
//! recoverable outcome maps to a 2xx with a status flag so the LNS does
//! not retry what was already absorbed.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

use crate::error::ApiError;
use crate::ingest::{self, IngestOutcome, RawWebhook};
use crate::state::AppState;

/// Build the webhook router (public).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook/uplink", post(uplink))
        .route("/webhook/{tenant_slug}/uplink", post(uplink_for_tenant))
}

/// Response body for absorbed uplinks.
#[derive(Debug, Serialize)]
struct UplinkResponse {
    status: &'static str,
}

/// `POST /webhook/uplink` — uplink with tenant inferred from the EUI.
async fn uplink(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<UplinkResponse>), ApiError> {
    handle(state, None, &headers, peer, body).await
}

/// `POST /webhook/{tenant_slug}/uplink` — uplink on a per-tenant URL.
async fn uplink_for_tenant(
    State(state): State<Arc<AppState>>,
    Path(tenant_slug): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<UplinkResponse>), ApiError> {
    handle(state, Some(tenant_slug), &headers, peer, body).await
}

async fn handle(
    state: Arc<AppState>,
    tenant_slug: Option<String>,
    headers: &HeaderMap,
    peer: SocketAddr,
    body: Bytes,
) -> Result<(StatusCode, Json<UplinkResponse>), ApiError> {
    let raw = RawWebhook {
        tenant_slug,
        headers: signature_headers(headers),
        body: body.to_vec(),
        remote_ip: Some(client_ip(headers, peer, state.config.trusted_proxy_hops)),
    };

    let outcome = ingest::ingest_or_spool(&state, raw).await?;
    let (status, flag) = match outcome {
        IngestOutcome::Accepted => (StatusCode::OK, "accepted"),
        IngestOutcome::Duplicate => (StatusCode::OK, "duplicate"),
        IngestOutcome::Orphan => (StatusCode::OK, "orphan"),
        IngestOutcome::Spooled => (StatusCode::ACCEPTED, "spooled"),
    };
    Ok((status, Json(UplinkResponse { status: flag })))
}

/// Keep only the headers the pipeline (and a later spool replay) needs.
fn signature_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-parklane-"))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), v.to_owned()))
        })
        .collect()
}

/// Resolve the client address the rate limiter may trust.
///
/// `X-Forwarded-For` is attacker-controlled unless appended by our own
/// reverse proxies, so it is only consulted when `trusted_hops > 0`,
/// and then only at the depth those proxies appended: with N trusted
/// hops the client is the Nth entry from the right. Anything shallower
/// was written by the caller and would mint a fresh rate-limit bucket
/// per request. With no trusted proxies, the socket peer is the client.
fn client_ip(headers: &HeaderMap, peer: SocketAddr, trusted_hops: usize) -> String {
    if trusted_hops == 0 {
        return peer.ip().to_string();
    }
    let forwarded: Vec<&str> = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    forwarded
        .len()
        .checked_sub(trusted_hops)
        .and_then(|index| forwarded.get(index))
        .map_or_else(|| peer.ip().to_string(), |ip| (*ip).to_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn signature_headers_filters_and_lowercases() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Parklane-Signature", HeaderValue::from_static("abc"));
        headers.insert("X-Parklane-Nonce", HeaderValue::from_static("n1"));
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));

        let map = signature_headers(&headers);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("x-parklane-signature").unwrap(), "abc");
        assert_eq!(map.get("x-parklane-nonce").unwrap(), "n1");
    }

    #[test]
    fn client_ip_ignores_forwarded_header_without_trusted_proxies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let peer: SocketAddr = "10.1.2.3:9000".parse().unwrap();
        // Directly exposed: the header is caller-controlled, use the peer.
        assert_eq!(client_ip(&headers, peer, 0), "10.1.2.3");
    }

    #[test]
    fn client_ip_reads_at_trusted_depth() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("6.6.6.6, 203.0.113.9, 10.0.0.1"),
        );
        let peer: SocketAddr = "10.1.2.3:9000".parse().unwrap();
        // Two proxies of ours appended the last two entries; the
        // caller-supplied 6.6.6.6 is ignored.
        assert_eq!(client_ip(&headers, peer, 2), "203.0.113.9");
        // One trusted proxy appended only the last entry.
        assert_eq!(client_ip(&headers, peer, 1), "10.0.0.1");
    }

    #[test]
    fn client_ip_falls_back_to_peer_on_short_chain() {
        let peer: SocketAddr = "10.1.2.3:9000".parse().unwrap();
        // Trusted proxies configured but no header (or fewer entries
        // than hops): the peer is the only honest answer.
        assert_eq!(client_ip(&HeaderMap::new(), peer, 1), "10.1.2.3");

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));
        assert_eq!(client_ip(&headers, peer, 2), "10.1.2.3");
    }
}
