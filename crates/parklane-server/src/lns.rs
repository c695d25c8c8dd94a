//! LoRaWAN network server client.
//!
//! The dispatcher and reconciliation sweep talk to the LNS through the
//! [`LnsClient`] trait, so neither needs to know the concrete transport.
//! The production implementation is a thin bearer-authenticated HTTP
//! client. Authentication is configured out of band.

use base64::Engine as _;
use parklane_core::Eui;
use serde::{Deserialize, Serialize};

/// Errors from LNS calls.
#[derive(Debug, thiserror::Error)]
pub enum LnsError {
    /// The LNS could not be reached.
    #[error("lns transport: {0}")]
    Transport(String),

    /// The LNS answered with a non-success status.
    #[error("lns rejected request: status {status}")]
    Rejected { status: u16 },

    /// The LNS answered with an unparseable body.
    #[error("lns response decode: {0}")]
    Decode(String),
}

/// An item sitting in a device's LNS downlink queue.
#[derive(Debug, Clone, Deserialize)]
pub struct LnsQueueItem {
    /// LNS-assigned downlink frame counter.
    pub fcnt: i64,
    pub port: u16,
    /// Base64 payload as the LNS stores it.
    pub payload: String,
}

/// Outbound operations toward the LNS.
#[async_trait::async_trait]
pub trait LnsClient: Send + Sync + 'static {
    /// Enqueue a Class-C downlink. Returns the LNS downlink frame counter.
    async fn enqueue_downlink(
        &self,
        eui: Eui,
        port: u16,
        payload: &[u8],
        confirmed: bool,
    ) -> Result<i64, LnsError>;

    /// Flush the device's entire LNS queue.
    async fn flush_queue(&self, eui: Eui) -> Result<(), LnsError>;

    /// List the device's LNS queue.
    async fn list_queue(&self, eui: Eui) -> Result<Vec<LnsQueueItem>, LnsError>;
}

#[derive(Debug, Serialize)]
struct EnqueueRequest<'a> {
    port: u16,
    payload: &'a str,
    confirmed: bool,
}

#[derive(Debug, Deserialize)]
struct EnqueueResponse {
    fcnt: i64,
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    #[serde(default)]
    items: Vec<LnsQueueItem>,
}

/// HTTP implementation of [`LnsClient`].
#[derive(Debug, Clone)]
pub struct HttpLnsClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpLnsClient {
    /// Build a client for `base_url` using `token` as bearer.
    pub fn new(base_url: &str, token: &str) -> Result<Self, LnsError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| LnsError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            token: token.to_owned(),
        })
    }

    fn queue_url(&self, eui: Eui) -> String {
        format!("{}/api/devices/{eui}/queue", self.base_url)
    }
}

#[async_trait::async_trait]
impl LnsClient for HttpLnsClient {
    async fn enqueue_downlink(
        &self,
        eui: Eui,
        port: u16,
        payload: &[u8],
        confirmed: bool,
    ) -> Result<i64, LnsError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(payload);
        let response = self
            .client
            .post(self.queue_url(eui))
            .bearer_auth(&self.token)
            .json(&EnqueueRequest {
                port,
                payload: &encoded,
                confirmed,
            })
            .send()
            .await
            .map_err(|e| LnsError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LnsError::Rejected {
                status: response.status().as_u16(),
            });
        }

        let body: EnqueueResponse = response
            .json()
            .await
            .map_err(|e| LnsError::Decode(e.to_string()))?;
        Ok(body.fcnt)
    }

    async fn flush_queue(&self, eui: Eui) -> Result<(), LnsError> {
        let response = self
            .client
            .delete(self.queue_url(eui))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| LnsError::Transport(e.to_string()))?;

        if response.status().is_success() || response.status().as_u16() == 404 {
            Ok(())
        } else {
            Err(LnsError::Rejected {
                status: response.status().as_u16(),
            })
        }
    }

    async fn list_queue(&self, eui: Eui) -> Result<Vec<LnsQueueItem>, LnsError> {
        let response = self
            .client
            .get(self.queue_url(eui))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| LnsError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LnsError::Rejected {
                status: response.status().as_u16(),
            });
        }

        let body: QueueResponse = response
            .json()
            .await
            .map_err(|e| LnsError::Decode(e.to_string()))?;
        Ok(body.items)
    }
}
