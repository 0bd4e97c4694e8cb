use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

const MAX_REJECT_MESSAGE_BYTES: usize = 512;

/// Failure of a single call to a worker's control API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlError {
    /// Nothing answered: connection refused, timeout, reset.
    #[error("instance on port {port} unreachable: {reason}")]
    Unreachable { port: u16, reason: String },
    /// The worker answered with a non-success status.
    #[error("instance on port {port} rejected request (HTTP {status}): {message}")]
    Rejected {
        port: u16,
        status: u16,
        message: String,
    },
    /// The worker answered 2xx with a body we could not read.
    #[error("instance on port {port} sent an unreadable response: {reason}")]
    Decode { port: u16, reason: String },
}

impl ControlError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ControlError::Unreachable { .. })
    }
}

/// `GET /status` body.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerStatus {
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct QrReply {
    #[serde(default)]
    status: bool,
    #[serde(default, rename = "qrCode")]
    qr_code: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessageBody<'a> {
    number: &'a str,
    message: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMediaBody<'a> {
    number: &'a str,
    media_url: &'a str,
    caption: &'a str,
}

#[derive(Debug, Deserialize)]
struct RejectBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…(truncated)", &s[..end])
}

/// HTTP client for the per-worker control API at `http://127.0.0.1:<port>/`.
///
/// Every call is bounded by a timeout and never retried; callers decide
/// whether an unreachable worker is a hard failure or should be masked.
#[derive(Debug, Clone)]
pub struct ControlClient {
    http: reqwest::Client,
    host: String,
    status_timeout: Duration,
    send_timeout: Duration,
}

impl ControlClient {
    pub fn new(status_timeout: Duration, send_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(status_timeout)
            .build()
            .context("build control http client")?;
        Ok(Self {
            http,
            host: "127.0.0.1".to_string(),
            status_timeout,
            send_timeout,
        })
    }

    fn url(&self, port: u16, path: &str) -> String {
        format!("http://{}:{port}{path}", self.host)
    }

    pub async fn status(&self, port: u16) -> Result<WorkerStatus, ControlError> {
        self.get_json(port, "/status").await
    }

    /// `Ok(None)` when the worker has no QR pending.
    pub async fn qr(&self, port: u16) -> Result<Option<String>, ControlError> {
        let reply: QrReply = self.get_json(port, "/qr").await?;
        Ok(reply
            .qr_code
            .filter(|q| reply.status && !q.trim().is_empty()))
    }

    pub async fn send_message(
        &self,
        port: u16,
        number: &str,
        message: &str,
    ) -> Result<(), ControlError> {
        self.post_json(port, "/send-message", &SendMessageBody { number, message })
            .await
    }

    pub async fn send_media(
        &self,
        port: u16,
        number: &str,
        media_url: &str,
        caption: &str,
    ) -> Result<(), ControlError> {
        self.post_json(
            port,
            "/send-media",
            &SendMediaBody {
                number,
                media_url,
                caption,
            },
        )
        .await
    }

    async fn get_json<T: DeserializeOwned>(&self, port: u16, path: &str) -> Result<T, ControlError> {
        let resp = self
            .http
            .get(self.url(port, path))
            .timeout(self.status_timeout)
            .send()
            .await
            .map_err(|e| unreachable(port, e))?;
        let resp = check_status(port, resp).await?;
        resp.json::<T>().await.map_err(|e| ControlError::Decode {
            port,
            reason: e.to_string(),
        })
    }

    async fn post_json<B: Serialize>(
        &self,
        port: u16,
        path: &str,
        body: &B,
    ) -> Result<(), ControlError> {
        let resp = self
            .http
            .post(self.url(port, path))
            .timeout(self.send_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| unreachable(port, e))?;
        check_status(port, resp).await.map(|_| ())
    }
}

fn unreachable(port: u16, err: reqwest::Error) -> ControlError {
    let reason = if err.is_timeout() {
        "timed out".to_string()
    } else if err.is_connect() {
        "connection refused".to_string()
    } else {
        err.to_string()
    };
    ControlError::Unreachable { port, reason }
}

async fn check_status(
    port: u16,
    resp: reqwest::Response,
) -> Result<reqwest::Response, ControlError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<RejectBody>(&text)
        .ok()
        .and_then(|b| b.message.or(b.error))
        .unwrap_or(text);
    Err(ControlError::Rejected {
        port,
        status: status.as_u16(),
        message: truncate_utf8(message.trim(), MAX_REJECT_MESSAGE_BYTES),
    })
}
