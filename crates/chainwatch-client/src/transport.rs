//! How watch requests reach the server.

use crate::error::ClientError;
use async_trait::async_trait;
use chainwatch_types::{Envelope, WatchError, WatchEventOptions, WatchResp, WATCH_PATH};
use std::time::Duration;

/// Sends one watch request and returns the interpreted response.
#[async_trait]
pub trait WatchTransport: Send + Sync {
    /// Issues `opts` and waits for the answer.
    async fn watch(&self, opts: &WatchEventOptions) -> Result<WatchResp, ClientError>;
}

/// [`WatchTransport`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    /// Builds a transport for the server at `base_url`.
    ///
    /// `timeout` bounds each request and must exceed the server's hold
    /// time, or every caught-up poll ends in a transport error.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Transport` when the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("chainwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), WATCH_PATH),
        })
    }

    /// Full URL of the watch endpoint.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl WatchTransport for HttpTransport {
    async fn watch(&self, opts: &WatchEventOptions) -> Result<WatchResp, ClientError> {
        let resp = self.client.post(&self.url).json(opts).send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;

        match serde_json::from_slice::<Envelope<WatchResp>>(&body) {
            Ok(envelope) => interpret(envelope),
            Err(_) if !status.is_success() => Err(ClientError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            }),
            Err(e) => Err(ClientError::Decode(e.to_string())),
        }
    }
}

/// Turns an envelope into the watch payload or a typed error.
///
/// # Errors
///
/// Returns the error named by the envelope's code, or
/// `ClientError::Decode` for a successful envelope without data.
pub fn interpret(envelope: Envelope<WatchResp>) -> Result<WatchResp, ClientError> {
    if !envelope.result {
        return Err(match WatchError::from_code(envelope.code, envelope.message.clone()) {
            Some(e) => e.into(),
            None => ClientError::Business {
                code: envelope.code,
                message: envelope.message,
            },
        });
    }
    envelope
        .data
        .ok_or_else(|| ClientError::Decode("successful response carries no data".to_string()))
}
