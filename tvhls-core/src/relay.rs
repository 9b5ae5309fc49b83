use std::pin::Pin;

use axum::body::Bytes;
use futures::{Stream, TryStreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::RelaySection;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid upstream url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("upstream {url} unreachable: {source}")]
    Unreachable {
        url: String,
        source: reqwest::Error,
    },
    #[error("upstream {url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + 'static>>;

/// An open upstream response, ready to be piped to a local consumer.
pub struct RelayStream {
    pub content_type: String,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStream")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish()
    }
}

/// Re-streams upstream HTTP resources so the transcoder only ever reads a
/// plain loopback URL.
#[derive(Debug, Clone)]
pub struct UpstreamRelay {
    client: Client,
    base_url: String,
}

impl UpstreamRelay {
    pub fn new(config: &RelaySection, base_url: impl Into<String>) -> Result<Self, RelayError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .tcp_nodelay(true)
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    /// Loopback address of the relay route for `upstream`.
    pub fn local_url(&self, upstream: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("url", upstream)
            .finish();
        format!("{}/proxy?{}", self.base_url, query)
    }

    pub async fn open(&self, upstream: &str) -> Result<RelayStream, RelayError> {
        let target = parse_upstream(upstream)?;
        let response = self
            .client
            .get(target)
            .send()
            .await
            .map_err(|source| {
                warn!(url = upstream, error = %source, "relay upstream unreachable");
                RelayError::Unreachable {
                    url: upstream.to_string(),
                    source,
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = upstream, status = status.as_u16(), "relay upstream rejected request");
            return Err(RelayError::Status {
                url: upstream.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let content_length = response.content_length();
        debug!(url = upstream, content_type = %content_type, "relay stream opened");

        let url = upstream.to_string();
        let body = response.bytes_stream().map_err(move |error| {
            warn!(url = %url, %error, "relay upstream disconnected mid-stream");
            std::io::Error::other(error)
        });
        Ok(RelayStream {
            content_type,
            content_length,
            body: Box::pin(body),
        })
    }
}

fn parse_upstream(upstream: &str) -> Result<Url, RelayError> {
    let url = Url::parse(upstream).map_err(|err| RelayError::InvalidUrl {
        url: upstream.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(RelayError::InvalidUrl {
            url: upstream.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_url_encodes_upstream() {
        let relay = UpstreamRelay::with_client(Client::new(), "http://127.0.0.1:3000/");
        assert_eq!(
            relay.local_url("http://x/123.ts?a=1&b=2"),
            "http://127.0.0.1:3000/proxy?url=http%3A%2F%2Fx%2F123.ts%3Fa%3D1%26b%3D2"
        );
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(matches!(
            parse_upstream("file:///etc/passwd"),
            Err(RelayError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_upstream("not a url"),
            Err(RelayError::InvalidUrl { .. })
        ));
        assert!(parse_upstream("https://x/1.ts").is_ok());
    }
}
