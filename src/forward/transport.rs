//! Outbound HTTP delivery.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderValue, InvalidHeaderValue};
use snafu::prelude::*;
use std::error::Error as StdError;
use std::time::Duration;
use tracing::warn;
use url::Url;

use crate::config::ForwardConfig;
use crate::emit;
use crate::error::{InvalidHeaderSnafu, StatusSnafu, TransportError};
use crate::event::Event;
use crate::metrics::events::ForwardRetried;

/// Header carrying the comma-joined IRIs of an event.
pub const IRIS_HEADER: &str = "Podcast-RSS";

/// The `Podcast-RSS` value for comma-joined `iris`.
pub fn iris_header(iris: &str) -> Result<HeaderValue, InvalidHeaderValue> {
    HeaderValue::from_bytes(iris.as_bytes())
}

/// Delivers a parsed event downstream.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver `event`, retrying as configured. Returns the final HTTP status.
    async fn deliver(&self, event: &Event) -> Result<u16, TransportError>;
}

/// POSTs the raw event JSON to `<endpoint>/<reason>`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
    retry_count: u32,
    retry_delay: Duration,
}

impl HttpTransport {
    pub fn new(endpoint: Url, config: &ForwardConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("podrelay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            retry_count: config.retry_count,
            retry_delay: config.retry_delay(),
        })
    }

    /// The endpoint with `reason` appended as one percent-encoded segment.
    pub fn url_for(&self, reason: &str) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(reason);
        }
        url
    }

    async fn attempt(&self, url: &Url, event: &Event) -> Result<u16, TransportError> {
        let iris = iris_header(&event.iris).context(InvalidHeaderSnafu { url: url.as_str() })?;

        let response = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(IRIS_HEADER, iris)
            .body(event.body.clone())
            .send()
            .await
            .map_err(|e| classify(url, e))?;

        let status = response.status();
        ensure!(
            status.is_success(),
            StatusSnafu {
                url: url.as_str(),
                status: status.as_u16(),
            }
        );
        Ok(status.as_u16())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, event: &Event) -> Result<u16, TransportError> {
        let url = self.url_for(&event.reason);
        let mut retries = 0;
        loop {
            match self.attempt(&url, event).await {
                Ok(status) => return Ok(status),
                Err(e) if e.is_retryable() && retries < self.retry_count => {
                    retries += 1;
                    warn!(
                        url = %url,
                        attempt = retries,
                        max_retries = self.retry_count,
                        error = %e,
                        "Forward attempt failed, retrying"
                    );
                    emit!(ForwardRetried);
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn classify(url: &Url, error: reqwest::Error) -> TransportError {
    let url = url.to_string();
    if is_connection_refused(&error) {
        TransportError::ConnectionRefused {
            url,
            source: Box::new(error),
        }
    } else if error.is_timeout() {
        TransportError::Timeout {
            url,
            source: Box::new(error),
        }
    } else {
        TransportError::Request {
            url,
            source: Box::new(error),
        }
    }
}

/// Whether any error in the source chain is an OS connection refusal.
pub fn is_connection_refused(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        if err
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::ConnectionRefused)
        {
            return true;
        }
        current = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(endpoint: &str) -> HttpTransport {
        HttpTransport::new(Url::parse(endpoint).unwrap(), &ForwardConfig::default()).unwrap()
    }

    #[test]
    fn test_reason_is_appended_as_path_segment() {
        let t = transport("http://localhost:3000/podping");
        assert_eq!(
            t.url_for("update").as_str(),
            "http://localhost:3000/podping/update"
        );

        let t = transport("http://localhost:3000/podping/");
        assert_eq!(
            t.url_for("live").as_str(),
            "http://localhost:3000/podping/live"
        );

        let t = transport("http://localhost:3000");
        assert_eq!(t.url_for("unknown").as_str(), "http://localhost:3000/unknown");
    }

    #[test]
    fn test_reason_is_encoded() {
        let t = transport("http://localhost:3000/podping");
        assert_eq!(
            t.url_for("a b/c").as_str(),
            "http://localhost:3000/podping/a%20b%2Fc"
        );
    }

    #[derive(Debug, snafu::Snafu)]
    #[snafu(display("connect failed"))]
    struct Wrapped {
        source: std::io::Error,
    }

    #[test]
    fn test_connection_refused_found_in_source_chain() {
        let nested = Wrapped {
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(is_connection_refused(&nested));

        let other = Wrapped {
            source: std::io::Error::from(std::io::ErrorKind::TimedOut),
        };
        assert!(!is_connection_refused(&other));
    }

    #[tokio::test]
    async fn test_invalid_iris_header_is_not_retried() {
        let config = ForwardConfig {
            retry_count: 3,
            retry_delay_ms: 60_000,
            ..Default::default()
        };
        let t = HttpTransport::new(Url::parse("http://127.0.0.1:1/podping").unwrap(), &config)
            .unwrap();
        let event = Event {
            reason: "update".into(),
            iris: "https://a.example/rss\n".into(),
            body: "{}".into(),
        };

        let err = tokio::time::timeout(Duration::from_secs(5), t.deliver(&event))
            .await
            .expect("delivery must not wait out retry delays")
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidHeader { .. }), "{err}");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_iris_header_rejects_control_characters() {
        assert!(iris_header("https://a.example/rss,https://b.example/feed").is_ok());
        assert!(iris_header("").is_ok());
        assert!(iris_header("https://a.example/\r\nX-Injected: 1").is_err());
        assert!(iris_header("https://a.example/\u{7f}").is_err());
    }
}
