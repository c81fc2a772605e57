//! HTTP push transmitter.
//!
//! POSTs the formatted item to the endpoint named in the destination config:
//!
//! ```json
//! { "url": "https://subscriber.example.com/ingest",
//!   "content_type": "application/json",
//!   "headers": { "X-Api-Key": "..." } }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::QueueItem;
use crate::registry::{TransmitError, Transmitter};

/// Delivery type served by [`HttpPushTransmitter`].
pub const HTTP_PUSH_DELIVERY_TYPE: &str = "http_push";

const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Bytes of a rejection body kept in the item's error message.
const MAX_ERROR_BODY_BYTES: usize = 1024;

/// Cut `body` to at most [`MAX_ERROR_BODY_BYTES`] on a char boundary.
fn truncate_body(body: &str) -> &str {
    if body.len() <= MAX_ERROR_BODY_BYTES {
        return body;
    }
    let mut end = MAX_ERROR_BODY_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[derive(Debug, Deserialize)]
struct HttpPushConfig {
    url: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    headers: std::collections::BTreeMap<String, String>,
}

/// Target of one push, parsed from the destination config.
#[derive(Debug)]
struct Endpoint {
    url: Url,
    content_type: String,
    headers: Vec<(String, String)>,
}

impl Endpoint {
    fn from_item(item: &QueueItem) -> Result<Self, TransmitError> {
        let config: HttpPushConfig = serde_json::from_value(item.destination.config.clone())
            .map_err(|e| {
                TransmitError::InvalidDestination(format!(
                    "{}: {e}",
                    item.destination.name
                ))
            })?;

        let url = Url::parse(&config.url)
            .map_err(|e| TransmitError::InvalidDestination(format!("{}: {e}", config.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransmitError::InvalidDestination(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }

        Ok(Self {
            url,
            content_type: config
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            headers: config.headers.into_iter().collect(),
        })
    }
}

/// Pushes items over HTTP.
#[derive(Clone)]
pub struct HttpPushTransmitter {
    client: Client,
    user_agent: String,
}

impl HttpPushTransmitter {
    /// Create a transmitter with a 30 second request timeout.
    pub fn new(user_agent: impl Into<String>) -> Result<Self, TransmitError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            user_agent: user_agent.into(),
        })
    }
}

#[async_trait]
impl Transmitter for HttpPushTransmitter {
    async fn transmit(&self, item: &QueueItem) -> Result<(), TransmitError> {
        let endpoint = Endpoint::from_item(item)?;

        debug!(
            queue_item_id = %item.id,
            subscriber_id = %item.subscriber_id,
            url = %endpoint.url,
            "Pushing item"
        );

        let mut request = self
            .client
            .post(endpoint.url.clone())
            .header("Content-Type", &endpoint.content_type)
            .header("User-Agent", &self.user_agent)
            .header("X-Courier-Item-Id", &item.item_id)
            .header("X-Courier-Item-Version", item.item_version.to_string());
        for (name, value) in &endpoint.headers {
            request = request.header(name, value);
        }

        let response = request.body(item.formatted_item.clone()).send().await?;
        let status = response.status();

        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            warn!(
                queue_item_id = %item.id,
                url = %endpoint.url,
                status = status.as_u16(),
                "Push rejected"
            );
            Err(TransmitError::Delivery(format!(
                "{status}: {}",
                truncate_body(body.trim())
            )))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use courier_db::test_utils::QueueItemFixture;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn item_for(config: serde_json::Value) -> QueueItem {
        let mut item = QueueItemFixture::pending("q1", "sub", 1).build();
        item.destination.config = config;
        item
    }

    /// Serve one request with `status`, returning the raw request text.
    async fn serve_once(status: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        serve_once_with_body(status, String::new()).await
    }

    async fn serve_once_with_body(
        status: &'static str,
        body: String,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0_u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        (format!("http://{addr}/ingest"), handle)
    }

    #[test]
    fn test_endpoint_defaults() {
        let endpoint =
            Endpoint::from_item(&item_for(json!({ "url": "https://example.com/in" }))).unwrap();

        assert_eq!(endpoint.url.as_str(), "https://example.com/in");
        assert_eq!(endpoint.content_type, "application/json");
        assert!(endpoint.headers.is_empty());
    }

    #[test]
    fn test_endpoint_rejects_missing_url() {
        let result = Endpoint::from_item(&item_for(json!({})));
        assert!(matches!(result, Err(TransmitError::InvalidDestination(_))));
    }

    #[test]
    fn test_endpoint_rejects_other_schemes() {
        let result = Endpoint::from_item(&item_for(json!({ "url": "ftp://example.com/in" })));
        assert!(matches!(result, Err(TransmitError::InvalidDestination(_))));
    }

    #[tokio::test]
    async fn test_push_success() {
        let (url, server) = serve_once("200 OK").await;
        let item = item_for(json!({ "url": url, "headers": { "X-Api-Key": "secret" } }));

        let transmitter = HttpPushTransmitter::new("courier-test").unwrap();
        transmitter.transmit(&item).await.unwrap();

        let request = server.await.unwrap().to_lowercase();
        assert!(request.starts_with("post /ingest"));
        assert!(request.contains("x-api-key: secret"));
        assert!(request.contains("x-courier-item-id: urn:item:q1"));
    }

    #[tokio::test]
    async fn test_push_server_error() {
        let (url, server) = serve_once("503 Service Unavailable").await;
        let item = item_for(json!({ "url": url }));

        let transmitter = HttpPushTransmitter::new("courier-test").unwrap();
        let result = transmitter.transmit(&item).await;

        assert!(matches!(result, Err(TransmitError::Delivery(msg)) if msg.starts_with("503")));
        server.await.unwrap();
    }

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("short"), "short");
        assert_eq!(truncate_body(&"a".repeat(4096)).len(), MAX_ERROR_BODY_BYTES);

        // Never splits a multi-byte character.
        let body = format!("a{}", "é".repeat(1024));
        let cut = truncate_body(&body);
        assert!(cut.len() <= MAX_ERROR_BODY_BYTES);
        assert!(cut.len() >= MAX_ERROR_BODY_BYTES - 1);
    }

    #[tokio::test]
    async fn test_rejection_body_is_capped() {
        let page = format!("<html>{}</html>", "x".repeat(64 * 1024));
        let (url, server) = serve_once_with_body("500 Internal Server Error", page).await;
        let item = item_for(json!({ "url": url }));

        let transmitter = HttpPushTransmitter::new("courier-test").unwrap();
        let result = transmitter.transmit(&item).await;

        match result {
            Err(TransmitError::Delivery(msg)) => {
                assert!(msg.starts_with("500"));
                assert!(msg.contains("<html>"));
                assert!(msg.len() < MAX_ERROR_BODY_BYTES + 64);
            }
            other => panic!("expected a delivery error, got {other:?}"),
        }
        server.await.unwrap();
    }
}
