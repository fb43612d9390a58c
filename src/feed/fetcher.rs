use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use url::Url;

/// Default cap on a feed body. Large back catalogues run to a few MB.
pub const DEFAULT_MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// A feed download that did not produce a usable body.
///
/// Carries the URL so the failure can be reported without extra context.
/// Failed fetches are not retried here; the next scheduled cycle is the retry.
#[derive(Debug, Error)]
#[error("Failed to fetch feed {url}: {cause}")]
pub struct FetchError {
    pub url: String,
    #[source]
    pub cause: FetchCause,
}

/// Why a fetch failed.
#[derive(Debug, Error)]
pub enum FetchCause {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// Anything other than http/https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// Network-level error (DNS, connection, TLS, too many redirects, ...)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Response body exceeded the configured size limit
    #[error("Response too large (limit {0} bytes)")]
    ResponseTooLarge(usize),
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Source of raw feed text.
///
/// [`FeedFetcher`] is the HTTP implementation; tests substitute their own.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Returns the body of `url` as text.
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;
}

/// Plain HTTP GET feed retrieval. No parsing, no retries.
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    client: reqwest::Client,
    max_size: usize,
}

impl FeedFetcher {
    pub fn new(client: reqwest::Client, max_size: usize) -> Self {
        Self { client, max_size }
    }

    /// Builds a fetcher with its own client identifying itself as `user_agent`.
    ///
    /// Redirects are followed by reqwest's default policy (up to 10 hops).
    pub fn with_user_agent(user_agent: &str, max_size: usize) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self::new(client, max_size))
    }

    async fn fetch_inner(&self, url: &str) -> Result<String, FetchCause> {
        let parsed = validate_feed_url(url)?;

        let response = self.client.get(parsed).send().await?;

        if !response.status().is_success() {
            return Err(FetchCause::HttpStatus(response.status().as_u16()));
        }

        let bytes = read_limited_bytes(response, self.max_size).await?;
        Ok(decode_body(url, bytes))
    }
}

impl Default for FeedFetcher {
    fn default() -> Self {
        Self::new(reqwest::Client::new(), DEFAULT_MAX_FEED_SIZE)
    }
}

#[async_trait]
impl FeedSource for FeedFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        tracing::debug!(url = %url, "Fetching feed");
        self.fetch_inner(url).await.map_err(|cause| FetchError {
            url: url.to_string(),
            cause,
        })
    }
}

/// Rejects anything that is not an absolute http(s) URL before touching the network.
fn validate_feed_url(url_str: &str) -> Result<Url, FetchCause> {
    let url = Url::parse(url_str.trim())?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(FetchCause::UnsupportedScheme(scheme.to_owned())),
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchCause> {
    // Capture Content-Length for completeness check
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchCause::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchCause::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchCause::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

/// Feed bodies are expected to be UTF-8. A leading BOM is dropped and invalid
/// sequences are replaced rather than failing the whole feed.
fn decode_body(url: &str, bytes: Vec<u8>) -> String {
    const BOM: &[u8] = b"\xEF\xBB\xBF";
    let body = if bytes.starts_with(BOM) {
        bytes[BOM.len()..].to_vec()
    } else {
        bytes
    };

    match String::from_utf8(body) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(url = %url, valid_up_to = e.utf8_error().valid_up_to(), "Feed body is not valid UTF-8, decoding lossily");
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><guid>1</guid><title>Test</title></item>
</channel></rss>"#;

    #[tokio::test]
    async fn test_fetch_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("Content-Type", "application/rss+xml"),
            )
            .mount(&mock_server)
            .await;

        let fetcher = FeedFetcher::default();
        let text = fetcher
            .fetch_text(&format!("{}/feed", mock_server.uri()))
            .await
            .unwrap();
        assert_eq!(text, VALID_RSS);
    }

    #[tokio::test]
    async fn test_fetch_404_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        let err = FeedFetcher::default().fetch_text(&url).await.unwrap_err();
        assert_eq!(err.url, url);
        match err.cause {
            FetchCause::HttpStatus(404) => {}
            e => panic!("Expected HttpStatus(404), got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_fetch_500_is_not_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = FeedFetcher::default()
            .fetch_text(&format!("{}/feed", mock_server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err.cause, FetchCause::HttpStatus(500)));
    }

    #[tokio::test]
    async fn test_fetch_follows_redirects() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(
                ResponseTemplate::new(301)
                    .insert_header("Location", format!("{}/new", mock_server.uri()).as_str()),
            )
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        let text = FeedFetcher::default()
            .fetch_text(&format!("{}/old", mock_server.uri()))
            .await
            .unwrap();
        assert_eq!(text, VALID_RSS);
    }

    #[tokio::test]
    async fn test_fetch_sends_user_agent() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("user-agent", "podfeed-test/1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .expect(1)
            .mount(&mock_server)
            .await;

        let fetcher = FeedFetcher::with_user_agent("podfeed-test/1.0", DEFAULT_MAX_FEED_SIZE).unwrap();
        assert!(fetcher
            .fetch_text(&format!("{}/feed", mock_server.uri()))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_fetch_rejects_oversized_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(2048)))
            .mount(&mock_server)
            .await;

        let fetcher = FeedFetcher::new(reqwest::Client::new(), 1024);
        let err = fetcher
            .fetch_text(&format!("{}/feed", mock_server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err.cause, FetchCause::ResponseTooLarge(1024)));
    }

    #[tokio::test]
    async fn test_fetch_rejects_unsupported_scheme_without_request() {
        let err = FeedFetcher::default()
            .fetch_text("ftp://example.com/feed.xml")
            .await
            .unwrap_err();
        assert!(matches!(err.cause, FetchCause::UnsupportedScheme(ref s) if s == "ftp"));

        let err = FeedFetcher::default().fetch_text("not a url").await.unwrap_err();
        assert!(matches!(err.cause, FetchCause::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_is_network_error() {
        // Bind then drop a server so the port is closed
        let uri = {
            let server = MockServer::start().await;
            server.uri()
        };
        let err = FeedFetcher::default()
            .fetch_text(&format!("{}/feed", uri))
            .await
            .unwrap_err();
        assert!(matches!(err.cause, FetchCause::Network(_)));
        assert!(err.to_string().contains("Failed to fetch feed"));
    }

    #[test]
    fn test_decode_body_strips_bom_and_tolerates_invalid_utf8() {
        let mut with_bom = b"\xEF\xBB\xBF".to_vec();
        with_bom.extend_from_slice(b"<rss/>");
        assert_eq!(decode_body("u", with_bom), "<rss/>");

        let latin1 = b"<title>Caf\xE9</title>".to_vec();
        let decoded = decode_body("u", latin1);
        assert!(decoded.starts_with("<title>Caf"));
        assert!(decoded.ends_with("</title>"));
    }
}
