//! Sitemap fetching with retry, conditional requests, and gzip handling.
//!
//! Network errors and 5xx responses retry up to 3 times with exponential
//! backoff (1 s base, doubling); 4xx responses never retry. A prior ETag
//! turns the request conditional, and a 304 short-circuits the re-parse.
//! Transport-level gzip/deflate is decompressed by the client; `.gz` sitemap
//! objects are decompressed here.

use std::io::Read;
use std::time::Duration;

use flate2::read::GzDecoder;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sent on every outbound sitemap request.
pub const USER_AGENT: &str = "SitemapIndexerPro/2.0";

/// Overall per-request deadline.
pub const FETCH_DEADLINE: Duration = Duration::from_secs(60);

const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request aborted")]
    Aborted,
    /// Non-retryable HTTP status (4xx).
    #[error("http status {0}")]
    Status(u16),
    /// Network failure or 5xx after exhausting retries.
    #[error("fetch failed: {0}")]
    Exhausted(String),
    #[error("gzip decompression failed: {0}")]
    Gzip(String),
}

#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(FetchedSitemap),
    /// Conditional request matched the prior ETag.
    NotModified,
}

#[derive(Debug)]
pub struct FetchedSitemap {
    pub body: String,
    pub etag: Option<String>,
}

/// Client used for all sitemap fetches.
pub fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(FETCH_DEADLINE)
        .user_agent(USER_AGENT)
        .build()
}

/// Fetch one sitemap document, honoring cancellation at every await.
pub async fn fetch_sitemap(
    client: &reqwest::Client,
    url: &str,
    prior_etag: Option<&str>,
    cancel: &CancellationToken,
) -> Result<FetchOutcome, FetchError> {
    let mut last_error = String::new();

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
            debug!(url, attempt, backoff_ms = backoff.as_millis() as u64, "retrying fetch");
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Aborted),
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        let mut request = client.get(url);
        if let Some(etag) = prior_etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Aborted),
            r = request.send() => r,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                last_error = e.to_string();
                continue;
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }

        if status.is_success() {
            let etag = response
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            let bytes = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Aborted),
                r = response.bytes() => r.map_err(|e| FetchError::Exhausted(e.to_string()))?,
            };

            let body = decode_body(url, &bytes)?;
            return Ok(FetchOutcome::Fetched(FetchedSitemap { body, etag }));
        }

        if status.is_server_error() {
            last_error = format!("http status {status}");
            continue;
        }

        // 4xx: not retryable
        return Err(FetchError::Status(status.as_u16()));
    }

    Err(FetchError::Exhausted(last_error))
}

/// Decompress `.gz` sitemap objects; transport encoding was already handled.
fn decode_body(url: &str, bytes: &[u8]) -> Result<String, FetchError> {
    let looks_gzipped = bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC;
    let gz_url = url.split('?').next().is_some_and(|path| path.ends_with(".gz"));

    if looks_gzipped && (gz_url || !bytes.starts_with(b"<")) {
        let mut decoder = GzDecoder::new(bytes);
        let mut body = String::new();
        decoder
            .read_to_string(&mut body)
            .map_err(|e| FetchError::Gzip(e.to_string()))?;
        return Ok(body);
    }

    Ok(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn plain_xml_passes_through() {
        let body = decode_body("http://t/sitemap.xml", b"<urlset></urlset>").unwrap();
        assert_eq!(body, "<urlset></urlset>");
    }

    #[test]
    fn gz_url_is_decompressed() {
        let compressed = gzip(b"<urlset><url><loc>http://t/x</loc></url></urlset>");
        let body = decode_body("http://t/sitemap.xml.gz", &compressed).unwrap();
        assert!(body.contains("http://t/x"));
    }

    #[test]
    fn gzipped_payload_without_gz_suffix_is_decompressed() {
        let compressed = gzip(b"<urlset></urlset>");
        let body = decode_body("http://t/sitemap.xml", &compressed).unwrap();
        assert_eq!(body, "<urlset></urlset>");
    }

    #[test]
    fn corrupt_gzip_is_an_error() {
        let mut compressed = gzip(b"<urlset></urlset>");
        compressed.truncate(6);
        assert!(matches!(
            decode_body("http://t/sitemap.xml.gz", &compressed),
            Err(FetchError::Gzip(_))
        ));
    }

    #[test]
    fn query_strings_do_not_hide_gz_suffix() {
        let compressed = gzip(b"<urlset></urlset>");
        let body = decode_body("http://t/sitemap.xml.gz?v=2", &compressed).unwrap();
        assert_eq!(body, "<urlset></urlset>");
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_sending() {
        let client = build_client().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        // the select observes the cancelled token before the connect finishes
        let result = fetch_sitemap(&client, "http://192.0.2.1/sitemap.xml", None, &cancel).await;
        assert!(matches!(result, Err(FetchError::Aborted)));
    }
}
