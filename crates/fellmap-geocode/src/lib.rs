//! UK postcode extraction and batched coordinate lookup.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use fellmap_core::PostcodeLocation;
use fellmap_storage::{FetchError, HttpFetcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fellmap-geocode";

/// Largest batch the bulk lookup endpoint accepts, less one.
pub const BATCH_SIZE: usize = 99;

pub const DEFAULT_POSTCODES_URL: &str = "https://api.postcodes.io/postcodes";

static RE_UK_POSTCODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"([Gg][Ii][Rr] 0[Aa]{2})|((([A-Za-z][0-9]{1,2})|(([A-Za-z][A-Ha-hJ-Yj-y][0-9]{1,2})|(([A-Za-z][0-9][A-Za-z])|([A-Za-z][A-Ha-hJ-Yj-y][0-9][A-Za-z]?))))\s?[0-9][A-Za-z]{2})",
    )
    .expect("invalid regex: uk postcode")
});

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed geocoding response: {0}")]
    MalformedResponse(#[from] serde_json::Error),
}

/// First UK postcode in free text, as written.
pub fn extract_postcode(text: &str) -> Option<String> {
    RE_UK_POSTCODE.find(text).map(|m| m.as_str().to_string())
}

/// Join key for postcodes: upper case, no whitespace.
pub fn postcode_key(postcode: &str) -> String {
    postcode
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

#[async_trait]
pub trait PostcodeLookup: Send + Sync {
    /// Resolve one batch of at most [`BATCH_SIZE`] postcodes. Postcodes the
    /// service does not know are left out of the result.
    async fn lookup_batch(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        batch: &[String],
    ) -> Result<Vec<PostcodeLocation>, GeocodeError>;
}

#[derive(Debug, Serialize)]
struct BulkLookupRequest<'a> {
    postcodes: &'a [String],
}

#[derive(Debug, Deserialize)]
struct BulkLookupResponse {
    result: Vec<BulkLookupItem>,
}

#[derive(Debug, Deserialize)]
struct BulkLookupItem {
    #[serde(default)]
    query: Option<String>,
    result: Option<PostcodeDetails>,
}

#[derive(Debug, Deserialize)]
struct PostcodeDetails {
    postcode: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

/// Decode a bulk lookup body into the postcodes that resolved to coordinates.
pub fn parse_bulk_response(body: &[u8]) -> Result<Vec<PostcodeLocation>, GeocodeError> {
    let response: BulkLookupResponse = serde_json::from_slice(body)?;
    Ok(response
        .result
        .into_iter()
        .filter_map(|item| {
            let details = item.result?;
            match (details.latitude, details.longitude) {
                (Some(latitude), Some(longitude)) => Some(PostcodeLocation {
                    postcode: details.postcode,
                    latitude,
                    longitude,
                }),
                _ => {
                    debug!(query = item.query.as_deref(), "postcode has no coordinates");
                    None
                }
            }
        })
        .collect())
}

/// Bulk client for the postcodes.io `POST /postcodes` endpoint.
#[derive(Debug, Clone)]
pub struct PostcodesIoClient {
    endpoint: String,
}

impl PostcodesIoClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl Default for PostcodesIoClient {
    fn default() -> Self {
        Self::new(DEFAULT_POSTCODES_URL)
    }
}

#[async_trait]
impl PostcodeLookup for PostcodesIoClient {
    async fn lookup_batch(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        batch: &[String],
    ) -> Result<Vec<PostcodeLocation>, GeocodeError> {
        let resp = http
            .post_json(run_id, &self.endpoint, &BulkLookupRequest { postcodes: batch })
            .await?;
        debug!(status = resp.status.as_u16(), bytes = resp.body.len(), "bulk lookup answered");
        parse_bulk_response(&resp.body)
    }
}

/// Resolve postcodes in sequential batches of [`BATCH_SIZE`]. Duplicates
/// (by [`postcode_key`]) are looked up once.
pub async fn resolve_postcodes(
    lookup: &dyn PostcodeLookup,
    http: &HttpFetcher,
    run_id: Uuid,
    postcodes: &[String],
) -> Result<Vec<PostcodeLocation>, GeocodeError> {
    let mut seen = HashSet::new();
    let unique = postcodes
        .iter()
        .filter(|p| seen.insert(postcode_key(p)))
        .cloned()
        .collect::<Vec<_>>();

    let mut locations = Vec::with_capacity(unique.len());
    for (batch_no, batch) in unique.chunks(BATCH_SIZE).enumerate() {
        let resolved = lookup.lookup_batch(http, run_id, batch).await?;
        debug!(batch_no, requested = batch.len(), resolved = resolved.len(), "postcode batch");
        locations.extend(resolved);
    }
    info!(
        requested = unique.len(),
        resolved = locations.len(),
        "postcode lookup finished"
    );
    Ok(locations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fellmap_storage::HttpClientConfig;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// One-shot HTTP endpoint: answers the first request with `status` and
    /// `body`, then returns the request body it received.
    async fn bulk_endpoint(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let request_body = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed before the request body arrived");
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).into_owned();
                let Some(head_end) = text.find("\r\n\r\n") else {
                    continue;
                };
                let content_length = text[..head_end]
                    .lines()
                    .find_map(|line| {
                        line.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if buf.len() >= head_end + 4 + content_length {
                    break text[head_end + 4..].to_string();
                }
            };
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            request_body
        });
        (format!("http://{addr}/postcodes"), handle)
    }

    #[derive(Default)]
    struct RecordingLookup {
        batches: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl PostcodeLookup for RecordingLookup {
        async fn lookup_batch(
            &self,
            _http: &HttpFetcher,
            _run_id: Uuid,
            batch: &[String],
        ) -> Result<Vec<PostcodeLocation>, GeocodeError> {
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(batch
                .iter()
                .map(|p| PostcodeLocation {
                    postcode: p.clone(),
                    latitude: 54.0,
                    longitude: -3.0,
                })
                .collect())
        }
    }

    fn http() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig::default()).unwrap()
    }

    #[test]
    fn extracts_postcode_from_venue_text() {
        assert_eq!(extract_postcode("Keswick, CA12 4EA").as_deref(), Some("CA12 4EA"));
        assert_eq!(extract_postcode("Village hall, M1 1AE").as_deref(), Some("M1 1AE"));
        assert_eq!(extract_postcode("Car park ca124ea").as_deref(), Some("ca124ea"));
        assert_eq!(extract_postcode("Girobank, GIR 0AA").as_deref(), Some("GIR 0AA"));
        assert_eq!(extract_postcode("Keswick Moot Hall"), None);
    }

    #[test]
    fn postcode_keys_ignore_case_and_spacing() {
        assert_eq!(postcode_key("ca12 4ea"), "CA124EA");
        assert_eq!(postcode_key("CA12  4EA"), postcode_key("CA124EA"));
    }

    #[tokio::test]
    async fn one_hundred_fifty_postcodes_take_two_batches() {
        let lookup = RecordingLookup::default();
        let postcodes = (0..150)
            .map(|i| format!("LA{} {}AA", i + 1, i % 10))
            .collect::<Vec<_>>();

        let locations = resolve_postcodes(&lookup, &http(), Uuid::new_v4(), &postcodes)
            .await
            .unwrap();

        let sizes = lookup
            .batches
            .lock()
            .unwrap()
            .iter()
            .map(Vec::len)
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![99, 51]);
        assert_eq!(locations.len(), 150);
    }

    #[tokio::test]
    async fn duplicate_postcodes_are_requested_once() {
        let lookup = RecordingLookup::default();
        let postcodes = vec!["CA12 4EA".to_string(), "ca12 4ea".to_string(), "CA124EA".to_string()];
        resolve_postcodes(&lookup, &http(), Uuid::new_v4(), &postcodes)
            .await
            .unwrap();
        assert_eq!(*lookup.batches.lock().unwrap(), vec![vec!["CA12 4EA".to_string()]]);
    }

    #[tokio::test]
    async fn no_postcodes_means_no_requests() {
        let lookup = RecordingLookup::default();
        let locations = resolve_postcodes(&lookup, &http(), Uuid::new_v4(), &[])
            .await
            .unwrap();
        assert!(locations.is_empty());
        assert!(lookup.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn bulk_response_drops_unknown_and_unplaced_postcodes() {
        let body = br#"{
            "status": 200,
            "result": [
                {"query": "CA12 4EA", "result": {"postcode": "CA12 4EA", "latitude": 54.6, "longitude": -3.13, "country": "England"}},
                {"query": "ZZ1 1ZZ", "result": null},
                {"query": "GY1 1AA", "result": {"postcode": "GY1 1AA", "latitude": null, "longitude": null}}
            ]
        }"#;
        let locations = parse_bulk_response(body).unwrap();
        assert_eq!(
            locations,
            vec![PostcodeLocation {
                postcode: "CA12 4EA".into(),
                latitude: 54.6,
                longitude: -3.13,
            }]
        );
    }

    #[test]
    fn bulk_request_body_lists_postcodes() {
        let batch = vec!["CA12 4EA".to_string()];
        let body = serde_json::to_string(&BulkLookupRequest { postcodes: &batch }).unwrap();
        assert_eq!(body, r#"{"postcodes":["CA12 4EA"]}"#);
    }

    #[tokio::test]
    async fn postcodes_io_client_posts_batch_and_decodes_result() {
        let (endpoint, server) = bulk_endpoint(
            "200 OK",
            r#"{"status":200,"result":[{"query":"CA12 4EA","result":{"postcode":"CA12 4EA","latitude":54.6,"longitude":-3.13}},{"query":"ZZ1 1ZZ","result":null}]}"#,
        )
        .await;
        let client = PostcodesIoClient::new(endpoint);
        let batch = vec!["CA12 4EA".to_string(), "ZZ1 1ZZ".to_string()];

        let locations = client.lookup_batch(&http(), Uuid::new_v4(), &batch).await.unwrap();

        assert_eq!(
            locations,
            vec![PostcodeLocation {
                postcode: "CA12 4EA".into(),
                latitude: 54.6,
                longitude: -3.13,
            }]
        );
        assert_eq!(
            server.await.unwrap(),
            r#"{"postcodes":["CA12 4EA","ZZ1 1ZZ"]}"#
        );
    }

    #[tokio::test]
    async fn postcodes_io_server_error_is_a_fetch_error() {
        let (endpoint, server) = bulk_endpoint("500 Internal Server Error", "{}").await;
        let client = PostcodesIoClient::new(endpoint);

        let err = client
            .lookup_batch(&http(), Uuid::new_v4(), &["CA12 4EA".to_string()])
            .await
            .unwrap_err();

        assert!(
            matches!(err, GeocodeError::Fetch(FetchError::HttpStatus { status: 500, .. })),
            "{err}"
        );
        server.await.unwrap();
    }

    #[test]
    fn bulk_response_without_result_is_malformed() {
        let err = parse_bulk_response(br#"{"status": 500, "error": "oops"}"#).unwrap_err();
        assert!(matches!(err, GeocodeError::MalformedResponse(_)));
    }
}
