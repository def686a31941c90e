//! Typed HTTP calls against the detiler API.
//!
//! Every request opens its own HTTP/1 connection, bounded by the
//! configured per-attempt timeout. With a retry strategy enabled, only
//! upstream failures (transport, timeout, 5xx) are retried.

use std::fmt::Display;
use std::time::Duration;

use bytes::Bytes;
use detiler_core::{
    Cooldown, CooldownCreationRequest, CooldownQuery, KitMetadata, KitName, TileDetailsPayload,
    TileKey, TileParams, TileQuery, TileQueryResponse, TileRecord, UpsertStatus,
};
use http::{Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::cancel::CancelToken;
use crate::config::{ClientConfig, RetryStrategy};
use crate::error::{ClientError, ClientResult};
use crate::pager::{CooldownPager, TilePager};

const USER_AGENT: &str = "detiler-client/0.1";

#[derive(Debug, Clone)]
pub struct DetilerClient {
    /// `host:port` to connect to.
    address: String,
    /// Value of the `host` header.
    authority: String,
    /// Path prefix of the base URL, without a trailing slash.
    base_path: String,
    timeout: Duration,
    retry: Option<RetryStrategy>,
}

struct RawResponse {
    status: StatusCode,
    body: Bytes,
}

impl DetilerClient {
    pub fn new(config: &ClientConfig) -> ClientResult<Self> {
        let uri: Uri = config
            .url
            .parse()
            .map_err(|e| ClientError::Config(format!("invalid url {:?}: {e}", config.url)))?;
        match uri.scheme_str() {
            Some("http") | None => {}
            Some(other) => {
                return Err(ClientError::Config(format!("unsupported scheme {other:?}")));
            }
        }
        let authority = uri
            .authority()
            .ok_or_else(|| ClientError::Config(format!("url {:?} has no host", config.url)))?;
        let port = authority.port_u16().unwrap_or(80);

        Ok(Self {
            address: format!("{}:{port}", authority.host()),
            authority: authority.to_string(),
            base_path: uri.path().trim_end_matches('/').to_string(),
            timeout: config.timeout(),
            retry: config.retry().cloned(),
        })
    }

    // ── Kits ───────────────────────────────────────────────────

    pub async fn get_kits(&self) -> ClientResult<Vec<KitMetadata>> {
        let resp = self.send(Method::GET, "/kits".to_string(), None).await?;
        decode(expect_success(resp)?)
    }

    pub async fn create_kit(&self, kit: &KitMetadata) -> ClientResult<KitMetadata> {
        let resp = self
            .send(Method::POST, "/kits".to_string(), Some(encode(kit)?))
            .await?;
        decode(expect_success(resp)?)
    }

    // ── Tiles ──────────────────────────────────────────────────

    /// The record for one kit and tile, `None` if it was never written.
    pub async fn get_tile_details(&self, key: &TileKey) -> ClientResult<Option<TileRecord>> {
        let path = format!(
            "/detail/{}/{}/{}/{}",
            urlencoding::encode(&key.kit),
            key.z,
            key.x,
            key.y
        );
        let resp = self.send(Method::GET, path, None).await?;
        if resp.status == StatusCode::NOT_FOUND {
            debug!(kit = %key.kit, z = key.z, x = key.x, y = key.y, "tile details not found");
            return Ok(None);
        }
        decode(expect_success(resp)?).map(Some)
    }

    /// Records of one tile across `kits`, or across every kit when empty.
    pub async fn get_tiles_details(
        &self,
        tile: TileParams,
        kits: &[KitName],
    ) -> ClientResult<Vec<TileRecord>> {
        let mut query = QueryString::default();
        for kit in kits {
            query.push("kits[]", kit);
        }
        let path = query.finish(&format!("/detail/{}/{}/{}", tile.z, tile.x, tile.y));
        let resp = self.send(Method::GET, path, None).await?;
        decode(expect_success(resp)?)
    }

    pub async fn set_tile_details(
        &self,
        key: &TileKey,
        payload: &TileDetailsPayload,
    ) -> ClientResult<UpsertStatus> {
        let path = format!(
            "/detail/{}/{}/{}/{}",
            urlencoding::encode(&key.kit),
            key.z,
            key.x,
            key.y
        );
        let resp = self.send(Method::PUT, path, Some(encode(payload)?)).await?;
        match resp.status {
            StatusCode::CREATED => Ok(UpsertStatus::Inserted),
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(UpsertStatus::Updated),
            _ => Err(status_error(&resp)),
        }
    }

    /// First page of a tile search.
    pub async fn query_tiles(&self, query: &TileQuery) -> ClientResult<TileQueryResponse> {
        let mut qs = QueryString::default();
        qs.push("minZoom", query.min_zoom)
            .push("maxZoom", query.max_zoom)
            .push_opt("minState", query.min_state)
            .push_opt("maxState", query.max_state);
        if query.match_current_state_only {
            qs.push("shouldMatchCurrentState", true);
        }
        for kit in &query.kits {
            qs.push("kits[]", kit);
        }
        if let Some(area) = &query.area {
            for value in area.to_array() {
                qs.push("bbox[]", value);
            }
        }
        qs.push_opt("size", query.size);

        let resp = self.send(Method::GET, qs.finish("/detail"), None).await?;
        decode(expect_success(resp)?)
    }

    /// Continue a tile search from a cursor returned by a previous page.
    pub async fn read_tile_cursor(
        &self,
        cursor: u64,
        size: Option<usize>,
    ) -> ClientResult<TileQueryResponse> {
        let mut qs = QueryString::default();
        qs.push("cursor", cursor).push_opt("size", size);
        let resp = self.send(Method::GET, qs.finish("/detail"), None).await?;
        decode(expect_success(resp)?)
    }

    pub fn tile_pager(&self, query: TileQuery, cancel: CancelToken) -> TilePager {
        TilePager::new(self.clone(), query, cancel)
    }

    // ── Cooldowns ──────────────────────────────────────────────

    pub async fn query_cooldowns(&self, query: &CooldownQuery) -> ClientResult<Vec<Cooldown>> {
        let mut qs = QueryString::default();
        qs.push_opt("enabled", query.enabled)
            .push_opt("minZoom", query.min_zoom)
            .push_opt("maxZoom", query.max_zoom);
        for kit in &query.kits {
            qs.push("kits[]", kit);
        }
        if let Some(area) = &query.area {
            for value in area.to_array() {
                qs.push("area[]", value);
            }
        }
        qs.push_opt("from", query.from).push_opt("size", query.size);

        let resp = self.send(Method::GET, qs.finish("/cooldown"), None).await?;
        decode(expect_success(resp)?)
    }

    /// Create a cooldown and return its key.
    pub async fn create_cooldown(&self, request: &CooldownCreationRequest) -> ClientResult<String> {
        #[derive(serde::Deserialize)]
        struct Created {
            key: String,
        }

        let resp = self
            .send(Method::POST, "/cooldown".to_string(), Some(encode(request)?))
            .await?;
        let created: Created = decode(expect_success(resp)?)?;
        Ok(created.key)
    }

    pub fn cooldown_pager(&self, query: CooldownQuery, cancel: CancelToken) -> CooldownPager {
        CooldownPager::new(self.clone(), query, cancel)
    }

    pub async fn liveness(&self) -> ClientResult<()> {
        let resp = self.send(Method::GET, "/liveness".to_string(), None).await?;
        expect_success(resp).map(|_| ())
    }

    // ── Transport ──────────────────────────────────────────────

    async fn send(
        &self,
        method: Method,
        target: String,
        body: Option<Bytes>,
    ) -> ClientResult<RawResponse> {
        let target = format!("{}{target}", self.base_path);
        let mut attempt = 0;
        loop {
            match self.send_once(&method, &target, body.clone()).await {
                Err(e) if e.is_retryable() => match &self.retry {
                    Some(strategy) if attempt < strategy.retries => {
                        let delay = strategy.delay_for(attempt);
                        attempt += 1;
                        warn!(
                            %method, %target, attempt, retries = strategy.retries,
                            delay_ms = delay.as_millis() as u64, error = %e,
                            "request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    _ => {
                        error!(%method, %target, error = %e, "request failed");
                        return Err(e);
                    }
                },
                other => return other,
            }
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        target: &str,
        body: Option<Bytes>,
    ) -> ClientResult<RawResponse> {
        debug!(%method, %target, "sending request");
        let request = async {
            let stream = tokio::net::TcpStream::connect(&self.address)
                .await
                .map_err(|e| ClientError::Upstream(format!("connect {}: {e}", self.address)))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ClientError::Upstream(format!("handshake failed: {e}")))?;
            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let mut builder = http::Request::builder()
                .method(method.clone())
                .uri(target)
                .header(http::header::HOST, &self.authority)
                .header(http::header::USER_AGENT, USER_AGENT);
            if body.is_some() {
                builder = builder.header(http::header::CONTENT_TYPE, "application/json");
            }
            let req = builder
                .body(Full::new(body.unwrap_or_default()))
                .map_err(|e| ClientError::Config(format!("invalid request {target}: {e}")))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| ClientError::Upstream(format!("request failed: {e}")))?;
            let status = resp.status();
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| ClientError::Upstream(format!("reading body failed: {e}")))?
                .to_bytes();
            Ok::<_, ClientError>(RawResponse { status, body })
        };

        let resp = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| {
                ClientError::Upstream(format!(
                    "request timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })??;

        if resp.status.is_server_error() {
            return Err(ClientError::Upstream(format!(
                "status {}: {}",
                resp.status.as_u16(),
                error_message(&resp)
            )));
        }
        Ok(resp)
    }
}

fn encode<T: Serialize>(value: &T) -> ClientResult<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| ClientError::Config(format!("unencodable body: {e}")))
}

fn decode<T: DeserializeOwned>(resp: RawResponse) -> ClientResult<T> {
    serde_json::from_slice(&resp.body).map_err(|e| ClientError::Decode(e.to_string()))
}

fn expect_success(resp: RawResponse) -> ClientResult<RawResponse> {
    if resp.status.is_success() {
        Ok(resp)
    } else {
        Err(status_error(&resp))
    }
}

fn status_error(resp: &RawResponse) -> ClientError {
    ClientError::Status {
        status: resp.status.as_u16(),
        message: error_message(resp),
    }
}

/// The `error` field of an error body, else the raw body text.
fn error_message(resp: &RawResponse) -> String {
    serde_json::from_slice::<serde_json::Value>(&resp.body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(&resp.body).into_owned())
}

/// Percent-encoded query string with repeated keys kept in order.
#[derive(Default)]
struct QueryString(Vec<String>);

impl QueryString {
    fn push(&mut self, name: &str, value: impl Display) -> &mut Self {
        self.0.push(format!(
            "{}={}",
            urlencoding::encode(name),
            urlencoding::encode(&value.to_string())
        ));
        self
    }

    fn push_opt(&mut self, name: &str, value: Option<impl Display>) -> &mut Self {
        if let Some(value) = value {
            self.push(name, value);
        }
        self
    }

    fn finish(&self, path: &str) -> String {
        if self.0.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{}", self.0.join("&"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_split() {
        let client = DetilerClient::new(&ClientConfig::new("http://detiler.local:9000/api/")).unwrap();
        assert_eq!(client.address, "detiler.local:9000");
        assert_eq!(client.authority, "detiler.local:9000");
        assert_eq!(client.base_path, "/api");

        let client = DetilerClient::new(&ClientConfig::new("http://detiler")).unwrap();
        assert_eq!(client.address, "detiler:80");
        assert_eq!(client.base_path, "");
    }

    #[test]
    fn unsupported_urls_are_rejected() {
        assert!(matches!(
            DetilerClient::new(&ClientConfig::new("https://detiler")),
            Err(ClientError::Config(_))
        ));
        assert!(matches!(
            DetilerClient::new(&ClientConfig::new("not a url")),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn query_string_encodes_array_keys() {
        let mut qs = QueryString::default();
        qs.push("kits[]", "a b")
            .push("kits[]", "c")
            .push_opt("size", None::<usize>)
            .push("bbox[]", -1.5);
        assert_eq!(
            qs.finish("/detail"),
            "/detail?kits%5B%5D=a%20b&kits%5B%5D=c&bbox%5B%5D=-1.5"
        );
        assert_eq!(QueryString::default().finish("/kits"), "/kits");
    }

    #[test]
    fn error_message_prefers_error_field() {
        let resp = RawResponse {
            status: StatusCode::BAD_REQUEST,
            body: Bytes::from_static(br#"{"success":false,"error":"bad zoom"}"#),
        };
        assert_eq!(error_message(&resp), "bad zoom");

        let resp = RawResponse {
            status: StatusCode::BAD_GATEWAY,
            body: Bytes::from_static(b"gateway down"),
        };
        assert_eq!(error_message(&resp), "gateway down");
        assert!(matches!(
            status_error(&resp),
            ClientError::Status { status: 502, .. }
        ));
    }
}
