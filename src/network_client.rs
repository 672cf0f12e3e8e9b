use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, COOKIE, ORIGIN, REFERER, USER_AGENT};
use reqwest::{Client, Error as ReqwestError, StatusCode};
use std::collections::HashMap;
use std::time::Instant;
use once_cell::sync::Lazy;
use log::{debug, info};
use serde_json::{json, Value};
use url::Url;

use crate::utils;

pub const DEFAULT_UPSTREAM_BASE: &str = "https://www.bybit.com";

pub const LIST_AWARDS_PATH: &str = "/x-api/segw/awar/v1/awarding/search-together";
pub const CLAIM_AWARD_PATH: &str = "/x-api/segw/awar/v1/awarding";
pub const RISK_COMPONENTS_PATH: &str = "/x-api/user/public/risk/components";
pub const FACE_TOKEN_PATH: &str = "/x-api/user/public/risk/face/token";

const REWARDS_PAGE_PATH: &str = "/en/task-center/my_rewards";
const RAW_BODY_LIMIT: usize = 2000;

static BASE_HEADERS: Lazy<HeaderMap> = Lazy::new(|| {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"));
    headers
});

const TRACEPARENT: &str = "traceparent";

#[derive(Debug)]
pub enum NetworkError {
    Reqwest(ReqwestError),
    UrlParseError(url::ParseError),
    InvalidProxy(String),
    InvalidHeader(String),
}

impl From<ReqwestError> for NetworkError {
    fn from(err: ReqwestError) -> NetworkError {
        NetworkError::Reqwest(err)
    }
}

impl From<url::ParseError> for NetworkError {
    fn from(err: url::ParseError) -> NetworkError {
        NetworkError::UrlParseError(err)
    }
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkError::Reqwest(e) => write!(f, "HTTP request error: {}", e),
            NetworkError::UrlParseError(e) => write!(f, "URL parsing error: {}", e),
            NetworkError::InvalidProxy(reason) => write!(f, "Invalid proxy: {}", reason),
            NetworkError::InvalidHeader(name) => write!(f, "Invalid value for header '{}'", name),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetworkError::Reqwest(e) => Some(e),
            NetworkError::UrlParseError(e) => Some(e),
            _ => None,
        }
    }
}

/// Outbound HTTP proxy given as `host:port:user:pass` (credentials optional).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
}

impl ProxySpec {
    pub fn parse(spec: &str) -> Result<Self, NetworkError> {
        let parts: Vec<&str> = spec.trim().splitn(4, ':').collect();
        let (host, port, credentials) = match parts.as_slice() {
            [host, port] => (*host, *port, None),
            [host, port, user, pass] => (*host, *port, Some((user.to_string(), pass.to_string()))),
            _ => {
                return Err(NetworkError::InvalidProxy(
                    "expected host:port or host:port:user:pass".to_string(),
                ))
            }
        };
        if host.is_empty() {
            return Err(NetworkError::InvalidProxy("empty host".to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| NetworkError::InvalidProxy(format!("bad port '{}'", port)))?;
        Ok(ProxySpec { host: host.to_string(), port, credentials })
    }

    fn to_proxy(&self) -> Result<reqwest::Proxy, NetworkError> {
        let proxy = reqwest::Proxy::all(format!("http://{}:{}", self.host, self.port))?;
        Ok(match &self.credentials {
            Some((user, pass)) => proxy.basic_auth(user, pass),
            None => proxy,
        })
    }
}

/// Decoded answer of one upstream call. Non-JSON bodies become `{"raw": <text>}`.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

/// Parses an upstream body as JSON, falling back to `{"raw": <truncated text>}`.
pub fn decode_body(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| json!({ "raw": utils::truncate_chars(text, RAW_BODY_LIMIT) }))
}

/// Client for the reward platform's JSON endpoints. Built once per inbound request.
pub struct UpstreamClient {
    client: Client,
    base_url: Url,
}

impl UpstreamClient {
    pub fn new(base_url: &Url, proxy: Option<&ProxySpec>) -> Result<Self, NetworkError> {
        let origin = base_url.origin().unicode_serialization();
        let referer = base_url.join(REWARDS_PAGE_PATH)?;

        let mut headers = BASE_HEADERS.clone();
        if let Ok(origin_val) = HeaderValue::from_str(&origin) {
            headers.insert(ORIGIN, origin_val);
        }
        if let Ok(referer_val) = HeaderValue::from_str(referer.as_str()) {
            headers.insert(REFERER, referer_val);
        }

        let mut builder = Client::builder().default_headers(headers);
        if let Some(proxy) = proxy {
            builder = builder.proxy(proxy.to_proxy()?);
        }

        Ok(UpstreamClient { client: builder.build()?, base_url: base_url.clone() })
    }

    /// POSTs `body` as JSON to `path` with the session cookie and any extra headers.
    ///
    /// Only transport failures are errors; every HTTP status comes back as an
    /// [`UpstreamResponse`] for the caller to judge.
    pub async fn post_json(
        &self,
        path: &str,
        body: &Value,
        cookies: &str,
        extra_headers: &[(&'static str, &'static str)],
    ) -> Result<UpstreamResponse, NetworkError> {
        let url = self.base_url.join(path)?;
        let cookie_val = HeaderValue::from_str(cookies)
            .map_err(|_| NetworkError::InvalidHeader(COOKIE.to_string()))?;
        let traceparent = HeaderValue::from_str(&utils::generate_traceparent())
            .map_err(|_| NetworkError::InvalidHeader(TRACEPARENT.to_string()))?;

        let mut request = self.client
            .post(url.clone())
            .header(COOKIE, cookie_val)
            .header(TRACEPARENT, traceparent)
            .json(body);
        for (name, value) in extra_headers {
            request = request.header(*name, *value);
        }
        debug!("[API] Sending POST to {}", url);
        debug!("[API] request body: {}", body);

        let start_time = Instant::now();
        let response_result = request.send().await;
        let duration = start_time.elapsed();
        info!("[TIMING] POST {} took {:.2?}", url.path(), duration);

        let response = response_result?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
            .collect::<HashMap<_, _>>();
        let text = response.text().await?;
        debug!("[API] {} response ({}): {}", url.path(), status, text);

        Ok(UpstreamResponse { status, headers, body: decode_body(&text) })
    }
}
