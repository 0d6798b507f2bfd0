//! Scan model
//!
//! A [`Scan`] is one candidate HTTP request (and, once fetched, its response)
//! under evaluation. Scans belong to a [`Job`], which scopes every
//! deduplication index so unrelated crawl sessions never share state.

mod gate;
mod poke;

pub use gate::{ScanGate, ScanPolicy};
pub use poke::poke;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::fingerprint::Fingerprint;
use crate::util::random_id;

/// Errors raised while building, sending or serializing a scan
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),
    #[error("Target unreachable: {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A crawl session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Hosts (without port) this job may crawl
    pub domains_allowed: Vec<String>,
}

/// A cookie carried between requests of one crawl path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parse the `name=value` pair of a `Set-Cookie` header, ignoring attributes
    pub fn parse_set_cookie(header: &str) -> Option<Self> {
        let pair = header.split(';').next()?.trim();
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name, value.trim()))
    }
}

/// The request half of a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub method: String,
    pub url: Url,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
}

/// A fetched response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl ScanResponse {
    /// First value of a header (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Cookies set by this response
    pub fn set_cookies(&self) -> Vec<Cookie> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("set-cookie"))
            .filter_map(|(_, v)| Cookie::parse_set_cookie(v))
            .collect()
    }
}

/// One candidate request/response pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scan {
    pub id: String,
    pub job: Job,
    pub request: ScanRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ScanResponse>,
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub hit_count: u32,
}

impl Scan {
    /// Create a scan for a seed URL, starting a new job restricted to the seed's host.
    ///
    /// Fragments never reach the server and are dropped.
    pub fn new(method: &str, url: &str, body: &str) -> Result<Self, ScanError> {
        let method = normalize_method(method)?;
        let mut url = Url::parse(url).map_err(|source| ScanError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        url.set_fragment(None);

        let domains_allowed = url.host_str().map(|h| vec![h.to_string()]).unwrap_or_default();

        Ok(Self {
            id: random_id(),
            job: Job {
                id: random_id(),
                domains_allowed,
            },
            request: ScanRequest {
                method,
                url,
                body: body.to_string(),
                headers: Vec::new(),
            },
            response: None,
            cookies: Vec::new(),
            fingerprint: Fingerprint::default(),
            hit_count: 0,
        })
    }

    /// Derive a follow-up scan: new id, same job and request, cookies carried forward
    pub fn spawn(&self) -> Self {
        let mut cookies = self.cookies.clone();
        if let Some(response) = &self.response {
            merge_cookies(&mut cookies, response.set_cookies());
        }

        Self {
            id: random_id(),
            job: self.job.clone(),
            request: self.request.clone(),
            response: None,
            cookies,
            fingerprint: Fingerprint::default(),
            hit_count: 0,
        }
    }

    /// Replace the request with one for `target`, resolved against the current URL
    /// with any fragment dropped.
    ///
    /// The cookie jar is kept (absorbing any cookies the current response set);
    /// the response and the cached fingerprints are cleared.
    pub fn merge_request(
        &mut self,
        method: &str,
        target: &str,
        body: &str,
    ) -> Result<(), ScanError> {
        let method = normalize_method(method)?;
        let mut url = self
            .request
            .url
            .join(target)
            .map_err(|source| ScanError::InvalidUrl {
                url: target.to_string(),
                source,
            })?;
        url.set_fragment(None);

        if let Some(response) = self.response.take() {
            merge_cookies(&mut self.cookies, response.set_cookies());
        }

        self.request = ScanRequest {
            method,
            url,
            body: body.to_string(),
            headers: Vec::new(),
        };
        self.fingerprint.reset();
        Ok(())
    }

    /// Whether the request host is one the job may crawl
    pub fn is_scan_allowed(&self) -> bool {
        match self.request.url.host_str() {
            Some(host) => self.job.domains_allowed.iter().any(|d| d == host),
            None => false,
        }
    }

    /// Host and explicit port of the request URL
    pub fn host(&self) -> String {
        let url = &self.request.url;
        match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            _ => String::new(),
        }
    }

    /// `scheme://host[:port]`
    pub fn origin(&self) -> String {
        format!("{}://{}", self.request.url.scheme(), self.host())
    }

    /// Fill in every fingerprint that can be computed and is not cached yet
    pub fn update_fingerprint(&mut self, shingle_factor: usize, max_tokens: usize) {
        let origin = self.origin();
        self.fingerprint
            .update_request(&origin, self.request.url.as_str(), &self.request.body);
        if let Some(response) = &self.response {
            self.fingerprint
                .update_response(&response.body, shingle_factor, max_tokens);
        }
    }

    /// `Cookie` request header value for the jar
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Send the request and read the whole response
    pub async fn send(
        &self,
        client: &reqwest::Client,
        timeout: Duration,
    ) -> Result<ScanResponse, reqwest::Error> {
        let method = reqwest::Method::from_bytes(self.request.method.as_bytes())
            .unwrap_or(reqwest::Method::GET);

        let mut builder = client.request(method, self.request.url.clone()).timeout(timeout);
        for (name, value) in &self.request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !self.cookies.is_empty() {
            builder = builder.header(reqwest::header::COOKIE, self.cookie_header());
        }
        if !self.request.body.is_empty() {
            builder = builder.body(self.request.body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                let value = String::from_utf8_lossy(v.as_bytes()).into_owned();
                (k.as_str().to_string(), value)
            })
            .collect();
        let body = response.text().await?;

        Ok(ScanResponse { status, headers, body })
    }

    /// Copy without the response, for stages that do not need it
    pub fn for_transit(&self) -> Self {
        Self {
            response: None,
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ScanError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(payload: &[u8]) -> Result<Self, ScanError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Emit a structured event for a decision point
    pub fn log(&self, service: &str, message: &str) {
        info!(
            service,
            job_id = %self.job.id,
            method = %self.request.method,
            url = %self.request.url,
            "{}",
            message
        );
    }
}

fn normalize_method(method: &str) -> Result<String, ScanError> {
    let method = method.trim().to_ascii_uppercase();
    if method.is_empty() || reqwest::Method::from_bytes(method.as_bytes()).is_err() {
        return Err(ScanError::InvalidMethod(method));
    }
    Ok(method)
}

/// Add cookies to a jar; a later cookie replaces an earlier one with the same name
fn merge_cookies(jar: &mut Vec<Cookie>, incoming: Vec<Cookie>) {
    for cookie in incoming {
        match jar.iter_mut().find(|c| c.name == cookie.name) {
            Some(existing) => existing.value = cookie.value,
            None => jar.push(cookie),
        }
    }
}
