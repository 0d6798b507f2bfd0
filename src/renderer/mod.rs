//! Page renderers
//!
//! A renderer takes a scan and asynchronously produces at most one fetched
//! page plus any number of follow-up scans derived from the page's links and
//! forms. Both streams close when rendering finishes, is cancelled because
//! the page is a near-duplicate, or times out.

use std::time::Duration;

use scraper::{Html, Selector};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn, Instrument};
use url::form_urlencoded;

use crate::scan::{Scan, ScanGate};

/// Errors raised while rendering a page
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("Render timed out after {0:?}")]
    Timeout(Duration),
}

/// Output of one render
pub struct RenderStreams {
    /// The fetched page, if it was fetched and is not a duplicate
    pub page: mpsc::Receiver<Scan>,
    /// Follow-up scans found on the page
    pub links: mpsc::Receiver<Scan>,
}

/// DOM renderer boundary
pub trait Renderer: Send + Sync {
    /// Start rendering `scan`. Must be called inside a tokio runtime.
    fn render(&self, scan: Scan) -> RenderStreams;
}

/// A follow-up request found in markup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub method: String,
    /// Possibly relative
    pub href: String,
    /// Form-encoded body for POST forms
    pub body: String,
}

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Collect `a[href]` links and `form` submissions from a page
pub fn extract_targets(html: &str) -> Vec<Target> {
    let document = Html::parse_document(html);
    let mut targets = Vec::new();

    if let Ok(anchors) = Selector::parse("a[href]") {
        for anchor in document.select(&anchors) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let href = href.trim();
            if is_navigable(href) {
                targets.push(Target {
                    method: "GET".to_string(),
                    href: href.to_string(),
                    body: String::new(),
                });
            }
        }
    }

    let (Ok(forms), Ok(fields)) = (
        Selector::parse("form"),
        Selector::parse("input[name], textarea[name], select[name]"),
    ) else {
        return targets;
    };

    for form in document.select(&forms) {
        let action = form.value().attr("action").unwrap_or("").trim();
        if !action.is_empty() && !is_navigable(action) {
            continue;
        }
        let method = form
            .value()
            .attr("method")
            .map(|m| m.trim().to_ascii_uppercase())
            .filter(|m| m == "POST")
            .unwrap_or_else(|| "GET".to_string());

        let mut encoded = form_urlencoded::Serializer::new(String::new());
        for field in form.select(&fields) {
            if let Some(name) = field.value().attr("name") {
                encoded.append_pair(name, field.value().attr("value").unwrap_or(""));
            }
        }
        let query = encoded.finish();

        let target = if method == "POST" {
            Target {
                method,
                href: action.to_string(),
                body: query,
            }
        } else {
            let separator = if action.contains('?') { '&' } else { '?' };
            let href = if query.is_empty() {
                action.to_string()
            } else {
                format!("{}{}{}", action, separator, query)
            };
            Target {
                method,
                href,
                body: String::new(),
            }
        };
        targets.push(target);
    }

    targets
}

fn is_navigable(href: &str) -> bool {
    let lower = href.to_ascii_lowercase();
    !(href.is_empty()
        || href.starts_with('#')
        || lower.starts_with("javascript:")
        || lower.starts_with("mailto:")
        || lower.starts_with("tel:")
        || lower.starts_with("data:"))
}

/// Renderer that fetches raw HTML without running scripts
#[derive(Debug, Clone)]
pub struct NoScriptRenderer {
    client: reqwest::Client,
    gate: ScanGate,
    timeout: Duration,
}

impl NoScriptRenderer {
    pub fn new(client: reqwest::Client, gate: ScanGate, timeout: Duration) -> Self {
        Self { client, gate, timeout }
    }

    async fn crawl(
        client: reqwest::Client,
        gate: ScanGate,
        mut scan: Scan,
        timeout: Duration,
        page_tx: mpsc::Sender<Scan>,
        link_tx: mpsc::Sender<Scan>,
    ) -> Result<(), RenderError> {
        let response = scan.send(&client, timeout).await?;
        scan.response = Some(response);
        scan.hit_count += 1;

        if gate.is_duplicate_page(&mut scan) {
            return Ok(());
        }

        let targets = scan
            .response
            .as_ref()
            .map(|r| extract_targets(&r.body))
            .unwrap_or_default();
        let links = follow_ups(&scan, targets);

        // Receivers may be gone if the caller lost interest
        let _ = page_tx.send(scan).await;
        drop(page_tx);

        for link in links {
            if link_tx.send(link).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Turn extracted targets into scans the job may crawl
fn follow_ups(scan: &Scan, targets: Vec<Target>) -> Vec<Scan> {
    let mut links = Vec::with_capacity(targets.len());
    for target in targets {
        let mut link = scan.spawn();
        if let Err(e) = link.merge_request(&target.method, &target.href, &target.body) {
            debug!(href = %target.href, "Skipping link: {}", e);
            continue;
        }
        if !matches!(link.request.url.scheme(), "http" | "https") || !link.is_scan_allowed() {
            continue;
        }
        if target.method == "POST" {
            link.request
                .headers
                .push(("Content-Type".to_string(), FORM_CONTENT_TYPE.to_string()));
        }
        links.push(link);
    }
    links
}

impl Renderer for NoScriptRenderer {
    fn render(&self, scan: Scan) -> RenderStreams {
        let (page_tx, page) = mpsc::channel(1);
        let (link_tx, links) = mpsc::channel(64);

        let client = self.client.clone();
        let gate = self.gate.clone();
        let timeout = self.timeout;
        let span = tracing::info_span!("render", job_id = %scan.job.id, url = %scan.request.url);

        let task = async move {
            let crawl = Self::crawl(client, gate, scan, timeout, page_tx, link_tx);
            let result = match tokio::time::timeout(timeout, crawl).await {
                Ok(result) => result,
                Err(_) => Err(RenderError::Timeout(timeout)),
            };
            if let Err(e) = result {
                warn!("NoScriptRenderer: {}", e);
            }
        };
        tokio::spawn(task.instrument(span));

        RenderStreams { page, links }
    }
}
