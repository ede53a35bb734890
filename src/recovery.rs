//! Fallback cascade for urls that direct fetching could not turn into text.
//!
//! Layers run in order and each only sees what the previous ones left:
//!
//! 1. a markdown-rendering reader proxy,
//! 2. a paid batch extraction API, limited to high-value domains,
//! 3. the search snippet, tagged with [`SNIPPET_MARKER`].
//!
//! A failure inside a layer only loses that url for that layer.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::batch::{BatchPlan, OverloadSignal, RetryPolicy, retry_with_backoff, run_in_batches};
use crate::config::RecoveryConfig;
use crate::data_models::{ExtractedContent, SearchResult};
use crate::errors::RecoveryError;
use crate::url_safety::has_allowed_scheme;

pub const SNIPPET_MARKER: &str = "[Source: search snippet]";

/// Hard cap of the extraction API per request.
pub const MAX_EXTRACT_BATCH: usize = 20;

const PROXY: &str = "reader proxy";
const EXTRACT: &str = "extract api";

/// Which layer recovered what.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub contents: Vec<ExtractedContent>,
    pub proxy_recovered: Vec<String>,
    pub extract_recovered: Vec<String>,
    pub snippet_recovered: Vec<String>,
    pub unrecovered: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ExtractRequest<'a> {
    urls: &'a [String],
    extract_depth: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    #[serde(default)]
    results: Vec<ExtractResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractResult {
    pub url: String,
    #[serde(default)]
    pub raw_content: Option<String>,
}

/// Client for the paid batch extraction endpoint (`POST {base}/extract`).
pub struct ExtractClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl ExtractClient {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: String, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout,
        }
    }

    /// At most [`MAX_EXTRACT_BATCH`] urls are sent; extra ones are ignored.
    pub async fn extract(&self, urls: &[String]) -> Result<Vec<ExtractResult>, RecoveryError> {
        let urls = &urls[..urls.len().min(MAX_EXTRACT_BATCH)];
        let res = self
            .client
            .post(format!("{}/extract", self.base_url))
            .timeout(self.timeout)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&ExtractRequest {
                urls,
                extract_depth: "advanced",
            })
            .send()
            .await
            .map_err(|e| RecoveryError::transport(EXTRACT, e))?;
        if !res.status().is_success() {
            return Err(RecoveryError::status(EXTRACT, res.status()));
        }
        let body: ExtractResponse = res
            .json()
            .await
            .map_err(|e| RecoveryError::transport(EXTRACT, e))?;
        Ok(body.results)
    }
}

pub struct RecoveryEngine {
    client: reqwest::Client,
    config: RecoveryConfig,
    extract: Option<ExtractClient>,
}

impl RecoveryEngine {
    /// The extraction layer is enabled only when an API key is configured.
    pub fn new(config: RecoveryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build recovery HTTP client")?;
        let extract = config.extract_api_key.clone().map(|key| {
            ExtractClient::new(
                client.clone(),
                &config.extract_base_url,
                key,
                config.extract_timeout,
            )
        });
        Ok(Self {
            client,
            config,
            extract,
        })
    }

    pub async fn recover(
        &self,
        failed_urls: &[String],
        search_results: &[SearchResult],
    ) -> Vec<ExtractedContent> {
        self.recover_with_report(failed_urls, search_results)
            .await
            .contents
    }

    pub async fn recover_with_report(
        &self,
        failed_urls: &[String],
        search_results: &[SearchResult],
    ) -> RecoveryReport {
        let mut seen = HashSet::new();
        let mut remaining: Vec<String> = failed_urls
            .iter()
            .filter(|u| has_allowed_scheme(u))
            .filter(|u| seen.insert(u.as_str()))
            .cloned()
            .collect();
        let mut report = RecoveryReport::default();
        if remaining.is_empty() {
            return report;
        }
        log::info!("recovering {} failed urls", remaining.len());

        let recovered = self.proxy_layer(&remaining).await;
        report.proxy_recovered = take_recovered(&mut remaining, &recovered);
        report.contents.extend(recovered);

        let recovered = self.extraction_layer(&remaining).await;
        report.extract_recovered = take_recovered(&mut remaining, &recovered);
        report.contents.extend(recovered);

        let recovered = snippet_layer(&remaining, search_results, self.config.min_snippet_chars);
        report.snippet_recovered = take_recovered(&mut remaining, &recovered);
        report.contents.extend(recovered);

        log::info!(
            "recovery: proxy {}, extract {}, snippet {}, lost {}",
            report.proxy_recovered.len(),
            report.extract_recovered.len(),
            report.snippet_recovered.len(),
            remaining.len()
        );
        report.unrecovered = remaining;
        report
    }

    async fn proxy_layer(&self, urls: &[String]) -> Vec<ExtractedContent> {
        let overload = OverloadSignal::new();
        let plan = BatchPlan::new(self.config.proxy_concurrency, self.config.overload_backoff);
        let retry = &self.config.retry;

        let per_url = |url: String| {
            let overload = &overload;
            async move {
                retry_with_backoff(|| self.fetch_via_proxy(&url), retry, Some(overload)).await
            }
        };
        let results = run_in_batches(urls.to_vec(), per_url, &plan, &overload).await;

        urls.iter()
            .zip(results)
            .filter_map(|(url, result)| match result {
                Ok(content) => Some(content),
                Err(e) => {
                    log::debug!("proxy could not recover {url}: {e}");
                    None
                }
            })
            .collect()
    }

    async fn fetch_via_proxy(&self, url: &str) -> Result<ExtractedContent, RecoveryError> {
        let proxy_url = format!("{}/{}", self.config.proxy_base_url.trim_end_matches('/'), url);
        let res = self
            .client
            .get(proxy_url)
            .timeout(self.config.proxy_timeout)
            .header(ACCEPT, "text/markdown")
            .send()
            .await
            .map_err(|e| RecoveryError::transport(PROXY, e))?;
        if !res.status().is_success() {
            return Err(RecoveryError::status(PROXY, res.status()));
        }
        let content_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.trim().to_ascii_lowercase());
        if let Some(content_type) = content_type.filter(|ct| !ct.starts_with("text/")) {
            return Err(RecoveryError::ContentType {
                endpoint: PROXY,
                content_type,
            });
        }
        let text = res
            .text()
            .await
            .map_err(|e| RecoveryError::transport(PROXY, e))?;
        let text = text.trim();
        let chars = text.chars().count();
        if chars <= self.config.min_content_chars {
            return Err(RecoveryError::TooShort {
                endpoint: PROXY,
                chars,
            });
        }
        Ok(ExtractedContent::new(url, markdown_title(text), text))
    }

    async fn extraction_layer(&self, urls: &[String]) -> Vec<ExtractedContent> {
        let Some(extract) = &self.extract else {
            return Vec::new();
        };
        let mut candidates: Vec<String> = urls
            .iter()
            .filter(|u| is_high_value(u, &self.config.high_value_domains))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }
        if candidates.len() > MAX_EXTRACT_BATCH {
            log::warn!(
                "{} high-value urls, only the first {MAX_EXTRACT_BATCH} go to the extract api",
                candidates.len()
            );
            candidates.truncate(MAX_EXTRACT_BATCH);
        }

        let retry: &RetryPolicy = &self.config.retry;
        let results = match retry_with_backoff(|| extract.extract(&candidates), retry, None).await {
            Ok(results) => results,
            Err(e) => {
                log::warn!("extract api failed for {} urls: {e}", candidates.len());
                return Vec::new();
            }
        };

        let mut recovered: Vec<ExtractedContent> = Vec::new();
        for result in results {
            let Some(url) = candidates
                .iter()
                .find(|c| same_url(c, &result.url))
                .cloned()
            else {
                continue;
            };
            if recovered.iter().any(|c| c.url == url) {
                continue;
            }
            let text = result.raw_content.as_deref().unwrap_or("").trim();
            if text.chars().count() <= self.config.min_content_chars {
                log::debug!("extract api returned too little for {url}");
                continue;
            }
            recovered.push(ExtractedContent::new(url, markdown_title(text), text));
        }
        recovered
    }
}

/// Fallback of last resort: the search snippet itself, clearly marked.
pub fn snippet_layer(
    urls: &[String],
    search_results: &[SearchResult],
    min_snippet_chars: usize,
) -> Vec<ExtractedContent> {
    let mut produced: HashSet<&str> = HashSet::new();
    let mut contents = Vec::new();
    for url in urls {
        if produced.contains(url.as_str()) {
            continue;
        }
        let hit = search_results.iter().find(|r| {
            same_url(&r.url, url) && r.snippet.trim().chars().count() > min_snippet_chars
        });
        if let Some(result) = hit {
            produced.insert(url.as_str());
            contents.push(ExtractedContent::new(
                url.as_str(),
                result.title.as_str(),
                format!("{SNIPPET_MARKER} {}", result.snippet.trim()),
            ));
        }
    }
    contents
}

/// Drop recovered urls from `remaining`; return them.
fn take_recovered(remaining: &mut Vec<String>, recovered: &[ExtractedContent]) -> Vec<String> {
    let done: HashSet<&str> = recovered.iter().map(|c| c.url.as_str()).collect();
    let (taken, rest): (Vec<String>, Vec<String>) = remaining
        .drain(..)
        .partition(|u| done.contains(u.as_str()));
    *remaining = rest;
    taken
}

/// Host equals a listed domain or is a subdomain of one.
pub fn is_high_value(url: &str, domains: &[String]) -> bool {
    let Some(host) = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    else {
        return false;
    };
    domains.iter().any(|d| {
        let d = d.to_ascii_lowercase();
        host == d || host.ends_with(&format!(".{d}"))
    })
}

/// First `# ` heading of a markdown document, or empty.
pub fn markdown_title(markdown: &str) -> String {
    markdown
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(|title| title.trim().to_string())
        .unwrap_or_default()
}

fn same_url(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}
