use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashSet;
use rand::seq::IndexedRandom;
use reqwest::StatusCode;
use reqwest::redirect::Policy;
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::data_models::FetchedPage;
use crate::url_safety::{DnsUrlGuard, UrlGuard};

/// Desktop browser strings. Rotating them gets past the laziest bot filters.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.6 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.7; rv:133.0) Gecko/20100101 Firefox/133.0",
];

pub const PROCESSABLE_CONTENT_TYPES: &[&str] =
    &["text/html", "application/xhtml+xml", "text/plain"];

/// Statuses that mean "go away" rather than "broken". Dropped without noise.
const QUIET_DROP_STATUSES: &[u16] = &[403, 404, 410, 451, 429];

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Blocked(u16),
    Status(u16),
    ContentType(String),
}

/// Decide whether a response is worth extracting.
pub fn classify_response(status: StatusCode, content_type: &str) -> Result<(), DropReason> {
    if QUIET_DROP_STATUSES.contains(&status.as_u16()) {
        return Err(DropReason::Blocked(status.as_u16()));
    }
    if !status.is_success() {
        return Err(DropReason::Status(status.as_u16()));
    }
    let media_type = media_type(content_type);
    if !PROCESSABLE_CONTENT_TYPES.contains(&media_type.as_str()) {
        return Err(DropReason::ContentType(media_type));
    }
    Ok(())
}

/// `"Text/HTML; charset=utf-8"` -> `"text/html"`.
fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// An input whose final url had already been fetched for another input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchAlias {
    pub requested_url: String,
    pub final_url: String,
}

/// What one `fetch_all` round produced.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub pages: Vec<FetchedPage>,
    pub aliases: Vec<FetchAlias>,
}

enum Fetched {
    Page(FetchedPage),
    Alias(FetchAlias),
}

/// Bounded-concurrency page fetcher behind an SSRF guard.
pub struct Fetcher {
    client: reqwest::Client,
    guard: Arc<dyn UrlGuard>,
}

impl Fetcher {
    pub fn new() -> Result<Fetcher> {
        Self::with_guard(Arc::new(DnsUrlGuard))
    }

    pub fn with_guard(guard: Arc<dyn UrlGuard>) -> Result<Fetcher> {
        let redirect_guard = guard.clone();
        let policy = Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error("too many redirects");
            }
            match redirect_guard.check_redirect(attempt.url()) {
                Ok(()) => attempt.follow(),
                Err(reason) => {
                    log::info!("not following redirect to {}: {reason}", attempt.url());
                    attempt.stop()
                }
            }
        });
        let client = reqwest::Client::builder()
            .redirect(policy)
            .build()
            .context("failed to build fetch HTTP client")?;
        Ok(Fetcher { client, guard })
    }

    /// Fetch every url with at most `max_concurrent` requests in flight.
    ///
    /// Returns the pages that came back processable, in completion order.
    /// Unsafe urls, bad statuses, wrong content types and transport errors
    /// are dropped; none of them fails the batch.
    pub async fn fetch_all(
        &self,
        urls: &[String],
        timeout: Duration,
        max_concurrent: usize,
    ) -> Vec<FetchedPage> {
        self.fetch_all_with_aliases(urls, timeout, max_concurrent)
            .await
            .pages
    }

    /// Like [`Fetcher::fetch_all`], but also reports inputs that landed on a
    /// final url another input already produced. Those are not failures.
    pub async fn fetch_all_with_aliases(
        &self,
        urls: &[String],
        timeout: Duration,
        max_concurrent: usize,
    ) -> FetchOutcome {
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let visited: Arc<DashSet<String>> = Arc::new(DashSet::new());
        let mut tasks = JoinSet::new();

        for url in urls {
            let url = url.clone();
            let client = self.client.clone();
            let guard = self.guard.clone();
            let semaphore = semaphore.clone();
            let visited = visited.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return None;
                };
                if let Err(reason) = guard.check(&url).await {
                    log::info!("skipping unsafe url {url}: {reason}");
                    return None;
                }
                let page = fetch_page(&client, &url, timeout).await?;
                if !visited.insert(page.url.clone()) {
                    log::debug!("{url} redirected to already fetched {}", page.url);
                    return Some(Fetched::Alias(FetchAlias {
                        requested_url: url,
                        final_url: page.url,
                    }));
                }
                Some(Fetched::Page(page))
            });
        }

        let mut outcome = FetchOutcome {
            pages: Vec::with_capacity(urls.len()),
            aliases: Vec::new(),
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(Fetched::Page(page))) => outcome.pages.push(page),
                Ok(Some(Fetched::Alias(alias))) => outcome.aliases.push(alias),
                Ok(None) => {}
                Err(e) => log::error!("fetch task failed: {:#}", e),
            }
        }
        log::info!("fetched {}/{} pages", outcome.pages.len(), urls.len());
        outcome
    }
}

async fn fetch_page(client: &reqwest::Client, url: &str, timeout: Duration) -> Option<FetchedPage> {
    let res = client
        .get(url)
        .timeout(timeout)
        .header(USER_AGENT, random_user_agent())
        .header(
            ACCEPT,
            "text/html,application/xhtml+xml,text/plain;q=0.9,*/*;q=0.5",
        )
        .send()
        .await;
    let res = match res {
        Ok(res) => res,
        Err(e) => {
            log::debug!("error fetching page {url}, error: {:#}", e);
            return None;
        }
    };

    let status = res.status();
    let content_type = res
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if let Err(reason) = classify_response(status, &content_type) {
        log::debug!("dropping {url}: {reason:?}");
        return None;
    }

    let final_url = res.url().to_string();
    match res.text().await {
        Ok(html) => Some(FetchedPage {
            url: final_url,
            requested_url: url.to_string(),
            html,
            status_code: status.as_u16(),
            content_type: media_type(&content_type),
        }),
        Err(e) => {
            log::debug!("error reading body of {url}, error: {:#}", e);
            None
        }
    }
}

#[test]
fn test_classify_response() {
    assert_eq!(classify_response(StatusCode::OK, "text/html; charset=utf-8"), Ok(()));
    assert_eq!(classify_response(StatusCode::OK, "Application/XHTML+XML"), Ok(()));
    assert_eq!(classify_response(StatusCode::OK, "text/plain"), Ok(()));
    for blocked in [403u16, 404, 410, 451, 429] {
        let status = StatusCode::from_u16(blocked).unwrap();
        assert_eq!(
            classify_response(status, "text/html"),
            Err(DropReason::Blocked(blocked))
        );
    }
    assert_eq!(
        classify_response(StatusCode::INTERNAL_SERVER_ERROR, "text/html"),
        Err(DropReason::Status(500))
    );
    assert_eq!(
        classify_response(StatusCode::OK, "application/pdf"),
        Err(DropReason::ContentType("application/pdf".into()))
    );
    assert_eq!(
        classify_response(StatusCode::OK, ""),
        Err(DropReason::ContentType("".into()))
    );
}

#[test]
fn test_random_user_agent_comes_from_pool() {
    for _ in 0..20 {
        assert!(USER_AGENTS.contains(&random_user_agent()));
    }
}
