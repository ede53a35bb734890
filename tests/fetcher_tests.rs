use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Redirect};
use axum::routing::get;
use futures::future::BoxFuture;
use reqwest::Url;

use sourcegate::fetcher::Fetcher;
use sourcegate::url_safety::{Rejection, UrlGuard};

mod test_helpers {
    use super::*;

    /// Lets the loopback test server through, redirects included.
    pub struct AllowAll;

    impl UrlGuard for AllowAll {
        fn check<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<(), Rejection>> {
            Box::pin(async { Ok(()) })
        }

        fn check_redirect(&self, _url: &Url) -> Result<(), Rejection> {
            Ok(())
        }
    }

    /// Trusts the first hop only; redirect hops get the default check.
    pub struct AllowFirstHop;

    impl UrlGuard for AllowFirstHop {
        fn check<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<(), Rejection>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[derive(Default)]
    pub struct Counters {
        pub hits: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    async fn page(State(counters): State<Arc<Counters>>) -> Html<&'static str> {
        counters.hits.fetch_add(1, Ordering::SeqCst);
        Html("<html><head><title>Page</title></head><body>hello</body></html>")
    }

    async fn slow(State(counters): State<Arc<Counters>>) -> Html<&'static str> {
        counters.hits.fetch_add(1, Ordering::SeqCst);
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        Html("<html><body>slow</body></html>")
    }

    async fn hang() -> Html<&'static str> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Html("<html><body>late</body></html>")
    }

    pub async fn spawn_server() -> (SocketAddr, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let port = addr.port();
        let app = Router::new()
            .route("/page", get(page))
            .route("/slow", get(slow))
            .route("/hang", get(hang))
            .route("/plain", get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "plain body") }))
            .route(
                "/pdf",
                get(|| async { ([(header::CONTENT_TYPE, "application/pdf")], "%PDF-1.7") }),
            )
            .route("/forbidden", get(|| async { (StatusCode::FORBIDDEN, Html("no")) }))
            .route("/gone", get(|| async { (StatusCode::GONE, Html("gone")) }))
            .route(
                "/ratelimited",
                get(|| async { (StatusCode::TOO_MANY_REQUESTS, Html("slow down")) }),
            )
            .route(
                "/broken",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, Html("boom")).into_response() }),
            )
            .route("/redirect", get(|| async { Redirect::temporary("/page") }))
            .route(
                "/to-localhost",
                get(move || async move { Redirect::temporary(&format!("http://localhost:{port}/page")) }),
            )
            .route(
                "/to-loopback",
                get(move || async move { Redirect::temporary(&format!("http://127.0.0.1:{port}/page")) }),
            )
            .with_state(counters.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, counters)
    }

    pub fn url(addr: SocketAddr, path: &str) -> String {
        format!("http://{addr}{path}")
    }

    pub fn test_fetcher() -> Fetcher {
        Fetcher::with_guard(Arc::new(AllowAll)).unwrap()
    }
}

use test_helpers::*;

#[tokio::test]
async fn test_fetch_all_keeps_processable_pages_only() {
    let (addr, _) = spawn_server().await;
    let urls: Vec<String> = [
        "/page", "/plain", "/pdf", "/forbidden", "/gone", "/ratelimited", "/broken",
    ]
    .iter()
    .map(|p| url(addr, p))
    .collect();

    let pages = test_fetcher().fetch_all(&urls, Duration::from_secs(5), 4).await;

    let mut got: Vec<String> = pages.iter().map(|p| p.url.clone()).collect();
    got.sort();
    assert_eq!(got, vec![url(addr, "/page"), url(addr, "/plain")]);
    for page in &pages {
        assert_eq!(page.status_code, 200);
    }
    let plain = pages.iter().find(|p| p.url.ends_with("/plain")).unwrap();
    assert_eq!(plain.content_type, "text/plain");
    assert_eq!(plain.html, "plain body");
}

#[tokio::test]
async fn test_fetch_all_never_exceeds_max_concurrent() {
    let (addr, counters) = spawn_server().await;
    let urls: Vec<String> = (0..12).map(|i| url(addr, &format!("/slow?i={i}"))).collect();

    let pages = test_fetcher().fetch_all(&urls, Duration::from_secs(5), 3).await;

    assert_eq!(pages.len(), 12);
    assert_eq!(counters.hits.load(Ordering::SeqCst), 12);
    let max = counters.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 3, "saw {max} concurrent requests");
    assert!(max >= 1);
}

#[tokio::test]
async fn test_redirect_records_final_url() {
    let (addr, _) = spawn_server().await;
    let urls = vec![url(addr, "/redirect")];

    let pages = test_fetcher().fetch_all(&urls, Duration::from_secs(5), 2).await;

    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].url, url(addr, "/page"));
    assert_eq!(pages[0].requested_url, url(addr, "/redirect"));
    assert!(pages[0].html.contains("<title>Page</title>"));
}

#[tokio::test]
async fn test_same_final_url_is_fetched_once() {
    let (addr, _) = spawn_server().await;
    let urls = vec![url(addr, "/redirect"), url(addr, "/page")];

    let pages = test_fetcher().fetch_all(&urls, Duration::from_secs(5), 2).await;

    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].url, url(addr, "/page"));
}

#[tokio::test]
async fn test_timeouts_and_dead_hosts_degrade_to_drop() {
    let (addr, _) = spawn_server().await;
    // Port 9 on loopback is almost never listening.
    let urls = vec![
        url(addr, "/hang"),
        "http://127.0.0.1:9/nothing".to_string(),
        url(addr, "/page"),
    ];

    let pages = test_fetcher()
        .fetch_all(&urls, Duration::from_millis(300), 3)
        .await;

    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].url, url(addr, "/page"));
}

#[tokio::test]
async fn test_default_guard_skips_loopback_without_a_request() {
    let (addr, counters) = spawn_server().await;
    let urls = vec![url(addr, "/page"), "file:///etc/passwd".to_string()];

    let pages = Fetcher::new()
        .unwrap()
        .fetch_all(&urls, Duration::from_secs(5), 2)
        .await;

    assert!(pages.is_empty());
    assert_eq!(counters.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_redirects_to_internal_hosts_are_not_followed() {
    let (addr, counters) = spawn_server().await;
    let urls = vec![url(addr, "/to-localhost"), url(addr, "/to-loopback")];

    let pages = Fetcher::with_guard(Arc::new(AllowFirstHop))
        .unwrap()
        .fetch_all(&urls, Duration::from_secs(5), 2)
        .await;

    // The 307 itself is returned and dropped as a non-2xx response.
    assert!(pages.is_empty());
    assert_eq!(counters.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_redirect_alias_is_reported_not_dropped() {
    let (addr, _) = spawn_server().await;
    let urls = vec![url(addr, "/page"), url(addr, "/redirect")];

    let outcome = test_fetcher()
        .fetch_all_with_aliases(&urls, Duration::from_secs(5), 2)
        .await;

    assert_eq!(outcome.pages.len(), 1);
    assert_eq!(outcome.aliases.len(), 1);
    assert_eq!(outcome.pages[0].url, url(addr, "/page"));
    assert_eq!(outcome.aliases[0].final_url, url(addr, "/page"));
    // Every input is accounted for: one page, one alias.
    let mut accounted = vec![
        outcome.pages[0].requested_url.clone(),
        outcome.aliases[0].requested_url.clone(),
    ];
    accounted.sort();
    let mut expected = urls.clone();
    expected.sort();
    assert_eq!(accounted, expected);
}
