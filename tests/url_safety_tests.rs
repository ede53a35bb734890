use sourcegate::url_safety::{DnsUrlGuard, Rejection, UrlGuard, check_url, is_safe};

#[tokio::test]
async fn test_literal_internal_addresses_are_unsafe() {
    for url in [
        "http://10.0.0.1/",
        "http://192.168.0.10:8080/admin",
        "http://169.254.169.254/latest/meta-data/",
        "http://127.0.0.2/",
        "http://[::1]/",
        "http://[fe80::1]/",
        "http://[::ffff:192.168.1.1]/",
        "http://224.0.0.251/",
        "http://0.0.0.0/",
        "http://localhost/",
    ] {
        assert!(!is_safe(url).await, "{url} should be rejected");
    }
}

#[tokio::test]
async fn test_obfuscated_loopback_is_unsafe() {
    // The url parser normalises these to 127.0.0.1.
    for url in ["http://0x7f000001/", "http://2130706433/", "http://127.1/"] {
        assert!(!is_safe(url).await, "{url} should be rejected");
    }
}

#[tokio::test]
async fn test_bad_schemes_and_shapes_are_unsafe() {
    assert_eq!(
        check_url("ftp://8.8.8.8/file").await,
        Err(Rejection::Scheme("ftp".into()))
    );
    assert_eq!(
        check_url("javascript:alert(1)").await,
        Err(Rejection::Scheme("javascript".into()))
    );
    assert_eq!(check_url("not a url").await, Err(Rejection::Malformed));
    assert_eq!(
        check_url("http://LOCALHOST:3000/").await,
        Err(Rejection::BlockedHost("localhost".into()))
    );
}

#[tokio::test]
async fn test_v6_forms_reaching_internal_v4_are_unsafe() {
    for url in [
        "http://[::127.0.0.1]/",
        "http://[::a9fe:a9fe]/",
        "http://[64:ff9b::a9fe:a9fe]/latest/meta-data/",
        "http://[2002:a9fe:a9fe::1]/",
    ] {
        assert!(!is_safe(url).await, "{url} should be rejected");
    }
}

#[tokio::test]
async fn test_reserved_v6_ranges_are_unsafe() {
    for url in ["http://[100::1]/", "http://[2001::1]/", "http://[2001:db8::1]/"] {
        assert!(!is_safe(url).await, "{url} should be rejected");
    }
}

#[tokio::test]
async fn test_public_literal_address_is_safe() {
    assert!(is_safe("http://8.8.8.8/").await);
    assert!(is_safe("https://[2606:4700:4700::1111]/dns-query").await);
    assert!(is_safe("http://[64:ff9b::808:808]/").await);
}

#[tokio::test]
async fn test_rejection_names_the_resolved_address() {
    let err = check_url("http://10.1.2.3:8443/").await.unwrap_err();
    assert_eq!(
        err,
        Rejection::NonPublicAddress {
            host: "10.1.2.3".into(),
            ip: "10.1.2.3".parse().unwrap(),
        }
    );
}

#[tokio::test]
async fn test_dns_guard_matches_check_url() {
    let guard = DnsUrlGuard;
    assert!(guard.check("http://172.16.5.4/").await.is_err());
    assert!(guard.check("http://1.1.1.1/").await.is_ok());
}
