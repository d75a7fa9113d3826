use std::time::Duration;

use http::Method;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use url::Url;

use crate::body::Body;
use crate::config::{
    Config, DEFAULT_USER_AGENT, PreparedRequest, ProxySetting, RequestOptions, StatusPolicy,
};
use crate::error::{Error, ErrorKind, TimeoutPhase, TransportErrorKind};
use crate::retry::RetryPolicy;

fn prepared(config: &Config, options: RequestOptions) -> PreparedRequest {
    match config.resolve(options).prepared {
        Ok(prepared) => prepared,
        Err(error) => panic!("request should resolve: {error}"),
    }
}

fn rejected(config: &Config, options: RequestOptions) -> Error {
    match config.resolve(options).prepared {
        Ok(_) => panic!("request should be rejected"),
        Err(error) => error,
    }
}

#[test]
fn defaults_apply_when_nothing_is_overridden() {
    let config = Config::default();
    let plan = config.resolve(RequestOptions::new("http://example.test/a"));

    assert_eq!(plan.method, Method::GET);
    assert!(!plan.wait);
    assert_eq!(plan.config.timeout, Duration::from_millis(6144));
    assert_eq!(plan.config.connect_timeout, plan.config.timeout);
    assert_eq!(plan.config.retry.configured_retries(), 3);
    assert_eq!(plan.config.retry.configured_delay(), Duration::from_millis(256));
    assert_eq!(plan.config.max_redirects, 4);
    assert!(plan.config.follow_redirect);
    assert!(!plan.config.tls.reject_unauthorized);
    assert!(plan.config.buffer_body);
    assert_eq!(plan.config.status_policy, StatusPolicy::Response);

    let Ok(prepared) = plan.prepared else {
        panic!("default request should resolve");
    };
    assert_eq!(
        prepared.headers.get(USER_AGENT).map(|value| value.as_bytes()),
        Some(DEFAULT_USER_AGENT.as_bytes())
    );
    assert_eq!(
        prepared.headers.get(ACCEPT).map(|value| value.as_bytes()),
        Some(&b"*/*"[..])
    );
    assert!(prepared.payload.is_none());
}

#[test]
fn per_call_options_override_client_defaults() {
    let config = Config::default()
        .timeout(Duration::from_secs(10))
        .retries(5)
        .wait(true);
    let plan = config.resolve(
        RequestOptions::new("http://example.test/")
            .timeout(Duration::from_millis(250))
            .connect_timeout(Duration::from_millis(50))
            .retries(1)
            .retry_delay(Duration::from_millis(10))
            .max_redirects(0)
            .raw_body(true)
            .wait(false),
    );

    assert_eq!(plan.config.timeout, Duration::from_millis(250));
    assert_eq!(plan.config.connect_timeout, Duration::from_millis(50));
    assert_eq!(plan.config.retry.configured_retries(), 1);
    assert_eq!(plan.config.retry.configured_delay(), Duration::from_millis(10));
    assert_eq!(plan.config.max_redirects, 0);
    assert!(!plan.config.buffer_body);
    assert!(!plan.wait);
}

#[test]
fn zero_timeout_is_clamped_to_one_millisecond() {
    let config = Config::default().timeout(Duration::ZERO);
    let plan = config.resolve(RequestOptions::new("http://example.test/").timeout(Duration::ZERO));
    assert_eq!(plan.config.timeout, Duration::from_millis(1));
}

#[test]
fn method_is_upper_cased() {
    let config = Config::default();
    let plan = config.resolve(RequestOptions::new("http://example.test/").method("patch"));
    assert_eq!(plan.method, Method::PATCH);
    assert!(plan.prepared.is_ok());
}

#[test]
fn invalid_method_is_a_bad_request() {
    let error = rejected(
        &Config::default(),
        RequestOptions::new("http://example.test/").method("GE T"),
    );
    assert_eq!(error.kind(), ErrorKind::BadRequest);
    assert_eq!(error.status(), 400);
}

#[test]
fn unparsable_url_is_a_bad_url() {
    let error = rejected(&Config::default(), RequestOptions::new("not a url"));
    assert_eq!(error.kind(), ErrorKind::BadUrl);
    assert_eq!(error.code(), 3);
    assert_eq!(error.status(), 400);
}

#[test]
fn unset_header_drops_a_default() {
    let request = prepared(
        &Config::default(),
        RequestOptions::new("http://example.test/")
            .unset_header("User-Agent")
            .header("x-trace", "abc"),
    );
    assert!(request.headers.get(USER_AGENT).is_none());
    assert_eq!(
        request.headers.get("x-trace").map(|value| value.as_bytes()),
        Some(&b"abc"[..])
    );
}

#[test]
fn auth_credentials_become_basic_authorization() {
    let request = prepared(
        &Config::default(),
        RequestOptions::new("http://example.test/").auth("user:pass"),
    );
    let value = request.headers.get(AUTHORIZATION).expect("authorization header");
    assert_eq!(value.as_bytes(), b"Basic dXNlcjpwYXNz");
    assert!(value.is_sensitive());
}

#[test]
fn body_content_type_only_fills_a_missing_header() {
    let config = Config::default();
    let json = prepared(
        &config,
        RequestOptions::new("http://example.test/")
            .method("POST")
            .body(Body::json(&serde_json::json!({ "k": 1 }))),
    );
    assert_eq!(
        json.headers.get(CONTENT_TYPE).map(|value| value.as_bytes()),
        Some(&b"application/json"[..])
    );

    let explicit = prepared(
        &config,
        RequestOptions::new("http://example.test/")
            .method("POST")
            .header("content-type", "text/plain")
            .body("a=b"),
    );
    assert_eq!(
        explicit.headers.get(CONTENT_TYPE).map(|value| value.as_bytes()),
        Some(&b"text/plain"[..])
    );
}

#[test]
fn retry_disabled_per_call_zeroes_the_budget() {
    let plan = Config::default().resolve(RequestOptions::new("http://example.test/").retry(false));
    assert_eq!(plan.config.retry.configured_retries(), 0);
}

#[test]
fn overall_deadline_spans_every_attempt_and_pause() {
    let config = Config::default()
        .timeout(Duration::from_millis(100))
        .retry_policy(RetryPolicy::standard().retries(2).delay(Duration::from_millis(50)));
    let plan = config.resolve(RequestOptions::new("http://example.test/"));
    assert_eq!(plan.config.overall_deadline(), Duration::from_millis(450));

    let disabled = Config::default()
        .timeout(Duration::from_millis(100))
        .retry_policy(RetryPolicy::disabled());
    let plan = disabled.resolve(RequestOptions::new("http://example.test/"));
    assert_eq!(plan.config.overall_deadline(), Duration::from_millis(356));
}

#[test]
fn proxy_setting_resolves_against_the_target() {
    let target = Url::parse("https://user:pw@example.test:8443/path?q=1").expect("target url");

    let none = Config::default().resolve(RequestOptions::new(target.as_str()));
    assert_eq!(none.config.proxy_url(&target).expect("no proxy"), None);

    let origin = Config::default()
        .proxy(ProxySetting::TargetOrigin)
        .resolve(RequestOptions::new(target.as_str()));
    let proxy = origin
        .config
        .proxy_url(&target)
        .expect("origin proxy")
        .expect("origin proxy url");
    assert_eq!(proxy.as_str(), "https://example.test:8443/");

    let explicit = Config::default().resolve(
        RequestOptions::new(target.as_str())
            .proxy(ProxySetting::Url("http://proxy.test:3128".to_owned())),
    );
    let proxy = explicit
        .config
        .proxy_url(&target)
        .expect("explicit proxy")
        .expect("explicit proxy url");
    assert_eq!(proxy.host_str(), Some("proxy.test"));

    let broken = Config::default().resolve(
        RequestOptions::new(target.as_str()).proxy(ProxySetting::Url("::".to_owned())),
    );
    let error = broken
        .config
        .proxy_url(&target)
        .expect_err("unparsable proxy");
    assert_eq!(error.kind(), ErrorKind::BadUrl);
}

#[test]
fn error_codes_and_statuses_follow_the_failure_class() {
    let source: crate::error::SharedError =
        std::sync::Arc::new(std::io::Error::other("connection reset"));

    let timeout = Error::Timeout {
        phase: TimeoutPhase::Attempt,
        timeout_ms: 100,
        method: Method::GET,
        uri: "http://example.test/".to_owned(),
    };
    assert_eq!((timeout.code(), timeout.status()), (28, 408));

    let aborted = Error::Aborted {
        method: Method::GET,
        uri: "http://example.test/".to_owned(),
    };
    assert_eq!((aborted.code(), aborted.status()), (42, 499));

    let empty = Error::from_transport(
        TransportErrorKind::EmptyReply,
        &Method::GET,
        "http://example.test/",
        source.clone(),
    );
    assert_eq!((empty.code(), empty.status()), (52, 503));

    let redirects = Error::from_transport(
        TransportErrorKind::TooManyRedirects,
        &Method::GET,
        "http://example.test/",
        source.clone(),
    );
    assert_eq!((redirects.code(), redirects.status()), (47, 429));

    let tls = Error::from_transport(
        TransportErrorKind::Tls,
        &Method::GET,
        "https://example.test/",
        source,
    );
    assert_eq!(tls.kind(), ErrorKind::Tls);
    assert_eq!(tls.transport_kind(), Some(TransportErrorKind::Tls));
    assert_eq!(tls.status(), 526);

    let bad_status = Error::BadStatus {
        status: 503,
        method: Method::GET,
        uri: "http://example.test/".to_owned(),
    };
    assert_eq!((bad_status.code(), bad_status.status()), (22, 503));
}

#[test]
fn only_protocol_violations_are_never_retried() {
    assert!(TransportErrorKind::Connect.is_retriable());
    assert!(TransportErrorKind::Timeout.is_retriable());
    assert!(TransportErrorKind::EmptyReply.is_retriable());
    assert!(!TransportErrorKind::MalformedUrl.is_retriable());
    assert!(!TransportErrorKind::TooManyRedirects.is_retriable());
}
