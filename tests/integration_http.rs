#![cfg(feature = "hyper-transport")]

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use http::StatusCode;
use reqwire::prelude::{
    Body, Client, Config, ErrorKind, FileSink, RequestOptions, TimeoutPhase, TransportErrorKind,
};
use reqwire::{Error, MetricsSnapshot};
use serde_json::{Value, json};

#[derive(Clone)]
struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Duration,
}

impl MockResponse {
    fn new(
        status: u16,
        headers: Vec<(impl Into<String>, impl Into<String>)>,
        body: impl Into<String>,
    ) -> Self {
        Self::new_bytes(status, headers, body.into().into_bytes(), Duration::ZERO)
    }

    fn new_bytes(
        status: u16,
        headers: Vec<(impl Into<String>, impl Into<String>)>,
        body: impl Into<Vec<u8>>,
        delay: Duration,
    ) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
            body: body.into(),
            delay,
        }
    }

    fn text(status: u16, body: &str) -> Self {
        Self::new(status, Vec::<(String, String)>::new(), body)
    }

    fn redirect(status: u16, location: &str) -> Self {
        Self::new(status, vec![("Location", location)], "")
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

struct MockServer {
    base_url: String,
    served: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let served = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let served_clone = Arc::clone(&served);
        let captured_clone = Arc::clone(&captured);

        let join = thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(3);
            let mut response_index = 0;

            while response_index < responses.len() && std::time::Instant::now() < deadline {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        if let Ok(request) = read_request(&mut stream) {
                            captured_clone
                                .lock()
                                .expect("lock captured requests")
                                .push(request);
                        }

                        served_clone.fetch_add(1, Ordering::SeqCst);
                        let response = &responses[response_index];
                        response_index += 1;

                        if !response.delay.is_zero() {
                            thread::sleep(response.delay);
                        }

                        let _ = write_response(&mut stream, response);
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            base_url: format!("http://{address}"),
            served,
            captured,
            join: Some(join),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn requests(&self) -> Vec<CapturedRequest> {
        self.captured
            .lock()
            .expect("lock captured requests")
            .clone()
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<CapturedRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;

    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
        if find_header_end(&raw).is_some() {
            break;
        }
    }

    let header_end = find_header_end(&raw).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "malformed request without header terminator",
        )
    })?;

    let header_text = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "missing request line")
    })?;
    let mut request_line_parts = request_line.split_whitespace();
    let method = request_line_parts.next().unwrap_or_default().to_owned();
    let path = request_line_parts.next().unwrap_or_default().to_owned();

    let mut headers = BTreeMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(CapturedRequest {
        method,
        path,
        headers,
        body,
    })
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) -> std::io::Result<()> {
    let body = &response.body;
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        status_text(response.status),
        body.len()
    );
    for (name, value) in &response.headers {
        raw.push_str(name);
        raw.push_str(": ");
        raw.push_str(value);
        raw.push_str("\r\n");
    }
    raw.push_str("\r\n");

    stream.write_all(raw.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn gzip_bytes(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .expect("write gzip source bytes should succeed");
    encoder.finish().expect("finish gzip stream should succeed")
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        307 => "Temporary Redirect",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn test_client(config: Config) -> Client {
    Client::builder()
        .config(config)
        .metrics_enabled(true)
        .try_build()
        .expect("client should build")
}

fn quick() -> Config {
    Config::default()
        .timeout(Duration::from_secs(2))
        .retries(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_returns_body_and_sends_default_headers() {
    let server = MockServer::start(vec![MockResponse::new(
        200,
        vec![("Content-Type", "application/json")],
        r#"{"ok":true}"#,
    )]);
    let client = test_client(quick());

    let response = client
        .get(server.url("/v1/items?page=2"))
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.header("content-type"), Some("application/json"));
    let body: Value = response.json().expect("json body");
    assert_eq!(body, json!({ "ok": true }));
    assert_eq!(response.attempts(), 1);

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/v1/items?page=2");
    assert_eq!(
        requests[0].headers.get("accept-encoding").map(String::as_str),
        Some("gzip, deflate")
    );
    assert_eq!(requests[0].headers.get("accept").map(String::as_str), Some("*/*"));
    assert!(
        requests[0]
            .headers
            .get("user-agent")
            .is_some_and(|value| value.starts_with("Mozilla/5.0"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_json_body_carries_content_type() {
    let server = MockServer::start(vec![MockResponse::text(201, "created")]);
    let client = test_client(quick());

    let response = client
        .post(server.url("/items"), Body::json(&json!({ "name": "wire" })))
        .await
        .expect("post should succeed");
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.text_lossy(), "created");

    let requests = server.requests();
    assert_eq!(requests[0].method, "POST");
    assert_eq!(
        requests[0].headers.get("content-type").map(String::as_str),
        Some("application/json")
    );
    let sent: Value = serde_json::from_slice(&requests[0].body).expect("sent json");
    assert_eq!(sent, json!({ "name": "wire" }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirect_is_followed_and_location_is_backfilled() {
    let server = MockServer::start(vec![
        MockResponse::redirect(302, "/final"),
        MockResponse::new(200, vec![("X-Hop", "last")], "landed"),
    ]);
    let client = test_client(quick());

    let response = client
        .get(server.url("/start"))
        .await
        .expect("redirected request should succeed");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text_lossy(), "landed");
    assert_eq!(response.header("x-hop"), Some("last"));
    assert_eq!(response.header("location"), Some("/final"));
    assert_eq!(response.url().path(), "/start");

    let paths = server
        .requests()
        .into_iter()
        .map(|request| request.path)
        .collect::<Vec<_>>();
    assert_eq!(paths, vec!["/start".to_owned(), "/final".to_owned()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn see_other_switches_post_to_get_without_body() {
    let server = MockServer::start(vec![
        MockResponse::redirect(303, "/result"),
        MockResponse::text(200, "done"),
    ]);
    let client = test_client(quick());

    client
        .post(server.url("/submit"), "a=1&b=2")
        .await
        .expect("post with see-other should succeed");

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].body, b"a=1&b=2");
    assert_eq!(requests[1].method, "GET");
    assert!(requests[1].body.is_empty());
    assert!(!requests[1].headers.contains_key("content-type"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirect_limit_is_a_non_retriable_failure() {
    let server = MockServer::start(vec![
        MockResponse::redirect(302, "/a"),
        MockResponse::redirect(302, "/b"),
    ]);
    let client = test_client(quick().max_redirects(1).retries(3));

    let error = client
        .get(server.url("/loop"))
        .await
        .expect_err("redirect limit should fail");

    assert_eq!(
        error.transport_kind(),
        Some(TransportErrorKind::TooManyRedirects)
    );
    assert_eq!(error.status(), 429);
    assert_eq!(server.served_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirect_is_returned_when_following_is_disabled() {
    let server = MockServer::start(vec![MockResponse::redirect(301, "/elsewhere")]);
    let client = test_client(quick().follow_redirect(false));

    let response = client
        .get(server.url("/moved"))
        .await
        .expect("redirect response");
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.header("location"), Some("/elsewhere"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gzip_body_is_decoded_and_encoding_headers_dropped() {
    let payload = "compressible ".repeat(64);
    let server = MockServer::start(vec![MockResponse::new_bytes(
        200,
        vec![("Content-Encoding", "gzip")],
        gzip_bytes(payload.as_bytes()),
        Duration::ZERO,
    )]);
    let client = test_client(quick());

    let response = client
        .get(server.url("/gz"))
        .await
        .expect("gzip response");

    assert_eq!(response.text_lossy(), payload);
    assert!(response.header("content-encoding").is_none());
    assert!(response.header("content-length").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_status_is_retried_against_a_live_server() {
    let server = MockServer::start(vec![
        MockResponse::text(503, "busy"),
        MockResponse::text(200, "ready"),
    ]);
    let client = test_client(
        Config::default()
            .timeout(Duration::from_secs(2))
            .retries(3)
            .retry_delay(Duration::from_millis(10)),
    );

    let response = client
        .get(server.url("/flaky"))
        .await
        .expect("retry should recover");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text_lossy(), "ready");
    assert_eq!(response.attempts(), 2);
    assert_eq!(server.served_count(), 2);

    let metrics: MetricsSnapshot = client.metrics_snapshot();
    assert_eq!(metrics.retries, 1);
    assert_eq!(metrics.status_counts.get(&200), Some(&1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_server_hits_the_attempt_timeout() {
    let server = MockServer::start(vec![MockResponse::new_bytes(
        200,
        Vec::<(String, String)>::new(),
        b"late".to_vec(),
        Duration::from_millis(400),
    )]);
    let client = test_client(Config::default().timeout(Duration::from_millis(100)).retries(0));

    let error = client
        .get(server.url("/slow"))
        .await
        .expect_err("slow response should time out");

    match error {
        Error::Timeout { phase, .. } => assert_eq!(phase, TimeoutPhase::Attempt),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connection_is_a_connect_error() {
    let address = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind scratch listener");
        listener.local_addr().expect("scratch address")
    };
    let client = test_client(quick());

    let error = client
        .get(format!("http://{address}/"))
        .await
        .expect_err("nothing listens on the scratch port");

    assert_eq!(error.kind(), ErrorKind::Transport);
    assert_eq!(error.transport_kind(), Some(TransportErrorKind::Connect));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_scheme_is_rejected_by_the_transport() {
    let client = test_client(quick().retries(2));

    let error = client
        .get("ftp://example.test/file")
        .await
        .expect_err("ftp is not supported");

    assert_eq!(
        error.transport_kind(),
        Some(TransportErrorKind::UnsupportedProtocol)
    );
    assert_eq!(client.metrics_snapshot().attempts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn url_credentials_become_basic_auth() {
    let server = MockServer::start(vec![MockResponse::text(200, "hi")]);
    let client = test_client(quick());
    let url = server.base_url.replace("http://", "http://user:pass@");

    client
        .get(format!("{url}/private"))
        .await
        .expect("request with credentials");

    let requests = server.requests();
    assert_eq!(
        requests[0].headers.get("authorization").map(String::as_str),
        Some("Basic dXNlcjpwYXNz")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn body_is_piped_into_a_file_sink() {
    let server = MockServer::start(vec![MockResponse::text(200, "file contents")]);
    let client = test_client(quick());
    let directory = tempfile::tempdir().expect("temp dir");
    let path = directory.path().join("download.txt");

    let sink = FileSink::create(&path).await.expect("create file sink");
    let response = client
        .request(RequestOptions::new(server.url("/download")).wait(true).no_storage(true))
        .pipe(sink)
        .send()
        .await
        .expect("download should succeed");

    assert!(response.body().is_empty());
    let written = std::fs::read_to_string(&path).expect("read downloaded file");
    assert_eq!(written, "file contents");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_download_removes_the_partial_file() {
    let directory = tempfile::tempdir().expect("temp dir");
    let path = directory.path().join("partial.bin");
    let client = test_client(quick());

    let sink = FileSink::create(&path).await.expect("create file sink");
    let error = client
        .request(RequestOptions::new("not a url").wait(true))
        .pipe(sink)
        .send()
        .await
        .expect_err("bad url");

    assert_eq!(error.kind(), ErrorKind::BadUrl);
    assert!(!path.exists());
}
