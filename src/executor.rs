//! The request executor — one HTTP transaction with bounded retries,
//! timeout, and hook-driven signing/retry decisions.
//!
//! One [`RequestExecutor`] is owned by one worker thread for its whole
//! lifetime: the `reqwest::blocking::Client` — and its connection pool and
//! TLS session cache — is built once and reused across transactions, the way
//! a libcurl easy handle is reused across `curl_easy_perform()` calls.
//! `init()` only resets the per-transaction scratch in [`Transaction`].

use crate::error::{FsError, FsResult};
use crate::hook::Hook;
use crate::stats;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{trace, warn};

/// HTTP method an executor transaction can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Put,
    Post,
    Delete,
}

impl Method {
    fn to_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Put => reqwest::Method::PUT,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Per-transaction scratch: headers, buffers, and the response fields a hook
/// inspects to sign a request or decide whether to retry.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub input_buffer: Option<Bytes>,
    pub response_code: Option<u16>,
    pub response_headers: Vec<(String, String)>,
    pub output_bytes: Bytes,
    pub last_modified: Option<SystemTime>,
}

impl Transaction {
    fn reset(&mut self, method: Method) {
        self.method = method;
        self.url.clear();
        self.query.clear();
        self.headers.clear();
        self.input_buffer = None;
        self.response_code = None;
        self.response_headers.clear();
        self.output_bytes = Bytes::new();
        self.last_modified = None;
    }

    /// Sets a request header, preserving insertion order and replacing an
    /// existing header of the same name (compared case-insensitively).
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(existing) = self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            existing.1 = value;
        } else {
            self.headers.push((name, value));
        }
    }

    /// Looks up a response header case-insensitively.
    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The URL with the query string applied.
    pub fn full_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        let qs = self
            .query
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    percent_encoding::utf8_percent_encode(k, percent_encoding::NON_ALPHANUMERIC),
                    percent_encoding::utf8_percent_encode(v, percent_encoding::NON_ALPHANUMERIC),
                )
            })
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{qs}", self.url)
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            method: Method::Get,
            url: String::new(),
            query: Vec::new(),
            headers: Vec::new(),
            input_buffer: None,
            response_code: None,
            response_headers: Vec::new(),
            output_bytes: Bytes::new(),
            last_modified: None,
        }
    }
}

/// Parses one response header line the way a line-oriented HTTP reader would:
/// strip trailing CR/LF, split on the first `:`, trim a single leading space
/// from the value. Lines without a colon are ignored.
pub fn parse_header_line(line: &str) -> Option<(String, String)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let idx = line.find(':')?;
    let name = &line[..idx];
    if name.is_empty() {
        return None;
    }
    let mut value = &line[idx + 1..];
    if let Some(stripped) = value.strip_prefix(' ') {
        value = stripped;
    }
    Some((name.to_string(), value.to_string()))
}

fn parse_http_date(value: &str) -> Option<SystemTime> {
    let dt = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let secs = dt.timestamp();
    if secs < 0 {
        return None;
    }
    #[allow(clippy::cast_sign_loss)]
    Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64))
}

enum AttemptOutcome {
    Completed,
    TimedOut,
    Transport(String),
}

/// Runs one HTTP transaction at a time with bounded retries.
///
/// Owned exclusively by one worker thread; never shared or made reentrant.
/// A canceled or timed-out executor rejects all further operations until
/// the pool worker replaces it with a fresh instance.
pub struct RequestExecutor {
    client: reqwest::blocking::Client,
    hook: Option<Arc<dyn Hook>>,
    txn: Transaction,
    canceled: bool,
    unusable: bool,
    max_transfer_retries: u32,
    run_count: u64,
    first_request_seen: bool,
    accumulated_elapsed: Duration,
    accumulated_bytes: u64,
    accumulated_retries: u64,
}

impl RequestExecutor {
    /// Builds a new executor with its own HTTP client session.
    pub fn new(max_transfer_retries: u32) -> Self {
        Self::with_client(
            reqwest::blocking::Client::builder()
                .build()
                .expect("reqwest client construction"),
            max_transfer_retries,
        )
    }

    /// Builds a new executor around a caller-supplied client (tests inject
    /// one pointed at a mock server's base URL via connection reuse rules
    /// that don't matter for correctness).
    pub fn with_client(client: reqwest::blocking::Client, max_transfer_retries: u32) -> Self {
        Self {
            client,
            hook: None,
            txn: Transaction::default(),
            canceled: false,
            unusable: false,
            max_transfer_retries: max_transfer_retries.max(1),
            run_count: 0,
            first_request_seen: false,
            accumulated_elapsed: Duration::ZERO,
            accumulated_bytes: 0,
            accumulated_retries: 0,
        }
    }

    /// Resets per-transaction fields for a new request. Fails if the
    /// executor has been canceled or discarded after a timeout.
    pub fn init(&mut self, method: Method) -> FsResult<()> {
        if self.canceled || self.unusable {
            return Err(FsError::Shutdown);
        }
        self.txn.reset(method);
        Ok(())
    }

    /// Sets the target URL, giving the hook a chance to rewrite the base.
    pub fn set_url(&mut self, base: &str, query: &[(String, String)]) {
        let adjusted = match &self.hook {
            Some(hook) => hook.adjust_url(base),
            None => base.to_string(),
        };
        self.txn.url = adjusted;
        self.txn.query = query.to_vec();
    }

    /// Sets a request header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.txn.set_header(name, value);
    }

    /// Appends a preformatted, already-encoded query string (e.g. from
    /// [`crate::hook::Hook::list_query`]) directly onto the current URL.
    pub fn set_raw_query(&mut self, query_string: &str) {
        if query_string.is_empty() {
            return;
        }
        self.txn.url = format!("{}?{query_string}", self.txn.url);
    }

    /// Returns the current request headers, in insertion order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.txn.headers
    }

    /// Sets the request body. Forbidden for methods other than PUT/POST when
    /// nonempty.
    pub fn set_input_buffer(&mut self, bytes: Bytes) -> FsResult<()> {
        if !bytes.is_empty() && !matches!(self.txn.method, Method::Put | Method::Post) {
            return Err(FsError::Misuse(format!(
                "body not allowed for {:?}",
                self.txn.method
            )));
        }
        self.txn.input_buffer = Some(bytes);
        Ok(())
    }

    /// Installs the signing/retry hook for this executor.
    pub fn set_hook(&mut self, hook: Arc<dyn Hook>) {
        self.hook = Some(hook);
    }

    /// Executes the transaction, retrying up to `max_transfer_retries` times.
    ///
    /// A deadline-exceeded attempt always reports [`FsError::TimedOut`] and
    /// discards the executor rather than risk reusing a connection that may
    /// still complete the prior attempt in the background.
    pub fn run(&mut self, timeout: Duration) -> FsResult<()> {
        if self.canceled || self.unusable {
            return Err(FsError::Shutdown);
        }
        let max = self.max_transfer_retries;
        let overall_start = Instant::now();
        let mut attempt = 0u32;
        let mut last_transport_err = String::new();

        loop {
            attempt += 1;
            if let Some(hook) = self.hook.clone() {
                hook.pre_run(&mut self.txn, attempt);
            }

            match self.do_attempt(timeout) {
                AttemptOutcome::Completed => {
                    self.accumulated_retries += u64::from(attempt.saturating_sub(1));
                    let code = self.txn.response_code.unwrap_or(0);
                    let retry_wanted = self
                        .hook
                        .as_ref()
                        .is_some_and(|h| h.should_retry(&self.txn, attempt));
                    if retry_wanted && attempt < max {
                        warn!(attempt, code, "hook requested retry on HTTP completion");
                        continue;
                    }
                    if code >= 300 && code != 404 {
                        warn!(code, url = %self.txn.url, "non-success HTTP status");
                    }
                    self.record_success(overall_start.elapsed());
                    return Ok(());
                }
                AttemptOutcome::TimedOut => {
                    self.unusable = true;
                    self.record_failure();
                    return Err(FsError::TimedOut);
                }
                AttemptOutcome::Transport(msg) => {
                    last_transport_err = msg;
                    if attempt >= max {
                        self.record_failure();
                        return Err(FsError::TransportFatal(last_transport_err));
                    }
                    trace!(attempt, error = %last_transport_err, "transport error, retrying");
                }
            }
        }
    }

    fn do_attempt(&mut self, timeout: Duration) -> AttemptOutcome {
        let method = self.txn.method.to_reqwest();
        let url = self.txn.full_url();
        let mut builder = self.client.request(method, &url).timeout(timeout);
        for (name, value) in &self.txn.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request_len = if let Some(body) = self.txn.input_buffer.clone() {
            let len = body.len();
            builder = builder.body(body);
            len
        } else {
            0
        };

        let response = match builder.send() {
            Ok(r) => r,
            Err(e) => {
                return if e.is_timeout() {
                    AttemptOutcome::TimedOut
                } else {
                    AttemptOutcome::Transport(e.to_string())
                };
            }
        };

        let status = response.status().as_u16();
        let mut response_headers = Vec::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                if let Some(pair) = parse_header_line(&format!("{}: {v}", name.as_str())) {
                    response_headers.push(pair);
                }
            }
        }

        match response.bytes() {
            Ok(body) => {
                self.accumulated_bytes += (request_len + body.len()) as u64;
                let last_modified = response_headers
                    .iter()
                    .find(|(n, _)| n.eq_ignore_ascii_case("last-modified"))
                    .and_then(|(_, v)| parse_http_date(v));
                self.txn.response_code = Some(status);
                self.txn.response_headers = response_headers;
                self.txn.output_bytes = body;
                self.txn.last_modified = last_modified;
                AttemptOutcome::Completed
            }
            Err(e) => {
                if e.is_timeout() {
                    AttemptOutcome::TimedOut
                } else {
                    AttemptOutcome::Transport(e.to_string())
                }
            }
        }
    }

    fn record_success(&mut self, elapsed: Duration) {
        self.run_count += 1;
        if self.first_request_seen {
            self.accumulated_elapsed += elapsed;
        } else {
            self.first_request_seen = true;
        }
    }

    fn record_failure(&mut self) {
        self.run_count += 1;
    }

    pub fn response_code(&self) -> Option<u16> {
        self.txn.response_code
    }

    pub fn response_headers(&self) -> &[(String, String)] {
        &self.txn.response_headers
    }

    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.txn.response_header(name)
    }

    pub fn output_bytes(&self) -> &Bytes {
        &self.txn.output_bytes
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.txn.last_modified
    }

    /// Terminal: once canceled, all further operations are rejected.
    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// False once canceled or discarded after a timeout; the pool replaces
    /// the executor before the next job rather than reusing it.
    pub fn is_usable(&self) -> bool {
        !self.canceled && !self.unusable
    }
}

impl Drop for RequestExecutor {
    fn drop(&mut self) {
        stats::GLOBAL_STATS.record(
            self.run_count,
            self.accumulated_elapsed,
            self.accumulated_bytes,
            self.accumulated_retries,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::ListingPage;

    #[test]
    fn header_line_parsing() {
        assert_eq!(
            parse_header_line("ETag: \"abc123\"\r\n"),
            Some(("ETag".to_string(), "\"abc123\"".to_string()))
        );
        assert_eq!(
            parse_header_line("Content-Length:42"),
            Some(("Content-Length".to_string(), "42".to_string()))
        );
        assert_eq!(parse_header_line("no colon here"), None);
        assert_eq!(parse_header_line(":value"), None);
    }

    #[test]
    fn set_header_is_case_insensitive_replace() {
        let mut txn = Transaction::default();
        txn.set_header("ETag", "one");
        txn.set_header("etag", "two");
        assert_eq!(txn.headers.len(), 1);
        assert_eq!(txn.headers[0].1, "two");
    }

    #[test]
    fn full_url_appends_encoded_query() {
        let mut txn = Transaction::default();
        txn.url = "https://example.com/bucket".to_string();
        txn.query = vec![("prefix".to_string(), "a b/c".to_string())];
        assert_eq!(txn.full_url(), "https://example.com/bucket?prefix=a%20b%2Fc");
    }

    #[test]
    fn full_url_without_query_is_unchanged() {
        let mut txn = Transaction::default();
        txn.url = "https://example.com/bucket/key".to_string();
        assert_eq!(txn.full_url(), "https://example.com/bucket/key");
    }

    #[test]
    fn body_forbidden_on_get() {
        let mut exec = RequestExecutor::new(3);
        exec.init(Method::Get).unwrap();
        let err = exec.set_input_buffer(Bytes::from_static(b"data")).unwrap_err();
        assert!(matches!(err, FsError::Misuse(_)));
    }

    #[test]
    fn empty_body_allowed_on_get() {
        let mut exec = RequestExecutor::new(3);
        exec.init(Method::Get).unwrap();
        assert!(exec.set_input_buffer(Bytes::new()).is_ok());
    }

    #[test]
    fn canceled_executor_rejects_init() {
        let mut exec = RequestExecutor::new(3);
        exec.cancel();
        assert!(exec.init(Method::Get).is_err());
    }

    #[derive(Debug)]
    struct NoRetryHook;
    impl Hook for NoRetryHook {
        fn adjust_url(&self, url: &str) -> String {
            url.to_string()
        }
        fn pre_run(&self, txn: &mut Transaction, _attempt: u32) {
            txn.set_header("x-test-attempt", "1");
        }
        fn should_retry(&self, _txn: &Transaction, _attempt: u32) -> bool {
            false
        }
        fn list_query(&self, _prefix: &str, _marker: Option<&str>) -> String {
            String::new()
        }
        fn parse_listing(&self, _body: &[u8]) -> FsResult<ListingPage> {
            Ok(ListingPage::default())
        }
        fn metadata_header_prefix(&self) -> &str {
            "x-amz-meta-"
        }
    }

    #[derive(Debug)]
    struct RetryOnceHook;
    impl Hook for RetryOnceHook {
        fn adjust_url(&self, url: &str) -> String {
            url.to_string()
        }
        fn pre_run(&self, _txn: &mut Transaction, _attempt: u32) {}
        fn should_retry(&self, txn: &Transaction, attempt: u32) -> bool {
            txn.response_code == Some(500) && attempt == 1
        }
        fn list_query(&self, _prefix: &str, _marker: Option<&str>) -> String {
            String::new()
        }
        fn parse_listing(&self, _body: &[u8]) -> FsResult<ListingPage> {
            Ok(ListingPage::default())
        }
        fn metadata_header_prefix(&self) -> &str {
            "x-amz-meta-"
        }
    }

    #[test]
    fn run_succeeds_against_mock_server() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/obj")
            .with_status(200)
            .with_header("etag", "\"xyz\"")
            .with_body("hello")
            .create();

        let mut exec = RequestExecutor::new(3);
        exec.set_hook(Arc::new(NoRetryHook));
        exec.init(Method::Get).unwrap();
        exec.set_url(&format!("{}/obj", server.url()), &[]);
        exec.run(Duration::from_secs(5)).unwrap();

        assert_eq!(exec.response_code(), Some(200));
        assert_eq!(exec.output_bytes().as_ref(), b"hello");
        assert_eq!(exec.response_header("etag"), Some("\"xyz\""));
        mock.assert();
    }

    #[test]
    fn run_retries_on_server_error_then_succeeds() {
        let mut server = mockito::Server::new();
        let fail_mock = server
            .mock("PUT", "/obj")
            .with_status(500)
            .expect(1)
            .create();
        let ok_mock = server
            .mock("PUT", "/obj")
            .with_status(200)
            .expect(1)
            .create();

        let mut exec = RequestExecutor::new(3);
        exec.set_hook(Arc::new(RetryOnceHook));
        exec.init(Method::Put).unwrap();
        exec.set_url(&format!("{}/obj", server.url()), &[]);
        exec.set_input_buffer(Bytes::from_static(b"x")).unwrap();
        exec.run(Duration::from_secs(5)).unwrap();

        assert_eq!(exec.response_code(), Some(200));
        fail_mock.assert();
        ok_mock.assert();
    }

    #[test]
    fn run_never_exceeds_max_retries() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/obj")
            .with_status(500)
            .expect(3)
            .create();

        #[derive(Debug)]
        struct AlwaysRetryHook;
        impl Hook for AlwaysRetryHook {
            fn adjust_url(&self, url: &str) -> String {
                url.to_string()
            }
            fn pre_run(&self, _txn: &mut Transaction, _attempt: u32) {}
            fn should_retry(&self, _txn: &Transaction, _attempt: u32) -> bool {
                true
            }
            fn list_query(&self, _prefix: &str, _marker: Option<&str>) -> String {
                String::new()
            }
            fn parse_listing(&self, _body: &[u8]) -> FsResult<ListingPage> {
                Ok(ListingPage::default())
            }
            fn metadata_header_prefix(&self) -> &str {
                "x-amz-meta-"
            }
        }

        let mut exec = RequestExecutor::new(3);
        exec.set_hook(Arc::new(AlwaysRetryHook));
        exec.init(Method::Get).unwrap();
        exec.set_url(&format!("{}/obj", server.url()), &[]);
        // should_retry always true, but the loop stops after max attempts and
        // still returns success with the last HTTP status (not a transport error).
        exec.run(Duration::from_secs(5)).unwrap();
        assert_eq!(exec.response_code(), Some(500));
        mock.assert();
    }

    #[test]
    fn run_fails_after_exhausting_transport_retries() {
        // Port 1 is reserved and nothing listens there, guaranteeing connect failure.
        let mut exec = RequestExecutor::new(2);
        exec.set_hook(Arc::new(NoRetryHook));
        exec.init(Method::Get).unwrap();
        exec.set_url("http://127.0.0.1:1/obj", &[]);
        let err = exec.run(Duration::from_millis(500));
        assert!(matches!(err, Err(FsError::TransportFatal(_))));
    }
}
