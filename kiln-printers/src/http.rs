//! Shared HTTP transport for vendor adapters.
//!
//! All HTTP adapters retry transient failures (connection errors, timeouts
//! and 429/502/503/504) with exponential backoff, and raise everything else
//! immediately with the vendor's response text attached.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;

use crate::{PrinterError, PrinterResult};

/// Default per-request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Default number of attempts for transient failures.
pub const DEFAULT_RETRIES: u32 = 3;

/// Retrying HTTP client bound to one printer host.
pub struct HttpTransport {
    base: String,
    client: Client,
    api_key: Option<String>,
    retries: u32,
    backend: &'static str,
}

impl HttpTransport {
    /// Build a transport. `host` must be non-empty; a trailing slash is
    /// stripped. The API key, when present, is sent as `X-Api-Key` on every
    /// request.
    pub fn new(
        backend: &'static str,
        host: &str,
        api_key: Option<&str>,
        timeout_secs: u64,
        retries: u32,
    ) -> PrinterResult<Self> {
        if host.is_empty() {
            return Err(PrinterError::Validation("host must not be empty".into()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|err| PrinterError::Protocol {
                message: "failed to build HTTP client".into(),
                source: Some(Box::new(err)),
            })?;
        Ok(Self {
            base: host.trim_end_matches('/').to_string(),
            client,
            api_key: api_key.filter(|k| !k.is_empty()).map(str::to_string),
            retries: retries.max(1),
            backend,
        })
    }

    /// Base URL without trailing slash.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Fully-qualified URL from a relative API path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn apply_auth(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("X-Api-Key", key),
            None => builder,
        }
    }

    fn classify_status(status: StatusCode) -> Option<bool> {
        // None = success; Some(true) = retryable; Some(false) = fatal.
        if status.is_success() {
            return None;
        }
        let retryable = matches!(status.as_u16(), 429 | 502 | 503 | 504);
        Some(retryable)
    }

    /// Execute a request with exponential-backoff retries. `build` is
    /// called once per attempt so request bodies (multipart included) are
    /// rebuilt fresh.
    pub async fn send_with_retry<F>(&self, method_path: &str, build: F) -> PrinterResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut last_err: Option<PrinterError> = None;

        for attempt in 0..self.retries {
            let request = self.apply_auth(build(&self.client));
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    match Self::classify_status(status) {
                        None => return Ok(response),
                        Some(retryable) => {
                            let body = response.text().await.unwrap_or_default();
                            let body: String = body.chars().take(300).collect();
                            if status == StatusCode::UNAUTHORIZED
                                || status == StatusCode::FORBIDDEN
                            {
                                return Err(PrinterError::Auth(format!(
                                    "{} rejected credentials for {method_path}: {body}",
                                    self.backend
                                )));
                            }
                            let err = PrinterError::Http {
                                status: status.as_u16(),
                                message: format!(
                                    "{} returned HTTP {status} for {method_path}: {body}",
                                    self.backend
                                ),
                            };
                            if !retryable {
                                return Err(err);
                            }
                            last_err = Some(err);
                        }
                    }
                }
                Err(err) if err.is_timeout() => {
                    last_err = Some(PrinterError::Timeout {
                        message: format!(
                            "request to {} timed out (attempt {}/{})",
                            self.url(method_path),
                            attempt + 1,
                            self.retries
                        ),
                        source: Some(Box::new(err)),
                    });
                }
                Err(err) if err.is_connect() => {
                    last_err = Some(PrinterError::Unreachable {
                        message: format!(
                            "could not connect to {} at {} (attempt {}/{})",
                            self.backend,
                            self.base,
                            attempt + 1,
                            self.retries
                        ),
                        source: Some(Box::new(err)),
                    });
                }
                Err(err) => {
                    return Err(PrinterError::Protocol {
                        message: format!("request error for {method_path}"),
                        source: Some(Box::new(err)),
                    });
                }
            }

            if attempt + 1 < self.retries {
                let backoff = Duration::from_secs(1 << attempt);
                tracing::debug!(
                    backend = self.backend,
                    path = method_path,
                    attempt = attempt + 1,
                    retries = self.retries,
                    "retrying after {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_err.unwrap_or(PrinterError::Unreachable {
            message: format!("{} exhausted retries for {method_path}", self.backend),
            source: None,
        }))
    }

    /// GET `path` and parse the JSON body.
    pub async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> PrinterResult<Value> {
        let path_owned = path.to_string();
        let query_owned: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let response = self
            .send_with_retry(path, |client| {
                client.get(self.url(&path_owned)).query(&query_owned)
            })
            .await?;
        response.json().await.map_err(|err| PrinterError::Protocol {
            message: format!("invalid JSON in response from GET {path}"),
            source: Some(Box::new(err)),
        })
    }

    /// POST `path` with an optional JSON body and query string.
    pub async fn post(
        &self,
        path: &str,
        json: Option<&Value>,
        query: &[(&str, &str)],
    ) -> PrinterResult<Response> {
        let path_owned = path.to_string();
        let json_owned = json.cloned();
        let query_owned: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.send_with_retry(path, move |client| {
            let mut builder = client.post(self.url(&path_owned)).query(&query_owned);
            if let Some(body) = &json_owned {
                builder = builder.json(body);
            }
            builder
        })
        .await
    }

    /// GET `path` returning the raw bytes (snapshots).
    pub async fn get_bytes(&self, path: &str) -> PrinterResult<Vec<u8>> {
        let path_owned = path.to_string();
        let response = self
            .send_with_retry(path, |client| client.get(self.url(&path_owned)))
            .await?;
        let bytes = response.bytes().await.map_err(|err| PrinterError::Protocol {
            message: format!("failed reading body from GET {path}"),
            source: Some(Box::new(err)),
        })?;
        Ok(bytes.to_vec())
    }

    /// DELETE `path`.
    pub async fn delete(&self, path: &str) -> PrinterResult<Response> {
        let path_owned = path.to_string();
        self.send_with_retry(path, |client| client.delete(self.url(&path_owned)))
            .await
    }
}

/// Walk nested JSON objects safely, returning `None` on any miss.
pub fn json_path<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in keys {
        current = current.as_object()?.get(*key)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn get_json_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/printer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let transport =
            HttpTransport::new("octoprint", &server.uri(), None, 5, 1).unwrap();
        let body = transport.get_json("/api/printer", &[]).await.unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn api_key_sent_as_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/job"))
            .and(header("X-Api-Key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let transport =
            HttpTransport::new("octoprint", &server.uri(), Some("secret"), 5, 1).unwrap();
        transport.get_json("/api/job", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn retries_on_503_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": 1})))
            .mount(&server)
            .await;

        let transport = HttpTransport::new("moonraker", &server.uri(), None, 5, 3).unwrap();
        let body = transport.get_json("/flaky", &[]).await.unwrap();
        assert_eq!(body["ok"], 1);
    }

    #[tokio::test]
    async fn non_retryable_4xx_fails_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conflict"))
            .respond_with(ResponseTemplate::new(409).set_body_string("busy"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new("octoprint", &server.uri(), None, 5, 3).unwrap();
        let err = transport.get_json("/conflict", &[]).await.unwrap_err();
        match err {
            PrinterError::Http { status, .. } => assert_eq!(status, 409),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/secure"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let transport = HttpTransport::new("octoprint", &server.uri(), None, 5, 2).unwrap();
        let err = transport.get_json("/secure", &[]).await.unwrap_err();
        assert!(matches!(err, PrinterError::Auth(_)));
    }

    #[tokio::test]
    async fn connection_refused_maps_to_unreachable() {
        // Nothing is listening on this port.
        let transport =
            HttpTransport::new("moonraker", "http://127.0.0.1:1", None, 2, 1).unwrap();
        let err = transport.get_json("/printer/info", &[]).await.unwrap_err();
        assert!(matches!(err, PrinterError::Unreachable { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn empty_host_is_rejected() {
        assert!(HttpTransport::new("octoprint", "", None, 5, 3).is_err());
    }

    #[test]
    fn json_path_walks_and_misses() {
        let value = json!({"result": {"status": {"extruder": {"temperature": 205.0}}}});
        let temp = json_path(&value, &["result", "status", "extruder", "temperature"]);
        assert_eq!(temp.and_then(Value::as_f64), Some(205.0));
        assert!(json_path(&value, &["result", "missing"]).is_none());
    }
}
