//! HTTP client for the remote sync API.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::error::{Result, SyncError};
use crate::ports::SyncTransport;
use crate::types::{ApiErrorResponse, PullResponse, PushRequest, PushResponse};

const MAX_LOG_BODY_CHARS: usize = 512;

/// Client for the remote sync API.
#[derive(Debug, Clone)]
pub struct SyncClient {
    client: reqwest::Client,
    base_url: String,
}

impl SyncClient {
    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("[Sync] API response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("[Sync] API response error ({}): {}", status, preview);
    }

    /// Create a new client. `timeout` bounds every request end to end.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create headers for an API request.
    fn headers(&self, token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| SyncError::auth("Invalid access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);
        Ok(headers)
    }

    /// Parse a JSON response body. An empty success body parses as `{}`.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(&body) {
                let message = if error.code.is_empty() {
                    error.message
                } else {
                    format!("{}: {}", error.code, error.message)
                };
                return Err(SyncError::api(status.as_u16(), message));
            }
            return Err(SyncError::api(
                status.as_u16(),
                format!("Request failed: {}", body),
            ));
        }

        let body = if body.trim().is_empty() { "{}" } else { body.as_str() };
        serde_json::from_str(body).map_err(|e| {
            log::error!("[Sync] Failed to deserialize response: {}", e);
            SyncError::api(status.as_u16(), format!("Failed to parse response: {}", e))
        })
    }
}

#[async_trait]
impl SyncTransport for SyncClient {
    /// `POST /sync/{table}` with `{records: [...]}`.
    async fn push_table(
        &self,
        token: &str,
        table: &str,
        records: &[serde_json::Value],
    ) -> Result<PushResponse> {
        let url = format!(
            "{}/sync/{}",
            self.base_url,
            urlencoding::encode(table)
        );
        let body = PushRequest {
            records: records.to_vec(),
        };

        let response = self
            .client
            .post(&url)
            .headers(self.headers(token)?)
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `GET /sync/pull?since=<timestamp>`.
    async fn pull_since(&self, token: &str, since: &str) -> Result<PullResponse> {
        let url = format!(
            "{}/sync/pull?since={}",
            self.base_url,
            urlencoding::encode(since)
        );

        let response = self
            .client
            .get(&url)
            .headers(self.headers(token)?)
            .send()
            .await?;

        Self::parse_response(response).await
    }
}

/// Scripted HTTP server for client and coordinator tests.
#[cfg(test)]
pub(crate) mod mock_server {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Debug, Clone)]
    pub struct CapturedRequest {
        pub method: String,
        pub path: String,
        pub headers: HashMap<String, String>,
        pub body: String,
    }

    #[derive(Debug, Clone)]
    pub enum MockOutcome {
        Respond {
            status: u16,
            body: String,
            delay_ms: u64,
        },
    }

    impl MockOutcome {
        pub fn ok(body: &str) -> Self {
            Self::Respond {
                status: 200,
                body: body.to_string(),
                delay_ms: 0,
            }
        }

        pub fn status(status: u16, body: &str) -> Self {
            Self::Respond {
                status,
                body: body.to_string(),
                delay_ms: 0,
            }
        }

        pub fn delayed(delay_ms: u64, body: &str) -> Self {
            Self::Respond {
                status: 200,
                body: body.to_string(),
                delay_ms,
            }
        }
    }

    pub fn api_error_body(code: &str, message: &str) -> String {
        format!(r#"{{"code":"{}","message":"{}"}}"#, code, message)
    }

    fn header_end_offset(buffer: &[u8]) -> Option<usize> {
        buffer.windows(4).position(|window| window == b"\r\n\r\n")
    }

    async fn read_http_request(stream: &mut tokio::net::TcpStream) -> Option<CapturedRequest> {
        let mut buffer = Vec::new();
        loop {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                return None;
            }
            buffer.extend_from_slice(&chunk[..read]);
            if header_end_offset(&buffer).is_some() {
                break;
            }
        }

        let header_end = header_end_offset(&buffer)?;
        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let mut lines = head.lines();
        let request_line = lines.next()?.to_string();
        let mut parts = request_line.split_whitespace();
        let method = parts.next()?.to_string();
        let path = parts.next()?.to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let content_length = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);

        let mut body = buffer[header_end + 4..].to_vec();
        while body.len() < content_length {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }

        Some(CapturedRequest {
            method,
            path,
            headers,
            body: String::from_utf8_lossy(&body).to_string(),
        })
    }

    fn status_text(status: u16) -> &'static str {
        match status {
            200 => "OK",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            _ => "Error",
        }
    }

    async fn write_http_response(
        stream: &mut tokio::net::TcpStream,
        status: u16,
        body: &str,
    ) -> std::io::Result<()> {
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            status_text(status),
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await
    }

    /// Starts a server answering requests with `outcomes` in order. Unscripted
    /// requests get a 500.
    pub async fn start(
        outcomes: Vec<MockOutcome>,
    ) -> (
        String,
        Arc<TokioMutex<Vec<CapturedRequest>>>,
        tokio::task::JoinHandle<()>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        let captured = Arc::new(TokioMutex::new(Vec::<CapturedRequest>::new()));
        let scripted = Arc::new(TokioMutex::new(VecDeque::from(outcomes)));
        let captured_clone = Arc::clone(&captured);
        let scripted_clone = Arc::clone(&scripted);

        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(value) => value,
                    Err(_) => break,
                };
                let captured_inner = Arc::clone(&captured_clone);
                let scripted_inner = Arc::clone(&scripted_clone);
                tokio::spawn(async move {
                    let Some(request) = read_http_request(&mut stream).await else {
                        return;
                    };
                    captured_inner.lock().await.push(request);

                    let outcome = scripted_inner.lock().await.pop_front().unwrap_or(
                        MockOutcome::Respond {
                            status: 500,
                            body: api_error_body("INTERNAL", "unexpected request"),
                            delay_ms: 0,
                        },
                    );

                    let MockOutcome::Respond {
                        status,
                        body,
                        delay_ms,
                    } = outcome;
                    if delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                    let _ = write_http_response(&mut stream, status, &body).await;
                });
            }
        });

        (format!("http://{}", addr), captured, handle)
    }
}
