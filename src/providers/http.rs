//! HTTP plumbing shared by the network backends
//!
//! Status classification, `Retry-After` parsing and a newline splitter over
//! a streaming response body (used for both SSE and NDJSON).

use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};

use crate::error::BackendError;

/// Longest error body excerpt kept in a backend error
const BODY_EXCERPT_BYTES: usize = 512;

/// Read a `Retry-After` header given in seconds
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Map a non-success status to a backend error
pub(crate) fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> BackendError {
    let mut excerpt = body.trim().to_string();
    crate::tools::truncate_utf8(&mut excerpt, BODY_EXCERPT_BYTES);
    if status == StatusCode::TOO_MANY_REQUESTS {
        BackendError::RateLimited {
            retry_after: parse_retry_after(headers),
        }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        BackendError::Unavailable(format!("HTTP {}: {}", status.as_u16(), excerpt))
    } else {
        BackendError::Permanent(format!("HTTP {}: {}", status.as_u16(), excerpt))
    }
}

/// Map a client-side failure to a backend error
pub(crate) fn classify_transport(error: &reqwest::Error) -> BackendError {
    if error.is_builder() {
        BackendError::Permanent(format!("invalid request: {}", error))
    } else {
        BackendError::Unavailable(error.to_string())
    }
}

/// Send a request and classify any non-success status
pub(crate) async fn send_checked(request: RequestBuilder) -> Result<Response, BackendError> {
    let response = request.send().await.map_err(|e| classify_transport(&e))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &headers, &body))
}

struct LineState {
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: Vec<u8>,
    done: bool,
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(|c| c == '\r' || c == '\n')
        .to_string()
}

/// Split a streaming body into lines
///
/// A transport error ends the stream after being yielded once. A trailing
/// line without a newline is still yielded.
pub(crate) fn line_stream(response: Response) -> BoxStream<'static, Result<String, BackendError>> {
    let state = LineState {
        bytes: response.bytes_stream().boxed(),
        buffer: Vec::new(),
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                return Some((Ok(decode_line(&line)), state));
            }
            if state.done {
                if state.buffer.is_empty() {
                    return None;
                }
                let rest = std::mem::take(&mut state.buffer);
                return Some((Ok(decode_line(&rest)), state));
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    state.done = true;
                    state.buffer.clear();
                    return Some((Err(classify_transport(&e)), state));
                }
                None => state.done = true,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_status_mapping() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, ""),
            BackendError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), ""),
            BackendError::RateLimited { retry_after: None }
        );
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, &HeaderMap::new(), "upstream"),
            BackendError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, &HeaderMap::new(), "bad key"),
            BackendError::Permanent(msg) if msg.contains("401")
        ));
    }

    #[test]
    fn test_fractional_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("0.05"));
        assert_eq!(
            parse_retry_after(&headers),
            Some(Duration::from_millis(50))
        );
        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[tokio::test]
    async fn test_line_stream_splits_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("one\r\ntwo\n\nthree"))
            .mount(&server)
            .await;

        let response = reqwest::get(server.uri()).await.unwrap();
        let lines: Vec<String> = line_stream(response)
            .map(|line| line.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["one", "two", "", "three"]);
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let client = reqwest::Client::new();
        let err = send_checked(client.get("http://127.0.0.1:1/"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }
}
