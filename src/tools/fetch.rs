//! Network fetch capability
//!
//! Fetches an http(s) URL with SSRF protection: loopback, private,
//! link-local and unspecified addresses are refused unless the host is
//! explicitly allow-listed. Host names are resolved before the request so a
//! public-looking name that points inward is also refused, and the request
//! is pinned to the address that was checked.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;
use url::Url;

use crate::error::CapabilityError;
use crate::tools::{
    parse_args, truncate_utf8, Capability, CapabilityOutput, InvocationContext, ValidatedArgs,
};

#[derive(Debug, Deserialize)]
struct FetchParams {
    url: String,
}

/// SSRF (Server-Side Request Forgery) prevention validator
#[derive(Debug, Clone, Default)]
pub struct SsrfValidator {
    allowed_hosts: Vec<String>,
}

impl SsrfValidator {
    /// Create a validator; `allowed_hosts` bypass the private address checks
    pub fn new(allowed_hosts: Vec<String>) -> Self {
        Self {
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }

    fn is_allowed_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.allowed_hosts.iter().any(|allowed| *allowed == host)
    }

    /// Check scheme and literal host of `url` without any network access
    ///
    /// # Errors
    ///
    /// Returns `ValidationRejected` for malformed URLs, schemes other than
    /// http and https, and literal private addresses
    pub fn validate(&self, url: &str) -> Result<Url, CapabilityError> {
        let parsed = Url::parse(url)
            .map_err(|e| CapabilityError::ValidationRejected(format!("invalid URL: {}", e)))?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(CapabilityError::ValidationRejected(format!(
                    "{}:// URLs are not allowed",
                    other
                )))
            }
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| CapabilityError::ValidationRejected("URL has no host".to_string()))?;
        if self.is_allowed_host(host) {
            return Ok(parsed);
        }
        if host.eq_ignore_ascii_case("localhost") {
            return Err(CapabilityError::ValidationRejected(
                "requests to localhost are not allowed".to_string(),
            ));
        }
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = IpAddr::from_str(literal) {
            check_ip(ip)?;
        }
        Ok(parsed)
    }

    /// Resolve the URL host and refuse private destinations
    ///
    /// Returns the checked address the request must connect to, or `None`
    /// when the host is allow-listed or an IP literal.
    pub async fn check_resolved(&self, url: &Url) -> Result<Option<SocketAddr>, CapabilityError> {
        let host = url
            .host_str()
            .ok_or_else(|| CapabilityError::ValidationRejected("URL has no host".to_string()))?;
        if self.is_allowed_host(host) {
            return Ok(None);
        }
        let port = url.port_or_known_default().unwrap_or(80);
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = IpAddr::from_str(literal) {
            check_ip(ip)?;
            return Ok(None);
        }
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((literal, port))
            .await
            .map_err(|e| CapabilityError::ExecutionFailed(format!("failed to resolve {}: {}", host, e)))?
            .collect();
        for addr in &addrs {
            check_ip(addr.ip())?;
        }
        addrs.first().copied().map(Some).ok_or_else(|| {
            CapabilityError::ExecutionFailed(format!("{} has no addresses", host))
        })
    }
}

/// Refuse loopback, private, link-local, broadcast and unspecified addresses
pub fn check_ip(ip: IpAddr) -> Result<(), CapabilityError> {
    let refused = match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.octets()[0] == 0
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().map_or(false, |v4| {
                    v4.is_loopback() || v4.is_private() || v4.is_link_local()
                })
        }
    };
    if refused {
        return Err(CapabilityError::ValidationRejected(format!(
            "requests to private address {} are not allowed",
            ip
        )));
    }
    Ok(())
}

/// The `fetch` capability
pub struct FetchCapability {
    client: reqwest::Client,
    validator: SsrfValidator,
    max_bytes: usize,
}

impl FetchCapability {
    /// Create the capability
    pub fn new(allowed_hosts: Vec<String>, max_bytes: usize) -> Self {
        let client = client_builder()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            validator: SsrfValidator::new(allowed_hosts),
            max_bytes,
        }
    }

    /// Client for one request; a pinned address bypasses a second DNS lookup
    fn client_for(
        &self,
        url: &Url,
        pinned: Option<SocketAddr>,
    ) -> Result<reqwest::Client, CapabilityError> {
        match (url.host_str(), pinned) {
            (Some(host), Some(addr)) => pinned_client(host, addr),
            _ => Ok(self.client.clone()),
        }
    }
}

fn client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder().redirect(reqwest::redirect::Policy::none())
}

fn pinned_client(host: &str, addr: SocketAddr) -> Result<reqwest::Client, CapabilityError> {
    client_builder()
        .resolve(host, addr)
        .build()
        .map_err(|e| CapabilityError::ExecutionFailed(format!("failed to build HTTP client: {}", e)))
}

#[async_trait]
impl Capability for FetchCapability {
    fn name(&self) -> &str {
        "fetch"
    }

    fn description(&self) -> &str {
        "Fetch the content of an http or https URL. Large responses are truncated."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "Absolute http(s) URL"
                }
            },
            "required": ["url"]
        })
    }

    fn validate(
        &self,
        args: &serde_json::Value,
        _ctx: &InvocationContext,
    ) -> Result<ValidatedArgs, CapabilityError> {
        let params: FetchParams = parse_args(self.name(), args)?;
        let url = self.validator.validate(&params.url)?;
        Ok(ValidatedArgs::new(self.name(), url))
    }

    async fn execute(
        &self,
        args: ValidatedArgs,
        deadline: Instant,
    ) -> Result<CapabilityOutput, CapabilityError> {
        let url: Url = args.into_params()?;
        let pinned = self.validator.check_resolved(&url).await?;
        let client = self.client_for(&url, pinned)?;

        let timeout = deadline.saturating_duration_since(Instant::now());
        let mut response = client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| CapabilityError::ExecutionFailed(format!("failed to fetch URL: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CapabilityError::ExecutionFailed(format!(
                "HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }

        let mut body: Vec<u8> = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| CapabilityError::ExecutionFailed(format!("failed to read body: {}", e)))?
        {
            let room = self.max_bytes.saturating_sub(body.len());
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        if body.contains(&0) {
            return Ok(CapabilityOutput::text("(binary content, not shown)"));
        }
        let mut text = String::from_utf8_lossy(&body).into_owned();
        if truncated {
            truncate_utf8(&mut text, self.max_bytes);
            text.push_str("\n... (response truncated)");
        }
        Ok(CapabilityOutput {
            text,
            truncated,
            ..CapabilityOutput::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> InvocationContext {
        InvocationContext::default()
    }

    #[test]
    fn test_ssrf_validator_schemes() {
        let validator = SsrfValidator::default();
        assert!(validator.validate("https://example.com").is_ok());
        assert!(validator.validate("http://example.com/a?b=c").is_ok());
        assert!(validator.validate("file:///etc/passwd").is_err());
        assert!(validator.validate("ftp://example.com").is_err());
        assert!(validator.validate("not a url").is_err());
    }

    #[test]
    fn test_ssrf_validator_private_literals() {
        let validator = SsrfValidator::default();
        for url in [
            "http://localhost/",
            "http://127.0.0.1/",
            "http://10.1.2.3/",
            "http://172.16.0.1/",
            "http://192.168.1.1/",
            "http://169.254.169.254/latest/meta-data",
            "http://0.0.0.0/",
            "http://[::1]/",
            "http://[fd00::1]/",
            "http://[fe80::1]/",
        ] {
            assert!(validator.validate(url).is_err(), "{} should be refused", url);
        }
        assert!(validator.validate("http://8.8.8.8/").is_ok());
    }

    #[test]
    fn test_ssrf_validator_allowed_host_bypass() {
        let validator = SsrfValidator::new(vec!["Sensor.Local".into(), "127.0.0.1".into()]);
        assert!(validator.validate("http://sensor.local/status").is_ok());
        assert!(validator.validate("http://127.0.0.1:8080/").is_ok());
        assert!(validator.validate("http://10.0.0.1/").is_err());
    }

    #[tokio::test]
    async fn test_resolved_loopback_is_refused() {
        let validator = SsrfValidator::default();
        let url = Url::parse("http://127.0.0.1:9/").unwrap();
        assert!(matches!(
            validator.check_resolved(&url).await,
            Err(CapabilityError::ValidationRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_literal_and_allow_listed_hosts_are_not_pinned() {
        let validator = SsrfValidator::new(vec!["sensor.local".into()]);
        let url = Url::parse("http://8.8.8.8:9/").unwrap();
        assert_eq!(validator.check_resolved(&url).await.unwrap(), None);
        let url = Url::parse("http://sensor.local/status").unwrap();
        assert_eq!(validator.check_resolved(&url).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pinned_client_connects_to_checked_address() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pinned"))
            .mount(&server)
            .await;

        // .invalid never resolves, so success means the pinned address was used
        let addr = *server.address();
        let client = pinned_client("status.invalid", addr).unwrap();
        let body = client
            .get(format!("http://status.invalid:{}/status", addr.port()))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "pinned");
    }

    #[tokio::test]
    async fn test_fetch_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("all good"))
            .mount(&server)
            .await;

        let fetch = FetchCapability::new(vec!["127.0.0.1".into()], 1024);
        let args = fetch
            .validate(&json!({"url": format!("{}/status", server.uri())}), &ctx())
            .unwrap();
        let output = fetch
            .execute(args, Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.text, "all good");
        assert!(!output.truncated);
    }

    #[tokio::test]
    async fn test_fetch_truncates_large_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(5000)))
            .mount(&server)
            .await;

        let fetch = FetchCapability::new(vec!["127.0.0.1".into()], 100);
        let args = fetch.validate(&json!({"url": server.uri()}), &ctx()).unwrap();
        let output = fetch
            .execute(args, Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.truncated);
        assert!(output.text.starts_with(&"x".repeat(100)));
        assert!(output.text.ends_with("(response truncated)"));
    }

    #[tokio::test]
    async fn test_fetch_http_error_is_execution_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetch = FetchCapability::new(vec!["127.0.0.1".into()], 100);
        let args = fetch.validate(&json!({"url": server.uri()}), &ctx()).unwrap();
        let result = fetch
            .execute(args, Instant::now() + Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(CapabilityError::ExecutionFailed(_))));
    }
}
