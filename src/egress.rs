//! Egress verification through the local proxy.
//!
//! An [`EgressVerifier`] asks third-party IP-identification services
//! whether traffic leaving through the proxy is recognized as Tor. Each
//! endpoint speaks its own [`Dialect`]. Endpoints are tried in order, each
//! with a short exponential backoff; every outcome is a
//! [`VerificationResult`] value.

use crate::metrics::MetricsSink;
use crate::USER_AGENT;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Retries per endpoint after the first attempt.
pub const MAX_RETRIES: u32 = 2;

/// Delay before the first retry; doubles on each further retry.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Response format of a verification service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `check.torproject.org`: `{"IsTor": bool, "IP": "..."}`.
    TorProject,
    /// `check.dan.me.uk`: plain text containing "yes" or "no".
    DanMeUk,
    /// `ipinfo.io`: `{"ip": "...", "org": "..."}`, Tor when `org` mentions it.
    IpInfo,
    /// Anything else. Never verifies.
    Unknown,
}

#[derive(Deserialize)]
struct TorProjectBody {
    #[serde(rename = "IsTor")]
    is_tor: bool,
    #[serde(rename = "IP", default)]
    ip: String,
}

#[derive(Deserialize)]
struct IpInfoBody {
    #[serde(default)]
    ip: String,
    #[serde(default)]
    org: String,
}

impl Dialect {
    /// Pick the dialect from the URL host.
    pub fn detect(url: &str) -> Self {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_ascii_lowercase));

        let matches = |domain: &str| {
            host.as_deref()
                .is_some_and(|host| host == domain || host.ends_with(&format!(".{}", domain)))
        };

        if matches("check.torproject.org") {
            Dialect::TorProject
        } else if matches("check.dan.me.uk") {
            Dialect::DanMeUk
        } else if matches("ipinfo.io") {
            Dialect::IpInfo
        } else {
            Dialect::Unknown
        }
    }

    /// Interpret a response body as `(verified, observed ip)`.
    pub fn interpret(&self, body: &str) -> (bool, Option<String>) {
        let non_empty = |ip: String| Some(ip).filter(|ip| !ip.is_empty());

        match self {
            Dialect::TorProject => match serde_json::from_str::<TorProjectBody>(body) {
                Ok(parsed) => (parsed.is_tor, non_empty(parsed.ip)),
                Err(_) => (false, None),
            },
            Dialect::DanMeUk => (body.to_lowercase().contains("yes"), None),
            Dialect::IpInfo => match serde_json::from_str::<IpInfoBody>(body) {
                Ok(parsed) => (
                    parsed.org.to_lowercase().contains("tor"),
                    non_empty(parsed.ip),
                ),
                Err(_) => (false, None),
            },
            Dialect::Unknown => (false, None),
        }
    }
}

/// A verification service and how to read its answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationEndpoint {
    /// URL fetched through the proxy.
    pub url: String,
    /// How the answer is read, detected from the URL's host.
    pub dialect: Dialect,
}

impl VerificationEndpoint {
    /// Wrap `url`, detecting its dialect.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let dialect = Dialect::detect(&url);
        Self { url, dialect }
    }
}

/// Outcome of one [`EgressVerifier::check`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    /// Some endpoint confirmed Tor egress.
    pub success: bool,
    /// Traffic was identified as leaving through Tor.
    pub is_tor: bool,
    /// Exit address reported by the service, when it gave one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Endpoint that produced the verdict.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// When the check finished.
    pub checked_at: DateTime<Utc>,
    /// Why verification failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerificationResult {
    fn verified(endpoint: &str, ip: Option<String>) -> Self {
        Self {
            success: true,
            is_tor: true,
            ip,
            endpoint: Some(endpoint.to_string()),
            checked_at: Utc::now(),
            error: None,
        }
    }

    fn failed(endpoint: Option<&str>, error: String) -> Self {
        Self {
            success: false,
            is_tor: false,
            ip: None,
            endpoint: endpoint.map(str::to_string),
            checked_at: Utc::now(),
            error: Some(error),
        }
    }
}

/// Errors from a single probe request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// Could not reach the endpoint, or the body could not be read.
    #[error("{0}")]
    Transport(String),

    /// The endpoint answered with a non-2xx status.
    #[error("HTTP {0}")]
    Status(u16),
}

/// Issues one GET and returns the body of a 2xx response.
#[async_trait]
pub trait ProbeClient: Send + Sync {
    /// GET `url` and return the response body.
    async fn fetch(&self, url: &str) -> Result<String, ProbeError>;
}

/// [`ProbeClient`] that routes through a proxy with `reqwest`.
pub struct ReqwestProbe {
    client: reqwest::Client,
}

impl ReqwestProbe {
    /// Build a client that sends everything through `proxy_url`.
    pub fn new(proxy_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(proxy_url)?)
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ProbeClient for ReqwestProbe {
    async fn fetch(&self, url: &str) -> Result<String, ProbeError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| ProbeError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }

        response
            .text()
            .await
            .map_err(|err| ProbeError::Transport(err.to_string()))
    }
}

/// Checks that egress traffic leaves through Tor.
pub struct EgressVerifier {
    endpoints: Vec<VerificationEndpoint>,
    proxy_url: String,
    timeout: Duration,
    probe: Option<Arc<dyn ProbeClient>>,
    metrics: Arc<dyn MetricsSink>,
}

impl EgressVerifier {
    /// Verify through `proxy_url`, trying `endpoints` in order.
    pub fn new<I, S>(
        endpoints: I,
        proxy_url: impl Into<String>,
        timeout: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(VerificationEndpoint::new).collect(),
            proxy_url: proxy_url.into(),
            timeout,
            probe: None,
            metrics,
        }
    }

    /// Use `probe` for every check instead of a fresh proxied client.
    pub fn with_probe(mut self, probe: Arc<dyn ProbeClient>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Configured endpoints, in probe order.
    pub fn endpoints(&self) -> &[VerificationEndpoint] {
        &self.endpoints
    }

    /// Probe the endpoints, through a fresh proxied client unless a probe
    /// was injected with [`EgressVerifier::with_probe`].
    pub async fn check(&self) -> VerificationResult {
        if let Some(probe) = &self.probe {
            return self.check_with(probe.as_ref()).await;
        }

        match ReqwestProbe::new(&self.proxy_url, self.timeout) {
            Ok(probe) => self.check_with(&probe).await,
            Err(err) => {
                warn!(error = %err, proxy = %self.proxy_url, "failed to build egress probe client");
                VerificationResult::failed(None, format!("building probe client: {}", err))
            }
        }
    }

    /// Probe the endpoints with `probe`, stopping at the first verification.
    pub async fn check_with(&self, probe: &dyn ProbeClient) -> VerificationResult {
        let mut failures = Vec::with_capacity(self.endpoints.len());

        for endpoint in &self.endpoints {
            let result = self.check_endpoint(probe, endpoint).await;
            if result.success {
                return result;
            }
            if let Some(error) = result.error {
                failures.push(format!("{}: {}", endpoint.url, error));
            }
        }

        let error = if failures.is_empty() {
            "all endpoints failed".to_string()
        } else {
            format!("all endpoints failed ({})", failures.join("; "))
        };
        VerificationResult::failed(None, error)
    }

    async fn check_endpoint(
        &self,
        probe: &dyn ProbeClient,
        endpoint: &VerificationEndpoint,
    ) -> VerificationResult {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            match probe.fetch(&endpoint.url).await {
                Ok(body) => {
                    let (is_tor, ip) = endpoint.dialect.interpret(&body);
                    self.metrics.external_check(&endpoint.url, true, is_tor);

                    if is_tor {
                        debug!(endpoint = %endpoint.url, ip = ?ip, "egress verified");
                        return VerificationResult::verified(&endpoint.url, ip);
                    }

                    debug!(endpoint = %endpoint.url, "endpoint did not identify traffic as tor");
                    let mut result = VerificationResult::failed(
                        Some(&endpoint.url),
                        "traffic not identified as tor".to_string(),
                    );
                    result.ip = ip;
                    return result;
                }
                Err(err) => {
                    self.metrics.external_check(&endpoint.url, false, false);
                    debug!(endpoint = %endpoint.url, attempt, error = %err, "egress probe failed");
                    last_error = Some(err);
                }
            }
        }

        let cause = last_error.map(|err| err.to_string()).unwrap_or_default();
        VerificationResult::failed(
            Some(&endpoint.url),
            format!("failed after {} retries: {}", MAX_RETRIES, cause),
        )
    }
}
