use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use metrics::{counter, histogram};
use portico_core::{EnvironmentTarget, RolloutError};
use portico_kubehub::KubeCluster;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "via", rename_all = "snake_case")]
pub enum ProbeTarget {
    /// Through the gateway's public address, with `Host` set to the domain.
    External { url: String, host: String },
    /// Through the API server's service proxy.
    Internal { namespace: String, service: String, port: u16, path: String },
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeTarget::External { url, host } => write!(f, "{} (Host: {})", url, host),
            ProbeTarget::Internal { namespace, service, port, path } => {
                write!(f, "svc/{}/{}:{}{}", namespace, service, port, path)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub target: String,
    pub status: ProbeStatus,
    pub latency_ms: u64,
    pub detail: String,
}

impl ProbeResult {
    pub fn succeeded(&self) -> bool { self.status == ProbeStatus::Passed }

    fn skipped(target: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { target: target.into(), status: ProbeStatus::Skipped, latency_ms: 0, detail: detail.into() }
    }

    pub fn warning(&self) -> Option<RolloutError> {
        match self.status {
            ProbeStatus::Failed => Some(RolloutError::ProbeFailure { target: self.target.clone(), detail: self.detail.clone() }),
            ProbeStatus::Passed | ProbeStatus::Skipped => None,
        }
    }
}

/// Issues one GET and reports the HTTP status code.
#[async_trait::async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn get(&self, target: &ProbeTarget, timeout: Duration) -> Result<u16>;
}

/// reqwest for external probes, the kube service proxy for internal ones.
pub struct HttpProbeTransport {
    http: reqwest::Client,
    cluster: Option<Arc<KubeCluster>>,
}

impl HttpProbeTransport {
    /// Redirects are not followed: a 3xx already proves the route answers.
    pub fn new(cluster: Option<Arc<KubeCluster>>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("building probe HTTP client")?;
        Ok(Self { http, cluster })
    }
}

#[async_trait::async_trait]
impl ProbeTransport for HttpProbeTransport {
    async fn get(&self, target: &ProbeTarget, timeout: Duration) -> Result<u16> {
        match target {
            ProbeTarget::External { url, host } => {
                let resp = self
                    .http
                    .get(url)
                    .header(reqwest::header::HOST, host)
                    .timeout(timeout)
                    .send()
                    .await
                    .with_context(|| format!("GET {}", url))?;
                Ok(resp.status().as_u16())
            }
            ProbeTarget::Internal { namespace, service, port, path } => {
                let cluster = self.cluster.as_ref().ok_or_else(|| anyhow!("no cluster connection for internal probes"))?;
                cluster.service_proxy_get(namespace, service, *port, path).await
            }
        }
    }
}

enum Planned {
    Run(ProbeTarget),
    Skip(ProbeResult),
}

/// Probes that will actually run, in result order.
pub fn probe_targets(target: &EnvironmentTarget, address: Option<&str>) -> Vec<ProbeTarget> {
    plan(target, address)
        .into_iter()
        .filter_map(|p| match p {
            Planned::Run(t) => Some(t),
            Planned::Skip(_) => None,
        })
        .collect()
}

/// `host[:port]` part of an external probe URL. IPv6 literals get brackets.
fn url_authority(addr: &str) -> String {
    match addr.parse::<std::net::Ipv6Addr>() {
        Ok(v6) => format!("[{}]", v6),
        Err(_) => addr.to_string(),
    }
}

/// Externals first (one per path, or one Skipped when there is no address),
/// then one internal probe per configured service.
fn plan(target: &EnvironmentTarget, address: Option<&str>) -> Vec<Planned> {
    let mut out = Vec::new();
    match address {
        Some(addr) => {
            let authority = url_authority(addr);
            for path in &target.probes.external_paths {
                let path = if path.starts_with('/') { path.clone() } else { format!("/{}", path) };
                out.push(Planned::Run(ProbeTarget::External { url: format!("http://{}{}", authority, path), host: target.domain.clone() }));
            }
        }
        None => out.push(Planned::Skip(ProbeResult::skipped(
            format!("external {}", target.domain),
            "gateway has no assigned address",
        ))),
    }
    for p in &target.probes.internal {
        out.push(Planned::Run(ProbeTarget::Internal {
            namespace: target.namespace.clone(),
            service: p.service.clone(),
            port: p.port,
            path: p.path.clone(),
        }));
    }
    out
}

async fn probe_one(transport: &dyn ProbeTransport, target: ProbeTarget, limit: Duration, cancel: &CancellationToken) -> ProbeResult {
    let label = target.to_string();
    let t0 = Instant::now();
    let res = tokio::select! {
        biased;
        _ = cancel.cancelled() => return ProbeResult::skipped(label, "cancelled"),
        r = timeout(limit, transport.get(&target, limit)) => r,
    };
    let latency_ms = t0.elapsed().as_millis() as u64;
    histogram!("probe_latency_ms", latency_ms as f64);
    let (status, detail) = match res {
        Ok(Ok(code)) if (200..400).contains(&code) => (ProbeStatus::Passed, format!("HTTP {}", code)),
        Ok(Ok(code)) => (ProbeStatus::Failed, format!("HTTP {}", code)),
        Ok(Err(e)) => (ProbeStatus::Failed, format!("{:#}", e)),
        Err(_) => (ProbeStatus::Failed, format!("timed out after {}s", limit.as_secs())),
    };
    match status {
        ProbeStatus::Passed => debug!(probe = %label, latency_ms, "probe passed"),
        _ => warn!(probe = %label, latency_ms, detail = %detail, "probe failed"),
    }
    ProbeResult { target: label, status, latency_ms, detail }
}

/// Run every probe concurrently. Results keep target order.
pub async fn run_probes(
    transport: &dyn ProbeTransport,
    target: &EnvironmentTarget,
    address: Option<&str>,
    cancel: &CancellationToken,
) -> Vec<ProbeResult> {
    let limit = target.probes.timeout();
    let futs = plan(target, address).into_iter().map(|p| async move {
        match p {
            Planned::Run(t) => probe_one(transport, t, limit, cancel).await,
            Planned::Skip(r) => r,
        }
    });
    let results = join_all(futs).await;
    for r in &results {
        let status = match r.status {
            ProbeStatus::Passed => "passed",
            ProbeStatus::Failed => "failed",
            ProbeStatus::Skipped => "skipped",
        };
        counter!("probe_results_total", 1u64, "status" => status);
    }
    info!(
        total = results.len(),
        passed = results.iter().filter(|r| r.succeeded()).count(),
        "health probes finished"
    );
    results
}
