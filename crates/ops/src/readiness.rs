use std::time::Duration;

use metrics::{counter, histogram};
use portico_core::{condition_is_true, conditions_of, Condition, ReadinessSettings, RecordKey, ResourceRecord, RolloutError};
use portico_kubehub::{strip_managed_fields, ClusterApi};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to wait for, and for how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessQuery {
    pub api_version: String,
    pub key: RecordKey,
    pub condition: String,
    pub timeout: Duration,
    pub interval: Duration,
    /// Bound on a single status read. Never extends past the deadline.
    pub request_timeout: Duration,
}

impl ReadinessQuery {
    pub fn for_record(record: &ResourceRecord, settings: &ReadinessSettings) -> Self {
        Self {
            api_version: record.api_version.clone(),
            key: record.key(),
            condition: settings.condition.clone(),
            timeout: settings.timeout(),
            interval: settings.interval(),
            request_timeout: settings.request_timeout(),
        }
    }
}

/// State captured when a resource never reports ready.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticSnapshot {
    pub resource: String,
    pub waited_secs: u64,
    pub conditions: Vec<Condition>,
    /// Last observed object, `managedFields` stripped.
    pub state: Option<Json>,
    pub events: Vec<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReadinessOutcome {
    Ready { waited_ms: u64 },
    TimedOut(DiagnosticSnapshot),
    Cancelled,
}

impl ReadinessOutcome {
    pub fn is_ready(&self) -> bool { matches!(self, ReadinessOutcome::Ready { .. }) }

    /// Non-fatal warning for a timeout.
    pub fn warning(&self) -> Option<RolloutError> {
        match self {
            ReadinessOutcome::TimedOut(d) => {
                Some(RolloutError::ReadinessTimeout { resource: d.resource.clone(), waited_secs: d.waited_secs })
            }
            _ => None,
        }
    }
}

/// Stand-in deadline for timeouts too large to represent (about 30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Poll until `query.condition` is `True`, the deadline passes or `cancel` fires.
///
/// Reads are cut off at the deadline. A final poll happens at the deadline
/// itself and counts only if the control plane answers without waiting, so a
/// resource that turns ready exactly at the boundary is reported Ready.
pub async fn wait_ready(cluster: &dyn ClusterApi, query: &ReadinessQuery, cancel: &CancellationToken) -> ReadinessOutcome {
    let start = Instant::now();
    let deadline = start.checked_add(query.timeout).unwrap_or(start + FAR_FUTURE);
    let mut last_seen: Option<Json> = None;
    let mut last_error: Option<String> = None;
    let mut polls = 0u64;

    info!(resource = %query.key, condition = %query.condition, timeout_secs = query.timeout.as_secs(), "waiting for readiness");
    loop {
        let bound = deadline.saturating_duration_since(Instant::now()).min(query.request_timeout);
        polls += 1;
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                info!(resource = %query.key, "readiness wait cancelled");
                return ReadinessOutcome::Cancelled;
            }
            r = timeout(bound, cluster.get(&query.api_version, &query.key)) => r,
        };
        match read {
            Ok(Ok(Some(obj))) => {
                let conditions = conditions_of(obj.get("status"));
                if condition_is_true(&conditions, &query.condition) {
                    let waited = start.elapsed();
                    histogram!("readiness_wait_ms", waited.as_secs_f64() * 1000.0);
                    info!(resource = %query.key, waited_ms = waited.as_millis() as u64, polls, "resource ready");
                    return ReadinessOutcome::Ready { waited_ms: waited.as_millis() as u64 };
                }
                debug!(resource = %query.key, polls, "not ready yet");
                last_error = None;
                last_seen = Some(obj);
            }
            Ok(Ok(None)) => last_error = Some("resource not found".to_string()),
            Ok(Err(e)) => {
                debug!(resource = %query.key, error = %e, "status read failed");
                last_error = Some(e.to_string());
            }
            Err(_) if bound.is_zero() => last_error = Some("status read still pending at deadline".to_string()),
            Err(_) => last_error = Some(format!("status read exceeded {}ms", bound.as_millis())),
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let nap = query.interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(resource = %query.key, "readiness wait cancelled");
                return ReadinessOutcome::Cancelled;
            }
            _ = sleep(nap) => {}
        }
    }

    counter!("readiness_timeouts_total", 1u64);
    let snapshot = diagnose(cluster, query, start.elapsed(), last_seen, last_error).await;
    warn!(resource = %snapshot.resource, waited_secs = snapshot.waited_secs, conditions = snapshot.conditions.len(), "readiness timed out");
    ReadinessOutcome::TimedOut(snapshot)
}

async fn diagnose(
    cluster: &dyn ClusterApi,
    query: &ReadinessQuery,
    waited: Duration,
    last_seen: Option<Json>,
    last_error: Option<String>,
) -> DiagnosticSnapshot {
    let events = match timeout(query.request_timeout, cluster.events_for(&query.key)).await {
        Ok(Ok(ev)) => ev,
        Ok(Err(e)) => vec![format!("events unavailable: {}", e)],
        Err(_) => vec!["events unavailable: request timed out".to_string()],
    };
    let state = last_seen.map(|mut v| {
        strip_managed_fields(&mut v);
        v
    });
    DiagnosticSnapshot {
        resource: query.key.to_string(),
        waited_secs: waited.as_secs(),
        conditions: conditions_of(state.as_ref().and_then(|s| s.get("status"))),
        state,
        events,
        last_error,
    }
}
