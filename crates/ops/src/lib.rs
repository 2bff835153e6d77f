//! Portico ops: everything that observes the cluster after apply.
//!
//! The readiness waiter is the only stage that blocks for long; it is bounded
//! by a deadline and a [`CancellationToken`](tokio_util::sync::CancellationToken).
//! Verification, probing and the smoke audit never raise: problems become
//! report fields that the rollout turns into warnings.

#![forbid(unsafe_code)]

mod probe;
mod readiness;
mod smoke;
mod verify;

pub use probe::{probe_targets, run_probes, HttpProbeTransport, ProbeResult, ProbeStatus, ProbeTarget, ProbeTransport};
pub use readiness::{wait_ready, DiagnosticSnapshot, ReadinessOutcome, ReadinessQuery};
pub use smoke::{smoke_audit, PathCheck, SmokeReport};
pub use verify::{verify_deployment, RouteObservation, VerificationReport};

/// Default API version for Gateway API kinds not present in the rendered document.
pub const GATEWAY_API_VERSION: &str = "gateway.networking.k8s.io/v1";
