use portico_core::{Finding, Severity, ValidationReport};
use portico_rollout::{RolloutReport, StageStatus};

fn status_label(s: StageStatus) -> &'static str {
    match s {
        StageStatus::Completed => "ok",
        StageStatus::Warned => "warn",
        StageStatus::Failed => "FAILED",
        StageStatus::Skipped => "skipped",
    }
}

pub fn print_report(report: &RolloutReport) {
    println!("rollout {} • {} • {}", report.id, report.environment, report.outcome.as_str());
    for s in &report.stages {
        if s.status == StageStatus::Skipped && s.detail.is_empty() {
            println!("  {:<14} {:<8}", s.stage.as_str(), status_label(s.status));
        } else {
            println!("  {:<14} {:<8} {:>6}ms  {}", s.stage.as_str(), status_label(s.status), s.took_ms, s.detail);
        }
    }
    if let Some(apply) = &report.payloads.apply {
        for r in &apply.records {
            println!("    {} {:?} +{} ~{} -{}", r.record, r.status, r.summary.adds, r.summary.updates, r.summary.removes);
        }
    }
    if let Some(probes) = &report.payloads.probes {
        for p in probes {
            println!("    probe {} • {:?} • {}ms • {}", p.target, p.status, p.latency_ms, p.detail);
        }
    }
    for w in &report.warnings {
        println!("  warning: {}", w);
    }
    if let Some(e) = &report.fatal {
        println!("  error: {}", e);
    }
}

fn finding_line(f: &Finding) -> String {
    let sev = match f.severity {
        Severity::Blocking => "blocking",
        Severity::Advisory => "advisory",
    };
    match &f.record {
        Some(k) => format!("  [{}] {} ({})", sev, f.message, k),
        None => format!("  [{}] {}", sev, f.message),
    }
}

pub fn print_findings(title: &str, report: &ValidationReport) {
    println!("{}: {} findings", title, report.findings.len());
    for f in &report.findings {
        println!("{}", finding_line(f));
    }
}
