use serde::{Deserialize, Serialize};

use crate::record::RecordKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    Structural,
    Security,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocking,
    Advisory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub category: FindingCategory,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<RecordKey>,
}

impl Finding {
    pub fn blocking(message: impl Into<String>) -> Self {
        Self { category: FindingCategory::Structural, severity: Severity::Blocking, message: message.into(), record: None }
    }

    pub fn structural_advisory(message: impl Into<String>) -> Self {
        Self { category: FindingCategory::Structural, severity: Severity::Advisory, message: message.into(), record: None }
    }

    /// Security findings are always advisory.
    pub fn security(message: impl Into<String>) -> Self {
        Self { category: FindingCategory::Security, severity: Severity::Advisory, message: message.into(), record: None }
    }

    pub fn with_record(mut self, key: RecordKey) -> Self {
        self.record = Some(key);
        self
    }

    pub fn halts(&self) -> bool {
        self.category == FindingCategory::Structural && self.severity == Severity::Blocking
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub findings: Vec<Finding>,
}

impl ValidationReport {
    pub fn push(&mut self, finding: Finding) { self.findings.push(finding); }

    pub fn is_empty(&self) -> bool { self.findings.is_empty() }

    pub fn is_blocking(&self) -> bool { self.findings.iter().any(Finding::halts) }

    pub fn blocking(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.halts())
    }

    pub fn advisories(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| !f.halts())
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.findings.iter().any(|f| f.message.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_structural_blocking_halts() {
        let mut r = ValidationReport::default();
        r.push(Finding::security("no TLS listener"));
        r.push(Finding::structural_advisory("dangling parentRef"));
        assert!(!r.is_blocking());
        r.push(Finding::blocking("route record required"));
        assert!(r.is_blocking());
        assert_eq!(r.blocking().count(), 1);
        assert_eq!(r.advisories().count(), 2);
    }
}
