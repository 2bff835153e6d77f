//! Portico core types: resource records, environment targets, findings and errors.

#![forbid(unsafe_code)]

mod error;
mod finding;
mod gateway;
mod record;
mod target;

pub use error::RolloutError;
pub use finding::{Finding, FindingCategory, Severity, ValidationReport};
pub use gateway::{condition_is_true, conditions_of, normalize_path, Condition};
pub use record::{is_cluster_scoped, RecordClass, RecordError, RecordKey, ResourceDocument, ResourceRecord};
pub use target::{EnvironmentTarget, InternalProbe, ProbeSettings, ReadinessSettings};

pub mod prelude {
    pub use super::{
        EnvironmentTarget, Finding, RecordClass, RecordKey, ResourceDocument, ResourceRecord, RolloutError,
        ValidationReport,
    };
}
