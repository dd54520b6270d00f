//! Remote status enumerations and their translation.
//!
//! The parsing functions are total: anything unrecognised becomes
//! `Unknown`. [`StatusTranslator`] adds the reporting side, logging each
//! distinct unmapped value exactly once.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Aggregate health of a managed entity (`ManagedEntityStatus`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum OverallStatus {
    /// "gray": status not known, typical of a standalone host
    #[default]
    Unknown,
    /// "green"
    Normal,
    /// "yellow"
    Warning,
    /// "red"
    Error,
}

/// Host power state (`HostSystemPowerState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Standby,
    #[default]
    Unknown,
}

/// Lowercase with separators removed, so `poweredOn`, `POWERED_ON` and
/// `powered-on` compare equal.
fn normalise(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl OverallStatus {
    /// Parse a remote value; `None` when unmapped.
    pub fn parse(raw: &str) -> Option<Self> {
        match normalise(raw).as_str() {
            "gray" | "grey" => Some(Self::Unknown),
            "green" => Some(Self::Normal),
            "yellow" => Some(Self::Warning),
            "red" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn from_remote(raw: &str) -> Self {
        Self::parse(raw).unwrap_or_default()
    }
}

impl PowerState {
    pub fn parse(raw: &str) -> Option<Self> {
        match normalise(raw).as_str() {
            "poweredon" => Some(Self::PoweredOn),
            "poweredoff" => Some(Self::PoweredOff),
            "standby" => Some(Self::Standby),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn from_remote(raw: &str) -> Self {
        Self::parse(raw).unwrap_or_default()
    }
}

/// Which enumeration a raw value was being translated into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusDomain {
    Overall,
    Power,
}

/// Translator that reports unmapped values once per distinct value.
#[derive(Debug, Default)]
pub struct StatusTranslator {
    unmapped: Mutex<HashSet<(StatusDomain, String)>>,
}

impl StatusTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn overall(&self, raw: &str) -> OverallStatus {
        match OverallStatus::parse(raw) {
            Some(s) => s,
            None => {
                self.report(StatusDomain::Overall, raw);
                OverallStatus::Unknown
            }
        }
    }

    pub fn power(&self, raw: &str) -> PowerState {
        match PowerState::parse(raw) {
            Some(s) => s,
            None => {
                self.report(StatusDomain::Power, raw);
                PowerState::Unknown
            }
        }
    }

    /// Distinct unmapped values seen so far (each was logged once).
    pub fn unmapped_count(&self) -> usize {
        self.unmapped.lock().len()
    }

    fn report(&self, domain: StatusDomain, raw: &str) {
        let first_sighting = self.unmapped.lock().insert((domain, raw.to_string()));
        if first_sighting {
            log::warn!("Unmapped {:?} status value '{}', treating as Unknown", domain, raw);
        }
    }
}
