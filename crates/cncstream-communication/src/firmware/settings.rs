//! Firmware settings as reported by the controller

use serde::{Deserialize, Serialize};
use std::fmt;

/// A firmware setting parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareSetting {
    /// Setting ID or code (`$110`, `xvm`, ...)
    pub id: String,
    /// Current value
    pub value: String,
    /// Setting description, when the firmware sends one
    pub description: Option<String>,
}

impl FirmwareSetting {
    pub fn new(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Parse a `$<n>=<value> (<description>)` line
    pub fn parse_dollar_line(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix('$')?;
        let (id, rest) = rest.split_once('=')?;
        let id = id.trim();
        if id.is_empty() {
            return None;
        }

        let (value, description) = match rest.split_once('(') {
            Some((value, desc)) => (value, Some(desc.trim_end().trim_end_matches(')').trim())),
            None => (rest, None),
        };

        let mut setting = Self::new(format!("${}", id), value.trim());
        if let Some(desc) = description.filter(|d| !d.is_empty()) {
            setting = setting.with_description(desc);
        }
        Some(setting)
    }
}

impl fmt::Display for FirmwareSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(desc) => write!(f, "{}={} ({})", self.id, self.value, desc),
            None => write!(f, "{}={}", self.id, self.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_description() {
        let setting = FirmwareSetting::parse_dollar_line("$110=500.000 (x max rate, mm/min)").unwrap();
        assert_eq!(setting.id, "$110");
        assert_eq!(setting.value, "500.000");
        assert_eq!(setting.description.as_deref(), Some("x max rate, mm/min"));
    }

    #[test]
    fn test_parse_bare() {
        let setting = FirmwareSetting::parse_dollar_line("$0=10").unwrap();
        assert_eq!(setting, FirmwareSetting::new("$0", "10"));
        assert_eq!(setting.to_string(), "$0=10");
    }

    #[test]
    fn test_reject_non_settings() {
        assert!(FirmwareSetting::parse_dollar_line("ok").is_none());
        assert!(FirmwareSetting::parse_dollar_line("$$").is_none());
        assert!(FirmwareSetting::parse_dollar_line("$=5").is_none());
    }
}
