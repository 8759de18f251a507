//! Validation rules applied while decoding configuration
//!
//! Rules are an explicit value handed to the config loader rather than global
//! state, so tests and embedders can tighten or relax them.

use crate::domain::topic::validate_publish_topic;
use crate::infra::error::ConfigError;
use std::ops::RangeInclusive;

#[derive(Debug, Clone)]
pub struct ValidationRules {
    /// Character bound for names, hosts, credentials and topic segments
    pub max_field_len: usize,
    /// Allowed broker priorities (1 = most preferred)
    pub priority: RangeInclusive<i64>,
    /// Byte bound for a decoded will payload
    pub max_will_len: usize,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self { max_field_len: 256, priority: 1..=3, max_will_len: 256 }
    }
}

impl ValidationRules {
    /// Length bound only
    pub fn check_len(
        &self,
        section: &str,
        field: &'static str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let len = value.chars().count();
        if len > self.max_field_len {
            return Err(ConfigError::invalid(
                section,
                field,
                format!("is {} characters, limit is {}", len, self.max_field_len),
            ));
        }
        Ok(())
    }

    /// Length bound plus NUL/wildcard check, for values used inside topics
    pub fn check_topic_part(
        &self,
        section: &str,
        field: &'static str,
        value: &str,
    ) -> Result<(), ConfigError> {
        self.check_len(section, field, value)?;
        validate_publish_topic(value)
            .map_err(|e| ConfigError::invalid(section, field, e.to_string()))
    }

    /// A single topic segment: topic part that also excludes `/`
    pub fn check_name(
        &self,
        section: &str,
        field: &'static str,
        value: &str,
    ) -> Result<(), ConfigError> {
        if value.is_empty() {
            return Err(ConfigError::invalid(section, field, "must not be empty"));
        }
        if value.contains('/') {
            return Err(ConfigError::invalid(section, field, "must not contain '/'"));
        }
        self.check_topic_part(section, field, value)
    }

    pub fn check_priority(&self, section: &str, priority: i64) -> Result<u8, ConfigError> {
        if !self.priority.contains(&priority) {
            return Err(ConfigError::invalid(
                section,
                "priority",
                format!(
                    "{} out of range {}..={}",
                    priority,
                    self.priority.start(),
                    self.priority.end()
                ),
            ));
        }
        u8::try_from(priority)
            .map_err(|_| ConfigError::invalid(section, "priority", "does not fit in u8"))
    }

    pub fn check_port(&self, section: &str, port: i64) -> Result<u16, ConfigError> {
        match u16::try_from(port) {
            Ok(p) if p >= 1 => Ok(p),
            _ => Err(ConfigError::invalid(
                section,
                "port",
                format!("{} out of range 1..=65535", port),
            )),
        }
    }

    pub fn check_non_negative(
        &self,
        section: &str,
        field: &'static str,
        value: i64,
    ) -> Result<u64, ConfigError> {
        u64::try_from(value)
            .map_err(|_| ConfigError::invalid(section, field, format!("{} must be >= 0", value)))
    }
}
