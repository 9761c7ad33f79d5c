// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Schema registry: per-topic validators, with safety-critical topics
//! rejected outright when unvalidated or invalid (§4.4).

use std::sync::Arc;

use super::topic::TopicPattern;

/// A validator checks a payload against whatever shape the registering
/// component expects. Returns `Ok(())` or a human-readable failure reason.
pub type Validator = Arc<dyn Fn(&serde_json::Value) -> Result<(), String> + Send + Sync>;

struct Registration {
    pattern: TopicPattern,
    schema_version: u32,
    validator: Validator,
}

/// Registered validators plus the set of patterns that must have a passing
/// validator or be rejected at publish time.
pub struct SchemaRegistry {
    registrations: Vec<Registration>,
    safety_critical: Vec<TopicPattern>,
}

impl SchemaRegistry {
    pub fn new(safety_critical: Vec<TopicPattern>) -> Self {
        Self { registrations: Vec::new(), safety_critical }
    }

    /// Register a validator for `pattern`. First matching registration wins
    /// at lookup time (declaration order), mirroring the design doc.
    pub fn register(&mut self, pattern: TopicPattern, schema_version: u32, validator: Validator) {
        self.registrations.push(Registration { pattern, schema_version, validator });
    }

    fn find(&self, topic: &str) -> Option<&Registration> {
        self.registrations.iter().find(|r| r.pattern.matches(topic))
    }

    fn is_safety_critical(&self, topic: &str) -> bool {
        self.safety_critical.iter().any(|p| p.matches(topic))
    }

    pub fn version_for(&self, topic: &str) -> u32 {
        self.find(topic).map(|r| r.schema_version).unwrap_or(0)
    }

    /// Returns `Some(reason)` if this publish must be rejected: a
    /// safety-critical topic with no registered validator, or one whose
    /// validator failed. Non-safety topics never cause rejection here (a
    /// failed validator there is only a warning, handled by the caller).
    pub fn reject_reason(&self, topic: &str, payload: &serde_json::Value) -> Option<String> {
        match self.find(topic) {
            Some(reg) => match (reg.validator)(payload) {
                Ok(()) => None,
                Err(reason) if self.is_safety_critical(topic) => Some(reason),
                Err(reason) => {
                    tracing::warn!(topic, reason, "bus: non-safety-critical validator failed");
                    None
                }
            },
            None if self.is_safety_critical(topic) => {
                Some("no registered validator for safety-critical topic".to_owned())
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_critical_topic_without_validator_is_rejected() -> anyhow::Result<()> {
        let pattern = TopicPattern::parse("frontpanel.power.changed")?;
        let registry = SchemaRegistry::new(vec![pattern]);
        let reason = registry.reject_reason("frontpanel.power.changed", &serde_json::Value::Null);
        assert!(reason.is_some());
        Ok(())
    }

    #[test]
    fn non_safety_topic_without_validator_passes() -> anyhow::Result<()> {
        let registry = SchemaRegistry::new(Vec::new());
        assert!(registry.reject_reason("mouse.move.relative", &serde_json::Value::Null).is_none());
        Ok(())
    }

    #[test]
    fn failing_validator_on_safety_critical_topic_is_rejected() -> anyhow::Result<()> {
        let pattern = TopicPattern::parse("frontpanel.power.changed")?;
        let mut registry = SchemaRegistry::new(vec![pattern.clone()]);
        registry.register(pattern, 1, Arc::new(|_v| Err("missing field".to_owned())));
        let reason = registry.reject_reason("frontpanel.power.changed", &serde_json::Value::Null);
        assert_eq!(reason, Some("missing field".to_owned()));
        Ok(())
    }
}
