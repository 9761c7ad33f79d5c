// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Declarative device matchers and the constraint/scoring rules discovery
//! uses to classify an enumerated port (§4.1).

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A candidate port's observed USB/serial metadata.
#[derive(Debug, Clone, Default)]
pub struct PortInfo {
    pub path: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub serial_number: Option<String>,
}

/// A declarative rule describing how to recognize one device class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialMatcher {
    pub kind: String,
    #[serde(default)]
    pub identification_string: Option<String>,
    #[serde(default)]
    pub vendor_id: Option<u16>,
    #[serde(default)]
    pub product_id: Option<u16>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub path_regex: Option<String>,
    pub baud_rate: u32,
    #[serde(default = "default_true")]
    pub identify_required: bool,
    #[serde(default)]
    pub keep_open_on_static: bool,
}

fn default_true() -> bool {
    true
}

impl SerialMatcher {
    /// Validate at `start()`-time: a matcher with no constraints at all
    /// could never be scored and is rejected as malformed.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.vendor_id.is_none()
            && self.product_id.is_none()
            && self.serial_number.is_none()
            && self.path_regex.is_none()
        {
            return Err(crate::error::OrchestratorError::Protocol(format!(
                "matcher {:?} has no constraints to match against",
                self.kind
            )));
        }
        if !self.identify_required && self.identification_string.is_some() {
            // Static matchers ignore identificationString; not an error, just unused.
        }
        Ok(())
    }

    /// Whether this matcher's *optional* constraints all pass against `port`.
    /// A constraint absent on the matcher is ignored (not a failure).
    pub fn is_eligible(&self, port: &PortInfo) -> bool {
        if let Some(vid) = self.vendor_id {
            if port.vendor_id != Some(vid) {
                return false;
            }
        }
        if let Some(pid) = self.product_id {
            if port.product_id != Some(pid) {
                return false;
            }
        }
        if let Some(ref serial) = self.serial_number {
            if port.serial_number.as_deref() != Some(serial.as_str()) {
                return false;
            }
        }
        if let Some(ref pattern) = self.path_regex {
            match Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(&port.path) {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
        true
    }

    /// Whether this is a static (non-active) matcher whose serial number or
    /// vid+pid exactly matches — the "exact-static shortcut" that skips
    /// active probing entirely.
    pub fn is_exact_static_match(&self, port: &PortInfo) -> bool {
        if self.identify_required {
            return false;
        }
        let serial_matches = self.serial_number.is_some()
            && self.serial_number.as_deref() == port.serial_number.as_deref();
        let vid_pid_matches = self.vendor_id.is_some()
            && self.product_id.is_some()
            && self.vendor_id == port.vendor_id
            && self.product_id == port.product_id;
        serial_matches || vid_pid_matches
    }

    pub fn is_active_candidate(&self) -> bool {
        self.identify_required && self.identification_string.is_some()
    }

    /// Constraint-strength score used for the static fallback. Ties are
    /// broken by declaration order by the caller.
    pub fn static_score(&self, port: &PortInfo) -> u32 {
        let mut score = 0;
        if self.serial_number.is_some() && self.serial_number.as_deref() == port.serial_number.as_deref() {
            score += 3;
        }
        if self.vendor_id.is_some() && self.vendor_id == port.vendor_id {
            score += 2;
        }
        if self.product_id.is_some() && self.product_id == port.product_id {
            score += 2;
        }
        if let Some(ref pattern) = self.path_regex {
            if Regex::new(pattern).is_ok_and(|re| re.is_match(&port.path)) {
                score += 1;
            }
        }
        score
    }
}

/// Pick the highest-scoring static matcher among `eligible`, ties broken by
/// declaration order (first one wins).
pub fn best_static_match<'a>(
    eligible: &[&'a SerialMatcher],
    port: &PortInfo,
) -> Option<&'a SerialMatcher> {
    eligible
        .iter()
        .map(|m| (m.static_score(port), *m))
        .filter(|(score, _)| *score > 0)
        .enumerate()
        .max_by_key(|(idx, (score, _))| (*score, std::cmp::Reverse(*idx)))
        .map(|(_, (_, m))| m)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(path: &str, vid: Option<u16>, pid: Option<u16>, serial: Option<&str>) -> PortInfo {
        PortInfo {
            path: path.to_owned(),
            vendor_id: vid,
            product_id: pid,
            serial_number: serial.map(str::to_owned),
        }
    }

    #[test]
    fn exact_serial_match_skips_probing() {
        let matcher = SerialMatcher {
            kind: "power-meter".into(),
            identification_string: None,
            vendor_id: None,
            product_id: None,
            serial_number: Some("SN123".into()),
            path_regex: None,
            baud_rate: 9600,
            identify_required: false,
            keep_open_on_static: true,
        };
        let p = port("/dev/ttyUSB0", None, None, Some("SN123"));
        assert!(matcher.is_exact_static_match(&p));
    }

    #[test]
    fn static_score_prefers_serial_over_vid_pid() {
        let by_serial = SerialMatcher {
            kind: "a".into(),
            identification_string: None,
            vendor_id: None,
            product_id: None,
            serial_number: Some("SN1".into()),
            path_regex: None,
            baud_rate: 9600,
            identify_required: false,
            keep_open_on_static: false,
        };
        let by_vid_pid = SerialMatcher {
            kind: "b".into(),
            identification_string: None,
            vendor_id: Some(1),
            product_id: Some(2),
            serial_number: None,
            path_regex: None,
            baud_rate: 9600,
            identify_required: false,
            keep_open_on_static: false,
        };
        let p = port("/dev/ttyUSB0", Some(1), Some(2), Some("SN1"));
        let eligible = [&by_serial, &by_vid_pid];
        let winner = best_static_match(&eligible, &p);
        assert_eq!(winner.map(|m| m.kind.as_str()), Some("a"));
    }

    #[test]
    fn matcher_with_no_constraints_is_rejected() {
        let matcher = SerialMatcher {
            kind: "bad".into(),
            identification_string: None,
            vendor_id: None,
            product_id: None,
            serial_number: None,
            path_regex: None,
            baud_rate: 9600,
            identify_required: true,
            keep_open_on_static: false,
        };
        assert!(matcher.validate().is_err());
    }
}
