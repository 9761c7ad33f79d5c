// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Locking discipline between the sheets host's two pools (§4.6). Modeled
//! directly on `tokio::sync::RwLock`'s own contract: many background ops hold
//! the read side concurrently, one blocking op holds the write side, and
//! acquiring the write side drains every outstanding read first.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Pools run independently; no cross-pool ordering.
    None,
    /// Every request serializes through one process-wide mutex and runs on
    /// the blocking pool regardless of which pool it was submitted to.
    SerializeAll,
    /// Background requests hold the barrier's read side; blocking requests
    /// hold the write side, so a blocking op never overlaps a background op
    /// and at most one blocking op runs at a time.
    ExclusiveBarrier,
}

impl LockMode {
    /// Parse the `SHEETS_LOCK_MODE` value. Unrecognized input falls back to
    /// `exclusiveBarrier`, the documented default and the strictest option.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "none" => Self::None,
            "serialize-all" | "serializeAll" => Self::SerializeAll,
            "exclusive-barrier" | "exclusiveBarrier" => Self::ExclusiveBarrier,
            other => {
                tracing::warn!(value = other, "unrecognized SHEETS_LOCK_MODE, defaulting to exclusive-barrier");
                Self::ExclusiveBarrier
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_documented_values() {
        assert_eq!(LockMode::parse("none"), LockMode::None);
        assert_eq!(LockMode::parse("serialize-all"), LockMode::SerializeAll);
        assert_eq!(LockMode::parse("exclusive-barrier"), LockMode::ExclusiveBarrier);
    }

    #[test]
    fn unrecognized_value_defaults_to_exclusive_barrier() {
        assert_eq!(LockMode::parse("bogus"), LockMode::ExclusiveBarrier);
    }
}
