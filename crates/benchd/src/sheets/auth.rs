// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Auth warmup strategy for the sheets host (§4.6). Workers are broadcast
//! the credentials path on init; `warmup()` just confirms the file is
//! present and readable before the pool starts serving exec calls.

use std::path::Path;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStrategy {
    /// No warmup; first `exec` call discovers credential problems.
    None,
    /// Fire-and-forget warmup on init; failures are logged, not fatal.
    Warmup,
    /// Synchronous warmup on init; failure aborts host startup.
    Strict,
}

impl AuthStrategy {
    /// Parse `SHEETS_AUTH_STRATEGY`. Unrecognized input falls back to
    /// `warmup`, the documented default.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "none" => Self::None,
            "strict" => Self::Strict,
            "warmup" => Self::Warmup,
            other => {
                tracing::warn!(value = other, "unrecognized SHEETS_AUTH_STRATEGY, defaulting to warmup");
                Self::Warmup
            }
        }
    }
}

/// Confirm the configured credentials file exists and is readable. A `None`
/// path always fails — warmup has nothing to check.
pub async fn warmup(credentials_path: Option<&str>) -> Result<()> {
    let Some(path) = credentials_path else {
        return Err(OrchestratorError::Other("no SHEETS_CREDENTIALS_PATH configured".to_owned()));
    };
    match tokio::fs::metadata(Path::new(path)).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(OrchestratorError::Other(format!("{path} is not a regular file"))),
        Err(err) => Err(OrchestratorError::Io(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_documented_values() {
        assert_eq!(AuthStrategy::parse("none"), AuthStrategy::None);
        assert_eq!(AuthStrategy::parse("strict"), AuthStrategy::Strict);
        assert_eq!(AuthStrategy::parse("warmup"), AuthStrategy::Warmup);
    }

    #[test]
    fn unrecognized_value_defaults_to_warmup() {
        assert_eq!(AuthStrategy::parse("bogus"), AuthStrategy::Warmup);
    }

    #[tokio::test]
    async fn warmup_fails_without_a_configured_path() {
        assert!(warmup(None).await.is_err());
    }

    #[tokio::test]
    async fn warmup_fails_for_missing_file() {
        assert!(warmup(Some("/nonexistent/path/creds.json")).await.is_err());
    }

    #[tokio::test]
    async fn warmup_succeeds_for_an_existing_file() -> anyhow::Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        let path = file.path().to_str().expect("utf8 path").to_owned();
        warmup(Some(&path)).await?;
        Ok(())
    }
}
