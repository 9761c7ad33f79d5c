// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Active identification handshake: open a candidate port, send `identify`,
//! and wait for a matching token, retrying up to the configured bound (§4.1
//! step 3).

use std::time::Duration;

use crate::error::{OrchestratorError, Result};
use crate::serial_io::SerialHandle;

use super::matcher::SerialMatcher;

const IDENTIFY_LINE: &str = "identify";
const EOL: &str = "\r\n";

/// Outcome of a successful identification: which matcher answered, at what
/// baud rate the handshake succeeded.
pub struct Identified {
    pub matcher_index: usize,
    pub baud_rate: u32,
}

/// Probe `path`, trying each active-candidate matcher's identification
/// string in declaration order. Opens and closes the port itself — callers
/// must not hold a separate handle to the same path concurrently.
pub async fn probe(
    path: &str,
    active: &[(usize, &SerialMatcher)],
    default_baud_rate: u32,
    timeout: Duration,
    retries: u32,
) -> Result<Option<Identified>> {
    if active.is_empty() {
        return Ok(None);
    }

    for attempt in 0..=retries {
        match try_identify(path, active, default_baud_rate, timeout).await {
            Ok(found) => return Ok(found),
            Err(err) if attempt < retries => {
                tracing::debug!(path, attempt, error = %err, "discovery probe attempt failed, retrying");
            }
            Err(err) => {
                tracing::debug!(path, error = %err, "discovery probe exhausted retries");
                return Ok(None);
            }
        }
    }
    Ok(None)
}

async fn try_identify(
    path: &str,
    active: &[(usize, &SerialMatcher)],
    default_baud_rate: u32,
    timeout: Duration,
) -> Result<Option<Identified>> {
    let mut handle = SerialHandle::open(path.to_owned(), default_baud_rate, timeout).await?;
    handle.write_line(IDENTIFY_LINE, EOL).await?;
    let line = handle.read_line_skip_debug(timeout).await?;
    let token = line.trim().to_lowercase();

    let found = active.iter().find_map(|(idx, matcher)| {
        matcher
            .identification_string
            .as_deref()
            .map(str::to_lowercase)
            .filter(|expected| expected == &token)
            .map(|_| Identified { matcher_index: *idx, baud_rate: matcher.baud_rate })
    });

    // Drop the handle explicitly before returning so the FD is closed before
    // discovery surfaces `device:identified` to the rest of the system.
    drop(handle);
    match found {
        Some(identified) => Ok(Some(identified)),
        None => Err(OrchestratorError::Protocol(format!(
            "no matcher recognized identification token {token:?} on {path}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_active_set_returns_none_without_opening_anything() -> anyhow::Result<()> {
        let result = probe("/dev/does-not-exist", &[], 9600, Duration::from_millis(10), 0).await?;
        assert!(result.is_none());
        Ok(())
    }
}
