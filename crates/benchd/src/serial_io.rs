// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Async wrapper around the blocking `serialport` crate. Every device driver
//! and the discovery prober share this: a handle owns one open port and runs
//! every read/write on a blocking thread so the executor never stalls on a
//! UART round trip.

use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

use crate::error::{OrchestratorError, Result};

/// One open serial port. Methods take `&mut self` and run the blocking call
/// on a `spawn_blocking` thread, matching the suspension points called out
/// for open/close/read/write. `reader` is `None` only for the instant a
/// blocking task owns it; every public method restores it before returning.
pub struct SerialHandle {
    path: String,
    reader: Option<BufReader<Box<dyn serialport::SerialPort>>>,
}

impl SerialHandle {
    /// Open `path` at `baud_rate`, with `timeout` applied to every
    /// subsequent read. Runs on a blocking thread: opening a serial device
    /// can itself block (locking, DCD negotiation on some platforms).
    pub async fn open(path: String, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let path_for_open = path.clone();
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&path_for_open, baud_rate)
                .timeout(timeout)
                .open()
        })
        .await
        .map_err(|e| OrchestratorError::Other(format!("serial open task panicked: {e}")))??;
        Ok(Self { path, reader: Some(BufReader::new(port)) })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Write `line` followed by `eol`, blocking-thread dispatched.
    pub async fn write_line(&mut self, line: &str, eol: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + eol.len());
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(eol.as_bytes());
        self.write_bytes(bytes).await
    }

    pub async fn write_bytes(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.with_reader(move |reader| {
            let port = reader.get_mut();
            port.write_all(&bytes)?;
            port.flush()?;
            Ok(())
        })
        .await
    }

    /// Read one line (delimited by `\n`), ignoring lines that start with
    /// `debug:` as the discovery protocol requires, up to `timeout`.
    pub async fn read_line_skip_debug(&mut self, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(OrchestratorError::Timeout(timeout));
            }
            let line = self.read_line_raw(remaining).await?;
            let trimmed = line.trim();
            if !trimmed.starts_with("debug:") {
                return Ok(trimmed.to_owned());
            }
        }
    }

    pub async fn read_line_raw(&mut self, timeout: Duration) -> Result<String> {
        self.with_reader(move |reader| {
            reader.get_mut().set_timeout(timeout)?;
            let mut line = String::new();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                return Err(OrchestratorError::Timeout(timeout));
            }
            Ok(line)
        })
        .await
    }

    /// Run `f` against the underlying reader on a blocking thread, returning
    /// `T` and always putting the reader back regardless of outcome.
    async fn with_reader<T: Send + 'static>(
        &mut self,
        f: impl FnOnce(&mut BufReader<Box<dyn serialport::SerialPort>>) -> Result<T> + Send + 'static,
    ) -> Result<T> {
        let mut owned = self
            .reader
            .take()
            .ok_or_else(|| OrchestratorError::Other("serial handle has no port".to_owned()))?;
        let (result, reader) = tokio::task::spawn_blocking(move || {
            let result = f(&mut owned);
            (result, owned)
        })
        .await
        .map_err(|e| OrchestratorError::Other(format!("serial io task panicked: {e}")))?;
        self.reader = Some(reader);
        result
    }
}
