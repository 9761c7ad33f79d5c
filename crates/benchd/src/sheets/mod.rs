// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sheets worker-pool host (§4.6): isolates spreadsheet I/O from the main
//! event loop behind two bounded-concurrency pools (`blocking` for critical
//! ops, `background` for everything else), a configurable locking
//! discipline between them, and an auth-warmup strategy run once on init.
//!
//! Each pool is a `tokio::sync::Semaphore` capping in-flight tasks at `size`
//! plus a pending counter capped at `max_pending` — the async equivalent of
//! a fixed-size thread pool with a bounded queue, without a dedicated worker
//! loop (tasks run on the ambient executor; the semaphore is what bounds
//! concurrency).

pub mod auth;
pub mod lock;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, Semaphore};

pub use auth::AuthStrategy;
pub use lock::LockMode;

use crate::error::{OrchestratorError, Result};

/// Which pool a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Blocking,
    Background,
}

/// Snapshot of one pool's load, returned by [`SheetsHost::stats`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub pending: usize,
    pub max_pending: usize,
    pub closed: bool,
}

/// A bounded-concurrency pool. `exec` rejects fast with `QueueFull` once
/// `max_pending` in-flight-or-waiting tasks are outstanding, and with a
/// terminal error once `shutdown` has closed it.
struct Pool {
    semaphore: Arc<Semaphore>,
    size: usize,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    task_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl Pool {
    fn new(size: usize, max_pending: usize, task_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size.max(1))),
            size: size.max(1),
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending: max_pending.max(1),
            task_timeout,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size,
            pending: self.pending.load(Ordering::SeqCst),
            max_pending: self.max_pending,
            closed: self.closed.load(Ordering::SeqCst),
        }
    }

    async fn exec<T, F, Fut>(&self, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Other("sheets pool is shut down".to_owned()));
        }
        if self.pending.fetch_add(1, Ordering::SeqCst) >= self.max_pending {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(OrchestratorError::queue_full(self.max_pending, self.max_pending));
        }
        let permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                return Err(OrchestratorError::Other("sheets pool is shut down".to_owned()));
            }
        };
        let result = tokio::time::timeout(self.task_timeout, task()).await;
        drop(permit);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        match result {
            Ok(inner) => inner,
            Err(_) => Err(OrchestratorError::Timeout(self.task_timeout)),
        }
    }

    /// Close the pool: further `exec` calls fail immediately. Waits for
    /// every outstanding permit to return first, i.e. drains in-flight work.
    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(permit) = self.semaphore.acquire_many(self.size as u32).await {
            drop(permit);
        }
    }
}

/// Credentials/dry-run config broadcast to workers on init.
#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub blocking_size: usize,
    pub background_size: usize,
    pub max_pending: usize,
    pub task_timeout: Duration,
    pub lock_mode: LockMode,
    pub auth_strategy: AuthStrategy,
    pub credentials_path: Option<String>,
    pub dry_run: bool,
}

impl SheetsConfig {
    pub fn from_bench_config(config: &crate::config::BenchConfig) -> Self {
        Self {
            blocking_size: config.sheets_blocking_pool_size,
            background_size: config.sheets_background_pool_size,
            max_pending: config.sheets_max_pending,
            task_timeout: config.sheets_task_timeout(),
            lock_mode: LockMode::parse(&config.sheets_lock_mode),
            auth_strategy: AuthStrategy::parse(&config.sheets_auth_strategy),
            credentials_path: config.sheets_credentials_path.clone(),
            dry_run: config.sheets_dry_run,
        }
    }
}

/// The sheets worker-pool host.
pub struct SheetsHost {
    blocking: Pool,
    background: Pool,
    lock_mode: LockMode,
    serialize_all: Mutex<()>,
    barrier: RwLock<()>,
    dry_run: bool,
}

impl SheetsHost {
    /// Construct the host and, per `auth_strategy`, run (or schedule) the
    /// credentials warmup. Returns `Err` only under `AuthStrategy::Strict`
    /// when warmup fails.
    pub async fn start(config: SheetsConfig) -> Result<Arc<Self>> {
        let host = Arc::new(Self {
            blocking: Pool::new(config.blocking_size, config.max_pending, config.task_timeout),
            background: Pool::new(config.background_size, config.max_pending, config.task_timeout),
            lock_mode: config.lock_mode,
            serialize_all: Mutex::new(()),
            barrier: RwLock::new(()),
            dry_run: config.dry_run,
        });

        match config.auth_strategy {
            AuthStrategy::None => {}
            AuthStrategy::Warmup => {
                let path = config.credentials_path.clone();
                tokio::spawn(async move {
                    if let Err(err) = auth::warmup(path.as_deref()).await {
                        tracing::warn!(%err, "sheets auth warmup failed");
                    }
                });
            }
            AuthStrategy::Strict => {
                auth::warmup(config.credentials_path.as_deref()).await?;
            }
        }

        Ok(host)
    }

    /// Re-run the credentials warmup on demand (e.g. after a credential
    /// rotation), independent of the startup strategy.
    pub async fn auth_warmup(&self, credentials_path: Option<&str>) -> Result<()> {
        auth::warmup(credentials_path).await
    }

    /// Submit `make_request` to the named pool, honoring the configured
    /// locking discipline. `make_request` only runs once the lock/barrier
    /// and pool concurrency both admit it — unless `dry_run` is set, in
    /// which case the request is logged and `make_request` never runs at
    /// all, touching neither the lock/barrier nor either pool.
    pub async fn exec<T, F, Fut>(&self, mode: PoolKind, make_request: F) -> Result<T>
    where
        T: Default,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.dry_run {
            tracing::debug!(?mode, "sheets exec (dry-run, not dispatched)");
            return Ok(T::default());
        }
        match self.lock_mode {
            LockMode::None => self.dispatch(mode, make_request).await,
            LockMode::SerializeAll => {
                let _guard = self.serialize_all.lock().await;
                self.dispatch(PoolKind::Blocking, make_request).await
            }
            LockMode::ExclusiveBarrier => match mode {
                PoolKind::Background => {
                    let _permit = self.barrier.read().await;
                    self.dispatch(PoolKind::Background, make_request).await
                }
                PoolKind::Blocking => {
                    let _permit = self.barrier.write().await;
                    self.dispatch(PoolKind::Blocking, make_request).await
                }
            },
        }
    }

    async fn dispatch<T, F, Fut>(&self, mode: PoolKind, make_request: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match mode {
            PoolKind::Blocking => self.blocking.exec(make_request).await,
            PoolKind::Background => self.background.exec(make_request).await,
        }
    }

    /// A cheap liveness check: both pools accept a no-op task.
    pub async fn healthy_snapshot(&self) -> bool {
        self.dispatch(PoolKind::Background, || async { Ok(()) }).await.is_ok()
            && self.dispatch(PoolKind::Blocking, || async { Ok(()) }).await.is_ok()
    }

    pub fn stats(&self) -> (PoolStats, PoolStats) {
        (self.blocking.stats(), self.background.stats())
    }

    /// Close the background pool, then the blocking pool. Errors from either
    /// are ignored — shutdown is best-effort.
    pub async fn shutdown(&self) {
        self.background.shutdown().await;
        self.blocking.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(lock_mode: LockMode) -> SheetsConfig {
        SheetsConfig {
            blocking_size: 1,
            background_size: 2,
            max_pending: 4,
            task_timeout: Duration::from_millis(200),
            lock_mode,
            auth_strategy: AuthStrategy::None,
            credentials_path: None,
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn none_mode_runs_both_pools_independently() -> anyhow::Result<()> {
        let host = SheetsHost::start(test_config(LockMode::None)).await?;
        let a = host.exec(PoolKind::Background, || async { Ok::<_, OrchestratorError>(1) });
        let b = host.exec(PoolKind::Blocking, || async { Ok::<_, OrchestratorError>(2) });
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a?, 1);
        assert_eq!(b?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn exec_past_max_pending_fails_fast() -> anyhow::Result<()> {
        let mut config = test_config(LockMode::None);
        config.background_size = 1;
        config.max_pending = 1;
        let host = SheetsHost::start(config).await?;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = std::sync::Mutex::new(Some(release_rx));
        let held = host.exec(PoolKind::Background, move || async move {
            let rx = release_rx.lock().unwrap_or_else(|e| e.into_inner()).take().expect("single use");
            let _ = rx.await;
            Ok::<_, OrchestratorError>(())
        });
        let held = tokio::spawn(held);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let rejected = host.exec(PoolKind::Background, || async { Ok::<_, OrchestratorError>(()) }).await;
        assert!(matches!(rejected, Err(OrchestratorError::QueueFull { .. })));

        let _ = release_tx.send(());
        held.await??;
        Ok(())
    }

    #[tokio::test]
    async fn exclusive_barrier_serializes_blocking_against_background() -> anyhow::Result<()> {
        let host = SheetsHost::start(test_config(LockMode::ExclusiveBarrier)).await?;
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let order1 = Arc::clone(&order);
        let background = host.exec(PoolKind::Background, move || async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            order1.lock().unwrap_or_else(|e| e.into_inner()).push("background");
            Ok::<_, OrchestratorError>(())
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let order2 = Arc::clone(&order);
        let blocking = host.exec(PoolKind::Blocking, move || async move {
            order2.lock().unwrap_or_else(|e| e.into_inner()).push("blocking");
            Ok::<_, OrchestratorError>(())
        });

        let (bg, bl) = tokio::join!(background, blocking);
        bg?;
        bl?;
        assert_eq!(*order.lock().unwrap_or_else(|e| e.into_inner()), vec!["background", "blocking"]);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_rejects_further_exec_calls() -> anyhow::Result<()> {
        let host = SheetsHost::start(test_config(LockMode::None)).await?;
        host.shutdown().await;
        let result = host.exec(PoolKind::Background, || async { Ok::<_, OrchestratorError>(()) }).await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn dry_run_never_invokes_make_request() -> anyhow::Result<()> {
        let mut config = test_config(LockMode::None);
        config.dry_run = true;
        let host = SheetsHost::start(config).await?;

        let invoked = Arc::new(AtomicBool::new(false));
        let invoked2 = Arc::clone(&invoked);
        let result = host
            .exec(PoolKind::Blocking, move || {
                let invoked = Arc::clone(&invoked2);
                async move {
                    invoked.store(true, Ordering::SeqCst);
                    Ok::<(), OrchestratorError>(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert!(!invoked.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn strict_auth_aborts_start_on_missing_credentials() {
        let mut config = test_config(LockMode::None);
        config.auth_strategy = AuthStrategy::Strict;
        config.credentials_path = Some("/nonexistent/creds.json".to_owned());
        assert!(SheetsHost::start(config).await.is_err());
    }
}
