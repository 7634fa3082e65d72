//! Retrying, paced wrapper around a [`RemoteSource`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use gapsync_common::{IdWindow, Result};

use crate::retry::{RetryConfig, RetryExecutor};
use crate::source::{RemoteSource, WindowPage};

/// Default pause between successive calls to the catalog.
pub const DEFAULT_PACING: Duration = Duration::from_secs(1);

/// Remote source client applying retry and request pacing.
///
/// Every fetch is run through the retry executor; retries are exhausted
/// before a failure reaches the caller. Successive calls are spaced by at
/// least `pacing` to avoid overloading the catalog.
pub struct SourceClient<S: RemoteSource + ?Sized> {
    inner: Arc<S>,
    retry: RetryExecutor,
    pacing: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl<S: RemoteSource + 'static> SourceClient<S> {
    /// Wrap a source with the default retry policy and pacing.
    pub fn new(source: S) -> Self {
        Self::from_arc(Arc::new(source))
    }
}

impl<S: RemoteSource + ?Sized> SourceClient<S> {
    /// Wrap an Arc-held source with the default retry policy and pacing.
    pub fn from_arc(source: Arc<S>) -> Self {
        Self {
            inner: source,
            retry: RetryExecutor::default(),
            pacing: DEFAULT_PACING,
            last_call: Mutex::new(None),
        }
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryExecutor::new(config);
        self
    }

    /// Set the minimum spacing between calls.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Access the wrapped source.
    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    /// Sleep until `pacing` has elapsed since the last successful call.
    async fn pace(&self) {
        if self.pacing.is_zero() {
            return;
        }
        let last = *self.last_call.lock().await;
        if let Some(last) = last {
            let elapsed = last.elapsed();
            if elapsed < self.pacing {
                let wait = self.pacing - elapsed;
                debug!("Pacing catalog requests, waiting {:?}", wait);
                sleep(wait).await;
            }
        }
    }

    async fn mark_call(&self) {
        *self.last_call.lock().await = Some(Instant::now());
    }
}

#[async_trait]
impl<S: RemoteSource + ?Sized> RemoteSource for SourceClient<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch_window(&self, window: IdWindow) -> Result<WindowPage> {
        self.pace().await;
        let source: &S = &self.inner;
        let page = self.retry.execute(move || source.fetch_window(window)).await?;
        self.mark_call().await;
        Ok(page)
    }

    async fn check_reachable(&self) -> bool {
        self.inner.check_reachable().await
    }

    async fn declared_total(&self) -> Result<u64> {
        self.pace().await;
        let source: &S = &self.inner;
        let total = self.retry.execute(move || source.declared_total()).await?;
        self.mark_call().await;
        Ok(total)
    }
}
