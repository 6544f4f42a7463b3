//! Rendered fetch transport: a bounded pool of headless browsers.
//!
//! Roughly one URL in ten needs JavaScript before the document exists in
//! the DOM. Those go through a shared pool of `chromiumoxide` browsers;
//! acquisition blocks when all instances are busy, and an instance is
//! recycled after `browser_max_requests` navigations to bound its memory.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as CdpBrowserConfig};
use futures::StreamExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BrowserConfig;
use crate::error::{CollectError, Result};

use super::{FetchTransport, FetchedPayload};

struct BrowserSlot {
    browser: Browser,
    handler_task: JoinHandle<()>,
    served: u64,
}

impl BrowserSlot {
    fn needs_recycle(&self, max_requests: u64) -> bool {
        self.served >= max_requests
    }

    async fn shutdown(mut self) {
        let _ = self.browser.close().await;
        self.handler_task.abort();
    }
}

/// Shared pool of launched browser instances. Workers borrow one per
/// rendered fetch and return it afterwards.
pub struct BrowserPool {
    config: BrowserConfig,
    idle: Mutex<VecDeque<BrowserSlot>>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for BrowserPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserPool")
            .field("pool_size", &self.config.pool_size)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl BrowserPool {
    pub fn new(config: BrowserConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.pool_size.max(1)));
        Self {
            config,
            idle: Mutex::new(VecDeque::new()),
            permits,
        }
    }

    async fn launch(&self) -> Result<BrowserSlot> {
        let cdp_config = CdpBrowserConfig::builder()
            .build()
            .map_err(CollectError::Browser)?;
        let (browser, mut handler) = Browser::launch(cdp_config)
            .await
            .map_err(|err| CollectError::Browser(err.to_string()))?;
        let handler_task = tokio::spawn(async move {
            while handler.next().await.is_some() {}
        });
        tracing::debug!(
            target: "collect::browser",
            "launched headless browser instance"
        );
        Ok(BrowserSlot {
            browser,
            handler_task,
            served: 0,
        })
    }

    /// Borrow a browser, navigate, and return the final document HTML.
    async fn navigate(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(CollectError::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => permit
                .map_err(|_| CollectError::Cancelled)?,
        };

        let mut slot = match self.idle.lock().await.pop_front() {
            Some(slot) => slot,
            None => self.launch().await?,
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(CollectError::Cancelled),
            rendered = tokio::time::timeout(
                self.config.navigation_timeout(),
                render_page(&slot.browser, url),
            ) => match rendered {
                Ok(result) => result,
                Err(_) => Err(CollectError::Browser(format!(
                    "navigation to {url} timed out"
                ))),
            },
        };

        slot.served += 1;
        if slot.needs_recycle(self.config.max_requests) || result.is_err() {
            slot.shutdown().await;
        } else {
            self.idle.lock().await.push_back(slot);
        }
        drop(permit);

        result
    }

    /// Close every pooled instance. Called on dispatcher shutdown.
    pub async fn close_all(&self) {
        let mut idle = self.idle.lock().await;
        while let Some(slot) = idle.pop_front() {
            slot.shutdown().await;
        }
    }
}

async fn render_page(browser: &Browser, url: &str) -> Result<String> {
    let page = browser
        .new_page(url)
        .await
        .map_err(|err| CollectError::Browser(err.to_string()))?;
    page.wait_for_navigation()
        .await
        .map_err(|err| CollectError::Browser(err.to_string()))?;
    let html = page
        .content()
        .await
        .map_err(|err| CollectError::Browser(err.to_string()))?;
    let _ = page.close().await;
    Ok(html)
}

/// [`FetchTransport`] over the browser pool. A completed navigation is
/// reported as HTTP 200 with an HTML content type; navigation failures
/// surface as transient network failures upstream.
pub struct RenderedFetcher {
    pool: Arc<BrowserPool>,
}

impl std::fmt::Debug for RenderedFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderedFetcher")
            .field("pool", &self.pool)
            .finish()
    }
}

impl RenderedFetcher {
    pub fn new(pool: Arc<BrowserPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FetchTransport for RenderedFetcher {
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchedPayload> {
        let started = Instant::now();
        let html = self.pool.navigate(url, cancel).await?;
        Ok(FetchedPayload {
            status: 200,
            content_type: Some("text/html".to_string()),
            bytes: html.into_bytes(),
            elapsed: started.elapsed(),
            final_url: url.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reports_configured_permits() {
        let pool = BrowserPool::new(BrowserConfig {
            pool_size: 3,
            ..BrowserConfig::default()
        });
        assert_eq!(pool.permits.available_permits(), 3);
    }
}
