//! Pooled headless-browser fetcher.
//!
//! Maintains a bounded pool of Chromium instances over the Chrome DevTools
//! Protocol. Each pooled entry owns its CDP handler task, at most one
//! reusable page and two reuse counters; worn-out pages and browsers are
//! closed and replaced instead of living forever.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use kanal::{bounded_async, AsyncReceiver, AsyncSender};
use trawl_core::traits::{HttpFetcher, ProxyRotator};
use trawl_core::{Error, JobLike, Response};

use crate::page::CdpPage;

const DEFAULT_VIEWPORT: (u32, u32) = (1920, 1080);
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Options for [`BrowserFetcher::new`].
pub struct BrowserFetcherOptions {
    /// Run Chromium without a visible window.
    pub headless: bool,
    /// Skip image loading to save bandwidth.
    pub disable_images: bool,
    /// Number of pooled browsers.
    pub pool_size: usize,
    /// Jobs a single page serves before it is closed; 0 closes the page
    /// after every job.
    pub page_reuse_limit: u32,
    /// Jobs a single browser serves before it is replaced; 0 means no limit.
    pub browser_reuse_limit: u32,
    pub user_agent: String,
    /// New browsers are created with this rotator's next proxy.
    pub rotator: Option<Arc<dyn ProxyRotator>>,
}

impl Default for BrowserFetcherOptions {
    fn default() -> Self {
        Self {
            headless: true,
            disable_images: false,
            pool_size: 1,
            page_reuse_limit: 0,
            browser_reuse_limit: 0,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            rotator: None,
        }
    }
}

struct PooledBrowser {
    browser: Browser,
    /// Drives the CDP connection; finishes when the browser disconnects.
    handler: tokio::task::JoinHandle<()>,
    page: Option<Page>,
    page_usage: u32,
    browser_usage: u32,
}

impl PooledBrowser {
    fn is_disconnected(&self) -> bool {
        self.handler.is_finished()
    }

    async fn close(mut self) {
        if let Some(page) = self.page.take() {
            let _ = page.close().await;
        }

        let _ = self.browser.close().await;
        let _ = self.browser.wait().await;
        self.handler.abort();
    }
}

/// Browser-pool fetcher: jobs run their `browser_actions` hook against a
/// pooled page.
pub struct BrowserFetcher {
    pool_tx: AsyncSender<PooledBrowser>,
    pool_rx: AsyncReceiver<PooledBrowser>,
    opts: BrowserFetcherOptions,
}

impl BrowserFetcher {
    /// Launch `pool_size` browsers up front.
    pub async fn new(opts: BrowserFetcherOptions) -> Result<Self, Error> {
        let pool_size = opts.pool_size.max(1);
        let (pool_tx, pool_rx) = bounded_async(pool_size);

        let fetcher = Self {
            pool_tx,
            pool_rx,
            opts,
        };

        for _ in 0..pool_size {
            let browser = fetcher.launch_browser().await?;
            let _ = fetcher.pool_tx.try_send(browser);
        }

        Ok(fetcher)
    }

    async fn launch_browser(&self) -> Result<PooledBrowser, Error> {
        let mut config = BrowserConfig::builder()
            .window_size(DEFAULT_VIEWPORT.0, DEFAULT_VIEWPORT.1)
            .arg("--no-sandbox")
            .arg("--no-default-browser-check")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-popup-blocking")
            .arg("--mute-audio")
            .arg("--no-first-run");

        if !self.opts.headless {
            config = config.with_head();
        }

        if self.opts.disable_images {
            config = config.arg("--blink-settings=imagesEnabled=false");
        }

        if let Some(rotator) = &self.opts.rotator {
            let proxy = rotator.next();
            config = config.arg(format!("--proxy-server={}", proxy.full_url()));
        }

        let config = config.build().map_err(Error::Browser)?;

        let (browser, mut events) = Browser::launch(config)
            .await
            .map_err(|e| Error::Browser(format!("failed to launch browser: {e}")))?;

        // The CDP handler must be polled for the connection to stay alive;
        // the task finishing doubles as the disconnect signal.
        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.is_err() {
                    tracing::warn!(error = ?event, "browser handler error");
                    break;
                }
            }
        });

        Ok(PooledBrowser {
            browser,
            handler,
            page: None,
            page_usage: 0,
            browser_usage: 0,
        })
    }

    async fn acquire(&self) -> Result<PooledBrowser, Error> {
        while let Ok(Some(pooled)) = self.pool_rx.try_recv() {
            if pooled.is_disconnected() {
                pooled.close().await;
                continue;
            }

            let limit = self.opts.browser_reuse_limit;
            if limit > 0 && pooled.browser_usage >= limit {
                pooled.close().await;
                return self.launch_browser().await;
            }

            return Ok(pooled);
        }

        self.launch_browser().await
    }

    async fn release(&self, pooled: PooledBrowser) {
        if pooled.is_disconnected() {
            pooled.close().await;
            return;
        }

        // Put back unless the pool is full or already closed.
        let mut slot = Some(pooled);
        let _ = self.pool_tx.try_send_option(&mut slot);
        if let Some(leftover) = slot.take() {
            leftover.close().await;
        }
    }

    /// Get the entry's single page, creating it on first use and closing
    /// any strays so at most one page exists per browser.
    async fn primary_page(&self, pooled: &mut PooledBrowser) -> Result<Page, Error> {
        if let Ok(pages) = pooled.browser.pages().await {
            for page in pages {
                let keep = pooled
                    .page
                    .as_ref()
                    .map(|p| p.target_id() == page.target_id())
                    .unwrap_or(false);
                if !keep {
                    let _ = page.close().await;
                }
            }
        }

        if let Some(page) = &pooled.page {
            return Ok(page.clone());
        }

        let page = pooled
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| Error::Browser(e.to_string()))?;

        let _ = page.set_user_agent(self.opts.user_agent.as_str()).await;

        pooled.page = Some(page.clone());
        Ok(page)
    }
}

#[async_trait]
impl HttpFetcher for BrowserFetcher {
    async fn fetch(&self, job: &dyn JobLike) -> Response {
        let mut pooled = match self.acquire().await {
            Ok(pooled) => pooled,
            Err(e) => return Response::from_error(e.to_string()),
        };

        let page = match self.primary_page(&mut pooled).await {
            Ok(page) => page,
            Err(e) => {
                pooled.close().await;
                return Response::from_error(e.to_string());
            }
        };

        pooled.page_usage += 1;
        pooled.browser_usage += 1;

        let cdp_page = CdpPage::new(page.clone());

        // The job timeout doubles as the page's default deadline.
        let response = match job.timeout() {
            Some(deadline) if !deadline.is_zero() => {
                match tokio::time::timeout(deadline, job.browser_actions(&cdp_page)).await {
                    Ok(response) => response,
                    Err(_) => Response::from_error(format!(
                        "browser actions timed out after {deadline:?}"
                    )),
                }
            }
            _ => job.browser_actions(&cdp_page).await,
        };

        let limit = self.opts.page_reuse_limit;
        if limit == 0 || pooled.page_usage >= limit {
            if let Some(page) = pooled.page.take() {
                let _ = page.close().await;
            }
            pooled.page_usage = 0;
        }

        self.release(pooled).await;

        response
    }

    async fn close(&self) -> Result<(), Error> {
        // Drain before closing the channel so every pooled browser shuts
        // down cleanly; entries released afterwards close themselves.
        while let Ok(Some(pooled)) = self.pool_rx.try_recv() {
            pooled.close().await;
        }

        self.pool_tx.close();
        Ok(())
    }
}
