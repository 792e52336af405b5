//! Shared headless-Chrome engine via chromiumoxide
//!
//! One Chromium process serves every caller in the process. Callers take a
//! lease (a fresh tab) and hand it back; the engine itself is only closed
//! once no lease is outstanding. `request_shutdown` is therefore safe to
//! call unconditionally after any top-level operation, even while sibling
//! tasks are mid-navigation: their leases keep the process alive and the
//! shutdown completes when the last one is released.

use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Error;

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Extra settle time after the load event when waiting for network idle.
const NETWORK_IDLE_SETTLE: Duration = Duration::from_millis(500);

/// How long to wait for page readiness after navigation commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStrategy {
    /// The DOM is parsed; scripts may still be running.
    DomContentLoaded,
    /// The load event fired.
    Load,
    /// The load event fired and the network has gone quiet.
    #[default]
    NetworkIdle,
}

/// The running Chromium process plus its CDP event pump.
struct Engine {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl Engine {
    async fn launch() -> Result<Self, Error> {
        let config = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-setuid-sandbox")
            .arg("--no-first-run")
            .arg("--headless=new")
            .build()
            .map_err(|e| Error::EngineUnavailable(format!("browser config error: {}", e)))?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(|e| {
            Error::EngineUnavailable(format!(
                "failed to launch Chrome, is Chrome/Chromium installed? ({})",
                e
            ))
        })?;

        // The CDP handler must be polled continuously for the connection to work.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    warn!("browser CDP handler error: {:?}", event);
                    break;
                }
            }
        });

        Ok(Self { browser, handler })
    }

    async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("error closing browser: {}", e);
        }
        self.handler.abort();
    }
}

/// Lease accounting, separated from the engine so the transitions are
/// testable without Chrome.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct LeaseCounter {
    active: usize,
    shutdown_requested: bool,
}

impl LeaseCounter {
    fn acquire(&mut self) {
        self.active += 1;
    }

    /// Returns true when a deferred shutdown should close the engine now.
    fn release(&mut self) -> bool {
        self.active = self.active.saturating_sub(1);
        self.active == 0 && self.shutdown_requested
    }

    /// Returns true when the engine can be closed immediately; otherwise the
    /// shutdown is remembered until the counter drains.
    fn request_shutdown(&mut self) -> bool {
        if self.active == 0 {
            true
        } else {
            self.shutdown_requested = true;
            false
        }
    }

    fn mark_closed(&mut self) {
        self.shutdown_requested = false;
    }
}

struct Shared {
    engine: Option<Engine>,
    counter: LeaseCounter,
}

/// Owner of the single shared browser process.
///
/// Cheap to clone; all clones share the same engine and lease counter.
#[derive(Clone)]
pub struct BrowserManager {
    shared: Arc<Mutex<Shared>>,
}

impl Default for BrowserManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BrowserManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                engine: None,
                counter: LeaseCounter::default(),
            })),
        }
    }

    /// Take a lease: a fresh tab backed by the shared engine, which is
    /// launched lazily on first use and relaunched transparently after a
    /// completed shutdown.
    pub async fn acquire(&self) -> Result<BrowserLease, Error> {
        let mut shared = self.shared.lock().await;

        if shared.engine.is_none() {
            info!("launching shared browser engine");
            shared.engine = Some(Engine::launch().await?);
        }
        let Some(engine) = shared.engine.as_ref() else {
            return Err(Error::EngineUnavailable("engine launch raced away".into()));
        };

        let page = engine
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| Error::EngineUnavailable(format!("failed to open page: {}", e)))?;
        page.execute(SetUserAgentOverrideParams::new(USER_AGENT))
            .await
            .map_err(|e| Error::EngineUnavailable(format!("failed to set user agent: {}", e)))?;

        shared.counter.acquire();
        debug!(active = shared.counter.active, "browser lease acquired");

        Ok(BrowserLease {
            page: Some(page),
            manager: self.clone(),
            released: false,
        })
    }

    /// Close the shared engine, or arrange for it to close once the last
    /// outstanding lease is released. Idempotent and always safe to call.
    pub async fn request_shutdown(&self) {
        let mut shared = self.shared.lock().await;
        if shared.counter.request_shutdown() {
            if let Some(engine) = shared.engine.take() {
                info!("closing shared browser engine");
                engine.close().await;
            }
            shared.counter.mark_closed();
        } else {
            debug!(
                active = shared.counter.active,
                "shutdown deferred until all leases release"
            );
        }
    }

    async fn finish_release(&self) {
        let mut shared = self.shared.lock().await;
        if shared.counter.release() {
            if let Some(engine) = shared.engine.take() {
                info!("closing shared browser engine after deferred shutdown");
                engine.close().await;
            }
            shared.counter.mark_closed();
        } else {
            debug!(active = shared.counter.active, "browser lease released");
        }
    }
}

/// A caller's temporary right to use the shared engine through one tab.
pub struct BrowserLease {
    page: Option<Page>,
    manager: BrowserManager,
    released: bool,
}

impl BrowserLease {
    /// Navigate and return the rendered HTML.
    ///
    /// The whole operation runs under `timeout`; elapsing it or any
    /// navigation error surfaces as a fallback fetch failure.
    pub async fn navigate(
        &self,
        url: &str,
        wait: WaitStrategy,
        timeout: Duration,
    ) -> Result<String, Error> {
        let Some(page) = &self.page else {
            return Err(Error::FallbackFetchFailed(
                "lease already released".to_string(),
            ));
        };

        let result = tokio::time::timeout(timeout, async {
            page.goto(url).await.map_err(|e| {
                Error::FallbackFetchFailed(format!("navigation to {} failed: {}", url, e))
            })?;

            match wait {
                WaitStrategy::DomContentLoaded => {
                    // DOM readiness signal: <body> resolves
                    page.find_element("body").await.map_err(|e| {
                        Error::FallbackFetchFailed(format!("page did not render a body: {}", e))
                    })?;
                }
                WaitStrategy::Load => {
                    let _ = page.wait_for_navigation().await;
                }
                WaitStrategy::NetworkIdle => {
                    let _ = page.wait_for_navigation().await;
                    tokio::time::sleep(NETWORK_IDLE_SETTLE).await;
                }
            }

            page.content()
                .await
                .map_err(|e| Error::FallbackFetchFailed(format!("failed to read content: {}", e)))
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::FallbackFetchFailed(format!(
                "navigation to {} timed out after {}ms",
                url,
                timeout.as_millis()
            ))),
        }
    }

    /// Close the tab and hand the lease back. Releasing twice is a no-op.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                debug!("error closing page: {}", e);
            }
        }
        self.manager.finish_release().await;
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // A lease dropped by an early return or panic must still hand its
        // count back, or a pending shutdown would never fire.
        let manager = self.manager.clone();
        let page = self.page.take();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Some(page) = page {
                    let _ = page.close().await;
                }
                manager.finish_release().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_with_no_leases_closes_immediately() {
        let mut counter = LeaseCounter::default();
        assert!(counter.request_shutdown());
    }

    #[test]
    fn test_shutdown_deferred_while_leases_outstanding() {
        let mut counter = LeaseCounter::default();
        counter.acquire();
        counter.acquire();

        // Two leases out: shutdown must wait
        assert!(!counter.request_shutdown());
        assert!(counter.shutdown_requested);

        // First release: still one lease out
        assert!(!counter.release());
        // Second release: now the engine closes
        assert!(counter.release());
        counter.mark_closed();

        // A later acquire starts a fresh cycle with no stale flag
        counter.acquire();
        assert!(!counter.shutdown_requested);
        assert!(!counter.release());
    }

    #[test]
    fn test_release_without_shutdown_keeps_engine() {
        let mut counter = LeaseCounter::default();
        counter.acquire();
        assert!(!counter.release());
        assert_eq!(counter.active, 0);
    }

    #[test]
    fn test_release_saturates() {
        let mut counter = LeaseCounter::default();
        assert!(!counter.release());
        assert_eq!(counter.active, 0);
    }

    #[test]
    fn test_acquire_during_deferred_shutdown_extends_wait() {
        let mut counter = LeaseCounter::default();
        counter.acquire();
        assert!(!counter.request_shutdown());

        // A sibling task takes a lease while shutdown is pending
        counter.acquire();
        assert!(!counter.release());
        assert!(counter.release());
    }
}
