use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::BrowserSection;
use crate::job::{CapturedUrl, DiscoveryMethod};

use super::error::{SessionError, SessionResult};
use super::{PageHandle, PageSession, SelectionStrategy, VideoSource};

const SOURCE_MENU_SELECTOR: &str = ".subplayermenu a, .subplayermenu button";
const PLAYER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Hook installed before any page script runs. Fetch and XHR URLs are
/// collected into a window bucket the extractor drains later.
const NETWORK_HOOK: &str = r#"
(() => {
    const bucket = [];
    const push = (url) => {
        try {
            bucket.push(String(url || ''));
        } catch (_) {
            // ignore
        }
    };
    Object.defineProperty(window, '__kukajCapturedUrls', {
        value: bucket,
        writable: false,
        configurable: false,
    });

    const originalFetch = window.fetch;
    window.fetch = async (...args) => {
        const response = await originalFetch(...args);
        try {
            const request = args[0];
            push(typeof request === 'string' ? request : request.url);
        } catch (_) {}
        return response;
    };

    const OriginalXHR = window.XMLHttpRequest;
    window.XMLHttpRequest = function() {
        const xhr = new OriginalXHR();
        const open = xhr.open;
        xhr.open = function(method, url) {
            push(url);
            return open.apply(xhr, arguments);
        };
        return xhr;
    };
})();
"#;

/// Drains the network bucket and sweeps the page for playlist URLs that
/// never went through fetch or XHR (video tags, script text, resource
/// timing entries).
const COLLECT_SCRIPT: &str = r#"
(() => {
    const network = (window.__kukajCapturedUrls || [])
        .filter((url) => url.includes('.m3u8'));
    const swept = [];
    try {
        for (const entry of performance.getEntriesByType('resource')) {
            if (String(entry.name).includes('.m3u8')) swept.push(String(entry.name));
        }
    } catch (_) {}
    try {
        for (const video of document.querySelectorAll('video, source')) {
            const src = video.currentSrc || video.src || video.getAttribute('src') || '';
            if (src.includes('.m3u8')) swept.push(src);
        }
    } catch (_) {}
    try {
        for (const script of document.querySelectorAll('script:not([src])')) {
            const match = (script.textContent || '').match(/https?:[^"'\s]+\.m3u8[^"'\s]*/g);
            if (match) swept.push(...match);
        }
    } catch (_) {}
    return { network, swept };
})()
"#;

#[derive(Debug, Deserialize)]
struct CollectedUrls {
    network: Vec<String>,
    swept: Vec<String>,
}

/// The bucket keeps every fetch a player retried, so the same URL shows
/// up many times. Insertion order is preserved; network hits win over
/// sweep hits for the same URL.
fn merge_captured(collected: CollectedUrls) -> Vec<CapturedUrl> {
    let mut urls: Vec<CapturedUrl> = Vec::new();
    for url in collected.network {
        if urls.iter().any(|existing| existing.url == url) {
            continue;
        }
        urls.push(CapturedUrl {
            url,
            method: DiscoveryMethod::NetworkRequest,
        });
    }
    for url in collected.swept {
        if urls.iter().any(|existing| existing.url == url) {
            continue;
        }
        urls.push(CapturedUrl {
            url,
            method: DiscoveryMethod::PageScript,
        });
    }
    urls
}

#[derive(Debug, Deserialize)]
struct RawSource {
    label: String,
    href: Option<String>,
}

/// Opens player pages in a dedicated Chromium instance per job. Each
/// `open` launches a fresh browser so no cookies or player state leak
/// between downloads.
pub struct ChromiumSession {
    config: BrowserSection,
}

impl ChromiumSession {
    pub fn new(config: BrowserSection) -> Self {
        Self { config }
    }

    fn chromium_config(&self) -> SessionResult<ChromiumConfig> {
        let [width, height] = self.config.viewport;
        let mut builder = ChromiumConfig::builder()
            .chrome_executable(&self.config.executable_path)
            .window_size(width, height)
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--autoplay-policy=no-user-gesture-required");
        if self.config.mute_audio {
            builder = builder.arg("--mute-audio");
        }
        if !self.config.sandbox {
            builder = builder.arg("--no-sandbox");
        }
        if !self.config.headless {
            builder = builder.with_head();
        }
        builder.build().map_err(SessionError::Launch)
    }

    async fn configure_page(&self, page: &Page) -> SessionResult<()> {
        page.enable_stealth_mode_with_agent(&self.config.user_agent)
            .await?;

        let params = SetUserAgentOverrideParams::builder()
            .user_agent(self.config.user_agent.clone())
            .build()
            .map_err(SessionError::Configuration)?;
        page.set_user_agent(params).await?;

        page.evaluate_on_new_document(
            AddScriptToEvaluateOnNewDocumentParams::builder()
                .source(NETWORK_HOOK)
                .build()
                .map_err(SessionError::Configuration)?,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PageSession for ChromiumSession {
    async fn open(&self, url: &Url) -> SessionResult<Box<dyn PageHandle>> {
        let chromium_config = self.chromium_config()?;
        info!(target = %url, headless = self.config.headless, "launching chromium");
        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| SessionError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        let params = CreateTargetParams::new("about:blank");
        let page = browser.new_page(params).await?;
        self.configure_page(&page).await?;

        let navigation = async {
            let params = NavigateParams::builder()
                .url(url.as_str())
                .build()
                .map_err(SessionError::Configuration)?;
            page.goto(params).await?;
            page.wait_for_navigation().await?;
            Ok::<_, SessionError>(())
        };
        tokio::time::timeout(self.config.navigation_timeout(), navigation)
            .await
            .map_err(|_| SessionError::Timeout(format!("navigation to {url}")))??;

        Ok(Box::new(ChromiumPage {
            browser,
            page,
            handler_task: Some(handler_task),
        }))
    }
}

pub struct ChromiumPage {
    browser: Browser,
    page: Page,
    handler_task: Option<JoinHandle<()>>,
}

impl ChromiumPage {
    async fn player_is_active(&self) -> SessionResult<bool> {
        let script = r#"
(() => {
    if (document.querySelector('video')) return true;
    for (const frame of document.querySelectorAll('iframe')) {
        const src = frame.src || '';
        if (src.length > 0 && !src.startsWith('about:')) return true;
    }
    return false;
})()
"#;
        let active = self
            .page
            .evaluate(script)
            .await?
            .into_value::<bool>()
            .map_err(|err| SessionError::Script(err.to_string()))?;
        Ok(active)
    }

    async fn click_source(&self, source: &VideoSource) -> SessionResult<()> {
        let script = format!(
            r#"
(() => {{
    for (const el of document.querySelectorAll({selector:?})) {{
        if ((el.textContent || '').trim().toUpperCase() === {label:?}) {{
            el.click();
            return true;
        }}
    }}
    return false;
}})()
"#,
            selector = SOURCE_MENU_SELECTOR,
            label = source.label.to_uppercase(),
        );
        let clicked = self
            .page
            .evaluate(script)
            .await?
            .into_value::<bool>()
            .map_err(|err| SessionError::Script(err.to_string()))?;
        if clicked {
            Ok(())
        } else {
            Err(SessionError::Script(format!(
                "source button {} not found",
                source.label
            )))
        }
    }

    async fn navigate_to_href(&self, source: &VideoSource) -> SessionResult<()> {
        let href = source.href.as_deref().ok_or_else(|| {
            SessionError::Navigation(format!("source {} has no link target", source.label))
        })?;
        let params = NavigateParams::builder()
            .url(href)
            .build()
            .map_err(SessionError::Configuration)?;
        self.page.goto(params).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn wait_for_player(&self, timeout: Duration) -> SessionResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.player_is_active().await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(PLAYER_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl PageHandle for ChromiumPage {
    async fn available_sources(&self) -> SessionResult<Vec<VideoSource>> {
        let script = format!(
            r#"
(() => {{
    const sources = [];
    for (const el of document.querySelectorAll({selector:?})) {{
        const label = (el.textContent || '').trim();
        if (label.length === 0) continue;
        sources.push({{ label, href: el.getAttribute('href') }});
    }}
    return sources;
}})()
"#,
            selector = SOURCE_MENU_SELECTOR,
        );
        let raw = self
            .page
            .evaluate(script)
            .await?
            .into_value::<Vec<RawSource>>()
            .map_err(|err| SessionError::Script(err.to_string()))?;
        Ok(raw
            .into_iter()
            .map(|source| VideoSource {
                label: source.label,
                href: source.href.filter(|href| !href.is_empty()),
            })
            .collect())
    }

    async fn select_source(
        &self,
        source: &VideoSource,
        strategy: SelectionStrategy,
        timeout: Duration,
    ) -> SessionResult<bool> {
        debug!(source = %source.label, strategy = strategy.label(), "activating source");
        match strategy {
            SelectionStrategy::DirectControl | SelectionStrategy::ExtendedWait => {
                self.click_source(source).await?;
            }
            SelectionStrategy::AlternateRoute => {
                let navigation = self.navigate_to_href(source);
                tokio::time::timeout(timeout, navigation)
                    .await
                    .map_err(|_| {
                        SessionError::Timeout(format!("navigation to source {}", source.label))
                    })??;
            }
        }
        self.wait_for_player(timeout).await
    }

    async fn captured_urls(&self) -> SessionResult<Vec<CapturedUrl>> {
        let collected = self
            .page
            .evaluate(COLLECT_SCRIPT)
            .await?
            .into_value::<CollectedUrls>()
            .map_err(|err| SessionError::Script(err.to_string()))?;
        Ok(merge_captured(collected))
    }

    async fn close(mut self: Box<Self>) -> SessionResult<()> {
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "failed to close browser gracefully");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "browser handler join error");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_drops_repeated_network_entries() {
        let merged = merge_captured(CollectedUrls {
            network: vec![
                "https://cdn.example/master.m3u8".into(),
                "https://cdn.example/master.m3u8".into(),
                "https://cdn.example/variant.m3u8".into(),
            ],
            swept: vec![
                "https://cdn.example/master.m3u8".into(),
                "https://cdn.example/sweep-only.m3u8".into(),
            ],
        });
        let urls: Vec<&str> = merged.iter().map(|entry| entry.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://cdn.example/master.m3u8",
                "https://cdn.example/variant.m3u8",
                "https://cdn.example/sweep-only.m3u8",
            ]
        );
        assert_eq!(merged[0].method, DiscoveryMethod::NetworkRequest);
        assert_eq!(merged[2].method, DiscoveryMethod::PageScript);
    }
}
