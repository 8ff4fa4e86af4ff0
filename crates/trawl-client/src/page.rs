//! chromiumoxide-backed implementation of the core browser-page contract.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventResponseReceived, ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::{
    EventLifecycleEvent, ReloadParams, SetLifecycleEventsEnabledParams,
};
use chromiumoxide::cdp::js_protocol::runtime::{
    CallArgument, CallFunctionOnParams, EvaluateParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use trawl_core::browser::{
    glob_to_regex, is_js_function_expression, BrowserPage, Locator, PageResponse, WaitUntil,
    URL_POLL_INTERVAL,
};
use trawl_core::Error;

/// Page wrapper implementing [`BrowserPage`] over the Chrome DevTools
/// Protocol.
#[derive(Clone)]
pub struct CdpPage {
    page: Page,
}

impl CdpPage {
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    /// The underlying chromiumoxide page, for driver-specific features.
    pub fn unwrap(&self) -> &Page {
        &self.page
    }

    /// Subscribe to lifecycle events. Must happen before navigating, or a
    /// fast page can fire the awaited event into nowhere.
    async fn lifecycle_events(&self) -> Result<LifecycleStream, Error> {
        self.page
            .event_listener::<EventLifecycleEvent>()
            .await
            .map_err(cdp_err)
    }

    async fn enable_instrumentation(&self) -> Result<(), Error> {
        self.page
            .execute(EnableParams::default())
            .await
            .map_err(cdp_err)?;

        let lifecycle = SetLifecycleEventsEnabledParams::builder()
            .enabled(true)
            .build()
            .map_err(Error::Browser)?;
        self.page.execute(lifecycle).await.map_err(cdp_err)?;

        Ok(())
    }
}

type LifecycleStream = chromiumoxide::listeners::EventStream<EventLifecycleEvent>;

fn cdp_err(e: chromiumoxide::error::CdpError) -> Error {
    Error::Browser(e.to_string())
}

async fn await_lifecycle(events: &mut LifecycleStream, wait_until: WaitUntil) -> Result<(), Error> {
    let target = match wait_until {
        WaitUntil::Load => "load",
        WaitUntil::DomContentLoaded => "DOMContentLoaded",
        WaitUntil::NetworkIdle => "networkIdle",
    };

    while let Some(event) = events.next().await {
        if event.name == target {
            return Ok(());
        }
    }

    Err(Error::Browser(format!(
        "page closed while waiting for {target}"
    )))
}

fn headers_to_map(
    headers: &chromiumoxide::cdp::browser_protocol::network::Headers,
) -> HashMap<String, String> {
    let mut map = HashMap::new();

    if let Ok(serde_json::Value::Object(entries)) = serde_json::to_value(headers) {
        for (name, value) in entries {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            map.insert(name, value);
        }
    }

    map
}

#[async_trait]
impl BrowserPage for CdpPage {
    async fn goto(&self, url: &str, wait_until: WaitUntil) -> Result<PageResponse, Error> {
        self.enable_instrumentation().await?;

        // Capture the main-document response off the event stream; pages
        // served from cache never emit one and default to 200.
        let captured: Arc<Mutex<Option<(u16, HashMap<String, String>)>>> =
            Arc::new(Mutex::new(None));

        let mut responses = self
            .page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(cdp_err)?;

        let sink = captured.clone();
        let listener = tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                if matches!(event.r#type, ResourceType::Document) {
                    let status = u16::try_from(event.response.status).unwrap_or(0);
                    let headers = headers_to_map(&event.response.headers);
                    *sink.lock().unwrap() = Some((status, headers));
                    return;
                }
            }
        });

        let mut lifecycles = self.lifecycle_events().await?;

        let navigated = async {
            self.page.goto(url).await.map_err(cdp_err)?;
            await_lifecycle(&mut lifecycles, wait_until).await
        }
        .await;

        listener.abort();

        navigated?;

        let (status, headers) = captured
            .lock()
            .unwrap()
            .take()
            .unwrap_or((200, HashMap::new()));

        let final_url = self.url().await?;
        let body = self.content().await?.into_bytes();

        Ok(PageResponse {
            url: final_url,
            status,
            headers,
            body,
        })
    }

    async fn url(&self) -> Result<String, Error> {
        Ok(self
            .page
            .url()
            .await
            .map_err(cdp_err)?
            .unwrap_or_default())
    }

    async fn content(&self) -> Result<String, Error> {
        self.page.content().await.map_err(cdp_err)
    }

    async fn reload(&self, wait_until: WaitUntil) -> Result<(), Error> {
        self.enable_instrumentation().await?;
        let mut lifecycles = self.lifecycle_events().await?;

        self.page
            .execute(ReloadParams::default())
            .await
            .map_err(cdp_err)?;

        await_lifecycle(&mut lifecycles, wait_until).await
    }

    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, Error> {
        let params = chromiumoxide::page::ScreenshotParams::builder()
            .full_page(full_page)
            .build();

        self.page.screenshot(params).await.map_err(cdp_err)
    }

    async fn eval(
        &self,
        js: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, Error> {
        if is_js_function_expression(js) {
            let mut params = CallFunctionOnParams::builder().function_declaration(js);

            for arg in args {
                params = params.argument(CallArgument::builder().value(arg).build());
            }

            let evaluated = self
                .page
                .evaluate_function(params.build().map_err(Error::Browser)?)
                .await
                .map_err(cdp_err)?;

            return Ok(evaluated.value().cloned().unwrap_or(serde_json::Value::Null));
        }

        // IIFEs and bare expressions go straight through the runtime.
        let params = EvaluateParams::builder()
            .expression(js)
            .return_by_value(true)
            .await_promise(true)
            .build()
            .map_err(Error::Browser)?;

        let evaluated = self.page.execute(params).await.map_err(cdp_err)?;
        let returns = &evaluated.result;

        if let Some(exception) = &returns.exception_details {
            return Err(Error::Browser(format!("eval error: {}", exception.text)));
        }

        Ok(returns.result.value.clone().unwrap_or(serde_json::Value::Null))
    }

    async fn wait_for_url(&self, pattern: &str, timeout: Duration) -> Result<(), Error> {
        let matcher = match regex::Regex::new(&glob_to_regex(pattern)) {
            Ok(re) => re,
            // Invalid as a regex: fall back to a literal match.
            Err(_) => regex::Regex::new(&regex::escape(pattern))
                .map_err(|e| Error::Browser(e.to_string()))?,
        };

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if matcher.is_match(&self.url().await?) {
                return Ok(());
            }
            tokio::time::sleep(URL_POLL_INTERVAL.min(deadline - Instant::now())).await;
        }

        Err(Error::Browser(format!(
            "timeout waiting for URL to match pattern: {pattern}"
        )))
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(Error::Browser(format!(
                    "timeout waiting for selector: {selector}"
                )));
            }

            tokio::time::sleep(URL_POLL_INTERVAL).await;
        }
    }

    async fn wait_for_timeout(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }

    fn locator(&self, selector: &str) -> Box<dyn Locator> {
        Box::new(CdpLocator {
            page: self.page.clone(),
            selector: selector.to_string(),
        })
    }

    async fn close(&self) -> Result<(), Error> {
        self.page.clone().close().await.map_err(cdp_err)
    }
}

/// Selector-based locator over a [`CdpPage`].
pub struct CdpLocator {
    page: Page,
    selector: String,
}

#[async_trait]
impl Locator for CdpLocator {
    async fn click(&self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.page.find_element(&self.selector).await {
                Ok(element) => {
                    element.click().await.map_err(cdp_err)?;
                    return Ok(());
                }
                Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(URL_POLL_INTERVAL).await;
                }
                Err(e) => return Err(cdp_err(e)),
            }
        }
    }

    async fn count(&self) -> Result<usize, Error> {
        let elements = self
            .page
            .find_elements(&self.selector)
            .await
            .map_err(cdp_err)?;

        Ok(elements.len())
    }

    fn first(&self) -> Box<dyn Locator> {
        // Matching is selector-based; narrowing to the first element is the
        // click/count behavior already.
        Box::new(CdpLocator {
            page: self.page.clone(),
            selector: self.selector.clone(),
        })
    }
}
