//! Contracts the engine consumes. Concrete implementations live in the
//! `trawl-client` and `trawl-proxy` crates, or in user code.

use async_trait::async_trait;

use crate::error::Error;
use crate::job::JobLike;
use crate::proxy::Proxy;
use crate::response::{Document, Response};
use crate::result::ScrapeResult;

/// Produces a [`Response`] for a job over plain HTTP or a browser.
///
/// Fetchers never fail at the call boundary: failures are reported inside
/// the response envelope so the engine's retry loop stays in charge.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn fetch(&self, job: &dyn JobLike) -> Response;

    /// Hook invoked by the `RefreshIp` retry policy before the next
    /// attempt. The default does nothing, degrading the policy to a plain
    /// retry.
    async fn refresh_ip(&self) {}

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Turns a response body into an opaque parsed document.
#[async_trait]
pub trait HtmlParser: Send + Sync {
    async fn parse(&self, body: &[u8]) -> Result<Document, Error>;
}

/// Response cache keyed by the job's deterministic cache key.
#[async_trait]
pub trait Cacher: Send + Sync {
    /// `Ok(None)` is a miss.
    async fn get(&self, key: &str) -> Result<Option<Response>, Error>;

    async fn set(&self, key: &str, response: &Response) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Consumes the results stream. Writers run concurrently; a writer error
/// cancels the engine.
#[async_trait]
pub trait ResultWriter: Send + Sync {
    async fn run(&self, results: kanal::AsyncReceiver<ScrapeResult>) -> Result<(), Error>;
}

/// Hands out upstream proxies in rotation.
pub trait ProxyRotator: Send + Sync {
    fn next(&self) -> Proxy;
}
