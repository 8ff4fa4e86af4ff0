//! Core engine of the trawl web-scraping framework.
//!
//! A [`Trawler`] pulls prioritized jobs from a [`JobProvider`], executes
//! them through a pluggable [`HttpFetcher`] (plain HTTP or browser-driven),
//! optionally caches responses, parses them, runs the job's `process` hook
//! and ships results to writers. Concrete fetchers live in `trawl-client`,
//! proxy plumbing in `trawl-proxy`.

pub mod browser;
pub mod engine;
pub mod error;
pub mod job;
pub mod provider;
pub mod proxy;
pub mod response;
pub mod result;
pub mod retry;
pub mod shutdown;
pub mod stats;
pub mod testutil;
pub mod traits;

pub use browser::{BrowserPage, Locator, PageResponse, WaitUntil};
pub use engine::{Trawler, TrawlerBuilder};
pub use error::Error;
pub use job::{Job, JobLike, JobRef, Priority, ProcessOutput};
pub use provider::{JobProvider, MemoryProvider};
pub use proxy::Proxy;
pub use response::{Document, Response};
pub use result::ScrapeResult;
pub use retry::RetryPolicy;
pub use shutdown::Shutdown;
pub use traits::{Cacher, HtmlParser, HttpFetcher, ProxyRotator, ResultWriter};
