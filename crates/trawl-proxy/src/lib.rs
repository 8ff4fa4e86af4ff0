//! Proxy plumbing for the trawl scraping engine.
//!
//! [`Rotator`] rotates requests across a fixed proxy list;
//! [`AuthProxy`] fronts a single authenticated HTTP/SOCKS5 upstream with a
//! credential-free local proxy, which is what headless browsers need.

pub mod auth_proxy;
pub mod rotator;

pub use auth_proxy::{
    start_auth_proxies, start_auth_proxy, AuthProxy, AuthProxyPool, UpstreamType,
};
pub use rotator::Rotator;
