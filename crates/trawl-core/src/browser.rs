//! Driver-agnostic browser page contract.
//!
//! Browser-driven jobs receive a [`BrowserPage`] in their `browser_actions`
//! hook; concrete adapters (e.g. the chromiumoxide one in `trawl-client`)
//! implement it on top of their driver.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Error;

/// When a navigation is considered complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitUntil {
    /// The `load` event fired.
    #[default]
    Load,
    /// The `DOMContentLoaded` event fired.
    DomContentLoaded,
    /// No network connections for at least 500 ms.
    NetworkIdle,
}

/// Outcome of a page navigation.
#[derive(Debug, Clone, Default)]
pub struct PageResponse {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Element locator on a page.
#[async_trait]
pub trait Locator: Send + Sync {
    /// Click the first matching element.
    async fn click(&self, timeout: Duration) -> Result<(), Error>;

    /// Number of matching elements.
    async fn count(&self) -> Result<usize, Error>;

    /// Locator narrowed to the first matching element.
    fn first(&self) -> Box<dyn Locator>;
}

/// Abstraction over a single browser page.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    /// Navigate to `url` and wait for the given state.
    async fn goto(&self, url: &str, wait_until: WaitUntil) -> Result<PageResponse, Error>;

    /// Current page URL.
    async fn url(&self) -> Result<String, Error>;

    /// Full HTML content of the page.
    async fn content(&self) -> Result<String, Error>;

    async fn reload(&self, wait_until: WaitUntil) -> Result<(), Error>;

    /// Screenshot of the viewport, or of the whole scrollable page.
    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, Error>;

    /// Execute JavaScript in the page and return its value.
    ///
    /// Arrow functions and `function` declarations are invoked as functions
    /// (with `args` applied); IIFEs and bare expressions are evaluated
    /// through the runtime with `return_by_value` and `await_promise`.
    async fn eval(&self, js: &str, args: Vec<serde_json::Value>)
        -> Result<serde_json::Value, Error>;

    /// Wait until the page URL matches `pattern` (glob or regex, see
    /// [`glob_to_regex`]), polling every 100 ms.
    async fn wait_for_url(&self, pattern: &str, timeout: Duration) -> Result<(), Error>;

    /// Wait for an element matching `selector` to appear.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<(), Error>;

    /// Sleep for the given duration. Prefer waiting for a condition.
    async fn wait_for_timeout(&self, timeout: Duration);

    fn locator(&self, selector: &str) -> Box<dyn Locator>;

    async fn close(&self) -> Result<(), Error>;
}

/// Interval at which `wait_for_url` re-reads the page URL.
pub const URL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Convert a URL glob into an anchored regex.
///
/// `*` matches anything except `/`, `**` matches anything, `?` matches one
/// non-`/` character. A pattern that already looks like a regex (leading `^`
/// or trailing `$`) passes through unchanged.
pub fn glob_to_regex(glob: &str) -> String {
    if glob.starts_with('^') || glob.ends_with('$') {
        return glob.to_string();
    }

    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');

    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '.' | '+' | '^' | '$' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    out.push('$');
    out
}

/// Whether `js` is a function expression that a driver can invoke directly
/// (arrow functions, `function` declarations). IIFEs and bare expressions
/// return false and must go through runtime evaluation instead.
pub fn is_js_function_expression(js: &str) -> bool {
    let js = js.trim();

    if js.starts_with('(') {
        // Either an arrow function with a parenthesised parameter list, or
        // an IIFE. A trailing invocation marks the IIFE.
        if js.ends_with("()") || js.ends_with("();") {
            return false;
        }

        let mut depth = 0usize;
        for (i, ch) in js.char_indices() {
            match ch {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return js[i + 1..].trim_start().starts_with("=>");
                    }
                }
                _ => {}
            }
        }
        return false;
    }

    if js.starts_with("()") || js.starts_with("async ()") || js.starts_with("async()") {
        return true;
    }

    if js.starts_with("function") || js.starts_with("async function") {
        return !js.ends_with("()");
    }

    false
}
