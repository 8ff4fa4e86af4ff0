use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::browser::{BrowserPage, WaitUntil};
use crate::error::Error;
use crate::response::Response;
use crate::retry::{RetryPolicy, DEFAULT_MAX_RETRY_DELAY};

/// Shared handle to a job flowing through the engine.
pub type JobRef = Arc<dyn JobLike>;

/// What a successful `process` produces: an optional result payload plus
/// zero or more follow-up jobs fed back into the provider.
pub type ProcessOutput = (Option<serde_json::Value>, Vec<JobRef>);

/// Per-job response acceptance predicate.
pub type CheckResponseFn = Arc<dyn Fn(&Response) -> bool + Send + Sync>;

/// Scheduling priority of a job. Higher priorities are drawn first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    High,
    Medium,
    Low,
}

impl Priority {
    /// Map a numeric level to a priority. Unknown levels map to `High`.
    pub fn from_level(level: u8) -> Self {
        match level {
            1 => Priority::Medium,
            2 => Priority::Low,
            _ => Priority::High,
        }
    }

    pub fn as_level(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

/// The base job: request shape, retry configuration and engine flags.
///
/// User job types embed a `Job` and implement [`JobLike::base`] to return
/// it; every getter then comes for free and only the `process` /
/// `browser_actions` hooks need overriding.
#[derive(Clone)]
pub struct Job {
    pub id: String,
    pub parent_id: String,
    /// HTTP method, uppercase.
    pub method: String,
    pub url: String,
    /// Query parameters; sorted by key when the full URL is assembled.
    pub url_params: Vec<(String, String)>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Deadline for a single fetch attempt.
    pub timeout: Option<Duration>,
    pub priority: Priority,
    pub retry_policy: RetryPolicy,
    pub max_retries: u32,
    /// Cap on the exponential backoff between retries.
    pub max_retry_delay: Duration,
    /// Acceptance predicate; `None` accepts 2xx.
    pub check_response: Option<CheckResponseFn>,
    pub take_screenshot: bool,
    /// Whether a completed job emits onto the results stream.
    pub use_in_results: bool,
    /// Deliver errored responses to `process` instead of failing the job.
    pub process_on_fetch_error: bool,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: String::new(),
            method: "GET".into(),
            url: String::new(),
            url_params: Vec::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            timeout: None,
            priority: Priority::High,
            retry_policy: RetryPolicy::default(),
            max_retries: 0,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            check_response: None,
            take_screenshot: false,
            use_in_results: true,
            process_on_fetch_error: false,
        }
    }
}

impl Job {
    pub fn new(method: &str, url: impl Into<String>) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// The request URL with query parameters appended, sorted by key so the
    /// result is deterministic.
    pub fn full_url(&self) -> String {
        if self.url_params.is_empty() {
            return self.url.clone();
        }

        let mut params = self.url_params.clone();
        params.sort_by(|a, b| a.0.cmp(&b.0));

        let mut encoded = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &params {
            encoded.append_pair(k, v);
        }

        format!("{}?{}", self.url, encoded.finish())
    }

    /// Deterministic cache key: 128-bit SHA-256 prefix over
    /// `"{METHOD}:{full_url}"`, with the body appended for POST.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_bytes());
        hasher.update(b":");
        hasher.update(self.full_url().as_bytes());

        if self.method == "POST" {
            hasher.update(&self.body);
        }

        hex::encode(&hasher.finalize()[..16])
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("url_params", &self.url_params)
            .field("priority", &self.priority)
            .field("retry_policy", &self.retry_policy)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Job{{id: {}, method: {}, url: {}}}",
            self.id, self.method, self.url
        )
    }
}

impl fmt::Debug for dyn JobLike {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.base().fmt(f)
    }
}

/// A unit of work the engine can execute.
///
/// Getters default to delegating into [`JobLike::base`]; override the hooks
/// to give a job behavior.
#[async_trait]
pub trait JobLike: Send + Sync + 'static {
    /// The base job this type embeds.
    fn base(&self) -> &Job;

    fn id(&self) -> &str {
        &self.base().id
    }

    fn parent_id(&self) -> &str {
        &self.base().parent_id
    }

    fn method(&self) -> &str {
        &self.base().method
    }

    fn url(&self) -> &str {
        &self.base().url
    }

    fn url_params(&self) -> &[(String, String)] {
        &self.base().url_params
    }

    fn headers(&self) -> &HashMap<String, String> {
        &self.base().headers
    }

    fn body(&self) -> &[u8] {
        &self.base().body
    }

    fn full_url(&self) -> String {
        self.base().full_url()
    }

    fn timeout(&self) -> Option<Duration> {
        self.base().timeout
    }

    fn priority(&self) -> Priority {
        self.base().priority
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.base().retry_policy
    }

    fn max_retries(&self) -> u32 {
        self.base().max_retries
    }

    fn max_retry_delay(&self) -> Duration {
        self.base().max_retry_delay
    }

    /// Whether `response` counts as a success for this job.
    fn check_response(&self, response: &Response) -> bool {
        match &self.base().check_response {
            Some(check) => check(response),
            None => response.is_success(),
        }
    }

    fn do_screenshot(&self) -> bool {
        self.base().take_screenshot
    }

    fn use_in_results(&self) -> bool {
        self.base().use_in_results
    }

    fn process_on_fetch_error(&self) -> bool {
        self.base().process_on_fetch_error
    }

    fn cache_key(&self) -> String {
        self.base().cache_key()
    }

    /// User hook: turn a response into a result payload and follow-ups.
    async fn process(&self, response: Response) -> Result<ProcessOutput, Error> {
        let _ = response;
        Ok((None, Vec::new()))
    }

    /// Hook executed by browser-driven fetchers. The default navigates to
    /// the full URL, waits for network idle and captures the response,
    /// optionally with a full-page screenshot.
    async fn browser_actions(&self, page: &dyn BrowserPage) -> Response {
        let page_response = match page.goto(&self.full_url(), WaitUntil::NetworkIdle).await {
            Ok(r) => r,
            Err(e) => return Response::from_error(e.to_string()),
        };

        let mut response = Response {
            url: page_response.url,
            status: page_response.status,
            headers: page_response.headers,
            body: page_response.body,
            ..Default::default()
        };

        if self.do_screenshot() {
            match page.screenshot(true).await {
                Ok(shot) => response.screenshot = Some(shot),
                Err(e) => return Response::from_error(e.to_string()),
            }
        }

        response
    }
}

#[async_trait]
impl JobLike for Job {
    fn base(&self) -> &Job {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_url_sorts_params_by_key() {
        let job = Job {
            url: "https://example.com/search".into(),
            url_params: vec![
                ("z".into(), "1".into()),
                ("a".into(), "2".into()),
                ("m".into(), "3".into()),
            ],
            ..Default::default()
        };

        assert_eq!(job.full_url(), "https://example.com/search?a=2&m=3&z=1");
    }

    #[test]
    fn full_url_without_params_is_the_plain_url() {
        let job = Job::new("GET", "https://example.com");
        assert_eq!(job.full_url(), "https://example.com");
    }

    #[test]
    fn cache_key_is_stable_across_param_order() {
        let a = Job {
            url: "https://example.com".into(),
            url_params: vec![("a".into(), "1".into()), ("b".into(), "2".into())],
            ..Default::default()
        };
        let b = Job {
            url: "https://example.com".into(),
            url_params: vec![("b".into(), "2".into()), ("a".into(), "1".into())],
            ..Default::default()
        };

        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key().len(), 32);
    }

    #[test]
    fn cache_key_distinguishes_methods_and_bodies() {
        let get = Job::new("GET", "https://example.com");
        let post = Job {
            method: "POST".into(),
            url: "https://example.com".into(),
            ..Default::default()
        };
        assert_ne!(get.cache_key(), post.cache_key());

        let post_a = Job {
            method: "POST".into(),
            url: "https://example.com".into(),
            body: b"a=1".to_vec(),
            ..Default::default()
        };
        let post_b = Job {
            method: "POST".into(),
            url: "https://example.com".into(),
            body: b"a=2".to_vec(),
            ..Default::default()
        };
        assert_ne!(post_a.cache_key(), post_b.cache_key());
    }

    #[test]
    fn unknown_priority_level_maps_to_high() {
        assert_eq!(Priority::from_level(0), Priority::High);
        assert_eq!(Priority::from_level(1), Priority::Medium);
        assert_eq!(Priority::from_level(2), Priority::Low);
        assert_eq!(Priority::from_level(9), Priority::High);
    }

    #[test]
    fn defaults_match_the_engine_contract() {
        let job = Job::default();
        assert!(job.use_in_results);
        assert!(!job.process_on_fetch_error);
        assert_eq!(job.max_retry_delay, DEFAULT_MAX_RETRY_DELAY);
        assert_eq!(job.priority, Priority::High);
    }

    #[test]
    fn default_check_response_accepts_2xx() {
        let job = Job::default();
        let ok = Response {
            status: 204,
            ..Default::default()
        };
        let bad = Response {
            status: 400,
            ..Default::default()
        };

        assert!(JobLike::check_response(&job, &ok));
        assert!(!JobLike::check_response(&job, &bad));
    }

    #[test]
    fn custom_check_response_overrides_the_default() {
        let job = Job {
            check_response: Some(Arc::new(|r: &Response| r.status == 301)),
            ..Default::default()
        };
        let moved = Response {
            status: 301,
            ..Default::default()
        };

        assert!(JobLike::check_response(&job, &moved));
    }
}
