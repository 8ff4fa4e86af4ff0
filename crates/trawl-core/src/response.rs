use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Opaque parsed document produced by an [`HtmlParser`](crate::traits::HtmlParser).
///
/// Concrete parsers decide the real type; user jobs downcast it back with
/// [`Response::document_as`].
pub type Document = Arc<dyn Any + Send + Sync>;

/// Envelope for the outcome of a single fetch.
///
/// Fetchers never return a `Result`: transport failures are carried in
/// [`Response::error`] so the retry loop can apply the job's policy
/// uniformly. The parsed document and the screenshot are skipped when a
/// response is serialized into a cache.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Response {
    /// Final URL after redirects.
    pub url: String,
    /// HTTP status code; zero when the transport failed before a response.
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// Wall-clock time the fetch took.
    #[serde(default)]
    pub duration: Duration,
    pub body: Vec<u8>,
    #[serde(skip)]
    pub screenshot: Option<Vec<u8>>,
    /// Set when the fetch failed or the status was rejected after retries.
    pub error: Option<String>,
    /// Adapter-specific metadata.
    #[serde(default)]
    pub meta: HashMap<String, serde_json::Value>,
    #[serde(skip)]
    pub document: Option<Document>,
}

impl Response {
    /// Response representing a fetch-layer failure: no status, no body.
    pub fn from_error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Default acceptance criterion: status in `[200, 300)`.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Downcast the parsed document to the concrete parser output type.
    pub fn document_as<T: 'static>(&self) -> Option<&T> {
        self.document.as_ref()?.downcast_ref::<T>()
    }

    pub fn body_as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url)
            .field("status", &self.status)
            .field("duration", &self.duration)
            .field("body_len", &self.body.len())
            .field("screenshot", &self.screenshot.as_ref().map(Vec::len))
            .field("error", &self.error)
            .field("has_document", &self.document.is_some())
            .finish()
    }
}
