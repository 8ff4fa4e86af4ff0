//! Test utilities: mock implementations of the collaborator contracts.
//!
//! Handwritten mocks for dependency injection in unit and integration
//! tests. All mocks use `Arc<Mutex<_>>` / atomics for interior mutability so
//! tests can assert on recorded calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kanal::{unbounded_async, AsyncReceiver, AsyncSender};

use crate::error::Error;
use crate::job::{Job, JobLike, JobRef, ProcessOutput};
use crate::provider::JobProvider;
use crate::response::{Document, Response};
use crate::result::ScrapeResult;
use crate::shutdown::Shutdown;
use crate::traits::{Cacher, HtmlParser, HttpFetcher, ResultWriter};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Fetcher returning a queue of canned responses, then a fallback.
#[derive(Clone)]
pub struct MockFetcher {
    queue: Arc<Mutex<Vec<Response>>>,
    fallback: Response,
    calls: Arc<AtomicUsize>,
    refreshes: Arc<AtomicUsize>,
    panic_message: Option<String>,
}

impl MockFetcher {
    /// Always answer with the given status and body.
    pub fn with_status(status: u16, body: &str) -> Self {
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            fallback: Response {
                url: String::new(),
                status,
                body: body.as_bytes().to_vec(),
                ..Default::default()
            },
            calls: Arc::new(AtomicUsize::new(0)),
            refreshes: Arc::new(AtomicUsize::new(0)),
            panic_message: None,
        }
    }

    /// Answer with each response in order, then repeat the last one.
    pub fn with_responses(responses: Vec<Response>) -> Self {
        let fallback = responses.last().cloned().unwrap_or_default();
        Self {
            queue: Arc::new(Mutex::new(responses)),
            fallback,
            calls: Arc::new(AtomicUsize::new(0)),
            refreshes: Arc::new(AtomicUsize::new(0)),
            panic_message: None,
        }
    }

    /// Always answer with a transport-level error.
    pub fn with_error(message: &str) -> Self {
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            fallback: Response::from_error(message),
            calls: Arc::new(AtomicUsize::new(0)),
            refreshes: Arc::new(AtomicUsize::new(0)),
            panic_message: None,
        }
    }

    /// Panic on every fetch, for panic-isolation tests.
    pub fn panicking(message: &str) -> Self {
        let mut fetcher = Self::with_status(200, "");
        fetcher.panic_message = Some(message.to_string());
        fetcher
    }

    /// Number of `fetch` invocations so far.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Number of `refresh_ip` invocations so far.
    pub fn refreshes(&self) -> Arc<AtomicUsize> {
        self.refreshes.clone()
    }
}

#[async_trait]
impl HttpFetcher for MockFetcher {
    async fn fetch(&self, job: &dyn JobLike) -> Response {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = &self.panic_message {
            panic!("{}", message.clone());
        }

        let mut response = {
            let mut queue = self.queue.lock().unwrap();
            if queue.is_empty() {
                self.fallback.clone()
            } else {
                queue.remove(0)
            }
        };

        if response.url.is_empty() {
            response.url = job.full_url();
        }

        response
    }

    async fn refresh_ip(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// Provider backed by an unbounded channel. Seeded jobs and pushed
/// follow-ups flow through the same stream, so follow-ups get executed.
pub struct MockProvider {
    tx: AsyncSender<JobRef>,
    rx: AsyncReceiver<JobRef>,
    err_tx: AsyncSender<Error>,
    err_rx: AsyncReceiver<Error>,
    pushed: Arc<Mutex<Vec<JobRef>>>,
    push_error: Arc<Mutex<Option<Error>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        let (tx, rx) = unbounded_async();
        let (err_tx, err_rx) = unbounded_async();
        Self {
            tx,
            rx,
            err_tx,
            err_rx,
            pushed: Arc::new(Mutex::new(Vec::new())),
            push_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Make the next `push` call fail with `error`.
    pub fn fail_next_push(&self, error: Error) {
        *self.push_error.lock().unwrap() = Some(error);
    }

    /// Enqueue a job as if it had been submitted externally.
    pub fn seed(&self, job: JobRef) {
        let _ = self.tx.try_send(job);
    }

    /// Emit a provider error to subscribed workers.
    pub fn inject_error(&self, error: Error) {
        let _ = self.err_tx.try_send(error);
    }

    /// Jobs pushed back by the engine (follow-ups).
    pub fn pushed(&self) -> Arc<Mutex<Vec<JobRef>>> {
        self.pushed.clone()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobProvider for MockProvider {
    fn jobs(&self, _shutdown: Shutdown) -> (AsyncReceiver<JobRef>, AsyncReceiver<Error>) {
        (self.rx.clone(), self.err_rx.clone())
    }

    async fn push(&self, _shutdown: &Shutdown, job: JobRef) -> Result<(), Error> {
        if let Some(error) = self.push_error.lock().unwrap().take() {
            return Err(error);
        }

        self.pushed.lock().unwrap().push(job.clone());
        let _ = self.tx.try_send(job);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockParser
// ---------------------------------------------------------------------------

/// Parser producing the body as a `String` document, or a fixed error.
#[derive(Clone, Default)]
pub struct MockParser {
    error: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl MockParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl HtmlParser for MockParser {
    async fn parse(&self, body: &[u8]) -> Result<Document, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        match &self.error {
            Some(message) => Err(Error::Parse(message.clone())),
            None => Ok(Arc::new(String::from_utf8_lossy(body).into_owned()) as Document),
        }
    }
}

// ---------------------------------------------------------------------------
// MockCacher
// ---------------------------------------------------------------------------

/// In-memory cache recording reads and writes.
#[derive(Clone, Default)]
pub struct MockCacher {
    entries: Arc<Mutex<HashMap<String, Response>>>,
    gets: Arc<AtomicUsize>,
    sets: Arc<Mutex<Vec<String>>>,
}

impl MockCacher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(key: &str, response: Response) -> Self {
        let cache = Self::default();
        cache
            .entries
            .lock()
            .unwrap()
            .insert(key.to_string(), response);
        cache
    }

    pub fn gets(&self) -> Arc<AtomicUsize> {
        self.gets.clone()
    }

    /// Keys written so far, in order.
    pub fn sets(&self) -> Arc<Mutex<Vec<String>>> {
        self.sets.clone()
    }
}

#[async_trait]
impl Cacher for MockCacher {
    async fn get(&self, key: &str) -> Result<Option<Response>, Error> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, response: &Response) -> Result<(), Error> {
        self.sets.lock().unwrap().push(key.to_string());
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), response.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CollectingWriter
// ---------------------------------------------------------------------------

/// Writer that records every result it consumes.
#[derive(Clone, Default)]
pub struct CollectingWriter {
    seen: Arc<Mutex<Vec<(String, Option<serde_json::Value>)>>>,
}

impl CollectingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(job url, payload)` pairs in completion order.
    pub fn seen(&self) -> Arc<Mutex<Vec<(String, Option<serde_json::Value>)>>> {
        self.seen.clone()
    }
}

#[async_trait]
impl ResultWriter for CollectingWriter {
    async fn run(&self, results: kanal::AsyncReceiver<ScrapeResult>) -> Result<(), Error> {
        while let Ok(result) = results.recv().await {
            self.seen
                .lock()
                .unwrap()
                .push((result.job.url().to_string(), result.data));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FnJob
// ---------------------------------------------------------------------------

type Processor = dyn Fn(Response) -> Result<ProcessOutput, Error> + Send + Sync;

/// Job whose `process` hook is a closure, for tests.
pub struct FnJob {
    job: Job,
    processor: Arc<Processor>,
}

impl FnJob {
    pub fn new(
        job: Job,
        processor: impl Fn(Response) -> Result<ProcessOutput, Error> + Send + Sync + 'static,
    ) -> Self {
        Self {
            job,
            processor: Arc::new(processor),
        }
    }
}

#[async_trait]
impl JobLike for FnJob {
    fn base(&self) -> &Job {
        &self.job
    }

    async fn process(&self, response: Response) -> Result<ProcessOutput, Error> {
        (self.processor)(response)
    }
}
