//! The execution engine: worker pool, job pipeline and lifecycle.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use kanal::{bounded_async, AsyncReceiver, AsyncSender};
use std::panic::AssertUnwindSafe;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::error::Error;
use crate::job::{JobRef, ProcessOutput};
use crate::provider::JobProvider;
use crate::response::Response;
use crate::result::ScrapeResult;
use crate::retry::{backoff_delay, effective_max_retries, RetryPolicy};
use crate::shutdown::Shutdown;
use crate::stats::{run_watchdog, Stats};
use crate::traits::{Cacher, HtmlParser, HttpFetcher, ResultWriter};

/// How long a worker backs off after a provider error before re-subscribing.
const PROVIDER_BACKOFF: Duration = Duration::from_secs(1);

/// Builder for [`Trawler`]. A provider and a fetcher are required;
/// everything else is optional.
#[derive(Default)]
pub struct TrawlerBuilder {
    shutdown: Option<Shutdown>,
    provider: Option<Arc<dyn JobProvider>>,
    fetcher: Option<Arc<dyn HttpFetcher>>,
    parser: Option<Arc<dyn HtmlParser>>,
    cache: Option<Arc<dyn Cacher>>,
    concurrency: Option<usize>,
    init_job: Option<JobRef>,
    inactivity: Option<Duration>,
    with_failed: bool,
}

impl TrawlerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an externally owned shutdown handle so callers can cancel the
    /// engine and observe its cause.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn JobProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn HttpFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn HtmlParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cacher>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Number of concurrent workers. Must be at least 1; defaults to 1.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Job executed depth-first (with all its transitive follow-ups) before
    /// the worker pool starts. Its results are discarded.
    pub fn with_init_job(mut self, job: JobRef) -> Self {
        self.init_job = Some(job);
        self
    }

    /// Exit normally when no job activity happens for `window`.
    pub fn with_inactivity_timeout(mut self, window: Duration) -> Self {
        self.inactivity = Some(window);
        self
    }

    /// Expose a stream of terminally failed jobs via [`Trawler::failed`].
    pub fn with_failed(mut self) -> Self {
        self.with_failed = true;
        self
    }

    pub fn build(self) -> Result<Trawler, Error> {
        let provider = self.provider.ok_or(Error::NoJobProvider)?;
        let fetcher = self.fetcher.ok_or(Error::NoFetcher)?;

        let concurrency = match self.concurrency {
            Some(0) => return Err(Error::Concurrency),
            Some(n) => n,
            None => 1,
        };

        let (results_tx, results_rx) = bounded_async(0);
        let (failed_tx, failed_rx) = if self.with_failed {
            let (tx, rx) = bounded_async(0);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        Ok(Trawler {
            inner: Arc::new(Inner {
                shutdown: self.shutdown.unwrap_or_default(),
                provider,
                fetcher,
                parser: self.parser,
                cache: self.cache,
                concurrency,
                init_job: self.init_job,
                inactivity: self.inactivity,
                stats: Stats::new(),
                results_tx,
                results_rx,
                failed_tx,
                failed_rx,
            }),
        })
    }
}

struct Inner {
    shutdown: Shutdown,
    provider: Arc<dyn JobProvider>,
    fetcher: Arc<dyn HttpFetcher>,
    parser: Option<Arc<dyn HtmlParser>>,
    cache: Option<Arc<dyn Cacher>>,
    concurrency: usize,
    init_job: Option<JobRef>,
    inactivity: Option<Duration>,
    stats: Stats,
    results_tx: AsyncSender<ScrapeResult>,
    results_rx: AsyncReceiver<ScrapeResult>,
    failed_tx: Option<AsyncSender<JobRef>>,
    failed_rx: Option<AsyncReceiver<JobRef>>,
}

/// The scraping engine. Cheap to clone; all clones drive the same run.
#[derive(Clone)]
pub struct Trawler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Trawler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trawler").finish_non_exhaustive()
    }
}

impl Trawler {
    pub fn builder() -> TrawlerBuilder {
        TrawlerBuilder::new()
    }

    /// Run until cancelled by a signal, a `StopScraping` job, inactivity or
    /// [`Trawler::close`]. Returns the shutdown cause, with inactivity
    /// mapped to a normal exit.
    pub async fn start(&self) -> Result<(), Error> {
        tracing::info!(concurrency = self.inner.concurrency, "starting trawler");
        self.spawn_signal_watcher();

        if let Some(init) = self.inner.init_job.clone() {
            // An init failure must leave the engine observably cancelled:
            // done()/err() report it and the streams close.
            if let Err(e) = self.run_init_job(init).await {
                self.inner.shutdown.cancel(e.clone());
                self.close_streams();
                return Err(e);
            }
        }

        let mut tasks = JoinSet::new();
        for worker_id in 0..self.inner.concurrency {
            let engine = self.clone();
            tasks.spawn(async move { engine.worker_loop(worker_id).await });
        }

        let engine = self.clone();
        tasks.spawn(async move {
            run_watchdog(
                &engine.inner.stats,
                &engine.inner.shutdown,
                engine.inner.inactivity,
            )
            .await;
        });

        while tasks.join_next().await.is_some() {}

        self.close_streams();

        match self.inner.shutdown.cause() {
            Some(cause) if cause.is_normal_exit() => Ok(()),
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    /// Cancel the run and close the fetcher and cache.
    pub async fn close(&self) -> Result<(), Error> {
        self.inner.shutdown.cancel(Error::Closed);
        self.inner.fetcher.close().await?;

        if let Some(cache) = &self.inner.cache {
            cache.close().await?;
        }

        Ok(())
    }

    /// Stream of completed results. The stream is multi-consumer: writers
    /// share it, each result going to exactly one of them.
    pub fn results(&self) -> AsyncReceiver<ScrapeResult> {
        self.inner.results_rx.clone()
    }

    /// Stream of terminally failed jobs, when built `with_failed`.
    pub fn failed(&self) -> Option<AsyncReceiver<JobRef>> {
        self.inner.failed_rx.clone()
    }

    /// Completes once the engine has been cancelled.
    pub async fn done(&self) {
        self.inner.shutdown.cancelled().await;
    }

    pub fn is_done(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// The shutdown cause, if the run ended abnormally. Inactivity is a
    /// normal exit and reports `None`.
    pub fn err(&self) -> Option<Error> {
        self.inner
            .shutdown
            .cause()
            .filter(|cause| !cause.is_normal_exit())
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// `(completed, failed)` job totals so far.
    pub fn stats(&self) -> (u64, u64) {
        self.inner.stats.totals()
    }

    /// Handle that cancels this engine when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.inner.shutdown.clone()
    }

    /// Spawn one task per writer, all sharing the results stream. A writer
    /// error cancels the engine.
    pub fn spawn_writers(
        &self,
        writers: Vec<Arc<dyn ResultWriter>>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        writers
            .into_iter()
            .map(|writer| {
                let results = self.results();
                let shutdown = self.inner.shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = writer.run(results).await {
                        tracing::error!(error = %e, "result writer failed");
                        shutdown.cancel(Error::Writer(e.to_string()));
                    }
                })
            })
            .collect()
    }

    /// Execute one job through the full pipeline: cache read, retried
    /// fetch, cache write, parse, user `process`. Panics anywhere inside
    /// are recovered and reported as a job failure.
    pub async fn do_job(&self, job: &JobRef) -> Result<ProcessOutput, Error> {
        match AssertUnwindSafe(self.do_job_inner(job)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(job_id = %job.id(), panic = %message, "panic while executing job");
                Err(Error::JobPanic(message))
            }
        }
    }

    fn close_streams(&self) {
        self.inner.results_tx.close();
        if let Some(tx) = &self.inner.failed_tx {
            tx.close();
        }
    }

    fn spawn_signal_watcher(&self) {
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = wait_for_exit_signal() => {
                    tracing::info!("received signal, shutting down");
                    shutdown.cancel(Error::ExitSignal);
                }
            }
        });
    }

    async fn run_init_job(&self, init: JobRef) -> Result<(), Error> {
        tracing::info!(job_id = %init.id(), "running init job");

        // Depth-first over the init job and its transitive follow-ups.
        let mut stack = vec![init];
        while let Some(job) = stack.pop() {
            let (_, followups) = self.do_job(&job).await?;
            for next in followups.into_iter().rev() {
                stack.push(next);
            }
        }

        Ok(())
    }

    async fn worker_loop(&self, worker_id: usize) {
        tracing::debug!(worker_id, "worker started");

        loop {
            if self.inner.shutdown.is_cancelled() {
                tracing::debug!(worker_id, "worker stopping");
                return;
            }

            let (jobs, errors) = self.inner.provider.jobs(self.inner.shutdown.clone());

            loop {
                tokio::select! {
                    _ = self.inner.shutdown.cancelled() => {
                        tracing::debug!(worker_id, "worker stopping");
                        return;
                    }
                    err = errors.recv() => {
                        if let Ok(e) = err {
                            tracing::error!(worker_id, error = %e, "error while getting jobs, backing off");
                        }
                        tokio::time::sleep(PROVIDER_BACKOFF).await;
                        break;
                    }
                    drawn = jobs.recv() => {
                        match drawn {
                            Ok(job) => self.handle_job(job).await,
                            Err(_) => {
                                tokio::time::sleep(PROVIDER_BACKOFF).await;
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_job(&self, job: JobRef) {
        self.inner.stats.touch();
        let started = Instant::now();

        let span = tracing::info_span!("job", job_id = %job.id());
        let outcome = self.do_job(&job).instrument(span).await;

        match outcome {
            Ok((data, followups)) => match self.finish_job(&job, data, followups).await {
                Ok(()) => {
                    self.inner.stats.job_completed();
                    tracing::info!(
                        job_id = %job.id(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        "job finished"
                    );
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id(), error = %e, "job failed");
                    self.fail_job(job).await;
                }
            },
            Err(e) => {
                tracing::warn!(job_id = %job.id(), error = %e, "job failed");
                self.fail_job(job).await;
            }
        }
    }

    async fn fail_job(&self, job: JobRef) {
        self.inner.stats.job_failed();

        if let Some(tx) = &self.inner.failed_tx {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {}
                _ = tx.send(job) => {}
            }
        }
    }

    async fn finish_job(
        &self,
        job: &JobRef,
        data: Option<serde_json::Value>,
        followups: Vec<JobRef>,
    ) -> Result<(), Error> {
        for next in followups {
            self.inner.provider.push(&self.inner.shutdown, next).await?;
        }

        if job.use_in_results() {
            let result = ScrapeResult {
                job: job.clone(),
                data,
            };

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    return Err(self
                        .inner
                        .shutdown
                        .cause()
                        .unwrap_or(Error::Closed));
                }
                sent = self.inner.results_tx.send(result) => {
                    sent.map_err(|_| Error::Other("results stream closed".into()))?;
                }
            }
        }

        Ok(())
    }

    async fn do_job_inner(&self, job: &JobRef) -> Result<ProcessOutput, Error> {
        let started = Instant::now();
        tracing::debug!(url = %job.url(), "starting job");

        let cache_key = job.cache_key();
        let mut from_cache = false;
        let mut cached_response = None;

        if let Some(cache) = &self.inner.cache {
            match cache.get(&cache_key).await {
                Ok(Some(hit)) => {
                    tracing::debug!(%cache_key, "cache hit");
                    from_cache = true;
                    cached_response = Some(hit);
                }
                Ok(None) => {}
                Err(e) => tracing::debug!(%cache_key, error = %e, "cache read failed"),
            }
        }

        let mut response = match cached_response {
            Some(hit) => hit,
            None => self.fetch_with_retries(job).await?,
        };

        if let Some(error) = &response.error {
            if !job.process_on_fetch_error() {
                return Err(Error::Fetch(error.clone()));
            }
        }

        // Cache failures are logged, never fatal.
        if !from_cache && response.error.is_none() {
            if let Some(cache) = &self.inner.cache {
                if let Err(e) = cache.set(&cache_key, &response).await {
                    tracing::warn!(%cache_key, error = %e, "cache write failed");
                }
            }
        }

        if response.error.is_none() {
            if let Some(parser) = &self.inner.parser {
                let document = parser.parse(&response.body).await.map_err(|e| match e {
                    Error::Parse(_) => e,
                    other => Error::Parse(other.to_string()),
                })?;
                response.document = Some(document);
            }
        }

        response.duration = started.elapsed();

        job.process(response).await
    }

    async fn fetch_with_retries(&self, job: &JobRef) -> Result<Response, Error> {
        let policy = job.retry_policy();
        let max_retries = effective_max_retries(job.max_retries());
        let cap = job.max_retry_delay();
        let mut attempt: u32 = 0;

        loop {
            let mut response = self.fetch_once(job).await;

            if job.check_response(&response) {
                return Ok(response);
            }

            match policy {
                RetryPolicy::StopScraping => {
                    tracing::warn!(job_id = %job.id(), "stopping scraping because of policy");
                    self.inner.shutdown.cancel(Error::PolicyStop);
                    return Err(Error::PolicyStop);
                }
                RetryPolicy::DiscardJob => {
                    tracing::debug!(job_id = %job.id(), "discarding job");
                    return Err(Error::JobDiscarded);
                }
                RetryPolicy::RetryJob | RetryPolicy::RefreshIp => {
                    if attempt >= max_retries {
                        if response.error.is_none() {
                            response.error = Some(format!("status code {}", response.status));
                        }
                        return Ok(response);
                    }

                    attempt += 1;

                    if policy == RetryPolicy::RefreshIp {
                        self.inner.fetcher.refresh_ip().await;
                    }

                    tokio::time::sleep(backoff_delay(attempt, cap)).await;
                }
            }
        }
    }

    async fn fetch_once(&self, job: &JobRef) -> Response {
        let fetch = async {
            match job.timeout() {
                Some(deadline) if !deadline.is_zero() => {
                    match tokio::time::timeout(deadline, self.inner.fetcher.fetch(job.as_ref()))
                        .await
                    {
                        Ok(response) => response,
                        Err(_) => {
                            Response::from_error(format!("fetch timed out after {deadline:?}"))
                        }
                    }
                }
                _ => self.inner.fetcher.fetch(job.as_ref()).await,
            }
        };

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Response::from_error("engine shutting down"),
            response = fetch => response,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(unix)]
async fn wait_for_exit_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(mut interrupt), Ok(mut terminate)) => {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
        }
        _ => futures::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_exit_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::testutil::{MockFetcher, MockProvider};

    fn base_engine(fetcher: MockFetcher) -> Trawler {
        Trawler::builder()
            .with_provider(Arc::new(MockProvider::new()))
            .with_fetcher(Arc::new(fetcher))
            .build()
            .unwrap()
    }

    #[test]
    fn build_requires_a_provider() {
        let err = Trawler::builder()
            .with_fetcher(Arc::new(MockFetcher::with_status(200, "test")))
            .build()
            .unwrap_err();
        assert_eq!(err, Error::NoJobProvider);
    }

    #[test]
    fn build_requires_a_fetcher() {
        let err = Trawler::builder()
            .with_provider(Arc::new(MockProvider::new()))
            .build()
            .unwrap_err();
        assert_eq!(err, Error::NoFetcher);
    }

    #[test]
    fn build_rejects_zero_concurrency() {
        let err = Trawler::builder()
            .with_provider(Arc::new(MockProvider::new()))
            .with_fetcher(Arc::new(MockFetcher::with_status(200, "test")))
            .with_concurrency(0)
            .build()
            .unwrap_err();
        assert_eq!(err, Error::Concurrency);
    }

    #[test]
    fn build_defaults() {
        let engine = base_engine(MockFetcher::with_status(200, "test"));
        assert_eq!(engine.concurrency(), 1);
        assert!(engine.failed().is_none());
        assert!(engine.err().is_none());
    }

    #[tokio::test]
    async fn do_job_recovers_from_a_fetcher_panic() {
        let engine = base_engine(MockFetcher::panicking("boom"));
        let job: JobRef = Arc::new(Job::new("GET", "http://example.com"));

        let err = engine.do_job(&job).await.unwrap_err();
        assert!(matches!(err, Error::JobPanic(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_status_with_no_retries_fails() {
        let engine = base_engine(MockFetcher::with_status(400, "test"));
        let job: JobRef = Arc::new(Job::new("GET", "http://example.com"));

        let err = engine.do_job(&job).await.unwrap_err();
        assert_eq!(err, Error::Fetch("status code 400".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_count_honors_max_retries() {
        let fetcher = MockFetcher::with_status(400, "test");
        let calls = fetcher.calls();
        let engine = base_engine(fetcher);

        let job: JobRef = Arc::new(Job {
            url: "http://example.com".into(),
            max_retries: 1,
            ..Default::default()
        });

        let err = engine.do_job(&job).await.unwrap_err();
        assert_eq!(err, Error::Fetch("status code 400".into()));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_count_is_capped_at_five() {
        let fetcher = MockFetcher::with_status(400, "test");
        let calls = fetcher.calls();
        let engine = base_engine(fetcher);

        let job: JobRef = Arc::new(Job {
            url: "http://example.com".into(),
            max_retries: 10,
            max_retry_delay: Duration::from_millis(600),
            ..Default::default()
        });

        let err = engine.do_job(&job).await.unwrap_err();
        assert_eq!(err, Error::Fetch("status code 400".into()));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn custom_acceptance_prevents_retries() {
        let fetcher = MockFetcher::with_status(301, "test");
        let calls = fetcher.calls();
        let engine = base_engine(fetcher);

        let job: JobRef = Arc::new(Job {
            url: "http://example.com".into(),
            check_response: Some(Arc::new(|r: &Response| r.status == 301)),
            ..Default::default()
        });

        engine.do_job(&job).await.unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_scraping_cancels_the_engine() {
        let engine = base_engine(MockFetcher::with_status(400, "test"));

        let job: JobRef = Arc::new(Job {
            url: "http://example.com".into(),
            retry_policy: RetryPolicy::StopScraping,
            ..Default::default()
        });

        let err = engine.do_job(&job).await.unwrap_err();
        assert_eq!(err, Error::PolicyStop);
        assert!(engine.is_done());
        assert_eq!(engine.err(), Some(Error::PolicyStop));
    }

    #[tokio::test]
    async fn discard_job_does_not_cancel_the_engine() {
        let engine = base_engine(MockFetcher::with_status(400, "test"));

        let job: JobRef = Arc::new(Job {
            url: "http://example.com".into(),
            retry_policy: RetryPolicy::DiscardJob,
            ..Default::default()
        });

        let err = engine.do_job(&job).await.unwrap_err();
        assert_eq!(err, Error::JobDiscarded);
        assert!(!engine.is_done());
    }

    #[tokio::test]
    async fn parse_error_is_terminal() {
        use crate::testutil::MockParser;

        let engine = Trawler::builder()
            .with_provider(Arc::new(MockProvider::new()))
            .with_fetcher(Arc::new(MockFetcher::with_status(200, "<html")))
            .with_parser(Arc::new(MockParser::failing("bad html")))
            .build()
            .unwrap();

        let job: JobRef = Arc::new(Job::new("GET", "http://example.com"));
        let err = engine.do_job(&job).await.unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[tokio::test]
    async fn close_records_the_cause() {
        let engine = base_engine(MockFetcher::with_status(200, "test"));
        engine.close().await.unwrap();

        assert!(engine.is_done());
        assert_eq!(engine.err(), Some(Error::Closed));
    }
}
