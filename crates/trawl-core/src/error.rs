use thiserror::Error;

/// Errors produced by the trawl engine and its collaborators.
///
/// Variants carry owned strings so the enum stays [`Clone`]: the engine
/// records the shutdown cause once and hands out copies afterwards.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// No job provider was configured at construction time.
    #[error("no job provider set")]
    NoJobProvider,

    /// No HTTP fetcher was configured at construction time.
    #[error("no http fetcher set")]
    NoFetcher,

    /// Concurrency was explicitly set below 1.
    #[error("concurrency must be greater than 0")]
    Concurrency,

    /// Transient provider failure; workers back off and re-subscribe.
    #[error("job provider error: {0}")]
    Provider(String),

    /// Transport, protocol or status-code failure while fetching.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// The configured parser rejected the response body. Terminal per job.
    #[error("parse error: {0}")]
    Parse(String),

    /// User `process` returned an error. Terminal per job.
    #[error("process error: {0}")]
    Process(String),

    /// A panic was recovered while executing a job.
    #[error("panic while executing job: {0}")]
    JobPanic(String),

    /// The job was dropped by the `DiscardJob` retry policy.
    #[error("job discarded by retry policy")]
    JobDiscarded,

    /// Cause used when a `StopScraping` job cancels the engine.
    #[error("stopping scraping because of policy")]
    PolicyStop,

    /// Cause used when the engine exits because nothing happened for the
    /// configured inactivity window. Reported as a normal exit.
    #[error("inactivity timeout")]
    InactivityTimeout,

    /// Cause used when an INT/TERM signal shuts the engine down.
    #[error("exit signal received")]
    ExitSignal,

    /// Cause used by an explicit `close()` call.
    #[error("engine closed")]
    Closed,

    #[error("cache error: {0}")]
    Cache(String),

    #[error("writer error: {0}")]
    Writer(String),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("invalid proxy: {0}")]
    InvalidProxy(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for causes that end a run without anything having gone wrong.
    pub fn is_normal_exit(&self) -> bool {
        matches!(self, Error::InactivityTimeout)
    }
}
