use crate::job::JobRef;

/// Item delivered on the results stream once a job completes.
#[derive(Clone)]
pub struct ScrapeResult {
    /// The job that produced the payload.
    pub job: JobRef,
    /// Opaque-but-serializable payload returned by the job's `process`.
    pub data: Option<serde_json::Value>,
}

impl std::fmt::Debug for ScrapeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrapeResult")
            .field("job_id", &self.job.id())
            .field("url", &self.job.url())
            .field("has_data", &self.data.is_some())
            .finish()
    }
}
