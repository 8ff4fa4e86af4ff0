//! Job providers: the source the worker pool draws from.

use async_trait::async_trait;
use kanal::{bounded_async, AsyncReceiver, AsyncSender};

use crate::error::Error;
use crate::job::{JobRef, Priority};
use crate::shutdown::Shutdown;

/// Supplies jobs to the engine and accepts follow-ups back.
#[async_trait]
pub trait JobProvider: Send + Sync {
    /// Subscribe to the job stream. The second stream carries provider
    /// errors; on cancellation the cause is emitted there and the job
    /// stream closes.
    fn jobs(&self, shutdown: Shutdown) -> (AsyncReceiver<JobRef>, AsyncReceiver<Error>);

    /// Enqueue a job. Must not block the caller on a full tier.
    async fn push(&self, shutdown: &Shutdown, job: JobRef) -> Result<(), Error>;
}

/// In-memory provider with three strict-priority tiers.
///
/// Draw order: a ready High job always wins, then a ready Medium one; only
/// when every tier is idle does the draw block fairly across all three.
/// Natural drain of the higher tiers therefore cannot starve the lower
/// ones indefinitely.
pub struct MemoryProvider {
    high_tx: AsyncSender<JobRef>,
    high_rx: AsyncReceiver<JobRef>,
    medium_tx: AsyncSender<JobRef>,
    medium_rx: AsyncReceiver<JobRef>,
    low_tx: AsyncSender<JobRef>,
    low_rx: AsyncReceiver<JobRef>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        let (high_tx, high_rx) = bounded_async(0);
        let (medium_tx, medium_rx) = bounded_async(0);
        let (low_tx, low_rx) = bounded_async(0);

        Self {
            high_tx,
            high_rx,
            medium_tx,
            medium_rx,
            low_tx,
            low_rx,
        }
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobProvider for MemoryProvider {
    fn jobs(&self, shutdown: Shutdown) -> (AsyncReceiver<JobRef>, AsyncReceiver<Error>) {
        let (out_tx, out_rx) = bounded_async(0);
        let (err_tx, err_rx) = bounded_async(1);

        let high = self.high_rx.clone();
        let medium = self.medium_rx.clone();
        let low = self.low_rx.clone();

        tokio::spawn(async move {
            loop {
                // Drain ready higher tiers before blocking across all three.
                let job = if let Ok(Some(job)) = high.try_recv() {
                    job
                } else if let Ok(Some(job)) = medium.try_recv() {
                    job
                } else {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            let cause = shutdown
                                .cause()
                                .unwrap_or_else(|| Error::Other("cancelled".into()));
                            let _ = err_tx.try_send(cause);
                            return;
                        }
                        drawn = high.recv() => match drawn {
                            Ok(job) => job,
                            Err(_) => return,
                        },
                        drawn = medium.recv() => match drawn {
                            Ok(job) => job,
                            Err(_) => return,
                        },
                        drawn = low.recv() => match drawn {
                            Ok(job) => job,
                            Err(_) => return,
                        },
                    }
                };

                tokio::select! {
                    _ = shutdown.cancelled() => {
                        let cause = shutdown
                            .cause()
                            .unwrap_or_else(|| Error::Other("cancelled".into()));
                        let _ = err_tx.try_send(cause);
                        return;
                    }
                    sent = out_tx.send(job) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        (out_rx, err_rx)
    }

    async fn push(&self, shutdown: &Shutdown, job: JobRef) -> Result<(), Error> {
        let tx = match job.priority() {
            Priority::High => self.high_tx.clone(),
            Priority::Medium => self.medium_tx.clone(),
            Priority::Low => self.low_tx.clone(),
        };

        // Detached sender: the caller never blocks on a full tier.
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tx.send(job) => {}
            }
        });

        Ok(())
    }
}
