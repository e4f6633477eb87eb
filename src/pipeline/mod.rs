//! Bulk verification: records from an async source, verified with bounded
//! global concurrency, written to a sink.
//!
//! The source is only pulled while fewer than `max_concurrent`
//! verifications are in flight, so the input is never buffered as a whole.
//! Records come out in completion order; each one travels with its own
//! status.

mod error;
mod progress;
mod record;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::smtp::SmtpError;
use crate::verifier::{Verifier, VerifyStatus};

pub use error::{BoxError, PipelineError};
pub use progress::{MovingAverage, Progress};
pub use record::{AddressRecord, AddressSink, EmailRecord};

use progress::Throughput;

pub const DEFAULT_MAX_CONCURRENT: usize = 1000;
const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(15);
const DEFAULT_LOG_EVERY: u64 = 100;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Verifications in flight at once, across all hosts.
    pub max_concurrent: NonZeroUsize,
    /// Minimum spacing between two pulls from the source.
    pub min_interval: Option<Duration>,
    /// Width of the moving-average window for the current rate.
    pub speed_window: Duration,
    /// Log progress every N records (0 = only the final summary).
    pub log_every: u64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_concurrent: NonZeroUsize::new(DEFAULT_MAX_CONCURRENT).unwrap_or(NonZeroUsize::MIN),
            min_interval: None,
            speed_window: DEFAULT_SPEED_WINDOW,
            log_every: DEFAULT_LOG_EVERY,
        }
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    pub processed: u64,
    pub in_flight_peak: usize,
    pub elapsed: Duration,
    pub statuses: HashMap<VerifyStatus, u64>,
}

impl PipelineReport {
    pub fn count(&self, status: VerifyStatus) -> u64 {
        self.statuses.get(&status).copied().unwrap_or(0)
    }
}

type ProgressFn = dyn Fn(&Progress) + Send + Sync;
type Outcome<R> = (R, Result<VerifyStatus, SmtpError>);

pub struct Pipeline {
    verifier: Verifier,
    options: PipelineOptions,
    on_progress: Option<Arc<ProgressFn>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("verifier", &self.verifier)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(verifier: Verifier, options: PipelineOptions) -> Self {
        Self {
            verifier,
            options,
            on_progress: None,
        }
    }

    /// Called after each record reaches the sink.
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    /// Verify every record of `source` and hand it to `sink`.
    ///
    /// A source error, a sink error or a fatal verification error (dead
    /// proxy) stops the run: pending verifications are cancelled, the sink
    /// is flushed and the error returned.
    pub async fn run<R, E, S, K>(&self, source: S, sink: &mut K) -> Result<PipelineReport, PipelineError>
    where
        R: AddressRecord,
        E: std::error::Error + Send + Sync + 'static,
        S: Stream<Item = Result<R, E>> + Send,
        K: AddressSink<R>,
    {
        let mut source = pin!(source);
        let mut tasks: JoinSet<Outcome<R>> = JoinSet::new();
        let mut throttle = self
            .options
            .min_interval
            .filter(|period| !period.is_zero())
            .map(throttle_interval);
        let max = self.options.max_concurrent.get();
        let started = Instant::now();
        let mut throughput = Throughput::new(self.options.speed_window);
        let mut report = PipelineReport::default();
        let mut exhausted = false;

        info!(max_concurrent = max, "verification started");
        let stopped = loop {
            let can_pull = !exhausted && tasks.len() < max;
            tokio::select! {
                pulled = next_record(&mut source, throttle.as_mut()), if can_pull => match pulled {
                    Some(Ok(record)) => {
                        let verifier = self.verifier.clone();
                        tasks.spawn(async move {
                            let status = verifier.verify(record.address()).await;
                            (record, status)
                        });
                        report.in_flight_peak = report.in_flight_peak.max(tasks.len());
                    }
                    Some(Err(err)) => {
                        break Err(PipelineError::Source { source: Box::new(err) });
                    }
                    None => {
                        debug!("address source exhausted");
                        exhausted = true;
                    }
                },
                Some(joined) = tasks.join_next() => {
                    let (mut record, status) = match joined {
                        Ok(outcome) => outcome,
                        Err(err) => break Err(PipelineError::Worker(err)),
                    };
                    let status = match status {
                        Ok(status) => status,
                        Err(err) => break Err(PipelineError::Verify(err)),
                    };
                    record.apply_status(status);
                    if let Err(err) = sink.write(record, status).await {
                        break Err(PipelineError::sink(err));
                    }
                    *report.statuses.entry(status).or_default() += 1;
                    let progress = throughput.record(started.elapsed(), tasks.len());
                    report.processed = progress.processed;
                    self.report_progress(&progress);
                },
                else => break Ok(()),
            }
        };

        if stopped.is_err() {
            warn!(pending = tasks.len(), "verification stopped");
            tasks.shutdown().await;
        }
        let flushed = sink.close().await.map_err(PipelineError::sink);
        stopped?;
        flushed?;

        report.elapsed = started.elapsed();
        info!(
            processed = report.processed,
            in_flight_peak = report.in_flight_peak,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "verification finished"
        );
        Ok(report)
    }

    fn report_progress(&self, progress: &Progress) {
        let every = self.options.log_every;
        if every > 0 && progress.processed % every == 0 {
            info!(
                processed = progress.processed,
                in_flight = progress.in_flight,
                average_rate = %format!("{:.2}", progress.average_rate),
                current_rate = ?progress.current_rate.map(|rate| (rate * 100.0).round() / 100.0),
                "progress"
            );
        }
        if let Some(callback) = &self.on_progress {
            callback(progress);
        }
    }
}

fn throttle_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_record<S, T>(source: &mut std::pin::Pin<&mut S>, throttle: Option<&mut Interval>) -> Option<T>
where
    S: Stream<Item = T>,
{
    if let Some(throttle) = throttle {
        throttle.tick().await;
    }
    source.next().await
}

#[cfg(test)]
mod tests;
