//! Bounded producer/consumer extraction pipeline
//!
//! The producer discovers input files, scans them on a blocking thread and
//! pushes one [`Message::Item`] per measurement interval into a bounded
//! channel, suspending when the channel is full. The consumer owns the sink
//! router: it pulls with a bounded wait, writes and flushes each item, and
//! closes every sink when it sees [`Message::EndOfStream`] or
//! [`Message::Cancel`].
//!
//! Interrupts and the optional deadline never kill the consumer. The
//! orchestrator raises a shared flag (which stops the scanner at its next
//! element) and enqueues `Cancel`, then waits for both sides to wind down.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::counters::{TableItem, scan_file};
use crate::error::{FlattenError, Result};
use crate::file_discovery::FileDiscovery;
use crate::metadata::FileMetadata;
use crate::router::SinkSummary;
use crate::storage::StorageBackend;
use crate::tables::CounterTableWriter;

/// What travels through the channel
#[derive(Debug)]
pub enum Message {
    Item(TableItem),
    EndOfStream,
    Cancel,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Glob pattern of input files
    pub pattern: String,
    /// Let `**` descend into subdirectories
    pub recursive: bool,
    pub channel_capacity: usize,
    /// Longest wait of one consumer pull
    pub poll_interval: Duration,
    /// Overall deadline for the run
    pub deadline: Option<Duration>,
}

impl PipelineOptions {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            recursive: false,
            channel_capacity: 12,
            poll_interval: Duration::from_millis(50),
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub items: usize,
    pub metadata: FileMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    /// Files scanned to the end, in enumeration order
    pub files: Vec<FileReport>,
    pub items: u64,
    pub rows: u64,
    pub sinks: Vec<SinkSummary>,
    pub outcome: RunOutcome,
    pub duration: Duration,
}

struct ConsumerReport {
    items: u64,
    rows: u64,
    sinks: Vec<SinkSummary>,
    outcome: RunOutcome,
}

enum Stop {
    Producer(Result<Vec<FileReport>>),
    Consumer(Result<ConsumerReport>),
    Deadline,
    Interrupted,
}

fn join_error(e: tokio::task::JoinError) -> FlattenError {
    FlattenError::Concurrency {
        details: e.to_string(),
    }
}

/// One counter extraction run
pub struct ExtractionPipeline<B: StorageBackend + 'static> {
    options: PipelineOptions,
    writer: CounterTableWriter<B>,
}

impl<B: StorageBackend + 'static> ExtractionPipeline<B> {
    pub fn new(options: PipelineOptions, writer: CounterTableWriter<B>) -> Self {
        Self { options, writer }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run to completion or until the deadline
    pub async fn run(self) -> Result<PipelineReport> {
        self.run_until(std::future::pending()).await
    }

    /// Run until done, the deadline passes, or `shutdown` resolves
    ///
    /// A resolved `shutdown` cancels the run and still returns a report with
    /// [`RunOutcome::Cancelled`]. A passed deadline is an error
    /// (`Timeout`), raised only after the consumer has closed its sinks.
    pub async fn run_until<S>(self, shutdown: S) -> Result<PipelineReport>
    where
        S: Future<Output = ()>,
    {
        let started = Instant::now();
        let Self { options, writer } = self;
        if options.channel_capacity == 0 {
            return Err(FlattenError::Config(
                "channel capacity must be greater than 0".to_string(),
            ));
        }

        let files = FileDiscovery::from_pattern(&options.pattern, options.recursive)?
            .discover()
            .await?;
        info!(
            "Extracting counters from {} files matching {}",
            files.len(),
            options.pattern
        );

        let (tx, rx) = mpsc::channel(options.channel_capacity);
        let cancel = Arc::new(AtomicBool::new(false));

        let mut consumer: JoinHandle<Result<ConsumerReport>> = tokio::spawn(consume(
            rx,
            writer,
            options.poll_interval,
            Arc::clone(&cancel),
        ));
        let mut producer: JoinHandle<Result<Vec<FileReport>>> = {
            let tx = tx.clone();
            let cancel = Arc::clone(&cancel);
            tokio::task::spawn_blocking(move || produce(files, tx, cancel))
        };

        let deadline = options.deadline;
        let expired = async move {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(shutdown);
        tokio::pin!(expired);

        let stop = tokio::select! {
            biased;
            _ = &mut shutdown => Stop::Interrupted,
            _ = &mut expired => Stop::Deadline,
            result = &mut producer => Stop::Producer(result.map_err(join_error).and_then(|r| r)),
        };

        let stop = match stop {
            Stop::Producer(Ok(reports)) => {
                drop(tx);
                let stop = tokio::select! {
                    biased;
                    _ = &mut shutdown => Stop::Interrupted,
                    _ = &mut expired => Stop::Deadline,
                    result = &mut consumer => Stop::Consumer(result.map_err(join_error).and_then(|r| r)),
                };
                match stop {
                    Stop::Consumer(result) => {
                        let report = result?;
                        return Ok(finish(reports, report, started));
                    }
                    other => {
                        cancel_run(&cancel, None).await;
                        (other, Some(reports))
                    }
                }
            }
            Stop::Producer(Err(e)) => {
                let consumer_result = {
                    cancel_run(&cancel, Some(tx)).await;
                    consumer.await.map_err(join_error).and_then(|r| r)
                };
                // A producer cut off by a failed consumer only sees Cancelled
                return match consumer_result {
                    Err(consumer_error) if e.is_cancelled() => Err(consumer_error),
                    _ => Err(e),
                };
            }
            other => {
                cancel_run(&cancel, Some(tx)).await;
                (other, None)
            }
        };

        let (stop, reports) = stop;
        let consumer_report = consumer.await.map_err(join_error).and_then(|r| r)?;
        let reports = match reports {
            Some(reports) => reports,
            None => match producer.await.map_err(join_error)? {
                Ok(reports) => reports,
                Err(e) if e.is_cancelled() => Vec::new(),
                Err(e) => return Err(e),
            },
        };

        match stop {
            Stop::Deadline => {
                let seconds = deadline.map(|d| d.as_secs_f64()).unwrap_or_default();
                warn!(
                    "Deadline of {:.3}s passed, {} sinks closed",
                    seconds,
                    consumer_report.sinks.len()
                );
                Err(FlattenError::Timeout { seconds })
            }
            _ => {
                info!("Run cancelled after {} items", consumer_report.items);
                let mut report = finish(reports, consumer_report, started);
                report.outcome = RunOutcome::Cancelled;
                Ok(report)
            }
        }
    }
}

fn finish(files: Vec<FileReport>, consumer: ConsumerReport, started: Instant) -> PipelineReport {
    PipelineReport {
        files,
        items: consumer.items,
        rows: consumer.rows,
        sinks: consumer.sinks,
        outcome: consumer.outcome,
        duration: started.elapsed(),
    }
}

/// Raise the flag and enqueue `Cancel` if a sender is still held
async fn cancel_run(cancel: &AtomicBool, tx: Option<mpsc::Sender<Message>>) {
    cancel.store(true, Ordering::SeqCst);
    match tx {
        Some(tx) => {
            if tx.send(Message::Cancel).await.is_err() {
                debug!("Consumer already gone, cancel not delivered");
            }
        }
        None => debug!("Cancel requested after end of stream"),
    }
}

fn produce(
    files: Vec<PathBuf>,
    tx: mpsc::Sender<Message>,
    cancel: Arc<AtomicBool>,
) -> Result<Vec<FileReport>> {
    let mut reports = Vec::with_capacity(files.len());
    for path in files {
        if cancel.load(Ordering::SeqCst) {
            return Err(FlattenError::Cancelled);
        }
        let summary = scan_file(&path, Some(Arc::clone(&cancel)), |item| {
            tx.blocking_send(Message::Item(item))
                .map_err(|_| FlattenError::Cancelled)
        })?;
        info!("Scanned {}: {} items", path.display(), summary.items);
        reports.push(FileReport {
            path,
            items: summary.items,
            metadata: summary.metadata,
        });
    }
    tx.blocking_send(Message::EndOfStream)
        .map_err(|_| FlattenError::Cancelled)?;
    Ok(reports)
}

async fn consume<B: StorageBackend>(
    mut rx: mpsc::Receiver<Message>,
    mut writer: CounterTableWriter<B>,
    poll_interval: Duration,
    cancel: Arc<AtomicBool>,
) -> Result<ConsumerReport> {
    let outcome = loop {
        let message = match tokio::time::timeout(poll_interval, rx.recv()).await {
            Ok(message) => message,
            Err(_) => {
                if cancel.load(Ordering::SeqCst) {
                    debug!("Cancel flag raised while idle");
                    break RunOutcome::Cancelled;
                }
                continue;
            }
        };
        match message {
            Some(Message::Item(item)) => {
                let written = writer.write_item(&item).and_then(|_| writer.flush());
                if let Err(e) = written {
                    if let Err(close_error) = writer.close() {
                        warn!("Closing sinks after failure: {}", close_error);
                    }
                    return Err(e);
                }
            }
            Some(Message::EndOfStream) => break RunOutcome::Completed,
            Some(Message::Cancel) => break RunOutcome::Cancelled,
            None => {
                debug!("Channel closed without end of stream");
                break RunOutcome::Cancelled;
            }
        }
    };
    rx.close();

    let items = writer.items_written();
    let rows = writer.rows_written();
    let sinks = writer.close()?;
    debug!("Consumer finished: {} items, {} rows", items, rows);
    Ok(ConsumerReport {
        items,
        rows,
        sinks,
        outcome,
    })
}
