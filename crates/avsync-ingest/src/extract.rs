//! Paged, windowed extraction with retries
//!
//! [`Extractor::extract`] yields pages lazily and strictly in page order while
//! keeping up to `max_in_flight_pages` requests outstanding. Each request runs
//! as its own task, so look-ahead fetches keep making progress while the
//! consumer is busy with an earlier page. The stream ends after the first
//! short page or the first error; requests still in flight at that point are
//! aborted.

use crate::config::{BatchConfig, RetryConfig, WindowConfig};
use crate::error::{PipelineError, SourceError};
use crate::source::{PageRequest, SourceClient};
use crate::stage::{Stage, StageDef, WindowPolicy};
use crate::types::{ExtractionWindow, OperatorId, Page, Watermark};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, BoxStream, FuturesOrdered, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

/// Window for a stage given its last checkpoint and the extraction start time.
pub fn window_for(
    policy: WindowPolicy,
    checkpoint: Option<Watermark>,
    now: DateTime<Utc>,
    config: &WindowConfig,
) -> ExtractionWindow {
    match policy {
        WindowPolicy::Unbounded => ExtractionWindow::unbounded(),
        WindowPolicy::Incremental { future_horizon } => {
            let since = match checkpoint {
                Some(watermark) => watermark - Duration::days(config.refresh_days_past),
                None => now - Duration::days(config.initial_load_days_past),
            };
            let until = if future_horizon {
                now + Duration::days(config.days_future)
            } else {
                now
            };
            ExtractionWindow {
                since: Some(since),
                until: Some(until),
            }
        },
    }
}

#[derive(Debug, Clone)]
pub struct ExtractSettings {
    pub page_size: u32,
    pub max_in_flight_pages: usize,
    pub retry: RetryConfig,
}

impl ExtractSettings {
    pub fn new(batch: &BatchConfig, retry: &RetryConfig) -> Self {
        Self {
            page_size: batch.page_size,
            max_in_flight_pages: batch.max_in_flight_pages.max(1),
            retry: retry.clone(),
        }
    }
}

pub struct Extractor {
    stage: Stage,
    endpoint: &'static str,
    source: Arc<dyn SourceClient>,
    settings: ExtractSettings,
}

impl Extractor {
    pub fn new(def: &StageDef, source: Arc<dyn SourceClient>, settings: ExtractSettings) -> Self {
        Self {
            stage: def.stage,
            endpoint: def.endpoint,
            source,
            settings,
        }
    }

    pub fn extract(
        &self,
        operator: &OperatorId,
        window: ExtractionWindow,
    ) -> BoxStream<'static, Result<Page, PipelineError>> {
        let state = PageQueue {
            source: Arc::clone(&self.source),
            operator: operator.clone(),
            settings: self.settings.clone(),
            stage: self.stage,
            endpoint: self.endpoint,
            window,
            next_page: 1,
            in_flight: FuturesOrdered::new(),
            finished: false,
        };

        stream::unfold(state, |mut queue| async move {
            if queue.finished {
                return None;
            }
            queue.fill();
            let item = queue.in_flight.next().await?;
            queue.finished = match &item {
                Ok(page) => page.is_last,
                Err(_) => true,
            };
            Some((item, queue))
        })
        .boxed()
    }
}

/// Outstanding page requests, yielded in page order
struct PageQueue {
    source: Arc<dyn SourceClient>,
    operator: OperatorId,
    settings: ExtractSettings,
    stage: Stage,
    endpoint: &'static str,
    window: ExtractionWindow,
    next_page: u32,
    in_flight: FuturesOrdered<PageTask>,
    finished: bool,
}

impl PageQueue {
    fn fill(&mut self) {
        while self.in_flight.len() < self.settings.max_in_flight_pages {
            let number = self.next_page;
            self.next_page += 1;

            let source = Arc::clone(&self.source);
            let operator = self.operator.clone();
            let retry = self.settings.retry.clone();
            let page_size = self.settings.page_size;
            let request = PageRequest {
                stage: self.stage,
                endpoint: self.endpoint,
                window: self.window,
                page: number,
                page_size,
            };

            let task = tokio::spawn(
                async move {
                    let records =
                        fetch_with_retry(source.as_ref(), &operator, &request, &retry).await?;
                    let is_last = records.len() < page_size as usize;
                    Ok(Page {
                        number,
                        records,
                        is_last,
                    })
                }
                .in_current_span(),
            );
            self.in_flight.push_back(PageTask {
                stage: self.stage,
                page: number,
                handle: task,
            });
        }
    }
}

/// A spawned page fetch, aborted when dropped before completion
struct PageTask {
    stage: Stage,
    page: u32,
    handle: JoinHandle<Result<Page, PipelineError>>,
}

impl Future for PageTask {
    type Output = Result<Page, PipelineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let (stage, page) = (self.stage, self.page);
        Pin::new(&mut self.handle).poll(cx).map(|joined| {
            joined.unwrap_or_else(|err| {
                Err(PipelineError::Extraction {
                    stage,
                    page,
                    attempts: 0,
                    message: format!("page task failed: {err}"),
                })
            })
        })
    }
}

impl Drop for PageTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One page with timeout and exponential backoff on transient failures.
pub async fn fetch_with_retry(
    source: &dyn SourceClient,
    operator: &OperatorId,
    request: &PageRequest,
    retry: &RetryConfig,
) -> Result<Vec<Value>, PipelineError> {
    let max_attempts = retry.max_attempts.max(1);
    let mut last_error = SourceError::Timeout;

    for attempt in 1..=max_attempts {
        let outcome = tokio::time::timeout(
            retry.request_timeout(),
            source.fetch_page(operator, request),
        )
        .await
        .unwrap_or(Err(SourceError::Timeout));

        match outcome {
            Ok(records) => {
                debug!(
                    stage = %request.stage,
                    page = request.page,
                    records = records.len(),
                    attempt,
                    "Fetched page"
                );
                return Ok(records);
            },
            Err(SourceError::Auth(message)) => return Err(PipelineError::FatalAuth(message)),
            Err(err) if err.is_retryable() => {
                if attempt < max_attempts {
                    let delay = retry.backoff(attempt);
                    warn!(
                        stage = %request.stage,
                        page = request.page,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Source call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = err;
            },
            Err(err) => {
                return Err(PipelineError::Extraction {
                    stage: request.stage,
                    page: request.page,
                    attempts: attempt,
                    message: err.to_string(),
                });
            },
        }
    }

    Err(PipelineError::Extraction {
        stage: request.stage,
        page: request.page,
        attempts: max_attempts,
        message: last_error.to_string(),
    })
}
