//! The processing step invoked for each claimed upload.
//!
//! Document parsing itself lives outside this system. The worker only needs
//! to know whether a job succeeded, or why it failed.

use std::time::Duration;

use async_trait::async_trait;

use hireloop_core::UploadQueueJob;

/// Failure reported by (or on behalf of) the processing step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessingError {
    /// The processor ran and reported a failure.
    #[error("processing failed: {0}")]
    Failed(String),
    /// The processor did not finish within the per-job timeout.
    #[error("processing timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
    /// The processor panicked.
    #[error("processor panicked: {0}")]
    Panicked(String),
}

impl ProcessingError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Processing step for one upload.
///
/// Any error, including one raised after partial work, counts as a failed
/// attempt; there is no partial-credit state.
#[async_trait]
pub trait UploadProcessor: Send + Sync {
    async fn process(&self, job: &UploadQueueJob) -> Result<(), ProcessingError>;
}

#[async_trait]
impl<P> UploadProcessor for std::sync::Arc<P>
where
    P: UploadProcessor + ?Sized,
{
    async fn process(&self, job: &UploadQueueJob) -> Result<(), ProcessingError> {
        (**self).process(job).await
    }
}

/// Processor that hands each job to an HTTP webhook.
///
/// POSTs the job JSON; any 2xx response is a success.
#[derive(Debug, Clone)]
pub struct HttpUploadProcessor {
    client: reqwest::Client,
    url: String,
}

impl HttpUploadProcessor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl UploadProcessor for HttpUploadProcessor {
    async fn process(&self, job: &UploadQueueJob) -> Result<(), ProcessingError> {
        let response = self
            .client
            .post(&self.url)
            .json(job)
            .send()
            .await
            .map_err(|e| ProcessingError::failed(format!("webhook request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let body = body.chars().take(200).collect::<String>();
        Err(ProcessingError::failed(format!(
            "webhook returned {status}: {body}"
        )))
    }
}
