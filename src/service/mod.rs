//! HTTP client for the separation service running inside an instance.
//!
//! The service speaks plain JSON over HTTP. Error bodies carry a `detail`
//! field which is surfaced verbatim in [`ServiceError`]. Every request has its
//! own timeout so a wedged instance can never stall the orchestrator.

mod types;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use camino::Utf8Path;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::marketplace::Endpoint;

pub use types::{
    JobAccepted, JobDetails, JobListing, JobRequest, JobStatus, JobStatusReport, JobSummary,
    LogChunk, ServerStatus,
};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(60);
const JOB_TIMEOUT: Duration = Duration::from_secs(60);
const LOGS_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors raised while talking to the separation service.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ServiceError {
    /// The request never produced a response (connect failure, timeout).
    #[error("request to separation service failed: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },
    /// The service answered 404.
    #[error("not found: {message}")]
    NotFound {
        /// Diagnostic returned by the service.
        message: String,
    },
    /// The service answered with another non-success status.
    #[error("separation service returned {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Diagnostic returned by the service.
        message: String,
    },
    /// The response body did not match the expected shape.
    #[error("malformed response from separation service: {message}")]
    Malformed {
        /// Description of the decoding failure.
        message: String,
    },
    /// Writing a downloaded artefact to disk failed.
    #[error("failed to write {path}: {message}")]
    Io {
        /// Destination path.
        path: String,
        /// Description of the I/O failure.
        message: String,
    },
}

impl From<reqwest::Error> for ServiceError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Malformed {
                message: value.to_string(),
            }
        } else {
            Self::Transport {
                message: value.to_string(),
            }
        }
    }
}

/// Future returned by [`JobService`] operations.
pub type ServiceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ServiceError>> + Send + 'a>>;

/// Operations exposed by the separation service.
pub trait JobService: Send + Sync {
    /// Probes `GET /health`; any success status counts as healthy.
    fn health(&self) -> ServiceFuture<'_, ()>;

    /// Reads `GET /status`.
    fn status(&self) -> ServiceFuture<'_, ServerStatus>;

    /// Submits a job with `POST /job`.
    fn submit<'a>(&'a self, request: &'a JobRequest) -> ServiceFuture<'a, JobAccepted>;

    /// Reads `GET /job/{id}`.
    fn job<'a>(&'a self, job_id: &'a str) -> ServiceFuture<'a, JobStatusReport>;

    /// Reads `GET /job/{id}/logs?offset=N`.
    fn logs<'a>(&'a self, job_id: &'a str, offset: u64) -> ServiceFuture<'a, LogChunk>;

    /// Streams `GET /result/{id}?file=name` into `destination`, returning the
    /// number of bytes written.
    fn download<'a>(
        &'a self,
        job_id: &'a str,
        file: &'a str,
        destination: &'a Utf8Path,
    ) -> ServiceFuture<'a, u64>;

    /// Reads `GET /jobs`, optionally filtered by status.
    fn list_jobs(&self, filter: Option<JobStatus>, limit: u32) -> ServiceFuture<'_, JobListing>;

    /// Deletes a finished job with `DELETE /job/{id}`.
    fn delete_job<'a>(&'a self, job_id: &'a str) -> ServiceFuture<'a, ()>;
}

/// Builds service clients for resolved endpoints.
pub trait ServiceConnector: Send + Sync {
    /// Client type produced for an endpoint.
    type Service: JobService;

    /// Returns a client bound to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Transport`] when the HTTP client cannot be
    /// constructed.
    fn connect(&self, endpoint: &Endpoint) -> Result<Self::Service, ServiceError>;
}

/// Connector producing [`ServiceClient`] instances.
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpConnector;

impl ServiceConnector for HttpConnector {
    type Service = ServiceClient;

    fn connect(&self, endpoint: &Endpoint) -> Result<Self::Service, ServiceError> {
        ServiceClient::new(endpoint)
    }
}

/// reqwest-backed [`JobService`].
#[derive(Clone, Debug)]
pub struct ServiceClient {
    client: Client,
    base_url: String,
}

impl ServiceClient {
    /// Creates a client for a resolved endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Transport`] when the HTTP client cannot be
    /// built.
    pub fn new(endpoint: &Endpoint) -> Result<Self, ServiceError> {
        Self::with_base_url(endpoint.base_url())
    }

    /// Creates a client against an explicit base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Transport`] when the HTTP client cannot be
    /// built.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ServiceError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    /// Returns the base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(request: RequestBuilder) -> Result<Response, ServiceError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = error_detail(&body);
        if status == StatusCode::NOT_FOUND {
            Err(ServiceError::NotFound { message })
        } else {
            Err(ServiceError::Http {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn fetch_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ServiceError> {
        let response = Self::send(request).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| ServiceError::Malformed {
            message: err.to_string(),
        })
    }

    async fn stream_to_file(
        mut response: Response,
        destination: &Utf8Path,
    ) -> Result<u64, ServiceError> {
        let io_error = |err: std::io::Error| ServiceError::Io {
            path: destination.to_string(),
            message: err.to_string(),
        };
        let mut file = tokio::fs::File::create(destination.as_std_path())
            .await
            .map_err(io_error)?;
        let mut written = 0_u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await.map_err(io_error)?;
            written = written.saturating_add(u64::try_from(chunk.len()).unwrap_or(u64::MAX));
        }
        file.flush().await.map_err(io_error)?;
        Ok(written)
    }
}

/// Extracts the `detail` field from an error body, falling back to the raw
/// text.
fn error_detail(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => match map.get("detail") {
            Some(serde_json::Value::String(detail)) => detail.clone(),
            Some(other) => other.to_string(),
            None => body.to_owned(),
        },
        _ => body.to_owned(),
    }
}

impl JobService for ServiceClient {
    fn health(&self) -> ServiceFuture<'_, ()> {
        Box::pin(async move {
            let request = self.client.get(self.url("/health")).timeout(HEALTH_TIMEOUT);
            Self::send(request).await.map(|_| ())
        })
    }

    fn status(&self) -> ServiceFuture<'_, ServerStatus> {
        Box::pin(async move {
            let request = self.client.get(self.url("/status")).timeout(STATUS_TIMEOUT);
            Self::fetch_json(request).await
        })
    }

    fn submit<'a>(&'a self, request: &'a JobRequest) -> ServiceFuture<'a, JobAccepted> {
        Box::pin(async move {
            debug!(input_url = %request.input_url, "submitting job");
            let builder = self
                .client
                .post(self.url("/job"))
                .timeout(SUBMIT_TIMEOUT)
                .json(request);
            Self::fetch_json(builder).await
        })
    }

    fn job<'a>(&'a self, job_id: &'a str) -> ServiceFuture<'a, JobStatusReport> {
        Box::pin(async move {
            let request = self
                .client
                .get(self.url(&format!("/job/{job_id}")))
                .timeout(JOB_TIMEOUT);
            Self::fetch_json(request).await
        })
    }

    fn logs<'a>(&'a self, job_id: &'a str, offset: u64) -> ServiceFuture<'a, LogChunk> {
        Box::pin(async move {
            let request = self
                .client
                .get(self.url(&format!("/job/{job_id}/logs")))
                .query(&[("offset", offset)])
                .timeout(LOGS_TIMEOUT);
            Self::fetch_json(request).await
        })
    }

    fn download<'a>(
        &'a self,
        job_id: &'a str,
        file: &'a str,
        destination: &'a Utf8Path,
    ) -> ServiceFuture<'a, u64> {
        Box::pin(async move {
            let request = self
                .client
                .get(self.url(&format!("/result/{job_id}")))
                .query(&[("file", file)])
                .timeout(DOWNLOAD_TIMEOUT);
            let response = Self::send(request).await?;
            Self::stream_to_file(response, destination).await
        })
    }

    fn list_jobs(&self, filter: Option<JobStatus>, limit: u32) -> ServiceFuture<'_, JobListing> {
        Box::pin(async move {
            let mut request = self
                .client
                .get(self.url("/jobs"))
                .query(&[("limit", limit)])
                .timeout(JOB_TIMEOUT);
            if let Some(status) = filter {
                request = request.query(&[("status", status.as_str())]);
            }
            Self::fetch_json(request).await
        })
    }

    fn delete_job<'a>(&'a self, job_id: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            let request = self
                .client
                .delete(self.url(&format!("/job/{job_id}")))
                .timeout(JOB_TIMEOUT);
            Self::send(request).await.map(|_| ())
        })
    }
}
