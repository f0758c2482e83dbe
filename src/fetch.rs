//! Result retrieval for completed jobs.
//!
//! Artefacts are streamed to `<destination>.part` and renamed into place
//! once the transfer finishes, so a partial download never masquerades as a
//! result.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::info;

use crate::job::{JobStore, StoreError};
use crate::service::{JobService, JobStatus, ServiceError};

/// Artefact produced by a default separation job.
pub const DEFAULT_ARTIFACT: &str = "instrumental.mp3";

/// Errors raised while fetching results.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The local record does not say `completed`.
    #[error("job {job_id} is not completed (status: {})", status.map_or("unknown", JobStatus::as_str))]
    NotCompleted {
        /// Requested job.
        job_id: String,
        /// Locally recorded status, if any.
        status: Option<JobStatus>,
    },
    /// The service has no such artefact.
    #[error("result for job {job_id} not found: {message}")]
    NotFound {
        /// Requested job.
        job_id: String,
        /// Server diagnostics, including available files.
        message: String,
    },
    /// The download failed.
    #[error("failed to download result: {0}")]
    Service(#[source] ServiceError),
    /// The destination could not be prepared or finalised.
    #[error("failed to write {path}: {message}")]
    Io {
        /// Path involved.
        path: Utf8PathBuf,
        /// Description of the failure.
        message: String,
    },
    /// The local job store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Downloads artefacts of completed jobs.
#[derive(Debug)]
pub struct ResultFetcher<'a, S: ?Sized, St: ?Sized> {
    service: &'a S,
    store: &'a St,
}

impl<'a, S, St> ResultFetcher<'a, S, St>
where
    S: JobService + ?Sized,
    St: JobStore + ?Sized,
{
    /// Creates a fetcher.
    #[must_use]
    pub const fn new(service: &'a S, store: &'a St) -> Self {
        Self { service, store }
    }

    /// Downloads `artifact` of `job_id` to `destination`.
    ///
    /// Parent directories are created as needed.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::NotCompleted`] unless the job is recorded as
    /// completed, [`FetchError::NotFound`] when the service has no such
    /// file, and [`FetchError::Io`] when the destination cannot be written.
    pub async fn fetch(
        &self,
        job_id: &str,
        artifact: &str,
        destination: &Utf8Path,
    ) -> Result<Utf8PathBuf, FetchError> {
        let status = self.store.get(job_id)?.map(|record| record.status);
        if status != Some(JobStatus::Completed) {
            return Err(FetchError::NotCompleted {
                job_id: job_id.to_owned(),
                status,
            });
        }

        let (dir, file_name) = prepare_parent(destination)?;
        let part_name = format!("{file_name}.part");
        let part_path = destination.with_file_name(&part_name);

        let bytes = match self.service.download(job_id, artifact, &part_path).await {
            Ok(bytes) => bytes,
            Err(ServiceError::NotFound { message }) => {
                discard(&dir, &part_name);
                return Err(FetchError::NotFound {
                    job_id: job_id.to_owned(),
                    message,
                });
            }
            Err(err) => {
                discard(&dir, &part_name);
                return Err(FetchError::Service(err));
            }
        };

        dir.rename(&part_name, &dir, file_name)
            .map_err(|err| FetchError::Io {
                path: destination.to_path_buf(),
                message: err.to_string(),
            })?;
        info!(%job_id, %artifact, path = %destination, bytes, "result downloaded");
        Ok(destination.to_path_buf())
    }
}

fn prepare_parent(destination: &Utf8Path) -> Result<(Dir, &str), FetchError> {
    let parent = destination
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = destination.file_name().ok_or_else(|| FetchError::Io {
        path: destination.to_path_buf(),
        message: String::from("destination is missing a file name"),
    })?;
    Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(|err| FetchError::Io {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| FetchError::Io {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })?;
    Ok((dir, file_name))
}

fn discard(dir: &Dir, part_name: &str) {
    if dir.try_exists(part_name).unwrap_or(false) {
        if let Err(err) = dir.remove_file(part_name) {
            tracing::debug!(file = %part_name, error = %err, "failed to remove partial download");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobRecord, MemoryJobStore};
    use crate::service::JobStatusReport;
    use crate::test_support::ScriptedService;
    use rstest::rstest;
    use tempfile::TempDir;

    fn completed_store(job_id: &str) -> MemoryJobStore {
        let store = MemoryJobStore::new();
        store
            .create(JobRecord::from_report(&JobStatusReport {
                job_id: job_id.to_owned(),
                status: JobStatus::Completed,
                state: None,
                tasks: None,
                details: None,
                elapsed_seconds: None,
                error: None,
            }))
            .expect("seed record");
        store
    }

    fn utf8_dir(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non-utf8 temp dir: {}", path.display()))
    }

    #[rstest]
    #[tokio::test]
    async fn fetch_writes_artifact_into_nested_directory() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let destination = utf8_dir(&tmp).join("out/nested/song.mp3");
        let service = ScriptedService::new();
        service.set_artifact("instrumental.mp3", b"ID3-audio".to_vec());
        let store = completed_store("job-1");

        let path = ResultFetcher::new(&service, &store)
            .fetch("job-1", DEFAULT_ARTIFACT, &destination)
            .await
            .unwrap_or_else(|err| panic!("fetch: {err}"));

        assert_eq!(path, destination);
        let written = std::fs::read(destination.as_std_path()).expect("read result");
        assert_eq!(written, b"ID3-audio");
        assert!(!destination.with_file_name("song.mp3.part").exists());
    }

    #[rstest]
    #[tokio::test]
    async fn fetch_refuses_unfinished_jobs() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let service = ScriptedService::new();
        let store = MemoryJobStore::new();
        store
            .create(JobRecord::pending("job-2"))
            .expect("seed record");

        let err = ResultFetcher::new(&service, &store)
            .fetch("job-2", DEFAULT_ARTIFACT, &utf8_dir(&tmp).join("x.mp3"))
            .await
            .expect_err("pending job must not be fetched");
        assert!(matches!(
            err,
            FetchError::NotCompleted {
                status: Some(JobStatus::Pending),
                ..
            }
        ));
        assert_eq!(service.download_calls(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn fetch_surfaces_missing_artifact_diagnostics() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let destination = utf8_dir(&tmp).join("vocals.mp3");
        let service = ScriptedService::new();
        service.set_artifact("instrumental.mp3", b"x".to_vec());
        let store = completed_store("job-3");

        let err = ResultFetcher::new(&service, &store)
            .fetch("job-3", "vocals.mp3", &destination)
            .await
            .expect_err("missing artifact");
        match err {
            FetchError::NotFound { message, .. } => {
                assert!(message.contains("instrumental.mp3"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!destination.exists());
        assert!(!destination.with_file_name("vocals.mp3.part").exists());
    }
}
