//! HTTP-level tests for the separation service client.

use camino::Utf8PathBuf;
use serde_json::json;
use stemrig::service::{JobRequest, JobService, JobStatus, ServiceClient, ServiceError};
use tempfile::TempDir;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> ServiceClient {
    ServiceClient::with_base_url(server.uri())
        .unwrap_or_else(|err| panic!("client should build: {err}"))
}

#[tokio::test]
async fn health_accepts_any_success_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    client(&server).health().await.expect("service is healthy");
}

#[tokio::test]
async fn status_reports_model_readiness() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "ok", "models_ready": false, "active_jobs": 0
        })))
        .mount(&server)
        .await;

    let status = client(&server).status().await.expect("status");

    assert_eq!(status.status, "ok");
    assert!(!status.models_ready);
}

#[tokio::test]
async fn submit_posts_the_request_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/job"))
        .and(body_json(json!({
            "input_url": "https://example.com/song.mp3",
            "interval_cut": "30,60",
            "all_stems": true
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "job_id": "job-9", "status": "pending", "message": "queued"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let request = JobRequest {
        interval_cut: Some(String::from("30,60")),
        all_stems: true,
        ..JobRequest::new("https://example.com/song.mp3")
    };
    let accepted = client(&server).submit(&request).await.expect("submit");

    assert_eq!(accepted.job_id, "job-9");
    assert_eq!(accepted.status, JobStatus::Pending);
}

#[tokio::test]
async fn job_reports_progress_details() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/job/job-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "job_id": "job-9",
            "status": "running",
            "state": "separating",
            "details": {"completed_segments": 2, "total_segments": 5}
        })))
        .mount(&server)
        .await;

    let report = client(&server).job("job-9").await.expect("job");

    assert_eq!(report.status, JobStatus::Running);
    assert_eq!(report.state.as_deref(), Some("separating"));
    let details = report.details.expect("details");
    assert_eq!(details.completed_segments, Some(2));
    assert_eq!(details.total_segments, Some(5));
}

#[tokio::test]
async fn logs_send_the_offset() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/job/job-9/logs"))
        .and(query_param("offset", "42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "logs": "segment 3/5\n", "offset": 54, "status": "running"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let chunk = client(&server).logs("job-9", 42).await.expect("logs");

    assert_eq!(chunk.logs, "segment 3/5\n");
    assert_eq!(chunk.offset, 54);
}

#[tokio::test]
async fn download_streams_the_artifact_to_disk() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/result/job-9"))
        .and(query_param("file", "instrumental.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ID3 fake audio".to_vec()))
        .mount(&server)
        .await;
    let workspace = TempDir::new().expect("tempdir");
    let destination = Utf8PathBuf::from_path_buf(workspace.path().join("instrumental.mp3"))
        .expect("utf8 path");

    let written = client(&server)
        .download("job-9", "instrumental.mp3", &destination)
        .await
        .expect("download");

    assert_eq!(written, 14);
    let contents = std::fs::read(&destination).expect("read artifact");
    assert_eq!(contents, b"ID3 fake audio");
}

#[tokio::test]
async fn download_surfaces_the_service_detail_on_404() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/result/job-9"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({"detail": "File vocals.mp3 not found"})),
        )
        .mount(&server)
        .await;
    let workspace = TempDir::new().expect("tempdir");
    let destination =
        Utf8PathBuf::from_path_buf(workspace.path().join("vocals.mp3")).expect("utf8 path");

    let err = client(&server)
        .download("job-9", "vocals.mp3", &destination)
        .await
        .expect_err("download should fail");

    assert_eq!(
        err,
        ServiceError::NotFound {
            message: String::from("File vocals.mp3 not found"),
        }
    );
    assert!(!destination.exists());
}

#[tokio::test]
async fn list_jobs_applies_the_status_filter() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jobs"))
        .and(query_param("status", "completed"))
        .and(query_param("limit", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobs": [{"job_id": "job-1", "status": "completed", "created_at": "2026-01-01T00:00:00"}],
            "total": 3
        })))
        .expect(1)
        .mount(&server)
        .await;

    let listing = client(&server)
        .list_jobs(Some(JobStatus::Completed), 10)
        .await
        .expect("listing");

    assert_eq!(listing.total, 3);
    assert_eq!(listing.jobs.len(), 1);
}

#[tokio::test]
async fn delete_job_reports_conflicts() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/job/job-9"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({"detail": "Cannot delete a running job"})),
        )
        .mount(&server)
        .await;

    let err = client(&server)
        .delete_job("job-9")
        .await
        .expect_err("delete should fail");

    assert_eq!(
        err,
        ServiceError::Http {
            status: 400,
            message: String::from("Cannot delete a running job"),
        }
    );
}
