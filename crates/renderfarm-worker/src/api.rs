//! HTTP client for the manager's dispatch API.
//!
//! Thin free functions over a shared `reqwest::Client`; failures the agent
//! branches on (claim races, unknown worker) are typed, everything else is
//! an anyhow error carrying the status and body.

use std::path::Path;
use std::time::Duration;

use renderfarm_protocol::{HeartbeatRequest, JobDto, JobUpdateRequest, WorkerDto};
use reqwest::Url;

const POLL_TIMEOUT: Duration = Duration::from_secs(10);
const UPDATE_TIMEOUT: Duration = Duration::from_secs(5);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub(crate) enum ManagerError {
    /// Another worker won the conditional update.
    #[error("job already claimed")]
    ClaimConflict,
    /// The manager no longer knows this hostname; re-register.
    #[error("worker is not registered")]
    UnknownWorker,
}

async fn error_from(res: reqwest::Response) -> anyhow::Error {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    anyhow::anyhow!("http {status}: {body}")
}

pub(crate) async fn poll_jobs(
    http: &reqwest::Client,
    base: &Url,
    gpu_available: Option<bool>,
) -> anyhow::Result<Vec<JobDto>> {
    let url = base.join("api/jobs")?;
    let mut query: Vec<(&str, String)> = vec![
        ("status", "QUEUED".to_string()),
        ("assigned_worker__isnull", "true".to_string()),
    ];
    if let Some(gpu) = gpu_available {
        query.push(("gpu_available", gpu.to_string()));
    }

    let res = http
        .get(url)
        .query(&query)
        .timeout(POLL_TIMEOUT)
        .send()
        .await?;
    if !res.status().is_success() {
        return Err(error_from(res).await);
    }
    Ok(res.json().await?)
}

pub(crate) async fn fetch_job(
    http: &reqwest::Client,
    base: &Url,
    job_id: u64,
) -> anyhow::Result<JobDto> {
    let url = base.join(&format!("api/jobs/{job_id}"))?;
    let res = http.get(url).timeout(UPDATE_TIMEOUT).send().await?;
    if !res.status().is_success() {
        return Err(error_from(res).await);
    }
    Ok(res.json().await?)
}

pub(crate) async fn claim_job(
    http: &reqwest::Client,
    base: &Url,
    job_id: u64,
    worker_id: u64,
) -> anyhow::Result<()> {
    let url = base.join(&format!("api/jobs/{job_id}"))?;
    let res = http
        .patch(url)
        .json(&JobUpdateRequest {
            assigned_worker: Some(worker_id),
            ..Default::default()
        })
        .timeout(UPDATE_TIMEOUT)
        .send()
        .await?;

    if res.status() == reqwest::StatusCode::CONFLICT {
        return Err(ManagerError::ClaimConflict.into());
    }
    if !res.status().is_success() {
        return Err(error_from(res).await);
    }
    Ok(())
}

pub(crate) async fn update_job(
    http: &reqwest::Client,
    base: &Url,
    job_id: u64,
    update: &JobUpdateRequest,
) -> anyhow::Result<JobDto> {
    let url = base.join(&format!("api/jobs/{job_id}"))?;
    let res = http
        .patch(url)
        .json(update)
        .timeout(UPDATE_TIMEOUT)
        .send()
        .await?;
    if !res.status().is_success() {
        return Err(error_from(res).await);
    }
    Ok(res.json().await?)
}

pub(crate) async fn upload_output(
    http: &reqwest::Client,
    base: &Url,
    job_id: u64,
    output: &Path,
) -> anyhow::Result<JobDto> {
    let url = base.join(&format!("api/jobs/{job_id}/upload_output"))?;
    let bytes = tokio::fs::read(output).await?;
    let filename = output
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("output.png")
        .to_string();

    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name(filename)
        .mime_str("image/png")?;
    let form = reqwest::multipart::Form::new().part("output_file", part);

    let res = http
        .post(url)
        .multipart(form)
        .timeout(UPLOAD_TIMEOUT)
        .send()
        .await?;
    if !res.status().is_success() {
        return Err(error_from(res).await);
    }
    Ok(res.json().await?)
}

/// Registration and keepalive share one endpoint; a payload with
/// capabilities upserts, a bare hostname only refreshes `last_seen`.
pub(crate) async fn heartbeat(
    http: &reqwest::Client,
    base: &Url,
    req: &HeartbeatRequest,
) -> anyhow::Result<WorkerDto> {
    let url = base.join("api/heartbeat")?;
    let res = http
        .post(url)
        .json(req)
        .timeout(POLL_TIMEOUT)
        .send()
        .await?;

    if res.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(ManagerError::UnknownWorker.into());
    }
    if !res.status().is_success() {
        return Err(error_from(res).await);
    }
    Ok(res.json().await?)
}

/// Stream a manager-served blob to a local file.
pub(crate) async fn download_to(
    http: &reqwest::Client,
    url: Url,
    dest: &Path,
) -> anyhow::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut res = http.get(url).send().await?;
    if !res.status().is_success() {
        return Err(error_from(res).await);
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = dest.with_extension("part");
    let mut file = tokio::fs::File::create(&tmp).await?;
    while let Some(chunk) = res.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);
    tokio::fs::rename(&tmp, dest).await?;
    Ok(())
}
