//! HTTP client for the review analysis service.

use crate::error::FetchError;
use crate::model::{
    AnalysisRecord, ClientConfig, DownloadFormat, PredictRequest, PredictResult, ProcessResponse,
    UploadResponse,
};
use crate::poller::RecordFetcher;
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use reqwest::Url;
use serde::de::DeserializeOwned;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(cfg: &ClientConfig) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url)
            .with_context(|| format!("invalid base URL {:?}", cfg.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("base URL {:?} cannot carry a path", cfg.base_url);
        }
        let http = reqwest::Client::builder()
            .user_agent(&cfg.user_agent)
            .timeout(cfg.timeout)
            .build()
            .context("build HTTP client")?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Join path segments onto the base URL, escaping each one.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn analysis_url(&self, analysis_id: &str) -> Url {
        self.endpoint(&["analysis", analysis_id])
    }

    pub fn download_url(&self, analysis_id: &str, format: DownloadFormat) -> Url {
        let mut url = self.endpoint(&["analysis", analysis_id, "download"]);
        url.query_pairs_mut()
            .append_pair("format", format.as_query_str());
        url
    }

    pub async fn get_analysis(&self, analysis_id: &str) -> Result<AnalysisRecord, FetchError> {
        let resp = self.http.get(self.analysis_url(analysis_id)).send().await?;
        decode(resp).await
    }

    pub async fn list_analyses(&self) -> Result<Vec<AnalysisRecord>, FetchError> {
        let resp = self.http.get(self.endpoint(&["analyses"])).send().await?;
        decode(resp).await
    }

    pub async fn upload_review_file(
        &self,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<UploadResponse, FetchError> {
        let part = reqwest::multipart::Part::bytes(data)
            .file_name(file_name.to_string())
            .mime_str(guess_mime(file_name))?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self
            .http
            .post(self.endpoint(&["uploads", "review-file"]))
            .multipart(form)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn process_upload(&self, upload_id: &str) -> Result<ProcessResponse, FetchError> {
        let resp = self
            .http
            .post(self.endpoint(&["analysis", "process-file", upload_id]))
            .send()
            .await?;
        decode(resp).await
    }

    /// Upload a review file and queue it for analysis. Returns the new analysis.
    pub async fn submit_file(&self, path: &Path) -> Result<ProcessResponse> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("file path has no usable file name")?
            .to_string();
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        debug!(file = %file_name, bytes = data.len(), "uploading review file");

        let upload = self
            .upload_review_file(&file_name, data)
            .await
            .context("upload failed")?;
        let processed = self
            .process_upload(&upload.upload_id)
            .await
            .with_context(|| format!("processing upload {} failed", upload.upload_id))?;
        debug!(analysis_id = %processed.analysis_id, "analysis queued");
        Ok(processed)
    }

    pub async fn predict(&self, req: &PredictRequest) -> Result<PredictResult, FetchError> {
        let resp = self
            .http
            .post(self.endpoint(&["predict"]))
            .json(req)
            .send()
            .await?;
        decode(resp).await
    }

    /// Stream an analysis report to `dest`. Returns the number of bytes written.
    pub async fn download_results(
        &self,
        analysis_id: &str,
        format: DownloadFormat,
        dest: &Path,
    ) -> Result<u64> {
        let resp = self
            .http
            .get(self.download_url(analysis_id, format))
            .send()
            .await
            .map_err(FetchError::from)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::from_status_body(status, &body).into());
        }
        write_stream_to_file(resp.bytes_stream(), dest).await
    }
}

impl RecordFetcher for ApiClient {
    fn fetch_record<'a>(
        &'a self,
        analysis_id: &'a str,
    ) -> BoxFuture<'a, Result<AnalysisRecord, FetchError>> {
        Box::pin(self.get_analysis(analysis_id))
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, FetchError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(FetchError::from_status_body(status, &body));
    }
    Ok(serde_json::from_str(&body)?)
}

fn guess_mime(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("xls") => "application/vnd.ms-excel",
        _ => "application/octet-stream",
    }
}

/// Write a byte stream to `dest`, removing the partial file if the stream fails.
pub(crate) async fn write_stream_to_file<S, E>(stream: S, dest: &Path) -> Result<u64>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("create {}", dest.display()))?;

    let written = async {
        let mut total = 0u64;
        let mut stream = std::pin::pin!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("download interrupted")?;
            file.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        file.flush().await?;
        Ok::<u64, anyhow::Error>(total)
    }
    .await;

    match written {
        Ok(total) => Ok(total),
        Err(e) => {
            drop(file);
            if let Err(rm) = tokio::fs::remove_file(dest).await {
                warn!(path = %dest.display(), "could not remove partial download: {rm}");
            }
            Err(e.context(format!("write {}", dest.display())))
        }
    }
}
