//! Upload and download drivers.

use crate::error::{ClientError, Result};
use crate::retry::RetryPolicy;
use crate::transport::{HttpTransport, Transport};
use ferry_core::{
    ChunkStatus, Chunker, ErrorKind, OpenUploadRequest, OpenUploadResponse, SealResponse,
    UploadPhase, UploadStatus,
};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Result of a finished upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadOutcome {
    pub upload_id: String,
    pub sealed: SealResponse,
    /// Chunks actually sent in this call (resumed uploads skip the rest).
    pub chunks_sent: u64,
}

/// Result of a finished download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub total_size: u64,
    /// Bytes written by this call, excluding any resumed prefix.
    pub bytes_written: u64,
    pub filename: Option<String>,
}

/// Drives uploads and downloads over a [`Transport`], retrying transient
/// failures with exponential backoff.
#[derive(Clone)]
pub struct FerryClient {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl FerryClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            retry: RetryPolicy::default(),
        }
    }

    /// Client for the ferry server at `base_url`.
    pub fn connect(base_url: &str) -> Result<Self> {
        Ok(Self::new(Arc::new(HttpTransport::new(base_url)?)))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub async fn open(
        &self,
        filename: &str,
        mime: &str,
        total_size: u64,
    ) -> Result<OpenUploadResponse> {
        let request = OpenUploadRequest {
            filename: filename.to_string(),
            mime: mime.to_string(),
            total_size,
        };
        self.retry
            .run("open", || self.transport.open_upload(&request))
            .await
    }

    pub async fn status(&self, upload_id: &str) -> Result<UploadStatus> {
        self.retry
            .run("status", || self.transport.upload_status(upload_id))
            .await
    }

    pub async fn seal(&self, upload_id: &str) -> Result<SealResponse> {
        self.retry
            .run("seal", || self.transport.seal_upload(upload_id))
            .await
    }

    pub async fn cancel(&self, upload_id: &str) -> Result<()> {
        self.retry
            .run("cancel", || self.transport.cancel_upload(upload_id))
            .await
    }

    /// Upload `total_size` bytes from `reader` and seal them.
    #[tracing::instrument(skip(self, reader))]
    pub async fn upload_reader<R>(
        &self,
        filename: &str,
        mime: &str,
        total_size: u64,
        reader: R,
    ) -> Result<UploadOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let opened = self.open(filename, mime, total_size).await?;
        tracing::info!(
            upload_id = %opened.upload_id,
            chunks = opened.chunks_expected,
            "Upload opened"
        );
        self.finish_upload(&opened, total_size, reader, 0).await
    }

    /// Upload a file from disk, using its file name.
    pub async fn upload_file(&self, path: &Path, mime: &str) -> Result<UploadOutcome> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                ClientError::Local(ferry_core::Error::BadInput(format!(
                    "{} has no usable file name",
                    path.display()
                )))
            })?
            .to_string();
        let file = tokio::fs::File::open(path).await?;
        let total_size = file.metadata().await?.len();
        self.upload_reader(&filename, mime, total_size, file).await
    }

    /// Continue an interrupted upload from the server's cursor.
    ///
    /// `reader` must yield the same bytes as the original source, from the
    /// start; chunks the server already holds are read and skipped.
    #[tracing::instrument(skip(self, opened, reader), fields(upload_id = %opened.upload_id))]
    pub async fn resume_upload<R>(
        &self,
        opened: &OpenUploadResponse,
        total_size: u64,
        reader: R,
    ) -> Result<UploadOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let status = self.status(&opened.upload_id).await?;
        if status.state == UploadPhase::Done {
            let sealed = self.seal(&opened.upload_id).await?;
            return Ok(UploadOutcome {
                upload_id: opened.upload_id.clone(),
                sealed,
                chunks_sent: 0,
            });
        }
        tracing::info!(cursor = status.cursor, "Resuming upload");
        self.finish_upload(opened, total_size, reader, status.cursor)
            .await
    }

    async fn finish_upload<R>(
        &self,
        opened: &OpenUploadResponse,
        total_size: u64,
        reader: R,
        mut cursor: u64,
    ) -> Result<UploadOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let upload_id = opened.upload_id.as_str();
        let mut chunker = Chunker::new(reader, total_size, opened.chunk_max)?;
        let mut chunks_sent = 0;

        while let Some(chunk) = chunker.next_chunk_async().await? {
            if chunk.index < cursor {
                continue;
            }

            // A chunk damaged in transit is rejected by hash and can be
            // sent again as is.
            let sent = self
                .retry
                .run_if(
                    "put_chunk",
                    |e| e.is_retryable() || e.kind() == ErrorKind::HashMismatch,
                    || {
                        self.transport
                            .put_chunk(upload_id, chunk.index, &chunk.hash, chunk.data.clone())
                    },
                )
                .await;

            match sent {
                Ok(ack) => {
                    if ack.status == ChunkStatus::Stored {
                        chunks_sent += 1;
                    }
                    cursor = ack.next_index;
                }
                Err(e) if e.kind() == ErrorKind::BadSequence => {
                    // Someone else moved the cursor; skip ahead if it is past us.
                    let status = self.status(upload_id).await?;
                    if status.cursor <= chunk.index {
                        return Err(e);
                    }
                    tracing::debug!(
                        chunk_index = chunk.index,
                        cursor = status.cursor,
                        "Server is ahead, skipping"
                    );
                    cursor = status.cursor;
                }
                Err(e) => return Err(e),
            }
        }

        let sealed = self.seal(upload_id).await?;
        tracing::info!(share_code = %sealed.share_code, chunks_sent, "Upload sealed");
        Ok(UploadOutcome {
            upload_id: upload_id.to_string(),
            sealed,
            chunks_sent,
        })
    }

    /// Stream a shared file into `writer`, starting at byte `offset`.
    ///
    /// A transfer cut off midway is resumed with a range request from the
    /// last byte written, within the retry budget.
    #[tracing::instrument(skip(self, writer))]
    pub async fn download_to<W>(
        &self,
        share_code: &str,
        writer: &mut W,
        offset: u64,
    ) -> Result<DownloadOutcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut position = offset;
        let mut attempt = 0;
        loop {
            match self.stream_once(share_code, writer, &mut position).await {
                Ok((total_size, filename)) => {
                    writer.flush().await?;
                    return Ok(DownloadOutcome {
                        total_size,
                        bytes_written: position - offset,
                        filename,
                    });
                }
                Err(ClientError::RangeNotSatisfiable { total_size }) if position == total_size => {
                    writer.flush().await?;
                    return Ok(DownloadOutcome {
                        total_size,
                        bytes_written: position - offset,
                        filename: None,
                    });
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        position,
                        attempt,
                        error = %e,
                        "Download interrupted, resuming"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stream_once<W>(
        &self,
        share_code: &str,
        writer: &mut W,
        position: &mut u64,
    ) -> Result<(u64, Option<String>)>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut body = self.transport.download(share_code, *position).await?;
        if body.offset != *position {
            return Err(ClientError::Protocol(format!(
                "asked for byte {position}, server started at {}",
                body.offset
            )));
        }

        while let Some(bytes) = body.stream.next().await {
            let bytes = bytes?;
            writer.write_all(&bytes).await?;
            *position += bytes.len() as u64;
        }
        if *position != body.total_size {
            // Treated like a dropped connection so the caller resumes.
            return Err(ClientError::Local(ferry_core::Error::Transient(format!(
                "download ended at byte {position} of {}",
                body.total_size
            ))));
        }
        Ok((body.total_size, body.filename))
    }

    /// Download into `path`, resuming from its current length if it exists.
    pub async fn download_file(&self, share_code: &str, path: &Path) -> Result<DownloadOutcome> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let offset = file.metadata().await?.len();
        if offset > 0 {
            tracing::info!(path = %path.display(), offset, "Resuming download");
        }
        let outcome = self.download_to(share_code, &mut file, offset).await?;
        file.sync_all().await?;
        Ok(outcome)
    }

    /// Download into `dir`, named after the server's file name.
    pub async fn download_into(
        &self,
        share_code: &str,
        dir: &Path,
    ) -> Result<(PathBuf, DownloadOutcome)> {
        let partial = dir.join(format!(".{share_code}.part"));
        let outcome = self.download_file(share_code, &partial).await?;
        let name = outcome
            .filename
            .clone()
            .unwrap_or_else(|| share_code.to_string());
        let target = dir.join(sanitize_filename(&name));
        tokio::fs::rename(&partial, &target).await?;
        Ok((target, outcome))
    }
}

/// Keep only the final path component and drop anything that could escape
/// the target directory.
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    match base {
        "" | "." | ".." => "download".to_string(),
        other => other.to_string(),
    }
}
