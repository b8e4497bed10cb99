//! Live upload and download sessions.
//!
//! Upload sessions carry the upload state machine and the lock that
//! serializes chunk and seal calls for one upload. They are rebuilt from the
//! persisted manifest when missing, so nothing here has to survive a restart.

use dashmap::DashMap;
use ferry_core::{ShareCode, UploadId, UploadPhase};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Upload,
    Download,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub kind: SessionKind,
    /// Upload id for uploads, share code for downloads.
    pub target: String,
    /// Next chunk index to receive or send.
    pub cursor: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
}

/// Upload state guarded by the session lock.
#[derive(Debug)]
pub struct UploadState {
    pub phase: UploadPhase,
    pub cursor: u64,
    /// References past the cursor may exist (rebuilt session, failed rollback).
    pub stale_refs: bool,
}

pub struct UploadSession {
    upload_id: UploadId,
    state: Mutex<UploadState>,
    cancel: CancellationToken,
    phase: AtomicU8,
    cursor: AtomicU64,
    last_activity: AtomicI64,
}

impl UploadSession {
    fn new(
        upload_id: UploadId,
        phase: UploadPhase,
        cursor: u64,
        stale_refs: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            upload_id,
            state: Mutex::new(UploadState {
                phase,
                cursor,
                stale_refs,
            }),
            cancel,
            phase: AtomicU8::new(phase_to_u8(phase)),
            cursor: AtomicU64::new(cursor),
            last_activity: AtomicI64::new(now_unix()),
        }
    }

    pub fn upload_id(&self) -> UploadId {
        self.upload_id
    }

    /// Exclusive access to the upload's state.
    pub async fn lock(&self) -> MutexGuard<'_, UploadState> {
        self.state.lock().await
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Phase as of the last transition, readable without the lock.
    pub fn phase(&self) -> UploadPhase {
        phase_from_u8(self.phase.load(Ordering::Relaxed))
    }

    pub fn set_phase(&self, state: &mut UploadState, phase: UploadPhase) {
        state.phase = phase;
        self.phase.store(phase_to_u8(phase), Ordering::Relaxed);
    }

    /// Record a committed chunk.
    pub fn advance(&self, state: &mut UploadState, cursor: u64) {
        state.cursor = cursor;
        self.cursor.store(cursor, Ordering::Relaxed);
        self.touch();
    }

    pub fn touch(&self) {
        self.last_activity.store(now_unix(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> OffsetDateTime {
        from_unix(self.last_activity.load(Ordering::Relaxed))
    }
}

pub struct DownloadSession {
    id: u64,
    share_code: ShareCode,
    upload_id: UploadId,
    cursor: AtomicU64,
    last_activity: AtomicI64,
}

impl DownloadSession {
    pub fn upload_id(&self) -> UploadId {
        self.upload_id
    }

    pub fn share_code(&self) -> &ShareCode {
        &self.share_code
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }

    /// Record that chunk `next_index - 1` was sent.
    pub fn advance(&self, next_index: u64) {
        self.cursor.store(next_index, Ordering::Relaxed);
        self.last_activity.store(now_unix(), Ordering::Relaxed);
    }
}

/// Keeps a download session registered until dropped.
pub struct DownloadGuard {
    registry: Arc<SessionRegistry>,
    session: Arc<DownloadSession>,
}

impl DownloadGuard {
    pub fn session(&self) -> &DownloadSession {
        &self.session
    }
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        self.registry.downloads.remove(&self.session.id);
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    uploads: DashMap<UploadId, Arc<UploadSession>>,
    downloads: DashMap<u64, Arc<DownloadSession>>,
    next_download_id: AtomicU64,
    /// Parent of every upload session's token; cancelled at shutdown.
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn upload(&self, upload_id: &UploadId) -> Option<Arc<UploadSession>> {
        self.uploads.get(upload_id).map(|s| s.clone())
    }

    /// Register an upload session, or return the one already registered.
    ///
    /// `stale_refs` marks a session rebuilt from a manifest, whose references
    /// past the cursor have to be discarded before the next chunk.
    pub fn insert_upload(
        &self,
        upload_id: UploadId,
        phase: UploadPhase,
        cursor: u64,
        stale_refs: bool,
    ) -> Arc<UploadSession> {
        self.uploads
            .entry(upload_id)
            .or_insert_with(|| {
                Arc::new(UploadSession::new(
                    upload_id,
                    phase,
                    cursor,
                    stale_refs,
                    self.shutdown.child_token(),
                ))
            })
            .clone()
    }

    /// A session that is never registered, for requests against a sealed
    /// upload. It still observes shutdown.
    pub fn detached_upload(
        &self,
        upload_id: UploadId,
        phase: UploadPhase,
        cursor: u64,
    ) -> Arc<UploadSession> {
        Arc::new(UploadSession::new(
            upload_id,
            phase,
            cursor,
            false,
            self.shutdown.child_token(),
        ))
    }

    pub fn remove_upload(&self, upload_id: &UploadId) -> Option<Arc<UploadSession>> {
        self.uploads.remove(upload_id).map(|(_, s)| s)
    }

    /// Track a download until the returned guard is dropped.
    pub fn begin_download(
        self: &Arc<Self>,
        share_code: ShareCode,
        upload_id: UploadId,
        first_index: u64,
    ) -> DownloadGuard {
        let id = self.next_download_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(DownloadSession {
            id,
            share_code,
            upload_id,
            cursor: AtomicU64::new(first_index),
            last_activity: AtomicI64::new(now_unix()),
        });
        self.downloads.insert(id, session.clone());
        DownloadGuard {
            registry: self.clone(),
            session,
        }
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.len()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.len()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let uploads = self.uploads.iter().map(|s| SessionInfo {
            kind: SessionKind::Upload,
            target: s.upload_id.to_string(),
            cursor: s.cursor.load(Ordering::Relaxed),
            last_activity: s.last_activity(),
        });
        let downloads = self.downloads.iter().map(|s| SessionInfo {
            kind: SessionKind::Download,
            target: s.share_code.to_string(),
            cursor: s.cursor(),
            last_activity: from_unix(s.last_activity.load(Ordering::Relaxed)),
        });
        uploads.chain(downloads).collect()
    }

    /// Forget idle upload sessions nobody is using. They are rebuilt from
    /// their manifests on the next request.
    pub fn drop_idle(&self, cutoff: OffsetDateTime) -> usize {
        let before = self.uploads.len();
        self.uploads
            .retain(|_, s| s.last_activity() >= cutoff || Arc::strong_count(s) > 1);
        before.saturating_sub(self.uploads.len())
    }

    /// Cancel every upload session. Used at shutdown.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }
}

fn phase_to_u8(phase: UploadPhase) -> u8 {
    match phase {
        UploadPhase::Init => 0,
        UploadPhase::Receiving => 1,
        UploadPhase::Sealing => 2,
        UploadPhase::Done => 3,
    }
}

fn phase_from_u8(value: u8) -> UploadPhase {
    match value {
        0 => UploadPhase::Init,
        1 => UploadPhase::Receiving,
        2 => UploadPhase::Sealing,
        _ => UploadPhase::Done,
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn from_unix(ts: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
