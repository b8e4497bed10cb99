//! Share code allocation.
//!
//! Live codes are held in memory and every assignment or release is appended
//! to a JSON-lines log, which is replayed (and compacted) on startup. All
//! allocation happens under one lock, so two uploads can never be handed the
//! same live code.

use ferry_core::share_code::MAX_CODE_LENGTH;
use ferry_core::{CodePolicy, Error, Result, ShareCode, UploadId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::instrument;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum LogRecord {
    Assign {
        code: ShareCode,
        upload_id: UploadId,
        #[serde(with = "time::serde::rfc3339")]
        expires_at: OffsetDateTime,
    },
    Release {
        code: ShareCode,
    },
}

/// What a live code points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeEntry {
    pub upload_id: UploadId,
    pub expires_at: OffsetDateTime,
}

impl CodeEntry {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at < now
    }
}

struct Inner {
    active: HashMap<ShareCode, CodeEntry>,
    length: usize,
    log: File,
}

pub struct ShareCodeRegistry {
    policy: CodePolicy,
    log_path: PathBuf,
    inner: Mutex<Inner>,
}

impl ShareCodeRegistry {
    /// Replay the log at `log_path`, compact it, and open it for appending.
    #[instrument(skip(policy, log_path), fields(log_path = %log_path.as_ref().display()))]
    pub async fn open(policy: CodePolicy, log_path: impl AsRef<Path>) -> Result<Self> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let active = replay(&log_path).await?;
        compact(&log_path, &active).await?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;

        let length = policy.initial_length();
        tracing::info!(active = active.len(), code_length = length, "Share code log replayed");
        Ok(Self {
            policy,
            log_path,
            inner: Mutex::new(Inner {
                active,
                length,
                log,
            }),
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Allocate a fresh code for `upload_id`, valid until `expires_at`.
    ///
    /// A code whose previous holder has expired may be handed out again.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn assign(
        &self,
        upload_id: UploadId,
        expires_at: OffsetDateTime,
    ) -> Result<ShareCode> {
        let mut inner = self.inner.lock().await;
        let now = OffsetDateTime::now_utc();
        let code = {
            let mut rng = rand::rng();
            self.pick_code(&mut inner, &mut rng, now)?
        };

        append(
            &mut inner.log,
            &LogRecord::Assign {
                code: code.clone(),
                upload_id,
                expires_at,
            },
        )
        .await?;
        inner.active.insert(
            code.clone(),
            CodeEntry {
                upload_id,
                expires_at,
            },
        );
        Ok(code)
    }

    /// Draw codes until one is free, growing the length after too many
    /// collisions.
    fn pick_code<R: Rng + ?Sized>(
        &self,
        inner: &mut Inner,
        rng: &mut R,
        now: OffsetDateTime,
    ) -> Result<ShareCode> {
        let mut collisions = 0u32;
        loop {
            let candidate = ShareCode::random(rng, inner.length);
            match inner.active.get(&candidate) {
                Some(entry) if !entry.is_expired_at(now) => {
                    collisions += 1;
                    tracing::debug!(length = inner.length, collisions, "Share code collision");
                    if collisions >= self.policy.max_collisions {
                        if inner.length >= MAX_CODE_LENGTH {
                            return Err(Error::Internal(
                                "share code space exhausted".to_string(),
                            ));
                        }
                        inner.length += 1;
                        collisions = 0;
                        tracing::warn!(
                            length = inner.length,
                            "Share code length grown after repeated collisions"
                        );
                    }
                }
                _ => return Ok(candidate),
            }
        }
    }

    /// Look up a code, expired or not.
    pub async fn lookup(&self, code: &ShareCode) -> Option<CodeEntry> {
        self.inner.lock().await.active.get(code).copied()
    }

    /// Release `code` only while it still points at `upload_id`.
    pub async fn release_for(&self, code: &ShareCode, upload_id: &UploadId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let held = inner
            .active
            .get(code)
            .is_some_and(|entry| entry.upload_id == *upload_id);
        if !held {
            return Ok(false);
        }
        release_locked(&mut inner, code).await
    }

    /// Release every code whose window ended before `now`.
    #[instrument(skip(self))]
    pub async fn release_expired(&self, now: OffsetDateTime) -> Result<Vec<(ShareCode, CodeEntry)>> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<(ShareCode, CodeEntry)> = inner
            .active
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(code, entry)| (code.clone(), *entry))
            .collect();
        for (code, _) in &expired {
            release_locked(&mut inner, code).await?;
        }
        Ok(expired)
    }

    /// Snapshot of every live code.
    pub async fn entries(&self) -> Vec<(ShareCode, CodeEntry)> {
        self.inner
            .lock()
            .await
            .active
            .iter()
            .map(|(code, entry)| (code.clone(), *entry))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.active.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Length new codes are currently drawn at.
    pub async fn code_length(&self) -> usize {
        self.inner.lock().await.length
    }

    /// Flush the log to disk.
    pub async fn sync(&self) -> Result<()> {
        self.inner.lock().await.log.sync_all().await?;
        Ok(())
    }
}

async fn release_locked(inner: &mut Inner, code: &ShareCode) -> Result<bool> {
    if inner.active.remove(code).is_none() {
        return Ok(false);
    }
    append(&mut inner.log, &LogRecord::Release { code: code.clone() }).await?;
    Ok(true)
}

async fn append(log: &mut File, record: &LogRecord) -> Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    log.write_all(&line).await?;
    log.sync_data().await?;
    Ok(())
}

async fn replay(path: &Path) -> Result<HashMap<ShareCode, CodeEntry>> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut active = HashMap::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(line) {
            Ok(LogRecord::Assign {
                code,
                upload_id,
                expires_at,
            }) => {
                active.insert(
                    code,
                    CodeEntry {
                        upload_id,
                        expires_at,
                    },
                );
            }
            Ok(LogRecord::Release { code }) => {
                active.remove(&code);
            }
            // A crash mid-append leaves a torn final line.
            Err(e) => tracing::warn!(line = lineno + 1, error = %e, "Skipping unreadable share code log line"),
        }
    }
    Ok(active)
}

/// Rewrite the log with only the live assignments.
async fn compact(path: &Path, active: &HashMap<ShareCode, CodeEntry>) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut body = Vec::new();
    for (code, entry) in active {
        serde_json::to_writer(
            &mut body,
            &LogRecord::Assign {
                code: code.clone(),
                upload_id: entry.upload_id,
                expires_at: entry.expires_at,
            },
        )?;
        body.push(b'\n');
    }

    let mut file = File::create(&tmp_path).await?;
    file.write_all(&body).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp_path, path).await?;
    Ok(())
}
