//! Garbage collection run records.
//!
//! At most one run may be `running` at a time; the unique partial index on
//! `gc_runs` enforces that, which makes starting a run the collector's
//! advisory lock.

use crate::error::MetadataResult;
use crate::models::GcRunRow;
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait GcRepo: Send + Sync {
    /// Record a new running GC run.
    ///
    /// Fails with [`MetadataError::Constraint`](crate::MetadataError::Constraint)
    /// while another run is still `running`.
    async fn begin_gc_run(&self, run_id: Uuid, dry_run: bool) -> MetadataResult<()>;

    /// Mark a run finished or failed.
    async fn finish_gc_run(
        &self,
        run_id: Uuid,
        state: GcRunState,
        stats_json: Option<&str>,
        error: Option<&str>,
    ) -> MetadataResult<()>;

    async fn get_gc_run(&self, run_id: Uuid) -> MetadataResult<Option<GcRunRow>>;

    /// Most recent runs, newest first.
    async fn recent_gc_runs(&self, limit: u32) -> MetadataResult<Vec<GcRunRow>>;

    /// Fail runs left `running` by a previous process. Returns how many.
    async fn fail_orphaned_gc_runs(&self) -> MetadataResult<u64>;
}

/// GC run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcRunState {
    Running,
    Finished,
    Failed,
}

impl GcRunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}
