//! Single-flight download state machine.
//!
//! `idle -> downloading(0..=100) -> committed | aborted`. The machine itself
//! never sleeps: the core asks the shell for one step at a time through the
//! `TileFetch` capability, and the shell answers it with a [`DownloadPipeline`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::model::{LatLon, MapSnapshot, SnapshotId, Zoom};
use crate::{DOWNLOAD_STEPS, DOWNLOAD_STEP_PERCENT};

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadError {
    #[error("an internet connection is required to download maps")]
    ConnectivityRequired,

    #[error("another download is already in progress")]
    AlreadyInProgress,

    #[error("no download is in progress")]
    NotInProgress,

    #[error("connection lost at {progress}%")]
    ConnectivityLost { progress: u8 },

    #[error("download timed out after {elapsed_ms}ms at {progress}%")]
    Timeout { elapsed_ms: u64, progress: u8 },

    #[error("download failed at {progress}%: {message}")]
    Pipeline { message: String, progress: u8 },

    #[error("download cancelled at {progress}%")]
    Cancelled { progress: u8 },

    #[error("download abandoned at {progress}% when the catalog was reloaded")]
    Superseded { progress: u8 },

    #[error("invalid download request: {0}")]
    Invalid(String),
}

impl DownloadError {
    /// Rejections happen before any state change; everything else aborts
    /// an in-flight download.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::ConnectivityRequired | Self::AlreadyInProgress | Self::NotInProgress | Self::Invalid(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{0}")]
pub struct PipelineError(pub String);

/// What the shell needs to fetch one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadPlan {
    pub snapshot_id: SnapshotId,
    pub center: LatLon,
    pub zoom: Zoom,
    pub total_steps: u8,
}

/// One unit of tile work handed to the shell. `step` counts from 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRequest {
    pub plan: DownloadPlan,
    pub step: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadStep {
    Continue(StepRequest),
    Committed(MapSnapshot),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ActiveDownload {
    pub(crate) snapshot: MapSnapshot,
    pub(crate) steps_done: u8,
    pub(crate) started_at_ms: u64,
}

impl ActiveDownload {
    pub(crate) fn new(snapshot: MapSnapshot, started_at_ms: u64) -> Self {
        Self {
            snapshot,
            steps_done: 0,
            started_at_ms,
        }
    }

    pub(crate) fn elapsed_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.started_at_ms)
    }

    pub(crate) fn next_step(&self) -> StepRequest {
        StepRequest {
            plan: self.plan(),
            step: (self.steps_done + 1).min(DOWNLOAD_STEPS),
        }
    }

    pub(crate) fn progress(&self) -> u8 {
        self.steps_done.saturating_mul(DOWNLOAD_STEP_PERCENT).min(100)
    }

    /// Returns `true` once the final step has been taken.
    pub(crate) fn advance(&mut self) -> bool {
        self.steps_done = (self.steps_done + 1).min(DOWNLOAD_STEPS);
        self.steps_done == DOWNLOAD_STEPS
    }

    pub(crate) fn plan(&self) -> DownloadPlan {
        DownloadPlan {
            snapshot_id: self.snapshot.id,
            center: self.snapshot.center,
            zoom: self.snapshot.zoom,
            total_steps: DOWNLOAD_STEPS,
        }
    }
}

/// Shell-side source of the per-step tile work.
#[async_trait]
pub trait DownloadPipeline: Send + Sync {
    async fn fetch_step(&self, plan: &DownloadPlan, step: u8) -> Result<(), PipelineError>;
}

/// Stand-in for tile fetching: waits a fixed delay per step.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedPipeline {
    step_delay: Duration,
}

impl SimulatedPipeline {
    pub const fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }

    pub const fn step_delay(&self) -> Duration {
        self.step_delay
    }
}

impl Default for SimulatedPipeline {
    fn default() -> Self {
        Self::new(Duration::from_millis(crate::DEFAULT_STEP_DELAY_MS))
    }
}

#[async_trait]
impl DownloadPipeline for SimulatedPipeline {
    async fn fetch_step(&self, _plan: &DownloadPlan, _step: u8) -> Result<(), PipelineError> {
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }
        Ok(())
    }
}
