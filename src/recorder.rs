use crate::agent::AgentError;
use crate::types::{Goal, RunResult, StepRecord};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;

/// Sink for the run's audit trail.
#[async_trait]
pub trait RunRecorder: Send + Sync {
    async fn run_started(&self, run_id: &str, goal: &Goal) -> Result<(), AgentError>;
    async fn step_recorded(&self, run_id: &str, step: &StepRecord, screenshot: Option<&[u8]>) -> Result<(), AgentError>;
    async fn run_finished(&self, run_id: &str, result: &RunResult) -> Result<(), AgentError>;
}

pub struct NullRecorder;

#[async_trait]
impl RunRecorder for NullRecorder {
    async fn run_started(&self, _run_id: &str, _goal: &Goal) -> Result<(), AgentError> {
        Ok(())
    }

    async fn step_recorded(&self, _run_id: &str, _step: &StepRecord, _screenshot: Option<&[u8]>) -> Result<(), AgentError> {
        Ok(())
    }

    async fn run_finished(&self, _run_id: &str, _result: &RunResult) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Writes `goal.json`, `step_NNN.json`, `step_NNN.png` and `run.json` under `<base>/<run_id>/`.
pub struct DiskRecorder {
    base_dir: PathBuf,
}

impl DiskRecorder {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }

    async fn run_dir(&self, run_id: &str) -> Result<PathBuf, AgentError> {
        let dir = self.base_dir.join(run_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentError::Recorder(format!("create_dir: {}", e)))?;
        Ok(dir)
    }

    async fn write_json<T: Serialize>(path: PathBuf, value: &T) -> Result<(), AgentError> {
        let body = serde_json::to_vec_pretty(value).map_err(|e| AgentError::Recorder(format!("encode: {}", e)))?;
        async_fs::write(&path, body)
            .await
            .map_err(|e| AgentError::Recorder(format!("write {}: {}", path.display(), e)))
    }
}

#[async_trait]
impl RunRecorder for DiskRecorder {
    async fn run_started(&self, run_id: &str, goal: &Goal) -> Result<(), AgentError> {
        let dir = self.run_dir(run_id).await?;
        Self::write_json(dir.join("goal.json"), goal).await
    }

    async fn step_recorded(&self, run_id: &str, step: &StepRecord, screenshot: Option<&[u8]>) -> Result<(), AgentError> {
        let dir = self.run_dir(run_id).await?;
        Self::write_json(dir.join(format!("step_{:03}.json", step.order)), step).await?;
        if let Some(png) = screenshot {
            let path = dir.join(format!("step_{:03}.png", step.order));
            async_fs::write(&path, png)
                .await
                .map_err(|e| AgentError::Recorder(format!("write: {}", e)))?;
        }
        Ok(())
    }

    async fn run_finished(&self, run_id: &str, result: &RunResult) -> Result<(), AgentError> {
        let dir = self.run_dir(run_id).await?;
        Self::write_json(dir.join("run.json"), result).await
    }
}
