use anyhow::Result;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::LanguageConfig;
use crate::record::ExecutionRecord;

use super::{ExecutionOutcome, ProgressUpdate};

/// Trait for the sandbox execution implementations.
///
/// An implementation creates one single-use execution environment per `run`
/// call, applies the record's constraints, executes the program and
/// normalizes the raw exit status. The environment is destroyed before `run`
/// returns, whatever the outcome.
pub trait SandboxRunner: Send + Sync {
    /// Creates a new runner instance for the worker with the given ID
    fn build(id: u8) -> Result<Self>
    where
        Self: Sized;

    /// Runs a record to completion in a fresh environment.
    ///
    /// For grading records every test case in `record.grading` is executed
    /// and a completion report is sent on `progress_tx` after each one.
    /// An `Err` return means the environment itself failed; the caller maps
    /// it to a terminal infrastructure-error result.
    fn run(
        &self,
        record: &ExecutionRecord,
        language: &LanguageConfig,
        progress_tx: Option<UnboundedSender<ProgressUpdate>>,
    ) -> Result<ExecutionOutcome>;
}
