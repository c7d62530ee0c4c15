//! State of the one pipeline run the service allows at a time, shared between
//! the background task and the HTTP handlers.

use crate::models::{BookMetadata, Chapter, RunState};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RunError {
    #[error("A run is already in progress")]
    Busy,
    #[error("No run is in progress")]
    NotActive,
    #[error("The run is not waiting for chapter review")]
    NotReviewing,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStatus {
    pub run_id: Option<Uuid>,
    pub state: RunState,
    pub progress: String,
    pub error: Option<String>,
    pub file_name: Option<String>,
    pub metadata: Option<BookMetadata>,
    pub chapters: Vec<Chapter>,
    pub artifacts: Vec<String>,
    pub log: Vec<String>,
}

#[derive(Default)]
pub struct RunContext {
    status: Mutex<RunStatus>,
    cancelled: AtomicBool,
    review: Mutex<Option<oneshot::Sender<Vec<Chapter>>>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn status(&self) -> MutexGuard<'_, RunStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn review_slot(&self) -> MutexGuard<'_, Option<oneshot::Sender<Vec<Chapter>>>> {
        self.review.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the context for a new run, wiping everything the last one left.
    pub fn begin(&self, file_name: &str, metadata: BookMetadata) -> Result<Uuid, RunError> {
        let mut status = self.status();
        if status.state.is_active() {
            return Err(RunError::Busy);
        }
        let run_id = Uuid::new_v4();
        *status = RunStatus {
            run_id: Some(run_id),
            state: RunState::LoadingPdf,
            progress: "Starting...".to_string(),
            file_name: Some(file_name.to_string()),
            metadata: Some(metadata),
            ..RunStatus::default()
        };
        self.cancelled.store(false, Ordering::SeqCst);
        self.review_slot().take();
        Ok(run_id)
    }

    pub fn snapshot(&self) -> RunStatus {
        self.status().clone()
    }

    pub fn state(&self) -> RunState {
        self.status().state
    }

    pub fn set_state(&self, state: RunState, progress: impl Into<String>) {
        let mut status = self.status();
        status.state = state;
        status.progress = progress.into();
    }

    pub fn set_progress(&self, progress: impl Into<String>) {
        self.status().progress = progress.into();
    }

    pub fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        let mut status = self.status();
        let run_id = status.run_id.map(|id| id.to_string()).unwrap_or_default();
        info!(run_id = %run_id, "{message}");
        let timestamp = chrono::Local::now().format("%H:%M:%S");
        status.log.push(format!("[{timestamp}] {message}"));
    }

    pub fn set_chapters(&self, chapters: &[Chapter]) {
        self.status().chapters = chapters.to_vec();
    }

    pub fn record_artifact(&self, filename: &str) {
        self.status().artifacts.push(filename.to_string());
    }

    pub fn finish(&self, progress: impl Into<String>) {
        self.set_state(RunState::Done, progress);
    }

    pub fn fail(&self, message: &str) {
        self.log(format!("ERROR: {message}"));
        let mut status = self.status();
        status.state = RunState::Error;
        status.error = Some(message.to_string());
        drop(status);
        self.review_slot().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Ask the active run to stop at its next chapter boundary. A pending
    /// review is abandoned right away.
    pub fn cancel(&self) -> Result<(), RunError> {
        if !self.state().is_active() {
            return Err(RunError::NotActive);
        }
        self.cancelled.store(true, Ordering::SeqCst);
        self.review_slot().take();
        self.log("Cancellation requested.");
        Ok(())
    }

    /// Back to `idle`, as if the service had just started.
    pub fn reset(&self) -> Result<(), RunError> {
        let mut status = self.status();
        if status.state.is_active() {
            return Err(RunError::Busy);
        }
        *status = RunStatus::default();
        Ok(())
    }

    /// Park the run in `reviewing_chapters` until someone submits a list.
    /// After a cancel the receiver resolves to an error straight away.
    pub fn await_review(&self) -> oneshot::Receiver<Vec<Chapter>> {
        let (tx, rx) = oneshot::channel();
        {
            // `cancel` sets the flag before emptying the slot, so checking
            // under the slot lock cannot miss it.
            let mut slot = self.review_slot();
            if !self.is_cancelled() {
                *slot = Some(tx);
            }
        }
        self.set_state(
            RunState::ReviewingChapters,
            "Waiting for the chapter list to be reviewed...",
        );
        rx
    }

    pub fn submit_review(&self, chapters: Vec<Chapter>) -> Result<(), RunError> {
        let sender = self.review_slot().take().ok_or(RunError::NotReviewing)?;
        sender.send(chapters).map_err(|_| RunError::NotReviewing)
    }
}
