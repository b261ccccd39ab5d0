//! Submission Orchestrator
//!
//! Drives one submission through validation, encryption and upload, keeping
//! the ledger in step:
//! 1. `received` → `validating` → `valid` (or `invalid`) → `encrypting`
//! 2. Files run in parallel tasks, each encrypting then uploading
//! 3. `encrypted` → `uploading` once every container is complete
//! 4. `uploaded` once every object is committed and verified
//!
//! A re-run picks up from the ledger head and the per-file sidecars.

mod types;
mod worker;

pub use types::*;
pub use worker::object_key;

use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};

use crate::cancel::CancelFlag;
use crate::config::PipelineConfig;
use crate::crypt::Encryptor;
use crate::ledger::{Author, Ledger, LedgerError, StateRecord, SubmissionState};
use crate::progress::ProgressStore;
use crate::upload::ChunkedUploader;
use worker::FileWorker;

/// Ledger states a run walks through, in order
const LIFECYCLE: [SubmissionState; 7] = [
    SubmissionState::Received,
    SubmissionState::Validating,
    SubmissionState::Valid,
    SubmissionState::Encrypting,
    SubmissionState::Encrypted,
    SubmissionState::Uploading,
    SubmissionState::Uploaded,
];

pub struct Orchestrator {
    ledger: Ledger,
    author: Arc<Author>,
    worker: FileWorker,
    max_parallel_files: usize,
    cancel: CancelFlag,
}

impl Orchestrator {
    pub fn new(
        ledger: Ledger,
        author: Arc<Author>,
        encryptor: Encryptor,
        uploader: ChunkedUploader,
        progress: ProgressStore,
        config: &PipelineConfig,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            ledger,
            author,
            worker: FileWorker {
                encryptor,
                uploader,
                progress,
                output_dir: config.output_dir.clone(),
            },
            max_parallel_files: config.max_parallel_files.max(1),
            cancel,
        }
    }

    /// Run a submission as far as it can go
    ///
    /// Per-file failures are reported in the returned report, not as an
    /// error. Errors mean the ledger could not be read or advanced.
    pub async fn run(&self, descriptor: &SubmissionDescriptor) -> Result<SubmissionReport, OrchestratorError> {
        descriptor.validate()?;
        let submission_id = descriptor.submission_id.as_str();

        let head = match self.ledger.head(submission_id).await {
            Ok(head) => head.state,
            Err(LedgerError::SubmissionNotFound(_)) => {
                self.ledger.register_submission(submission_id, &self.author).await?.state
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            submission_id,
            state = %head,
            files = descriptor.files.len(),
            "Starting submission run"
        );

        match head {
            SubmissionState::Uploaded | SubmissionState::Reported | SubmissionState::Archived => {
                return Ok(SubmissionReport {
                    submission_id: submission_id.to_string(),
                    state: head,
                    files: descriptor
                        .files
                        .iter()
                        .map(|f| {
                            FileOutcome::new(
                                &f.file_id,
                                &object_key(submission_id, &f.file_id),
                                FileStatus::AlreadyUploaded,
                            )
                        })
                        .collect(),
                });
            }
            SubmissionState::Invalid | SubmissionState::Error => {
                return Err(OrchestratorError::NotRunnable {
                    submission_id: submission_id.to_string(),
                    state: head,
                });
            }
            _ => {}
        }

        if matches!(head, SubmissionState::Received | SubmissionState::Validating) {
            let validating = self.advance_to(submission_id, SubmissionState::Validating).await?;
            let invalid = validate_files(descriptor).await;
            if !invalid.is_empty() {
                let data = json!({ "invalid_files": invalid.iter().map(|f| &f.file_id).collect::<Vec<_>>() });
                let record = self
                    .ledger
                    .append(
                        submission_id,
                        validating.sequence,
                        SubmissionState::Invalid,
                        Some(data),
                        &self.author,
                    )
                    .await?;
                tracing::error!(submission_id, invalid = invalid.len(), "Submission failed validation");
                return Ok(SubmissionReport {
                    submission_id: submission_id.to_string(),
                    state: record.state,
                    files: invalid,
                });
            }
            self.advance_to(submission_id, SubmissionState::Valid).await?;
        }
        self.advance_to(submission_id, SubmissionState::Encrypting).await?;

        let files = self.process_files(descriptor).await?;
        let state = self.settle(submission_id, &files).await?;

        tracing::info!(
            submission_id,
            state = %state,
            uploaded = files.iter().filter(|f| f.is_success()).count(),
            failed = files.iter().filter(|f| !f.is_success()).count(),
            "Submission run finished"
        );

        Ok(SubmissionReport {
            submission_id: submission_id.to_string(),
            state,
            files,
        })
    }

    /// Run all files, advancing to `uploading` once every container exists
    async fn process_files(&self, descriptor: &SubmissionDescriptor) -> Result<Vec<FileOutcome>, OrchestratorError> {
        let submission_id = descriptor.submission_id.clone();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel_files));
        let (encrypted_tx, mut encrypted_rx) = mpsc::unbounded_channel::<String>();

        let handles: Vec<_> = descriptor
            .files
            .iter()
            .cloned()
            .map(|file| {
                let worker = self.worker.clone();
                let semaphore = semaphore.clone();
                let encrypted_tx = encrypted_tx.clone();
                let submission_id = submission_id.clone();
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    let object_key = object_key(&submission_id, &file.file_id);
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return FileOutcome::failed(&file.file_id, &object_key, false, "worker pool closed");
                    };
                    if cancel.is_cancelled() {
                        return FileOutcome::failed(&file.file_id, &object_key, false, "cancelled");
                    }
                    worker.process(&submission_id, &file, &encrypted_tx).await
                })
            })
            .collect();
        drop(encrypted_tx);

        let total = descriptor.files.len();
        let ledger_phase = async {
            let mut done = 0;
            while done < total {
                if encrypted_rx.recv().await.is_none() {
                    return Ok(());
                }
                done += 1;
            }
            tracing::info!(submission_id = %submission_id, "All containers encrypted");
            self.advance_to(&submission_id, SubmissionState::Uploading)
                .await
                .map(|_| ())
        };

        let (results, phase) = tokio::join!(join_all(handles), ledger_phase);
        phase?;

        let outcomes = results
            .into_iter()
            .zip(&descriptor.files)
            .map(|(result, file)| match result {
                Ok(outcome) => outcome,
                Err(e) => FileOutcome::failed(
                    &file.file_id,
                    &object_key(&submission_id, &file.file_id),
                    false,
                    format!("file task failed: {}", e),
                ),
            })
            .collect();

        Ok(outcomes)
    }

    /// Record the run's result in the ledger and return the head state
    async fn settle(&self, submission_id: &str, files: &[FileOutcome]) -> Result<SubmissionState, OrchestratorError> {
        if files.iter().all(FileOutcome::is_success) {
            let head = self.advance_to(submission_id, SubmissionState::Uploaded).await?;
            return Ok(head.state);
        }

        let head = self.ledger.head(submission_id).await?;
        let fatal: Vec<&FileOutcome> = files.iter().filter(|f| f.is_fatal()).collect();
        if fatal.is_empty() {
            tracing::warn!(submission_id, state = %head.state, "Run incomplete, submission left resumable");
            return Ok(head.state);
        }

        let data = json!({
            "failed_files": fatal.iter().map(|f| &f.file_id).collect::<Vec<_>>(),
            "errors": fatal
                .iter()
                .map(|f| (f.file_id.clone(), f.error.clone().unwrap_or_default()))
                .collect::<std::collections::BTreeMap<_, _>>(),
        });
        let record = self
            .ledger
            .append(submission_id, head.sequence, SubmissionState::Error, Some(data), &self.author)
            .await?;
        tracing::error!(submission_id, failed = fatal.len(), "Submission moved to error");
        Ok(record.state)
    }

    /// Append lifecycle states until the head reaches `target`, returning the head record
    async fn advance_to(&self, submission_id: &str, target: SubmissionState) -> Result<StateRecord, OrchestratorError> {
        let mut head = self.ledger.head(submission_id).await?;
        loop {
            if head.state == target {
                return Ok(head);
            }
            let position = LIFECYCLE.iter().position(|s| *s == head.state);
            let target_position = LIFECYCLE.iter().position(|s| *s == target);
            let next = match (position, target_position) {
                (Some(p), Some(t)) if p < t => LIFECYCLE[p + 1],
                (Some(_), Some(_)) => return Ok(head),
                _ => {
                    return Err(OrchestratorError::NotRunnable {
                        submission_id: submission_id.to_string(),
                        state: head.state,
                    })
                }
            };
            head = self
                .ledger
                .append(submission_id, head.sequence, next, None, &self.author)
                .await?;
        }
    }
}

/// Check every file exists with its declared size
async fn validate_files(descriptor: &SubmissionDescriptor) -> Vec<FileOutcome> {
    let mut invalid = Vec::new();
    for file in &descriptor.files {
        let object_key = object_key(&descriptor.submission_id, &file.file_id);
        let problem = match tokio::fs::metadata(&file.path).await {
            Ok(meta) if !meta.is_file() => Some(format!("{} is not a regular file", file.path.display())),
            Ok(meta) if meta.len() != file.size => Some(format!(
                "declared {} bytes, found {}",
                file.size,
                meta.len()
            )),
            Ok(_) => None,
            Err(e) => Some(format!("{}: {}", file.path.display(), e)),
        };
        if let Some(problem) = problem {
            tracing::warn!(file_id = %file.file_id, problem = %problem, "File failed validation");
            invalid.push(FileOutcome {
                error: Some(problem),
                ..FileOutcome::new(&file.file_id, &object_key, FileStatus::Invalid)
            });
        }
    }
    invalid
}
