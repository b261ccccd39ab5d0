//! Application state management

use std::sync::Arc;

use crate::cancel::CancelFlag;
use crate::config::Config;
use crate::crypt::{Encryptor, RecipientPublicKey};
use crate::error::Result;
use crate::ledger::{Author, Ledger};
use crate::orchestrator::Orchestrator;
use crate::progress::ProgressStore;
use crate::storage::{MultipartStore, S3MultipartStore};
use crate::upload::{ChunkedUploader, UploadOptions};

/// Everything a pipeline run needs, opened from configuration
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    ledger: Ledger,
    store: Arc<dyn MultipartStore>,
    progress: ProgressStore,
    recipient: RecipientPublicKey,
    author: Arc<Author>,
    cancel: CancelFlag,
}

impl AppState {
    /// Open the ledger, object store and progress directory
    pub async fn new(config: Config, cancel: CancelFlag) -> Result<Self> {
        let store = S3MultipartStore::new(&config.storage).await?;
        Self::with_store(config, Arc::new(store), cancel).await
    }

    /// Like `new`, with a caller-supplied object store
    pub async fn with_store(config: Config, store: Arc<dyn MultipartStore>, cancel: CancelFlag) -> Result<Self> {
        let ledger = Ledger::open(&config.database.url).await?;
        tracing::info!("Ledger opened at {}", config.database.url);

        let progress = ProgressStore::open(&config.pipeline.state_dir)?;
        let recipient = RecipientPublicKey::load(&config.pipeline.recipient_public_key)?;
        let author = Author::load(&config.author.name, &config.author.private_key_path)?;
        if config.author.register_key {
            ledger
                .register_author_key(author.name(), &author.verifying_key(), Some("registered at startup"))
                .await?;
        }

        tracing::info!(
            recipient = %recipient.fingerprint(),
            author = author.name(),
            state_dir = %config.pipeline.state_dir.display(),
            "Pipeline state ready"
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                ledger,
                store,
                progress,
                recipient,
                author: Arc::new(author),
                cancel,
            }),
        })
    }

    /// Get the ledger
    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    /// Build an orchestrator over this state
    pub fn orchestrator(&self) -> Orchestrator {
        let inner = &self.inner;
        let encryptor = Encryptor::new(inner.progress.clone(), inner.recipient, inner.cancel.clone());
        let uploader = ChunkedUploader::new(
            inner.store.clone(),
            inner.progress.clone(),
            UploadOptions::from(&inner.config.upload),
            inner.cancel.clone(),
        );

        Orchestrator::new(
            inner.ledger.clone(),
            inner.author.clone(),
            encryptor,
            uploader,
            inner.progress.clone(),
            &inner.config.pipeline,
            inner.cancel.clone(),
        )
    }
}
