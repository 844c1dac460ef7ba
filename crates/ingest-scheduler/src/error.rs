use std::path::PathBuf;

use corpus_types::interruption::Interrupted;
use corpus_types::modules::{ModuleError, ModuleKind};
use corpus_types::BaseId;

use crate::{DocumentId, ModuleUid};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Knowledge base `{0}` not found.")]
    KnowledgeBaseNotFound(BaseId),
    #[error("Knowledge base `{0}` cannot be removed because it still contains resources.")]
    KnowledgeBaseNotEmpty(BaseId),
    #[error("Resource `{external_id}` not found in knowledge base `{base}`.")]
    ResourceNotFound { base: BaseId, external_id: String },
    #[error("Module `{0}` is not registered.")]
    ModuleNotFound(String),
    #[error("No module is bound to the internal id `{0}`.")]
    UnknownModuleUid(ModuleUid),
    #[error("Module `{id}` is bound as a {expected} module but was used as a {found} module.")]
    ModuleKindMismatch { id: String, expected: ModuleKind, found: ModuleKind },
    #[error("Document `{0}` not found.")]
    DocumentNotFound(DocumentId),
    #[error("Preprocessing result [{index}] is flagged `from_cache` but there is no latest cache.")]
    MissingLatestCache { index: usize },
    #[error("Preprocessing result [{index}] must use a relative path, got `{}`.", .path.display())]
    AbsoluteDocumentPath { index: usize, path: PathBuf },
    #[error("The worker pool was stopped.")]
    WakerStopped,
    #[error("An unexpected crash occurred when processing the task: {0}")]
    WorkerPanicked(String),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    WorkspaceStore(#[from] workspace_store::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    // Irrecoverable errors: the persisted rows and the in-memory queues no
    // longer agree.
    #[error("Corrupted task queue.")]
    CorruptedTaskQueue,
}

impl Error {
    /// True when the error is a propagated cancellation rather than a
    /// failure.
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            Error::Interrupted(_) | Error::Module(ModuleError::Interrupted(_))
        )
    }
}
