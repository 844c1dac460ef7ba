use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;
use crate::interruption::{Interrupted, Interruption};
use crate::resources::{KnowledgeBase, ResourceEvent};
use crate::BaseId;

pub type ModuleResult<T> = Result<T, ModuleError>;

/// Errors surfaced by plugin modules.
///
/// Cancellation stays typed so the engine can tell an aborted task apart
/// from a failed one; everything else travels as an `anyhow` error.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The three module roles form a closed sum; the discriminator is
/// persisted next to the stable string id so a module cannot silently
/// change roles between restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModuleKind {
    Resource,
    Preprocessing,
    Index,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Resource => f.write_str("resource"),
            ModuleKind::Preprocessing => f.write_str("preprocessing"),
            ModuleKind::Index => f.write_str("index"),
        }
    }
}

pub trait Module: Send + Sync {
    /// Stable identifier of the module, persisted across restarts.
    fn id(&self) -> &str;
}

/// Enumerates the resources of a base and declares which preprocessing and
/// index modules apply to them.
pub trait ResourceModule: Module {
    /// Start a fresh scan pass over the base.
    ///
    /// The returned sequence is finite and single-pass; it is not
    /// restartable, each call to `scan` begins a new pass.
    fn scan<'a>(
        &'a self,
        base: &KnowledgeBase,
    ) -> ModuleResult<Box<dyn Iterator<Item = ModuleResult<ResourceEvent>> + Send + 'a>>;

    /// Durably mark the event as consumed by the engine.
    fn complete_event(&self, event: &ResourceEvent) -> ModuleResult<()>;

    /// Durably mark the whole scan pass as consumed.
    fn complete_scanning(&self, base: &KnowledgeBase) -> ModuleResult<()>;

    /// Stable ids of the preprocessing modules applying to this content type.
    fn preprocess_module_ids(&self, base: &KnowledgeBase, content_type: &str) -> Vec<String>;

    /// Stable ids of the index modules applying to this base.
    fn index_module_ids(&self, base: &KnowledgeBase) -> Vec<String>;
}

/// Everything a preprocessing run needs, bundled to keep the trait call
/// site readable.
pub struct PreprocessContext<'a> {
    /// Directory owned by this invocation, `<root>/<base>/<hash>/<module>`.
    pub workspace_path: &'a Path,
    /// Workspace of a previous preprocessing of a related resource, if it
    /// still exists on disk. Derived files that did not change can be
    /// referenced from here with `from_cache`.
    pub latest_cache_path: Option<&'a Path>,
    pub base: BaseId,
    pub resource_hash: &'a ContentHash,
    pub resource_path: &'a Path,
    pub content_type: &'a str,
    pub report_progress: &'a (dyn Fn(f32) + Sync),
    pub interruption: &'a Interruption,
}

/// One derived document produced by a preprocessing run.
///
/// `path` is relative: against the latest cache when `from_cache` is set,
/// against the workspace otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingOutcome {
    pub hash: ContentHash,
    pub path: PathBuf,
    pub meta: serde_json::Value,
    #[serde(default)]
    pub from_cache: bool,
}

/// Turns one unique resource content into derived documents.
///
/// The module guarantees that `(file content, resource hash)` is
/// deterministic: preprocessing an unchanged resource yields byte-identical
/// derived files, which is what makes `from_cache` reuse sound.
pub trait PreprocessingModule: Module {
    fn acceptant(
        &self,
        base: BaseId,
        resource_hash: &ContentHash,
        resource_path: &Path,
        content_type: &str,
    ) -> bool;

    fn preprocess(&self, ctx: PreprocessContext<'_>) -> ModuleResult<Vec<PreprocessingOutcome>>;
}

pub struct IndexAddition<'a> {
    pub base: BaseId,
    pub preproc_module: &'a str,
    pub document_hash: &'a ContentHash,
    pub document_path: &'a Path,
    pub document_meta: &'a serde_json::Value,
    pub report_progress: &'a (dyn Fn(f32) + Sync),
    pub interruption: &'a Interruption,
}

pub struct IndexRemoval<'a> {
    pub base: BaseId,
    pub preproc_module: &'a str,
    pub document_hash: &'a ContentHash,
    pub report_progress: &'a (dyn Fn(f32) + Sync),
    pub interruption: &'a Interruption,
}

/// Maintains one search index over the documents of a base.
pub trait IndexModule: Module {
    fn add(&self, addition: IndexAddition<'_>) -> ModuleResult<()>;
    fn remove(&self, removal: IndexRemoval<'_>) -> ModuleResult<()>;
}

/// A module handed to the engine, tagged with its role.
#[derive(Clone)]
pub enum ModuleHandle {
    Resource(Arc<dyn ResourceModule>),
    Preprocessing(Arc<dyn PreprocessingModule>),
    Index(Arc<dyn IndexModule>),
}

impl ModuleHandle {
    pub fn kind(&self) -> ModuleKind {
        match self {
            ModuleHandle::Resource(_) => ModuleKind::Resource,
            ModuleHandle::Preprocessing(_) => ModuleKind::Preprocessing,
            ModuleHandle::Index(_) => ModuleKind::Index,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ModuleHandle::Resource(module) => module.id(),
            ModuleHandle::Preprocessing(module) => module.id(),
            ModuleHandle::Index(module) => module.id(),
        }
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleHandle::{}({:?})", self.kind(), self.id())
    }
}
