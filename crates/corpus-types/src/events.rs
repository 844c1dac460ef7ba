use std::path::PathBuf;
use std::sync::Arc;

use crate::hash::ContentHash;
use crate::resources::Updating;
use crate::{BaseId, EventId};

/// Typed observability events surfaced to the user-supplied listener.
///
/// `id` is generated by the reporter and increases monotonically; progress
/// and completion events reference the id of the matching begin event.
/// `module` is the stable string id of the module doing the work, `error`
/// is the rendered failure message.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ScanBegin {
        id: EventId,
        base: BaseId,
    },
    ScanResource {
        id: EventId,
        base: BaseId,
        path: PathBuf,
        hash: ContentHash,
        content_type: String,
        updating: Updating,
    },
    ScanComplete {
        id: EventId,
        base: BaseId,
    },
    ScanFail {
        id: EventId,
        base: BaseId,
        error: String,
    },
    PreprocessingBegin {
        id: EventId,
        base: BaseId,
        module: String,
        path: PathBuf,
        hash: ContentHash,
        content_type: String,
    },
    PreprocessingProgress {
        id: EventId,
        base: BaseId,
        path: PathBuf,
        hash: ContentHash,
        content_type: String,
        progress: f32,
    },
    PreprocessingComplete {
        id: EventId,
        base: BaseId,
        module: String,
        path: PathBuf,
        hash: ContentHash,
        content_type: String,
        documents: Vec<ContentHash>,
    },
    PreprocessingFail {
        id: EventId,
        base: BaseId,
        module: String,
        path: PathBuf,
        hash: ContentHash,
        content_type: String,
        error: String,
    },
    HandleIndexBegin {
        id: EventId,
        base: BaseId,
        module: String,
        hash: ContentHash,
        updating: Updating,
    },
    HandleIndexProgress {
        id: EventId,
        base: BaseId,
        module: String,
        hash: ContentHash,
        updating: Updating,
        progress: f32,
    },
    HandleIndexComplete {
        id: EventId,
        base: BaseId,
        module: String,
        hash: ContentHash,
        updating: Updating,
    },
    HandleIndexFail {
        id: EventId,
        base: BaseId,
        module: String,
        hash: ContentHash,
        updating: Updating,
        error: String,
    },
}

/// The listener events are pushed to. Must be cheap and non-blocking, it is
/// called from worker threads.
pub type EventListener = Arc<dyn Fn(Event) + Send + Sync>;
