//! Fans the engine's typed observability events out to the user listener.

use std::fmt::Display;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use corpus_types::events::{Event, EventListener};
use corpus_types::resources::{ResourceEvent, Updating};
use corpus_types::{BaseId, EventId};

use crate::machine::{DocumentDescription, HandleIndexEvent, IndexOperation, PreprocessingEvent};

/// Thread-safe reporter with monotonically increasing event ids.
///
/// Every `report_*` call is a no-op returning `-1` when no listener is
/// attached. Progress events reuse the id of the originating resource
/// event; begin events allocate a fresh id that the matching
/// complete/fail event references.
#[derive(Clone)]
pub struct EventReporter {
    listener: Option<EventListener>,
    next_id: Arc<AtomicI64>,
}

impl EventReporter {
    pub fn new(listener: Option<EventListener>) -> EventReporter {
        EventReporter { listener, next_id: Arc::new(AtomicI64::new(0)) }
    }

    fn generate_id(&self) -> EventId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, event: Event) {
        if let Some(listener) = &self.listener {
            listener(event);
        }
    }

    pub fn report_scan_begin(&self, base: BaseId) -> EventId {
        if self.listener.is_none() {
            return -1;
        }
        let id = self.generate_id();
        self.emit(Event::ScanBegin { id, base });
        id
    }

    pub fn report_scan_complete(&self, id: EventId, base: BaseId) {
        self.emit(Event::ScanComplete { id, base });
    }

    pub fn report_scan_fail(&self, id: EventId, base: BaseId, error: &dyn Display) {
        self.emit(Event::ScanFail { id, base, error: error.to_string() });
    }

    pub fn report_resource_event(&self, event: &ResourceEvent) {
        if self.listener.is_none() {
            return;
        }
        self.emit(Event::ScanResource {
            id: self.generate_id(),
            base: event.resource.base,
            path: event.path.clone(),
            hash: event.resource.hash.clone(),
            content_type: event.resource.content_type.clone(),
            updating: event.updating,
        });
    }

    pub fn report_preproc_begin(&self, event: &PreprocessingEvent, module: &str) -> EventId {
        if self.listener.is_none() {
            return -1;
        }
        let id = self.generate_id();
        self.emit(Event::PreprocessingBegin {
            id,
            base: event.base,
            module: module.to_string(),
            path: event.resource_path.clone(),
            hash: event.resource_hash.clone(),
            content_type: event.content_type.clone(),
        });
        id
    }

    pub fn report_preproc_progress(&self, event: &PreprocessingEvent, progress: f32) {
        self.emit(Event::PreprocessingProgress {
            id: event.proto_event_id,
            base: event.base,
            path: event.resource_path.clone(),
            hash: event.resource_hash.clone(),
            content_type: event.content_type.clone(),
            progress,
        });
    }

    pub fn report_preproc_complete(
        &self,
        id: EventId,
        event: &PreprocessingEvent,
        module: &str,
        documents: &[DocumentDescription],
    ) {
        self.emit(Event::PreprocessingComplete {
            id,
            base: event.base,
            module: module.to_string(),
            path: event.resource_path.clone(),
            hash: event.resource_hash.clone(),
            content_type: event.content_type.clone(),
            documents: documents.iter().map(|document| document.document_hash.clone()).collect(),
        });
    }

    pub fn report_preproc_fail(
        &self,
        id: EventId,
        event: &PreprocessingEvent,
        module: &str,
        error: &dyn Display,
    ) {
        self.emit(Event::PreprocessingFail {
            id,
            base: event.base,
            module: module.to_string(),
            path: event.resource_path.clone(),
            hash: event.resource_hash.clone(),
            content_type: event.content_type.clone(),
            error: error.to_string(),
        });
    }

    pub fn report_handle_index_begin(&self, event: &HandleIndexEvent, module: &str) -> EventId {
        if self.listener.is_none() {
            return -1;
        }
        let id = self.generate_id();
        self.emit(Event::HandleIndexBegin {
            id,
            base: event.base,
            module: module.to_string(),
            hash: event.document_hash.clone(),
            updating: operation_to_updating(event.operation),
        });
        id
    }

    pub fn report_handle_index_progress(
        &self,
        event: &HandleIndexEvent,
        module: &str,
        progress: f32,
    ) {
        self.emit(Event::HandleIndexProgress {
            id: event.proto_event_id,
            base: event.base,
            module: module.to_string(),
            hash: event.document_hash.clone(),
            updating: operation_to_updating(event.operation),
            progress,
        });
    }

    pub fn report_handle_index_complete(&self, id: EventId, event: &HandleIndexEvent, module: &str) {
        self.emit(Event::HandleIndexComplete {
            id,
            base: event.base,
            module: module.to_string(),
            hash: event.document_hash.clone(),
            updating: operation_to_updating(event.operation),
        });
    }

    pub fn report_handle_index_fail(
        &self,
        id: EventId,
        event: &HandleIndexEvent,
        module: &str,
        error: &dyn Display,
    ) {
        self.emit(Event::HandleIndexFail {
            id,
            base: event.base,
            module: module.to_string(),
            hash: event.document_hash.clone(),
            updating: operation_to_updating(event.operation),
            error: error.to_string(),
        });
    }
}

fn operation_to_updating(operation: IndexOperation) -> Updating {
    match operation {
        IndexOperation::Create => Updating::Create,
        IndexOperation::Remove => Updating::Delete,
    }
}
