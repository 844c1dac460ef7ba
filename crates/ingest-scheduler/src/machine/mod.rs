//! The single source of truth for persisted entities, task graph
//! transitions and reference counts.
//!
//! Every public command runs inside one write transaction: either the
//! mutation and all its derived task-graph updates are persisted, or none
//! are. The in-memory task queues are derived views over the task tables;
//! they are refilled from the database when entering the processing state
//! and only mutated after a transaction commits.

mod bases;
mod codec;
mod documents;
#[cfg(test)]
mod properties;
mod registry;
mod resources;
mod tasks;
#[cfg(test)]
mod test;

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use corpus_types::hash::ContentHash;
use corpus_types::modules::{IndexModule, ModuleHandle, PreprocessingModule, ResourceModule};
use corpus_types::resources::{KnowledgeBase, Resource};
use corpus_types::{BaseId, EventId};
use heed::{Env, EnvOpenOptions, RoTxn, WithoutTls};
use time::OffsetDateTime;

use self::bases::{BaseStore, KnowledgeBaseRecord};
pub use self::documents::Document;
use self::documents::DocumentStore;
use self::registry::ModuleRegistry;
use self::resources::ResourceStore;
pub use self::tasks::{FromResource, IndexOperation, IndexTask, PreprocessingTask};
use self::tasks::TaskStore;
use crate::utils::clamp_to_page_size;
use crate::{DocumentId, Error, ModuleUid, Result, TaskId};

/// The three exclusive lifecycle phases of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// Knowledge bases may be created and removed.
    Setting,
    /// Resources may be mutated.
    Scanning,
    /// Tasks may be popped and completed.
    Processing,
}

/// A popped preprocessing task, ready to be dispatched to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessingEvent {
    pub proto_event_id: EventId,
    pub task_id: TaskId,
    pub base: BaseId,
    pub module: ModuleUid,
    pub resource_hash: ContentHash,
    pub from_resource_hash: Option<ContentHash>,
    pub resource_path: PathBuf,
    pub content_type: String,
    pub created_at: OffsetDateTime,
}

/// A popped index task, carrying the document it targets.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleIndexEvent {
    pub proto_event_id: EventId,
    pub task_id: TaskId,
    pub base: BaseId,
    pub preproc_module: ModuleUid,
    pub index_module: ModuleUid,
    pub operation: IndexOperation,
    pub document_hash: ContentHash,
    pub document_path: PathBuf,
    pub document_meta: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// A resource hash whose last reference disappeared; its on-disk
/// workspaces can be deleted. These events live only in memory: a crash
/// forfeits the pending cleanups, never the consistency of the database.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedResourceEvent {
    pub proto_event_id: EventId,
    pub base: BaseId,
    pub hash: ContentHash,
}

/// One derived document returned by a preprocessing run, with its path
/// already resolved against the workspace or the latest cache.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentDescription {
    pub document_hash: ContentHash,
    pub path: PathBuf,
    pub meta: serde_json::Value,
}

/// Queue mutations staged by a command and applied only once its
/// transaction committed.
#[derive(Default)]
struct Effects {
    enqueue_preproc: Vec<PreprocessingTask>,
    enqueue_index: Vec<IndexTask>,
    cancel_preproc_ids: Vec<TaskId>,
    cancel_index_ids: Vec<TaskId>,
    enqueue_removed: Vec<RemovedResourceEvent>,
    cancel_removed: Vec<(BaseId, ContentHash)>,
}

pub struct StateMachine {
    /// The LMDB environment which all the DBs are associated with.
    env: Env<WithoutTls>,
    registry: ModuleRegistry,
    bases: BaseStore,
    resources: ResourceStore,
    documents: DocumentStore,
    tasks: TaskStore,

    state: MachineState,
    /// Derived views over the task tables, in `(created_at, id)` order.
    preproc_queue: VecDeque<PreprocessingTask>,
    index_queue: VecDeque<IndexTask>,
    removed_resources: VecDeque<RemovedResourceEvent>,
    /// Popped-but-not-completed counts; both must be zero to leave the
    /// processing state.
    popped_preproc_count: usize,
    popped_index_count: usize,
}

impl StateMachine {
    pub(crate) const fn nb_db() -> u32 {
        ModuleRegistry::nb_db()
            + BaseStore::nb_db()
            + ResourceStore::nb_db()
            + DocumentStore::nb_db()
            + TaskStore::nb_db()
    }

    /// Open the machine, loading any tasks left over by a previous run.
    /// The initial state is processing iff some tasks are pending.
    pub fn new(path: &Path, map_size: usize, modules: Vec<ModuleHandle>) -> Result<StateMachine> {
        std::fs::create_dir_all(path)?;
        let env = unsafe {
            let env_options = EnvOpenOptions::new();
            let mut env_options = env_options.read_txn_without_tls();
            env_options
                .max_dbs(Self::nb_db())
                .map_size(clamp_to_page_size(map_size))
                .open(path)
        }?;

        let mut wtxn = env.write_txn()?;
        let registry = ModuleRegistry::new(&env, &mut wtxn, modules)?;
        let bases = BaseStore::new(&env, &mut wtxn)?;
        let resources = ResourceStore::new(&env, &mut wtxn)?;
        let documents = DocumentStore::new(&env, &mut wtxn)?;
        let tasks = TaskStore::new(&env, &mut wtxn)?;
        wtxn.commit()?;

        let mut machine = StateMachine {
            env,
            registry,
            bases,
            resources,
            documents,
            tasks,
            state: MachineState::Setting,
            preproc_queue: VecDeque::new(),
            index_queue: VecDeque::new(),
            removed_resources: VecDeque::new(),
            popped_preproc_count: 0,
            popped_index_count: 0,
        };
        machine.reload_tasks()?;
        if !machine.preproc_queue.is_empty() || !machine.index_queue.is_empty() {
            machine.state = MachineState::Processing;
        }
        Ok(machine)
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    /// Legal only when no task is pending and none is popped-but-not-completed.
    pub fn goto_setting(&mut self) {
        if self.state != MachineState::Setting {
            self.assert_drained();
            self.state = MachineState::Setting;
        }
    }

    /// Legal only when no task is pending and none is popped-but-not-completed.
    pub fn goto_scanning(&mut self) {
        if self.state != MachineState::Scanning {
            self.assert_drained();
            self.state = MachineState::Scanning;
        }
    }

    /// Always legal; reloads the pending task queues from the database.
    pub fn goto_processing(&mut self) -> Result<()> {
        if self.state != MachineState::Processing {
            self.reload_tasks()?;
            self.state = MachineState::Processing;
        }
        Ok(())
    }

    fn assert_drained(&self) {
        assert!(self.preproc_queue.is_empty(), "preprocessing tasks are still queued");
        assert!(self.index_queue.is_empty(), "index tasks are still queued");
        assert_eq!(self.popped_preproc_count, 0, "a popped preprocessing task was not completed");
        assert_eq!(self.popped_index_count, 0, "a popped index task was not completed");
    }

    fn reload_tasks(&mut self) -> Result<()> {
        let rtxn = self.env.read_txn()?;
        self.preproc_queue = self.tasks.all_preproc(&rtxn)?.into();
        self.index_queue = self.tasks.all_index(&rtxn)?.into();
        Ok(())
    }

    // ===== knowledge bases =====

    pub fn create_knowledge_base(
        &mut self,
        resource_module: &str,
        resource_params: serde_json::Value,
    ) -> Result<KnowledgeBase> {
        assert_eq!(self.state, MachineState::Setting, "bases can only be created while setting");
        let uid = self.registry.uid(resource_module)?;
        // reject non-resource modules before writing anything
        self.registry.resource_module(uid)?;

        let mut wtxn = self.env.write_txn()?;
        let record =
            KnowledgeBaseRecord { resource_module: uid, resource_params: resource_params.clone() };
        let id = self.bases.create(&mut wtxn, &record)?;
        wtxn.commit()?;

        Ok(KnowledgeBase { id, resource_module: resource_module.to_string(), resource_params })
    }

    /// Removable only when it no longer holds resources; run
    /// [`clean_resources`](Self::clean_resources) and drain the resulting
    /// tasks first.
    pub fn remove_knowledge_base(&mut self, base: &KnowledgeBase) -> Result<()> {
        assert_eq!(self.state, MachineState::Setting, "bases can only be removed while setting");
        let mut wtxn = self.env.write_txn()?;
        if self.resources.has_any(&wtxn, base.id)? {
            return Err(Error::KnowledgeBaseNotEmpty(base.id));
        }
        if !self.bases.delete(&mut wtxn, base.id)? {
            return Err(Error::KnowledgeBaseNotFound(base.id));
        }
        wtxn.commit()?;
        Ok(())
    }

    pub fn knowledge_base(&self, id: BaseId) -> Result<KnowledgeBase> {
        let rtxn = self.env.read_txn()?;
        let record = self.bases.get(&rtxn, id)?.ok_or(Error::KnowledgeBaseNotFound(id))?;
        self.materialize_base(id, record)
    }

    pub fn knowledge_bases(&self) -> Result<Vec<KnowledgeBase>> {
        let rtxn = self.env.read_txn()?;
        self.bases
            .all(&rtxn)?
            .into_iter()
            .map(|(id, record)| self.materialize_base(id, record))
            .collect()
    }

    fn materialize_base(&self, id: BaseId, record: KnowledgeBaseRecord) -> Result<KnowledgeBase> {
        let resource_module = self.registry.string_id(record.resource_module)?.to_string();
        Ok(KnowledgeBase { id, resource_module, resource_params: record.resource_params })
    }

    // ===== scanning commands =====

    /// Insert or update a resource observed by a scan.
    ///
    /// The first appearance of a content hash in a base schedules its
    /// preprocessing; a hash losing its last reference schedules the
    /// removal of everything derived from it.
    pub fn put_resource(&mut self, event_id: EventId, resource: &Resource, path: &Path) -> Result<()> {
        assert_eq!(self.state, MachineState::Scanning, "resources are only mutable while scanning");
        let base = self.knowledge_base(resource.base)?;

        let mut effects = Effects::default();
        let mut wtxn = self.env.write_txn()?;

        let target_last_refs = self.resource_hash_refs(&wtxn, resource.base, &resource.hash)?;
        let origin = self.resources.get(&wtxn, resource.base, &resource.external_id)?;
        match &origin {
            None => self.resources.insert(&mut wtxn, resource)?,
            Some(origin) => {
                self.resources.update(&mut wtxn, resource, origin)?;
                if origin.hash != resource.hash {
                    self.retire_hash(
                        &mut wtxn,
                        &mut effects,
                        event_id,
                        &base,
                        &origin.hash,
                        &origin.content_type,
                    )?;
                }
            }
        }
        if target_last_refs == 0 {
            let from = origin.as_ref().map(|origin| FromResource {
                hash: origin.hash.clone(),
                content_type: origin.content_type.clone(),
            });
            self.submit_hash_created(&mut wtxn, &mut effects, event_id, &base, resource, from, path)?;
        }

        wtxn.commit()?;
        self.apply(effects);
        Ok(())
    }

    /// Remove a resource observed as deleted by a scan.
    pub fn remove_resource(&mut self, event_id: EventId, resource: &Resource) -> Result<()> {
        assert_eq!(self.state, MachineState::Scanning, "resources are only mutable while scanning");
        let base = self.knowledge_base(resource.base)?;

        let mut effects = Effects::default();
        let mut wtxn = self.env.write_txn()?;

        let origin = self
            .resources
            .remove(&mut wtxn, resource.base, &resource.external_id)?
            .ok_or_else(|| Error::ResourceNotFound {
                base: resource.base,
                external_id: resource.external_id.clone(),
            })?;
        self.retire_hash(&mut wtxn, &mut effects, event_id, &base, &origin.hash, &origin.content_type)?;

        wtxn.commit()?;
        self.apply(effects);
        Ok(())
    }

    /// A resource stopped carrying `hash`. When no live resource carries it
    /// anymore, its pending preprocessing tasks are superseded (no popped
    /// task can exist outside the processing state, so this never races a
    /// worker); once the reference count reaches zero the hash is submitted
    /// as removed, except when the cancelled tasks were the only trace it
    /// ever left.
    fn retire_hash(
        &self,
        wtxn: &mut heed::RwTxn,
        effects: &mut Effects,
        event_id: EventId,
        base: &KnowledgeBase,
        hash: &ContentHash,
        content_type: &str,
    ) -> Result<()> {
        let mut cancelled = Vec::new();
        if self.resources.count_by_hash(wtxn, base.id, hash)? == 0 {
            for task in self.tasks.preproc_by_resource_hash(wtxn, base.id, hash)? {
                self.tasks.remove_preproc(wtxn, &task)?;
                effects.cancel_preproc_ids.push(task.id);
                cancelled.push(task);
            }
        }

        if self.resource_hash_refs(wtxn, base.id, hash)? == 0 {
            let superseded_before_any_effect =
                !cancelled.is_empty() && !self.hash_has_documents(wtxn, base, hash, content_type)?;
            if !superseded_before_any_effect {
                self.submit_hash_removed(wtxn, effects, event_id, base, hash, content_type)?;
            }
        }

        // a cancelled task may have held the last reference on the hash it
        // derived from
        for task in cancelled {
            if let Some(from) = task.from_resource {
                if self.resource_hash_refs(wtxn, base.id, &from.hash)? == 0 {
                    self.submit_hash_removed(
                        wtxn,
                        effects,
                        event_id,
                        base,
                        &from.hash,
                        &from.content_type,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Whether any document is still referenced from the hash by an
    /// applicable preprocessing module.
    fn hash_has_documents(
        &self,
        rtxn: &RoTxn<WithoutTls>,
        base: &KnowledgeBase,
        hash: &ContentHash,
        content_type: &str,
    ) -> Result<bool> {
        for uid in self.preprocess_module_uids(base, content_type) {
            if !self.documents.documents_by_resource(rtxn, uid, base.id, hash)?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Schedule the removal of everything a base holds, then transition to
    /// processing so the emitted removal tasks can drain.
    pub fn clean_resources(&mut self, event_id: EventId, base: &KnowledgeBase) -> Result<()> {
        assert_eq!(self.state, MachineState::Setting, "bases can only be cleaned while setting");

        let mut effects = Effects::default();
        let mut wtxn = self.env.write_txn()?;

        for hash in self.resources.hashes(&wtxn, base.id)? {
            let resource = self
                .resources
                .get_by_hash(&wtxn, base.id, &hash)?
                .into_iter()
                .next()
                .ok_or(Error::CorruptedTaskQueue)?;
            // preprocessing the base's content became moot, only the index
            // removals of already-derived documents must still run
            for task in self.tasks.preproc_by_resource_hash(&wtxn, base.id, &hash)? {
                self.tasks.remove_preproc(&mut wtxn, &task)?;
                effects.cancel_preproc_ids.push(task.id);
            }
            self.submit_hash_removed(
                &mut wtxn,
                &mut effects,
                event_id,
                base,
                &hash,
                &resource.content_type,
            )?;
        }
        self.resources.remove_all(&mut wtxn, base.id)?;

        wtxn.commit()?;
        self.apply(effects);
        self.state = MachineState::Processing;
        Ok(())
    }

    // ===== processing commands =====

    /// Pop the next preprocessing task, FIFO over `(created_at, id)`.
    pub fn pop_preproc_event(&mut self) -> Option<PreprocessingEvent> {
        assert_eq!(self.state, MachineState::Processing, "tasks can only be popped while processing");
        let task = self.preproc_queue.pop_front()?;
        self.popped_preproc_count += 1;
        Some(PreprocessingEvent {
            proto_event_id: task.event_id,
            task_id: task.id,
            base: task.base,
            module: task.preproc_module,
            resource_hash: task.resource_hash,
            from_resource_hash: task.from_resource.map(|from| from.hash),
            resource_path: task.path,
            content_type: task.content_type,
            created_at: task.created_at,
        })
    }

    /// Pop the next index task, FIFO over `(created_at, id)`.
    pub fn pop_handle_index_event(&mut self) -> Result<Option<HandleIndexEvent>> {
        assert_eq!(self.state, MachineState::Processing, "tasks can only be popped while processing");
        let Some(task) = self.index_queue.pop_front() else { return Ok(None) };
        self.popped_index_count += 1;

        let rtxn = self.env.read_txn()?;
        let document =
            self.documents.get(&rtxn, task.document)?.ok_or(Error::DocumentNotFound(task.document))?;
        Ok(Some(HandleIndexEvent {
            proto_event_id: task.event_id,
            task_id: task.id,
            base: task.base,
            preproc_module: task.preproc_module,
            index_module: task.index_module,
            operation: task.operation,
            document_hash: document.document_hash,
            document_path: document.path,
            document_meta: document.meta,
            created_at: task.created_at,
        }))
    }

    pub fn pop_removed_resource_event(&mut self) -> Option<RemovedResourceEvent> {
        assert_eq!(self.state, MachineState::Processing, "events can only be popped while processing");
        self.removed_resources.pop_front()
    }

    /// Apply the documents returned by a preprocessing run.
    ///
    /// Transactionally: the task row is deleted, each document is appended
    /// with a reference row, and a CREATE index task is derived per index
    /// module, unless a pending REMOVE for the same `(document, module)`
    /// cancels against it. Hashes whose last reference was the task itself
    /// are then submitted as removed.
    pub fn complete_preproc_task(
        &mut self,
        event: &PreprocessingEvent,
        documents: Vec<DocumentDescription>,
    ) -> Result<()> {
        assert_eq!(self.state, MachineState::Processing, "tasks can only complete while processing");
        let base = self.knowledge_base(event.base)?;
        let index_uids = self.index_module_uids(&base);

        let mut effects = Effects::default();
        let mut wtxn = self.env.write_txn()?;

        let task = self.tasks.get_preproc(&wtxn, event.task_id)?.ok_or(Error::CorruptedTaskQueue)?;
        self.tasks.remove_preproc(&mut wtxn, &task)?;

        for description in &documents {
            let document = self.documents.append(
                &mut wtxn,
                task.preproc_module,
                task.base,
                &task.resource_hash,
                description,
            )?;
            for &index_uid in &index_uids {
                let prior = self
                    .tasks
                    .index_tasks_of_document(&wtxn, document.id, index_uid)?
                    .into_iter()
                    .next();
                match prior {
                    None => {
                        let index_task = self.tasks.create_index(
                            &mut wtxn,
                            task.event_id,
                            task.preproc_module,
                            index_uid,
                            task.base,
                            document.id,
                            IndexOperation::Create,
                        )?;
                        effects.enqueue_index.push(index_task);
                    }
                    // a pending REMOVE and the new CREATE cancel each other
                    Some(prior) if prior.operation == IndexOperation::Remove => {
                        self.tasks.remove_index(&mut wtxn, &prior)?;
                        effects.cancel_index_ids.push(prior.id);
                    }
                    Some(_) => (),
                }
            }
        }

        for (hash, content_type) in task.referenced_hashes() {
            if self.resource_hash_refs(&wtxn, task.base, hash)? == 0 {
                self.submit_hash_removed(
                    &mut wtxn,
                    &mut effects,
                    task.event_id,
                    &base,
                    hash,
                    content_type,
                )?;
            }
        }

        wtxn.commit()?;
        assert!(self.popped_preproc_count > 0, "no preprocessing task was popped");
        self.popped_preproc_count -= 1;
        self.apply(effects);
        Ok(())
    }

    /// Mark an index task as done. The referenced document is deleted once
    /// nothing holds a reference on it and no other index task needs it.
    pub fn complete_index_task(&mut self, event: &HandleIndexEvent) -> Result<()> {
        assert_eq!(self.state, MachineState::Processing, "tasks can only complete while processing");

        let mut wtxn = self.env.write_txn()?;
        let task = self.tasks.get_index(&wtxn, event.task_id)?.ok_or(Error::CorruptedTaskQueue)?;
        let document =
            self.documents.get(&wtxn, task.document)?.ok_or(Error::DocumentNotFound(task.document))?;
        self.tasks.remove_index(&mut wtxn, &task)?;

        if self.document_refs(&wtxn, document.id)? == 0
            && self.tasks.index_tasks_for_document(&wtxn, document.id)?.is_empty()
        {
            self.documents.remove(&mut wtxn, &document)?;
        }

        wtxn.commit()?;
        assert!(self.popped_index_count > 0, "no index task was popped");
        self.popped_index_count -= 1;
        Ok(())
    }

    /// Release a popped preprocessing task without completing it: its row
    /// stays persisted and is retried on the next queue reload.
    pub fn abandon_preproc_task(&mut self) {
        assert_eq!(self.state, MachineState::Processing, "tasks can only be abandoned while processing");
        assert!(self.popped_preproc_count > 0, "no preprocessing task was popped");
        self.popped_preproc_count -= 1;
    }

    /// Release a popped index task without completing it: its row stays
    /// persisted and is retried on the next queue reload.
    pub fn abandon_index_task(&mut self) {
        assert_eq!(self.state, MachineState::Processing, "tasks can only be abandoned while processing");
        assert!(self.popped_index_count > 0, "no index task was popped");
        self.popped_index_count -= 1;
    }

    // ===== hash submission =====

    /// A content hash appeared for the first time in a base: supersede any
    /// pending preprocessing of the same hash, create one task per
    /// applicable preprocessing module, and cancel a queued removed-resource
    /// event for the hash (a create supersedes a pending removal).
    #[allow(clippy::too_many_arguments)]
    fn submit_hash_created(
        &self,
        wtxn: &mut heed::RwTxn,
        effects: &mut Effects,
        event_id: EventId,
        base: &KnowledgeBase,
        resource: &Resource,
        from: Option<FromResource>,
        path: &Path,
    ) -> Result<()> {
        for task in self.tasks.preproc_by_resource_hash(wtxn, resource.base, &resource.hash)? {
            self.tasks.remove_preproc(wtxn, &task)?;
            effects.cancel_preproc_ids.push(task.id);
        }

        for uid in self.preprocess_module_uids(base, &resource.content_type) {
            let task = self.tasks.create_preproc(
                wtxn,
                event_id,
                uid,
                resource.base,
                &resource.hash,
                from.clone(),
                path,
                &resource.content_type,
            )?;
            effects.enqueue_preproc.push(task);
        }

        effects.cancel_removed.push((resource.base, resource.hash.clone()));
        Ok(())
    }

    /// The last reference on a content hash disappeared: drop the document
    /// references owned by the hash, emit REMOVE index tasks for documents
    /// that thereby died (deleting them right away when the base has no
    /// index module), and queue a removed-resource event for the disk
    /// cleanup.
    fn submit_hash_removed(
        &self,
        wtxn: &mut heed::RwTxn,
        effects: &mut Effects,
        event_id: EventId,
        base: &KnowledgeBase,
        hash: &ContentHash,
        content_type: &str,
    ) -> Result<()> {
        let mut dead: BTreeMap<DocumentId, Document> = BTreeMap::new();
        for uid in self.preprocess_module_uids(base, content_type) {
            let documents = self.documents.documents_by_resource(wtxn, uid, base.id, hash)?;
            self.documents.remove_refs_by_resource(wtxn, uid, base.id, hash)?;
            for document in documents {
                if self.document_refs(wtxn, document.id)? == 0 {
                    dead.insert(document.id, document);
                }
            }
        }

        let index_uids = self.index_module_uids(base);
        for document in dead.values() {
            if index_uids.is_empty() {
                self.documents.remove(wtxn, document)?;
            } else {
                for &index_uid in &index_uids {
                    let pending_create = self
                        .tasks
                        .index_tasks_of_document(wtxn, document.id, index_uid)?
                        .into_iter()
                        .find(|task| task.operation == IndexOperation::Create);
                    match pending_create {
                        // a pending CREATE and the new REMOVE cancel each other
                        Some(create) => {
                            self.tasks.remove_index(wtxn, &create)?;
                            effects.cancel_index_ids.push(create.id);
                        }
                        None => {
                            let index_task = self.tasks.create_index(
                                wtxn,
                                event_id,
                                document.preproc_module,
                                index_uid,
                                base.id,
                                document.id,
                                IndexOperation::Remove,
                            )?;
                            effects.enqueue_index.push(index_task);
                        }
                    }
                }
            }
        }

        let already_pending = self
            .removed_resources
            .iter()
            .chain(effects.enqueue_removed.iter())
            .any(|event| event.base == base.id && event.hash == *hash);
        if !already_pending {
            effects.enqueue_removed.push(RemovedResourceEvent {
                proto_event_id: event_id,
                base: base.id,
                hash: hash.clone(),
            });
        }
        Ok(())
    }

    fn apply(&mut self, effects: Effects) {
        if !effects.cancel_preproc_ids.is_empty() {
            self.preproc_queue.retain(|task| !effects.cancel_preproc_ids.contains(&task.id));
        }
        if !effects.cancel_index_ids.is_empty() {
            self.index_queue.retain(|task| !effects.cancel_index_ids.contains(&task.id));
        }
        self.preproc_queue.extend(effects.enqueue_preproc);
        self.index_queue.extend(effects.enqueue_index);
        for (base, hash) in effects.cancel_removed {
            if let Some(position) = self
                .removed_resources
                .iter()
                .position(|event| event.base == base && event.hash == hash)
            {
                self.removed_resources.remove(position);
            }
        }
        self.removed_resources.extend(effects.enqueue_removed);
    }

    // ===== reference counts =====

    /// Live resources carrying the hash plus pending preprocessing tasks
    /// referencing it, directly or as their from-resource.
    fn resource_hash_refs(
        &self,
        rtxn: &RoTxn<WithoutTls>,
        base: BaseId,
        hash: &ContentHash,
    ) -> Result<u64> {
        Ok(self.resources.count_by_hash(rtxn, base, hash)?
            + self.tasks.count_hash_refs(rtxn, base, hash)?)
    }

    /// Reference rows plus pending CREATE index tasks.
    fn document_refs(&self, rtxn: &RoTxn<WithoutTls>, document: DocumentId) -> Result<u64> {
        Ok(self.documents.refs_count(rtxn, document)?
            + self.tasks.count_document_create_tasks(rtxn, document)?)
    }

    // ===== module resolution =====

    fn preprocess_module_uids(&self, base: &KnowledgeBase, content_type: &str) -> Vec<ModuleUid> {
        match self.resource_module(&base.resource_module) {
            Ok(module) => {
                self.registry.preprocessing_uids(&module.preprocess_module_ids(base, content_type))
            }
            Err(_) => Vec::new(),
        }
    }

    fn index_module_uids(&self, base: &KnowledgeBase) -> Vec<ModuleUid> {
        match self.resource_module(&base.resource_module) {
            Ok(module) => self.registry.index_uids(&module.index_module_ids(base)),
            Err(_) => Vec::new(),
        }
    }

    /// Look up a registered resource module by its stable id.
    pub fn resource_module(&self, id: &str) -> Result<Arc<dyn ResourceModule>> {
        self.registry.resource_module(self.registry.uid(id)?)
    }

    /// Look up a registered preprocessing module by its stable id.
    pub fn preproc_module(&self, id: &str) -> Result<Arc<dyn PreprocessingModule>> {
        self.registry.preprocessing_module(self.registry.uid(id)?)
    }

    /// Look up a registered index module by its stable id.
    pub fn index_module(&self, id: &str) -> Result<Arc<dyn IndexModule>> {
        self.registry.index_module(self.registry.uid(id)?)
    }

    pub(crate) fn preprocessing_module_handle(
        &self,
        uid: ModuleUid,
    ) -> Result<Arc<dyn PreprocessingModule>> {
        self.registry.preprocessing_module(uid)
    }

    pub(crate) fn index_module_handle(&self, uid: ModuleUid) -> Result<Arc<dyn IndexModule>> {
        self.registry.index_module(uid)
    }

    pub(crate) fn module_string_id(&self, uid: ModuleUid) -> Result<String> {
        Ok(self.registry.string_id(uid)?.to_string())
    }

    // ===== queries =====

    /// The live resources of a base sharing a content hash, newest first.
    pub fn resources(&self, base: BaseId, hash: &ContentHash) -> Result<Vec<Resource>> {
        let rtxn = self.env.read_txn()?;
        self.resources.get_by_hash(&rtxn, base, hash)
    }

    /// Look up a document by its identity `(base, preproc module, hash)`.
    pub fn document(
        &self,
        base: BaseId,
        preproc_module: &str,
        hash: &ContentHash,
    ) -> Result<Option<Document>> {
        let uid = self.registry.uid(preproc_module)?;
        let rtxn = self.env.read_txn()?;
        self.documents.get_by_hash(&rtxn, uid, base, hash)
    }

    /// Pending work counts, keyed the way they are reported.
    pub fn stats(&self) -> Result<BTreeMap<String, u64>> {
        let rtxn = self.env.read_txn()?;
        let mut stats = BTreeMap::new();
        stats.insert("knowledgeBases".to_string(), self.bases.all(&rtxn)?.len() as u64);
        stats.insert("preprocessingTasks".to_string(), self.tasks.preproc_len(&rtxn)?);
        let index_tasks = self.tasks.all_index(&rtxn)?;
        for operation in enum_iterator::all::<IndexOperation>() {
            let count =
                index_tasks.iter().filter(|task| task.operation == operation).count() as u64;
            stats.insert(format!("{operation}IndexTasks"), count);
        }
        Ok(stats)
    }

    /// Return `Ok(())` if the machine is able to access its databases.
    pub fn health(&self) -> Result<()> {
        let rtxn = self.env.read_txn()?;
        self.registry.check(&rtxn)?;
        self.bases.check(&rtxn)?;
        Ok(())
    }

    // ===== test introspection =====

    #[cfg(test)]
    pub(crate) fn dump_preproc_tasks(&self) -> Result<Vec<PreprocessingTask>> {
        let rtxn = self.env.read_txn()?;
        self.tasks.all_preproc(&rtxn)
    }

    #[cfg(test)]
    pub(crate) fn dump_index_tasks(&self) -> Result<Vec<IndexTask>> {
        let rtxn = self.env.read_txn()?;
        self.tasks.all_index(&rtxn)
    }

    #[cfg(test)]
    pub(crate) fn dump_documents(&self) -> Result<Vec<Document>> {
        let rtxn = self.env.read_txn()?;
        self.documents.all(&rtxn)
    }

    #[cfg(test)]
    pub(crate) fn dump_document_ref_counts(&self) -> Result<Vec<(DocumentId, u64)>> {
        let rtxn = self.env.read_txn()?;
        self.documents.all_ref_counts(&rtxn)
    }

    #[cfg(test)]
    pub(crate) fn hash_refs(&self, base: BaseId, hash: &ContentHash) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        self.resource_hash_refs(&rtxn, base, hash)
    }

    #[cfg(test)]
    pub(crate) fn count_resources_by_hash(&self, base: BaseId, hash: &ContentHash) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        self.resources.count_by_hash(&rtxn, base, hash)
    }

    #[cfg(test)]
    pub(crate) fn queued_removed_resource_hashes(&self) -> Vec<ContentHash> {
        self.removed_resources.iter().map(|event| event.hash.clone()).collect()
    }
}
