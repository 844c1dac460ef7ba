use std::fmt;
use std::path::PathBuf;

use corpus_types::hash::ContentHash;
use corpus_types::{BaseId, EventId};
use enum_iterator::Sequence;
use heed::types::SerdeJson;
use heed::{Database, Env, RoTxn, RwTxn, WithoutTls};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::codec::{BEU32BytesCodec, RoaringBitmapCodec};
use crate::{DocumentId, Error, ModuleUid, Result, TaskId, BEU32};

/// The number of database used by the task store
const NUMBER_OF_DATABASES: u32 = 5;
mod db_name {
    pub const PREPROC_TASKS: &str = "preproc-tasks";
    pub const PREPROC_TASKS_BY_HASH: &str = "preproc-tasks-by-hash";
    pub const PREPROC_TASKS_BY_FROM_HASH: &str = "preproc-tasks-by-from-hash";
    pub const INDEX_TASKS: &str = "index-tasks";
    pub const INDEX_TASKS_BY_DOCUMENT: &str = "index-tasks-by-document";
}

/// The resource a content hash replaced, kept on the task so the
/// preprocessing worker can reuse the previous workspace as a cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FromResource {
    pub hash: ContentHash,
    pub content_type: String,
}

/// Scheduled work to produce the documents of one
/// `(base, resource hash, preproc module)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingTask {
    pub id: TaskId,
    pub preproc_module: ModuleUid,
    pub base: BaseId,
    pub resource_hash: ContentHash,
    pub from_resource: Option<FromResource>,
    pub event_id: EventId,
    pub path: PathBuf,
    pub content_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl PreprocessingTask {
    /// The resource hashes this task holds a reference on.
    pub fn referenced_hashes(&self) -> impl Iterator<Item = (&ContentHash, &str)> + '_ {
        std::iter::once((&self.resource_hash, self.content_type.as_str())).chain(
            self.from_resource.iter().map(|from| (&from.hash, from.content_type.as_str())),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Sequence)]
#[serde(rename_all = "camelCase")]
pub enum IndexOperation {
    Create,
    Remove,
}

impl fmt::Display for IndexOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexOperation::Create => f.write_str("create"),
            IndexOperation::Remove => f.write_str("remove"),
        }
    }
}

/// Scheduled work to add or remove one document from one index module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexTask {
    pub id: TaskId,
    pub preproc_module: ModuleUid,
    pub index_module: ModuleUid,
    pub base: BaseId,
    pub document: DocumentId,
    pub operation: IndexOperation,
    pub event_id: EventId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

pub struct TaskStore {
    /// Pending preprocessing tasks by id.
    preproc_tasks: Database<BEU32, SerdeJson<PreprocessingTask>>,
    /// Task ids keyed by `(base, resource hash)`.
    preproc_by_hash: Database<BEU32BytesCodec, RoaringBitmapCodec>,
    /// Task ids keyed by `(base, from-resource hash)`.
    preproc_by_from_hash: Database<BEU32BytesCodec, RoaringBitmapCodec>,
    /// Pending index tasks by id.
    index_tasks: Database<BEU32, SerdeJson<IndexTask>>,
    /// Index task ids keyed by the document they reference.
    index_by_document: Database<BEU32, RoaringBitmapCodec>,
}

impl TaskStore {
    pub(crate) const fn nb_db() -> u32 {
        NUMBER_OF_DATABASES
    }

    pub(crate) fn new(env: &Env<WithoutTls>, wtxn: &mut RwTxn) -> Result<TaskStore> {
        Ok(TaskStore {
            preproc_tasks: env.create_database(wtxn, Some(db_name::PREPROC_TASKS))?,
            preproc_by_hash: env.create_database(wtxn, Some(db_name::PREPROC_TASKS_BY_HASH))?,
            preproc_by_from_hash: env
                .create_database(wtxn, Some(db_name::PREPROC_TASKS_BY_FROM_HASH))?,
            index_tasks: env.create_database(wtxn, Some(db_name::INDEX_TASKS))?,
            index_by_document: env.create_database(wtxn, Some(db_name::INDEX_TASKS_BY_DOCUMENT))?,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_preproc(
        &self,
        wtxn: &mut RwTxn,
        event_id: EventId,
        preproc_module: ModuleUid,
        base: BaseId,
        resource_hash: &ContentHash,
        from_resource: Option<FromResource>,
        path: &std::path::Path,
        content_type: &str,
    ) -> Result<PreprocessingTask> {
        let id = self.preproc_tasks.last(wtxn)?.map_or(0, |(id, _)| id + 1);
        let task = PreprocessingTask {
            id,
            preproc_module,
            base,
            resource_hash: resource_hash.clone(),
            from_resource,
            event_id,
            path: path.to_path_buf(),
            content_type: content_type.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        self.preproc_tasks.put(wtxn, &id, &task)?;
        self.update_hash_index(wtxn, self.preproc_by_hash, base, &task.resource_hash, |bitmap| {
            bitmap.insert(id);
        })?;
        if let Some(from) = &task.from_resource {
            self.update_hash_index(wtxn, self.preproc_by_from_hash, base, &from.hash, |bitmap| {
                bitmap.insert(id);
            })?;
        }
        Ok(task)
    }

    pub fn get_preproc(
        &self,
        rtxn: &RoTxn<WithoutTls>,
        id: TaskId,
    ) -> Result<Option<PreprocessingTask>> {
        Ok(self.preproc_tasks.get(rtxn, &id)?)
    }

    /// The pending preprocessing tasks keyed on `(base, resource hash)`.
    pub fn preproc_by_resource_hash(
        &self,
        rtxn: &RoTxn<WithoutTls>,
        base: BaseId,
        resource_hash: &ContentHash,
    ) -> Result<Vec<PreprocessingTask>> {
        let key = (base, resource_hash.as_bytes());
        let Some(ids) = self.preproc_by_hash.get(rtxn, &key)? else { return Ok(Vec::new()) };
        let mut tasks = Vec::with_capacity(ids.len() as usize);
        for id in ids {
            tasks.push(self.get_preproc(rtxn, id)?.ok_or(Error::CorruptedTaskQueue)?);
        }
        Ok(tasks)
    }

    pub fn remove_preproc(&self, wtxn: &mut RwTxn, task: &PreprocessingTask) -> Result<()> {
        self.preproc_tasks.delete(wtxn, &task.id)?;
        self.update_hash_index(wtxn, self.preproc_by_hash, task.base, &task.resource_hash, |bitmap| {
            bitmap.remove(task.id);
        })?;
        if let Some(from) = &task.from_resource {
            self.update_hash_index(wtxn, self.preproc_by_from_hash, task.base, &from.hash, |bitmap| {
                bitmap.remove(task.id);
            })?;
        }
        Ok(())
    }

    /// How many pending preprocessing tasks reference this hash, either as
    /// their resource hash or as the hash they derive from.
    pub fn count_hash_refs(
        &self,
        rtxn: &RoTxn<WithoutTls>,
        base: BaseId,
        hash: &ContentHash,
    ) -> Result<u64> {
        let key = (base, hash.as_bytes());
        let direct = self.preproc_by_hash.get(rtxn, &key)?.map_or(0, |bitmap| bitmap.len());
        let from = self.preproc_by_from_hash.get(rtxn, &key)?.map_or(0, |bitmap| bitmap.len());
        Ok(direct + from)
    }

    /// Every pending preprocessing task, in `(created_at, id)` order.
    pub fn all_preproc(&self, rtxn: &RoTxn<WithoutTls>) -> Result<Vec<PreprocessingTask>> {
        let mut tasks = Vec::new();
        for entry in self.preproc_tasks.iter(rtxn)? {
            let (_, task) = entry?;
            tasks.push(task);
        }
        tasks.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(tasks)
    }

    pub fn create_index(
        &self,
        wtxn: &mut RwTxn,
        event_id: EventId,
        preproc_module: ModuleUid,
        index_module: ModuleUid,
        base: BaseId,
        document: DocumentId,
        operation: IndexOperation,
    ) -> Result<IndexTask> {
        let id = self.index_tasks.last(wtxn)?.map_or(0, |(id, _)| id + 1);
        let task = IndexTask {
            id,
            preproc_module,
            index_module,
            base,
            document,
            operation,
            event_id,
            created_at: OffsetDateTime::now_utc(),
        };
        self.index_tasks.put(wtxn, &id, &task)?;
        self.update_document_index(wtxn, document, |bitmap| {
            bitmap.insert(id);
        })?;
        Ok(task)
    }

    pub fn get_index(&self, rtxn: &RoTxn<WithoutTls>, id: TaskId) -> Result<Option<IndexTask>> {
        Ok(self.index_tasks.get(rtxn, &id)?)
    }

    /// The pending index tasks referencing a document, restricted to one
    /// index module.
    pub fn index_tasks_of_document(
        &self,
        rtxn: &RoTxn<WithoutTls>,
        document: DocumentId,
        index_module: ModuleUid,
    ) -> Result<Vec<IndexTask>> {
        Ok(self
            .index_tasks_for_document(rtxn, document)?
            .into_iter()
            .filter(|task| task.index_module == index_module)
            .collect())
    }

    /// Every pending index task referencing a document.
    pub fn index_tasks_for_document(
        &self,
        rtxn: &RoTxn<WithoutTls>,
        document: DocumentId,
    ) -> Result<Vec<IndexTask>> {
        let Some(ids) = self.index_by_document.get(rtxn, &document)? else {
            return Ok(Vec::new());
        };
        let mut tasks = Vec::with_capacity(ids.len() as usize);
        for id in ids {
            tasks.push(self.get_index(rtxn, id)?.ok_or(Error::CorruptedTaskQueue)?);
        }
        Ok(tasks)
    }

    /// How many pending CREATE index tasks reference the document.
    pub fn count_document_create_tasks(
        &self,
        rtxn: &RoTxn<WithoutTls>,
        document: DocumentId,
    ) -> Result<u64> {
        let tasks = self.index_tasks_for_document(rtxn, document)?;
        Ok(tasks.iter().filter(|task| task.operation == IndexOperation::Create).count() as u64)
    }

    pub fn remove_index(&self, wtxn: &mut RwTxn, task: &IndexTask) -> Result<()> {
        self.index_tasks.delete(wtxn, &task.id)?;
        self.update_document_index(wtxn, task.document, |bitmap| {
            bitmap.remove(task.id);
        })?;
        Ok(())
    }

    /// Every pending index task, in `(created_at, id)` order.
    pub fn all_index(&self, rtxn: &RoTxn<WithoutTls>) -> Result<Vec<IndexTask>> {
        let mut tasks = Vec::new();
        for entry in self.index_tasks.iter(rtxn)? {
            let (_, task) = entry?;
            tasks.push(task);
        }
        tasks.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(tasks)
    }

    pub fn preproc_len(&self, rtxn: &RoTxn<WithoutTls>) -> Result<u64> {
        Ok(self.preproc_tasks.len(rtxn)?)
    }

    fn update_hash_index(
        &self,
        wtxn: &mut RwTxn,
        database: Database<BEU32BytesCodec, RoaringBitmapCodec>,
        base: BaseId,
        hash: &ContentHash,
        f: impl Fn(&mut RoaringBitmap),
    ) -> Result<()> {
        let key = (base, hash.as_bytes());
        let mut bitmap = database.get(wtxn, &key)?.unwrap_or_default();
        f(&mut bitmap);
        if bitmap.is_empty() {
            database.delete(wtxn, &key)?;
        } else {
            database.put(wtxn, &key, &bitmap)?;
        }
        Ok(())
    }

    fn update_document_index(
        &self,
        wtxn: &mut RwTxn,
        document: DocumentId,
        f: impl Fn(&mut RoaringBitmap),
    ) -> Result<()> {
        let mut bitmap = self.index_by_document.get(wtxn, &document)?.unwrap_or_default();
        f(&mut bitmap);
        if bitmap.is_empty() {
            self.index_by_document.delete(wtxn, &document)?;
        } else {
            self.index_by_document.put(wtxn, &document, &bitmap)?;
        }
        Ok(())
    }
}
