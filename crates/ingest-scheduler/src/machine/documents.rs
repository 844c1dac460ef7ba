use std::collections::BTreeSet;
use std::path::PathBuf;

use corpus_types::hash::ContentHash;
use corpus_types::BaseId;
use heed::types::SerdeJson;
use heed::{Database, Env, RoTxn, RwTxn, WithoutTls};
use serde::{Deserialize, Serialize};

use super::codec::{BEU32U32BytesCodec, RoaringBitmapCodec};
use super::DocumentDescription;
use crate::{DocumentId, Error, ModuleUid, Result, BEU32};

/// The number of database used by the document store
const NUMBER_OF_DATABASES: u32 = 5;
mod db_name {
    pub const DOCUMENTS: &str = "documents";
    pub const DOCUMENTS_BY_HASH: &str = "documents-by-hash";
    pub const DOCUMENT_REFS: &str = "document-refs";
    pub const REFS_BY_RESOURCE: &str = "document-refs-by-resource";
    pub const REFS_BY_DOCUMENT: &str = "document-refs-by-document";
}

/// A derived artifact produced by a preprocessing module. Immutable once
/// appended; `resource_hash` is the hash whose preprocessing first produced
/// it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub preproc_module: ModuleUid,
    pub base: BaseId,
    pub resource_hash: ContentHash,
    pub document_hash: ContentHash,
    pub path: PathBuf,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentRecord {
    preproc_module: ModuleUid,
    base: BaseId,
    resource_hash: ContentHash,
    document_hash: ContentHash,
    path: PathBuf,
    meta: serde_json::Value,
}

/// One reference row: which `(preproc module, base, resource hash)` owns a
/// reference to which document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentRefRecord {
    preproc_module: ModuleUid,
    base: BaseId,
    resource_hash: ContentHash,
    document: DocumentId,
}

pub struct DocumentStore {
    /// The main table, every live document by id.
    documents: Database<BEU32, SerdeJson<DocumentRecord>>,
    /// Document identity `(preproc module, base, document hash) -> id`.
    by_doc_hash: Database<BEU32U32BytesCodec, BEU32>,
    /// Every reference row by id.
    refs: Database<BEU32, SerdeJson<DocumentRefRecord>>,
    /// Reference ids keyed by `(preproc module, base, resource hash)`.
    refs_by_resource: Database<BEU32U32BytesCodec, RoaringBitmapCodec>,
    /// Reference ids keyed by the referenced document.
    refs_by_document: Database<BEU32, RoaringBitmapCodec>,
}

impl DocumentStore {
    pub(crate) const fn nb_db() -> u32 {
        NUMBER_OF_DATABASES
    }

    pub(crate) fn new(env: &Env<WithoutTls>, wtxn: &mut RwTxn) -> Result<DocumentStore> {
        Ok(DocumentStore {
            documents: env.create_database(wtxn, Some(db_name::DOCUMENTS))?,
            by_doc_hash: env.create_database(wtxn, Some(db_name::DOCUMENTS_BY_HASH))?,
            refs: env.create_database(wtxn, Some(db_name::DOCUMENT_REFS))?,
            refs_by_resource: env.create_database(wtxn, Some(db_name::REFS_BY_RESOURCE))?,
            refs_by_document: env.create_database(wtxn, Some(db_name::REFS_BY_DOCUMENT))?,
        })
    }

    /// Append a document and a reference row for it.
    ///
    /// When the identity `(preproc module, base, document hash)` already
    /// exists, only a new reference row is added.
    pub fn append(
        &self,
        wtxn: &mut RwTxn,
        preproc_module: ModuleUid,
        base: BaseId,
        resource_hash: &ContentHash,
        description: &DocumentDescription,
    ) -> Result<Document> {
        let identity = (preproc_module, base, description.document_hash.as_bytes());
        let id = match self.by_doc_hash.get(wtxn, &identity)? {
            Some(id) => id,
            None => {
                let id = self.documents.last(wtxn)?.map_or(0, |(id, _)| id + 1);
                let record = DocumentRecord {
                    preproc_module,
                    base,
                    resource_hash: resource_hash.clone(),
                    document_hash: description.document_hash.clone(),
                    path: description.path.clone(),
                    meta: description.meta.clone(),
                };
                self.documents.put(wtxn, &id, &record)?;
                self.by_doc_hash.put(wtxn, &identity, &id)?;
                id
            }
        };

        let ref_id = self.refs.last(wtxn)?.map_or(0, |(id, _)| id + 1);
        let ref_record =
            DocumentRefRecord { preproc_module, base, resource_hash: resource_hash.clone(), document: id };
        self.refs.put(wtxn, &ref_id, &ref_record)?;

        let resource_key = (preproc_module, base, resource_hash.as_bytes());
        let mut by_resource = self.refs_by_resource.get(wtxn, &resource_key)?.unwrap_or_default();
        by_resource.insert(ref_id);
        self.refs_by_resource.put(wtxn, &resource_key, &by_resource)?;

        let mut by_document = self.refs_by_document.get(wtxn, &id)?.unwrap_or_default();
        by_document.insert(ref_id);
        self.refs_by_document.put(wtxn, &id, &by_document)?;

        self.get(wtxn, id)?.ok_or(Error::CorruptedTaskQueue)
    }

    pub fn get(&self, rtxn: &RoTxn<WithoutTls>, id: DocumentId) -> Result<Option<Document>> {
        let Some(record) = self.documents.get(rtxn, &id)? else { return Ok(None) };
        Ok(Some(Document {
            id,
            preproc_module: record.preproc_module,
            base: record.base,
            resource_hash: record.resource_hash,
            document_hash: record.document_hash,
            path: record.path,
            meta: record.meta,
        }))
    }

    pub fn get_by_hash(
        &self,
        rtxn: &RoTxn<WithoutTls>,
        preproc_module: ModuleUid,
        base: BaseId,
        document_hash: &ContentHash,
    ) -> Result<Option<Document>> {
        let identity = (preproc_module, base, document_hash.as_bytes());
        match self.by_doc_hash.get(rtxn, &identity)? {
            Some(id) => self.get(rtxn, id),
            None => Ok(None),
        }
    }

    /// The distinct documents referenced from `(preproc module, base,
    /// resource hash)`, in id order.
    pub fn documents_by_resource(
        &self,
        rtxn: &RoTxn<WithoutTls>,
        preproc_module: ModuleUid,
        base: BaseId,
        resource_hash: &ContentHash,
    ) -> Result<Vec<Document>> {
        let key = (preproc_module, base, resource_hash.as_bytes());
        let Some(ref_ids) = self.refs_by_resource.get(rtxn, &key)? else {
            return Ok(Vec::new());
        };
        let mut ids = BTreeSet::new();
        for ref_id in ref_ids {
            let record = self.refs.get(rtxn, &ref_id)?.ok_or(Error::CorruptedTaskQueue)?;
            ids.insert(record.document);
        }
        let mut documents = Vec::with_capacity(ids.len());
        for id in ids {
            documents.push(self.get(rtxn, id)?.ok_or(Error::CorruptedTaskQueue)?);
        }
        Ok(documents)
    }

    /// Delete every reference row owned by `(preproc module, base,
    /// resource hash)`.
    pub fn remove_refs_by_resource(
        &self,
        wtxn: &mut RwTxn,
        preproc_module: ModuleUid,
        base: BaseId,
        resource_hash: &ContentHash,
    ) -> Result<()> {
        let key = (preproc_module, base, resource_hash.as_bytes());
        let Some(ref_ids) = self.refs_by_resource.get(wtxn, &key)? else { return Ok(()) };
        for ref_id in ref_ids {
            let record = self.refs.get(wtxn, &ref_id)?.ok_or(Error::CorruptedTaskQueue)?;
            self.refs.delete(wtxn, &ref_id)?;

            let mut by_document =
                self.refs_by_document.get(wtxn, &record.document)?.unwrap_or_default();
            by_document.remove(ref_id);
            if by_document.is_empty() {
                self.refs_by_document.delete(wtxn, &record.document)?;
            } else {
                self.refs_by_document.put(wtxn, &record.document, &by_document)?;
            }
        }
        self.refs_by_resource.delete(wtxn, &key)?;
        Ok(())
    }

    /// How many reference rows point at the document.
    pub fn refs_count(&self, rtxn: &RoTxn<WithoutTls>, id: DocumentId) -> Result<u64> {
        Ok(self.refs_by_document.get(rtxn, &id)?.map_or(0, |bitmap| bitmap.len()))
    }

    /// Delete the document row itself; its reference rows must be gone.
    pub fn remove(&self, wtxn: &mut RwTxn, document: &Document) -> Result<()> {
        self.documents.delete(wtxn, &document.id)?;
        let identity =
            (document.preproc_module, document.base, document.document_hash.as_bytes());
        self.by_doc_hash.delete(wtxn, &identity)?;
        self.refs_by_document.delete(wtxn, &document.id)?;
        Ok(())
    }

    #[cfg(test)]
    pub fn all(&self, rtxn: &RoTxn<WithoutTls>) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        for entry in self.documents.iter(rtxn)? {
            let (id, _) = entry?;
            documents.push(self.get(rtxn, id)?.ok_or(Error::CorruptedTaskQueue)?);
        }
        Ok(documents)
    }

    #[cfg(test)]
    pub fn all_ref_counts(&self, rtxn: &RoTxn<WithoutTls>) -> Result<Vec<(DocumentId, u64)>> {
        let mut counts = Vec::new();
        for entry in self.refs_by_document.iter(rtxn)? {
            let (id, bitmap) = entry?;
            counts.push((id, bitmap.len()));
        }
        Ok(counts)
    }
}
