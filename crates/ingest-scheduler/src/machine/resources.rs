use std::collections::BTreeSet;

use corpus_types::hash::ContentHash;
use corpus_types::resources::Resource;
use corpus_types::BaseId;
use heed::types::SerdeJson;
use heed::{Database, Env, RoTxn, RwTxn, WithoutTls};
use serde::{Deserialize, Serialize};

use super::codec::{BEU32BytesCodec, BEU32StrCodec};
use crate::Result;

/// The number of database used by the resource store
const NUMBER_OF_DATABASES: u32 = 2;
mod db_name {
    pub const RESOURCES: &str = "resources";
    pub const RESOURCES_BY_HASH: &str = "resources-by-hash";
}

/// The persisted part of a resource; the key carries `(base, external_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub hash: ContentHash,
    pub content_type: String,
    pub meta: serde_json::Value,
    pub updated_at: i64,
}

impl ResourceRecord {
    pub fn into_resource(self, base: BaseId, external_id: String) -> Resource {
        Resource {
            base,
            external_id,
            hash: self.hash,
            content_type: self.content_type,
            meta: self.meta,
            updated_at: self.updated_at,
        }
    }
}

pub struct ResourceStore {
    /// The main table, keyed by `(base, external_id)`.
    resources: Database<BEU32StrCodec, SerdeJson<ResourceRecord>>,
    /// External ids of the resources sharing a content hash in a base.
    by_hash: Database<BEU32BytesCodec, SerdeJson<BTreeSet<String>>>,
}

impl ResourceStore {
    pub(crate) const fn nb_db() -> u32 {
        NUMBER_OF_DATABASES
    }

    pub(crate) fn new(env: &Env<WithoutTls>, wtxn: &mut RwTxn) -> Result<ResourceStore> {
        Ok(ResourceStore {
            resources: env.create_database(wtxn, Some(db_name::RESOURCES))?,
            by_hash: env.create_database(wtxn, Some(db_name::RESOURCES_BY_HASH))?,
        })
    }

    pub fn get(
        &self,
        rtxn: &RoTxn<WithoutTls>,
        base: BaseId,
        external_id: &str,
    ) -> Result<Option<ResourceRecord>> {
        Ok(self.resources.get(rtxn, &(base, external_id))?)
    }

    pub fn insert(&self, wtxn: &mut RwTxn, resource: &Resource) -> Result<()> {
        let record = ResourceRecord {
            hash: resource.hash.clone(),
            content_type: resource.content_type.clone(),
            meta: resource.meta.clone(),
            updated_at: resource.updated_at,
        };
        self.resources.put(wtxn, &(resource.base, &resource.external_id), &record)?;
        self.add_hash_member(wtxn, resource.base, &resource.hash, &resource.external_id)?;
        Ok(())
    }

    /// Overwrite an existing row, keeping the hash index consistent.
    pub fn update(
        &self,
        wtxn: &mut RwTxn,
        resource: &Resource,
        origin: &ResourceRecord,
    ) -> Result<()> {
        let record = ResourceRecord {
            hash: resource.hash.clone(),
            content_type: resource.content_type.clone(),
            meta: resource.meta.clone(),
            updated_at: resource.updated_at,
        };
        self.resources.put(wtxn, &(resource.base, &resource.external_id), &record)?;
        if origin.hash != resource.hash {
            self.remove_hash_member(wtxn, resource.base, &origin.hash, &resource.external_id)?;
            self.add_hash_member(wtxn, resource.base, &resource.hash, &resource.external_id)?;
        }
        Ok(())
    }

    pub fn remove(
        &self,
        wtxn: &mut RwTxn,
        base: BaseId,
        external_id: &str,
    ) -> Result<Option<ResourceRecord>> {
        let Some(record) = self.resources.get(wtxn, &(base, external_id))? else {
            return Ok(None);
        };
        self.resources.delete(wtxn, &(base, external_id))?;
        self.remove_hash_member(wtxn, base, &record.hash, external_id)?;
        Ok(Some(record))
    }

    /// How many live resources of the base carry this hash.
    pub fn count_by_hash(
        &self,
        rtxn: &RoTxn<WithoutTls>,
        base: BaseId,
        hash: &ContentHash,
    ) -> Result<u64> {
        let members = self.by_hash.get(rtxn, &(base, hash.as_bytes()))?;
        Ok(members.map_or(0, |members| members.len() as u64))
    }

    /// The resources of the base carrying this hash, newest first.
    pub fn get_by_hash(
        &self,
        rtxn: &RoTxn<WithoutTls>,
        base: BaseId,
        hash: &ContentHash,
    ) -> Result<Vec<Resource>> {
        let Some(members) = self.by_hash.get(rtxn, &(base, hash.as_bytes()))? else {
            return Ok(Vec::new());
        };
        let mut resources = Vec::with_capacity(members.len());
        for external_id in members {
            let record = self
                .resources
                .get(rtxn, &(base, &external_id))?
                .ok_or(crate::Error::CorruptedTaskQueue)?;
            resources.push(record.into_resource(base, external_id));
        }
        resources.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(resources)
    }

    /// Every distinct content hash live in the base.
    pub fn hashes(&self, rtxn: &RoTxn<WithoutTls>, base: BaseId) -> Result<Vec<ContentHash>> {
        let mut hashes = Vec::new();
        for entry in self.by_hash.prefix_iter(rtxn, &(base, &[][..]))? {
            let ((_, hash), _) = entry?;
            hashes.push(ContentHash::from(hash));
        }
        Ok(hashes)
    }

    pub fn has_any(&self, rtxn: &RoTxn<WithoutTls>, base: BaseId) -> Result<bool> {
        let mut iter = self.resources.prefix_iter(rtxn, &(base, ""))?;
        Ok(iter.next().transpose()?.is_some())
    }

    /// Delete every resource row of the base.
    pub fn remove_all(&self, wtxn: &mut RwTxn, base: BaseId) -> Result<()> {
        let mut external_ids = Vec::new();
        for entry in self.resources.prefix_iter(wtxn, &(base, ""))? {
            let ((_, external_id), _) = entry?;
            external_ids.push(external_id.to_string());
        }
        for external_id in external_ids {
            self.resources.delete(wtxn, &(base, &external_id))?;
        }

        let mut hashes = Vec::new();
        for entry in self.by_hash.prefix_iter(wtxn, &(base, &[][..]))? {
            let ((_, hash), _) = entry?;
            hashes.push(hash.to_vec());
        }
        for hash in hashes {
            self.by_hash.delete(wtxn, &(base, &hash))?;
        }
        Ok(())
    }

    fn add_hash_member(
        &self,
        wtxn: &mut RwTxn,
        base: BaseId,
        hash: &ContentHash,
        external_id: &str,
    ) -> Result<()> {
        let key = (base, hash.as_bytes());
        let mut members = self.by_hash.get(wtxn, &key)?.unwrap_or_default();
        members.insert(external_id.to_string());
        self.by_hash.put(wtxn, &key, &members)?;
        Ok(())
    }

    fn remove_hash_member(
        &self,
        wtxn: &mut RwTxn,
        base: BaseId,
        hash: &ContentHash,
        external_id: &str,
    ) -> Result<()> {
        let key = (base, hash.as_bytes());
        let mut members = self.by_hash.get(wtxn, &key)?.unwrap_or_default();
        members.remove(external_id);
        if members.is_empty() {
            self.by_hash.delete(wtxn, &key)?;
        } else {
            self.by_hash.put(wtxn, &key, &members)?;
        }
        Ok(())
    }
}
