use heed::types::SerdeJson;
use heed::{Database, Env, RoTxn, RwTxn, WithoutTls};
use serde::{Deserialize, Serialize};

use corpus_types::BaseId;

use crate::{ModuleUid, Result, BEU32};

/// The number of database used by the base store
const NUMBER_OF_DATABASES: u32 = 1;
mod db_name {
    pub const KNOWLEDGE_BASES: &str = "knowledge-bases";
}

/// The persisted part of a knowledge base; the resource module is stored by
/// internal id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBaseRecord {
    pub resource_module: ModuleUid,
    pub resource_params: serde_json::Value,
}

pub struct BaseStore {
    bases: Database<BEU32, SerdeJson<KnowledgeBaseRecord>>,
}

impl BaseStore {
    pub(crate) const fn nb_db() -> u32 {
        NUMBER_OF_DATABASES
    }

    pub(crate) fn new(env: &Env<WithoutTls>, wtxn: &mut RwTxn) -> Result<BaseStore> {
        Ok(BaseStore { bases: env.create_database(wtxn, Some(db_name::KNOWLEDGE_BASES))? })
    }

    pub fn create(&self, wtxn: &mut RwTxn, record: &KnowledgeBaseRecord) -> Result<BaseId> {
        let id = self.bases.last(wtxn)?.map_or(0, |(id, _)| id + 1);
        self.bases.put(wtxn, &id, record)?;
        Ok(id)
    }

    pub fn get(&self, rtxn: &RoTxn<WithoutTls>, id: BaseId) -> Result<Option<KnowledgeBaseRecord>> {
        Ok(self.bases.get(rtxn, &id)?)
    }

    pub fn all(&self, rtxn: &RoTxn<WithoutTls>) -> Result<Vec<(BaseId, KnowledgeBaseRecord)>> {
        let mut bases = Vec::new();
        for entry in self.bases.iter(rtxn)? {
            bases.push(entry?);
        }
        Ok(bases)
    }

    pub fn delete(&self, wtxn: &mut RwTxn, id: BaseId) -> Result<bool> {
        Ok(self.bases.delete(wtxn, &id)?)
    }

    /// Probe the database, for health checks.
    pub(crate) fn check(&self, rtxn: &RoTxn<WithoutTls>) -> Result<()> {
        self.bases.first(rtxn)?;
        Ok(())
    }
}
