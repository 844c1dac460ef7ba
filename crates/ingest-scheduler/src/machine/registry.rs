use std::collections::HashMap;
use std::sync::Arc;

use corpus_types::modules::{
    IndexModule, ModuleHandle, ModuleKind, PreprocessingModule, ResourceModule,
};
use heed::types::{SerdeJson, Str};
use heed::{Database, Env, RwTxn, WithoutTls};
use serde::{Deserialize, Serialize};

use crate::{Error, ModuleUid, Result, BEU32};

/// The number of database used by the module registry
const NUMBER_OF_DATABASES: u32 = 2;
mod db_name {
    pub const MODULE_BINDINGS: &str = "module-bindings";
    pub const MODULE_UIDS: &str = "module-uids";
}

/// One persisted binding of a stable module id to a dense internal id.
///
/// Every persisted foreign key references the internal id, so bindings are
/// never deleted; a binding whose module is absent at startup simply stays
/// unresolvable until the module comes back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleBinding {
    pub uid: ModuleUid,
    pub kind: ModuleKind,
    pub string_id: String,
}

/// Maps the plugin modules to stable integer ids, persisted across
/// restarts.
pub struct ModuleRegistry {
    /// Every binding ever allocated, keyed by internal id.
    bindings: Database<BEU32, SerdeJson<ModuleBinding>>,
    /// Reverse lookup from the stable string id.
    uids: Database<Str, BEU32>,

    modules: HashMap<ModuleUid, ModuleHandle>,
    by_string: HashMap<String, ModuleUid>,
}

impl ModuleRegistry {
    pub(crate) const fn nb_db() -> u32 {
        NUMBER_OF_DATABASES
    }

    pub(crate) fn new(
        env: &Env<WithoutTls>,
        wtxn: &mut RwTxn,
        handles: Vec<ModuleHandle>,
    ) -> Result<ModuleRegistry> {
        let bindings: Database<BEU32, SerdeJson<ModuleBinding>> =
            env.create_database(wtxn, Some(db_name::MODULE_BINDINGS))?;
        let uids: Database<Str, BEU32> = env.create_database(wtxn, Some(db_name::MODULE_UIDS))?;

        let mut modules = HashMap::new();
        let mut by_string = HashMap::new();
        for handle in handles {
            let string_id = handle.id().to_string();
            let uid = match uids.get(wtxn, &string_id)? {
                Some(uid) => {
                    let binding =
                        bindings.get(wtxn, &uid)?.ok_or(Error::CorruptedTaskQueue)?;
                    // a reused stable id must not silently re-type a module
                    if binding.kind != handle.kind() {
                        return Err(Error::ModuleKindMismatch {
                            id: string_id,
                            expected: binding.kind,
                            found: handle.kind(),
                        });
                    }
                    uid
                }
                None => {
                    let uid = bindings.last(wtxn)?.map_or(0, |(uid, _)| uid + 1);
                    let binding =
                        ModuleBinding { uid, kind: handle.kind(), string_id: string_id.clone() };
                    bindings.put(wtxn, &uid, &binding)?;
                    uids.put(wtxn, &string_id, &uid)?;
                    uid
                }
            };
            modules.insert(uid, handle);
            by_string.insert(string_id, uid);
        }

        Ok(ModuleRegistry { bindings, uids, modules, by_string })
    }

    pub fn uid(&self, string_id: &str) -> Result<ModuleUid> {
        self.by_string
            .get(string_id)
            .copied()
            .ok_or_else(|| Error::ModuleNotFound(string_id.to_string()))
    }

    pub fn get(&self, uid: ModuleUid) -> Result<&ModuleHandle> {
        self.modules.get(&uid).ok_or(Error::UnknownModuleUid(uid))
    }

    pub fn string_id(&self, uid: ModuleUid) -> Result<&str> {
        Ok(self.get(uid)?.id())
    }

    pub fn resource_module(&self, uid: ModuleUid) -> Result<Arc<dyn ResourceModule>> {
        match self.get(uid)? {
            ModuleHandle::Resource(module) => Ok(module.clone()),
            other => Err(kind_mismatch(other, ModuleKind::Resource)),
        }
    }

    pub fn preprocessing_module(&self, uid: ModuleUid) -> Result<Arc<dyn PreprocessingModule>> {
        match self.get(uid)? {
            ModuleHandle::Preprocessing(module) => Ok(module.clone()),
            other => Err(kind_mismatch(other, ModuleKind::Preprocessing)),
        }
    }

    pub fn index_module(&self, uid: ModuleUid) -> Result<Arc<dyn IndexModule>> {
        match self.get(uid)? {
            ModuleHandle::Index(module) => Ok(module.clone()),
            other => Err(kind_mismatch(other, ModuleKind::Index)),
        }
    }

    /// The internal ids of the declared preprocessing modules among `ids`.
    /// Unknown ids and modules of another kind are skipped.
    pub fn preprocessing_uids(&self, ids: &[String]) -> Vec<ModuleUid> {
        self.uids_of_kind(ids, ModuleKind::Preprocessing)
    }

    /// The internal ids of the declared index modules among `ids`.
    /// Unknown ids and modules of another kind are skipped.
    pub fn index_uids(&self, ids: &[String]) -> Vec<ModuleUid> {
        self.uids_of_kind(ids, ModuleKind::Index)
    }

    fn uids_of_kind(&self, ids: &[String], kind: ModuleKind) -> Vec<ModuleUid> {
        ids.iter()
            .filter_map(|id| self.by_string.get(id.as_str()).copied())
            .filter(|uid| self.modules.get(uid).is_some_and(|m| m.kind() == kind))
            .collect()
    }

    /// Probe one registry database, for health checks.
    pub(crate) fn check(&self, rtxn: &heed::RoTxn<WithoutTls>) -> Result<()> {
        self.bindings.first(rtxn)?;
        self.uids.first(rtxn)?;
        Ok(())
    }
}

fn kind_mismatch(handle: &ModuleHandle, expected: ModuleKind) -> Error {
    Error::ModuleKindMismatch {
        id: handle.id().to_string(),
        expected,
        found: handle.kind(),
    }
}
