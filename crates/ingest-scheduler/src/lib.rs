/*!
This crate defines the ingestion core of corpus, which is responsible for:
1. Keeping the persistent, content-addressed task graph that coordinates
   scanning, preprocessing and indexing over every registered knowledge
   base.
2. Driving that graph to quiescence on each [`Engine::scan`] call, with a
   resizable worker pool and cooperative cancellation.

All persisted state lives in one LMDB environment owned by the
[`StateMachine`]; an interrupted ingestion resumes from it on the next
scan. The machine is only ever mutated from the thread running the scan:
scan workers hand their resource events over through a rendezvous
primitive, and pool workers return typed continuations that the main
thread applies.
*/

pub mod error;
mod machine;
mod process_hub;
mod reporter;
mod scan_hub;
#[cfg(test)]
mod test_utils;
mod thread_pool;
mod utils;
mod waker;

use std::collections::BTreeMap;
use std::path::PathBuf;

use corpus_types::events::EventListener;
use corpus_types::hash::ContentHash;
use corpus_types::interruption::Interruption;
use corpus_types::modules::{IndexModule, ModuleHandle, PreprocessingModule, ResourceModule};
use corpus_types::resources::{KnowledgeBase, Resource};
use corpus_types::BaseId;
pub use error::Error;
pub use machine::{
    Document, DocumentDescription, FromResource, HandleIndexEvent, IndexOperation, IndexTask,
    MachineState, PreprocessingEvent, PreprocessingTask, RemovedResourceEvent, StateMachine,
};
use process_hub::ProcessHub;
use reporter::EventReporter;
use scan_hub::ScanHub;
use workspace_store::WorkspaceStore;

pub type Result<T, E = Error> = std::result::Result<T, E>;
pub type TaskId = u32;
pub type DocumentId = u32;
pub type ModuleUid = u32;

pub(crate) type BEU32 = heed::types::U32<heed::byteorder::BE>;

pub struct EngineOptions {
    /// The path to the folder containing the task databases.
    pub db_path: PathBuf,
    /// The root of the on-disk preprocessing workspaces.
    pub workspace_path: PathBuf,
    /// The maximum size, in bytes, of the task databases.
    pub task_db_size: usize,
    /// How many knowledge bases are scanned in parallel.
    pub scan_workers: usize,
    /// How many preprocessing/indexing payloads run in parallel.
    pub process_workers: usize,
    /// Every plugin module the engine may dispatch to, in any order.
    pub modules: Vec<ModuleHandle>,
    /// Receives the typed observability events. `None` disables reporting.
    pub listener: Option<EventListener>,
}

/// Structure which owns the state machine and both hubs and drives a full
/// ingestion pass over every registered knowledge base.
pub struct Engine {
    machine: StateMachine,
    scan_hub: ScanHub,
    process_hub: ProcessHub,
    interruption: Interruption,
    scan_workers: usize,
    process_workers: usize,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Result<Engine> {
        let reporter = EventReporter::new(options.listener);
        let interruption = Interruption::new();
        let machine = StateMachine::new(&options.db_path, options.task_db_size, options.modules)?;
        let workspace = WorkspaceStore::new(&options.workspace_path)?;
        let scan_hub = ScanHub::new(reporter.clone(), interruption.clone());
        let process_hub = ProcessHub::new(workspace, reporter, interruption.clone());

        Ok(Engine {
            machine,
            scan_hub,
            process_hub,
            interruption,
            scan_workers: options.scan_workers.max(1),
            process_workers: options.process_workers.max(1),
        })
    }

    /// A clone of the process-wide cancellation token. Raising it makes the
    /// running scan unwind at the next safe point.
    pub fn interruption(&self) -> Interruption {
        self.interruption.clone()
    }

    pub fn state(&self) -> MachineState {
        self.machine.state()
    }

    /// Run one full ingestion pass: re-drain any tasks left over from an
    /// interrupted run, scan every base, process the resulting task graph
    /// to quiescence and return to the setting state.
    pub fn scan(&mut self) -> Result<()> {
        self.interruption.reset();
        if self.machine.state() == MachineState::Processing {
            self.process_hub.run(&mut self.machine, self.process_workers)?;
        }
        self.scan_hub.run(&mut self.machine, self.scan_workers)?;
        self.process_hub.run(&mut self.machine, self.process_workers)?;
        self.machine.goto_setting();
        Ok(())
    }

    pub fn create_knowledge_base(
        &mut self,
        resource_module: &str,
        resource_params: serde_json::Value,
    ) -> Result<KnowledgeBase> {
        self.machine.create_knowledge_base(resource_module, resource_params)
    }

    /// Remove a knowledge base and everything derived from it: the index
    /// removal tasks emitted for its documents are drained before the base
    /// row is deleted.
    pub fn remove_knowledge_base(&mut self, base: &KnowledgeBase) -> Result<()> {
        self.machine.clean_resources(-1, base)?;
        self.process_hub.run(&mut self.machine, self.process_workers)?;
        self.machine.goto_setting();
        self.machine.remove_knowledge_base(base)
    }

    pub fn knowledge_base(&self, id: BaseId) -> Result<KnowledgeBase> {
        self.machine.knowledge_base(id)
    }

    pub fn knowledge_bases(&self) -> Result<Vec<KnowledgeBase>> {
        self.machine.knowledge_bases()
    }

    /// The live resources of a base sharing a content hash, newest first.
    pub fn resources(&self, base: BaseId, hash: &ContentHash) -> Result<Vec<Resource>> {
        self.machine.resources(base, hash)
    }

    /// Look up a document by its identity `(base, preproc module, hash)`.
    pub fn document(
        &self,
        base: BaseId,
        preproc_module: &str,
        hash: &ContentHash,
    ) -> Result<Option<Document>> {
        self.machine.document(base, preproc_module, hash)
    }

    /// Look up a registered resource module by its stable id.
    pub fn resource_module(&self, id: &str) -> Result<std::sync::Arc<dyn ResourceModule>> {
        self.machine.resource_module(id)
    }

    /// Look up a registered preprocessing module by its stable id.
    pub fn preproc_module(&self, id: &str) -> Result<std::sync::Arc<dyn PreprocessingModule>> {
        self.machine.preproc_module(id)
    }

    /// Look up a registered index module by its stable id.
    pub fn index_module(&self, id: &str) -> Result<std::sync::Arc<dyn IndexModule>> {
        self.machine.index_module(id)
    }

    /// Pending work counts, mostly for monitoring.
    pub fn stats(&self) -> Result<BTreeMap<String, u64>> {
        self.machine.stats()
    }

    /// Return `Ok(())` if the engine is able to access its databases.
    pub fn health(&self) -> Result<()> {
        self.machine.health()
    }
}
