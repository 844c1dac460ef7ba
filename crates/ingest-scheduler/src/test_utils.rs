//! Stub plugin modules and builders shared by the test suites.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use big_s::S;
use corpus_types::events::Event;
use corpus_types::hash::ContentHash;
use corpus_types::interruption::Interruption;
use corpus_types::modules::{
    IndexAddition, IndexModule, IndexRemoval, Module, ModuleHandle, ModuleResult,
    PreprocessContext, PreprocessingModule, PreprocessingOutcome, ResourceModule,
};
use corpus_types::resources::{KnowledgeBase, Resource, ResourceEvent, Updating};
use corpus_types::{BaseId, EventId};
use tempfile::TempDir;

use crate::machine::{DocumentDescription, StateMachine};
use crate::{Engine, EngineOptions};

pub(crate) const TEST_DB_SIZE: usize = 10 * 1024 * 1024; // 10 MiB

pub(crate) fn hash(bytes: &[u8]) -> ContentHash {
    ContentHash::new(bytes)
}

pub(crate) fn resource(base: BaseId, external_id: &str, hash_bytes: &[u8]) -> Resource {
    Resource {
        base,
        external_id: external_id.to_string(),
        hash: hash(hash_bytes),
        content_type: S("application/pdf"),
        meta: serde_json::Value::Null,
        updated_at: 0,
    }
}

pub(crate) fn document(hash_bytes: &[u8], path: &str) -> DocumentDescription {
    DocumentDescription {
        document_hash: hash(hash_bytes),
        path: PathBuf::from(path),
        meta: serde_json::Value::Null,
    }
}

pub(crate) fn scan_event(
    id: EventId,
    resource: Resource,
    updating: Updating,
) -> ResourceEvent {
    let path = PathBuf::from(&resource.external_id);
    ResourceEvent { id, resource, path, updating }
}

/// A resource module whose scan passes are scripted by the test. Each
/// call to `scan` consumes the next scripted pass; an exhausted script
/// yields empty scans.
pub(crate) struct StubResourceModule {
    id: String,
    preproc_ids: Vec<String>,
    index_ids: Vec<String>,
    scans: Mutex<VecDeque<Vec<ModuleResult<ResourceEvent>>>>,
    pub completed_events: Mutex<Vec<EventId>>,
    pub completed_scans: AtomicUsize,
}

impl StubResourceModule {
    pub fn new(id: &str, preproc_ids: &[&str], index_ids: &[&str]) -> Arc<StubResourceModule> {
        Arc::new(StubResourceModule {
            id: id.to_string(),
            preproc_ids: preproc_ids.iter().map(|id| id.to_string()).collect(),
            index_ids: index_ids.iter().map(|id| id.to_string()).collect(),
            scans: Mutex::new(VecDeque::new()),
            completed_events: Mutex::new(Vec::new()),
            completed_scans: AtomicUsize::new(0),
        })
    }

    pub fn push_scan(&self, events: Vec<ResourceEvent>) {
        self.scans.lock().unwrap().push_back(events.into_iter().map(Ok).collect());
    }

    /// Script a scan pass that aborts with an error after its events.
    pub fn push_failing_scan(&self, events: Vec<ResourceEvent>, error: &str) {
        let mut pass: Vec<ModuleResult<ResourceEvent>> = events.into_iter().map(Ok).collect();
        pass.push(Err(anyhow::anyhow!("{error}").into()));
        self.scans.lock().unwrap().push_back(pass);
    }
}

impl Module for StubResourceModule {
    fn id(&self) -> &str {
        &self.id
    }
}

impl ResourceModule for StubResourceModule {
    fn scan<'a>(
        &'a self,
        _base: &KnowledgeBase,
    ) -> ModuleResult<Box<dyn Iterator<Item = ModuleResult<ResourceEvent>> + Send + 'a>> {
        let events = self.scans.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::new(events.into_iter()))
    }

    fn complete_event(&self, event: &ResourceEvent) -> ModuleResult<()> {
        self.completed_events.lock().unwrap().push(event.id);
        Ok(())
    }

    fn complete_scanning(&self, _base: &KnowledgeBase) -> ModuleResult<()> {
        self.completed_scans.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn preprocess_module_ids(&self, _base: &KnowledgeBase, _content_type: &str) -> Vec<String> {
        self.preproc_ids.clone()
    }

    fn index_module_ids(&self, _base: &KnowledgeBase) -> Vec<String> {
        self.index_ids.clone()
    }
}

/// A preprocessing module producing scripted outcomes per resource hash.
/// Results not flagged `from_cache` are materialized in the workspace.
pub(crate) struct StubPreprocessingModule {
    id: String,
    outcomes: Mutex<HashMap<Vec<u8>, Vec<PreprocessingOutcome>>>,
    pub fail_hashes: Mutex<HashSet<Vec<u8>>>,
    pub accept: std::sync::atomic::AtomicBool,
    pub calls: AtomicUsize,
}

impl StubPreprocessingModule {
    pub fn new(id: &str) -> Arc<StubPreprocessingModule> {
        Arc::new(StubPreprocessingModule {
            id: id.to_string(),
            outcomes: Mutex::new(HashMap::new()),
            fail_hashes: Mutex::new(HashSet::new()),
            accept: std::sync::atomic::AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_outcomes(&self, resource_hash: &[u8], outcomes: Vec<PreprocessingOutcome>) {
        self.outcomes.lock().unwrap().insert(resource_hash.to_vec(), outcomes);
    }

    pub fn fail_on(&self, resource_hash: &[u8]) {
        self.fail_hashes.lock().unwrap().insert(resource_hash.to_vec());
    }

    pub fn recover(&self, resource_hash: &[u8]) {
        self.fail_hashes.lock().unwrap().remove(resource_hash);
    }
}

impl Module for StubPreprocessingModule {
    fn id(&self) -> &str {
        &self.id
    }
}

impl PreprocessingModule for StubPreprocessingModule {
    fn acceptant(
        &self,
        _base: BaseId,
        _resource_hash: &ContentHash,
        _resource_path: &std::path::Path,
        _content_type: &str,
    ) -> bool {
        self.accept.load(Ordering::SeqCst)
    }

    fn preprocess(&self, ctx: PreprocessContext<'_>) -> ModuleResult<Vec<PreprocessingOutcome>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ctx.interruption.check()?;
        if self.fail_hashes.lock().unwrap().contains(ctx.resource_hash.as_bytes()) {
            return Err(anyhow::anyhow!("scripted preprocessing failure").into());
        }
        let mut outcomes = self
            .outcomes
            .lock()
            .unwrap()
            .get(ctx.resource_hash.as_bytes())
            .cloned()
            .unwrap_or_default();
        for outcome in &mut outcomes {
            // reuse the previous derived file when the cache survived,
            // otherwise reproduce it in the workspace
            if outcome.from_cache && ctx.latest_cache_path.is_none() {
                outcome.from_cache = false;
            }
            if !outcome.from_cache {
                std::fs::write(ctx.workspace_path.join(&outcome.path), outcome.hash.as_bytes())
                    .map_err(anyhow::Error::from)?;
            }
        }
        (ctx.report_progress)(1.0);
        Ok(outcomes)
    }
}

/// An index module recording every call; `interrupt_on_add` makes the next
/// `add` raise the given interruption and fail with it.
pub(crate) struct StubIndexModule {
    id: String,
    pub added: Mutex<Vec<ContentHash>>,
    pub removed: Mutex<Vec<ContentHash>>,
    pub fail_next_add: std::sync::atomic::AtomicBool,
    pub interrupt_on_add: Mutex<Option<Interruption>>,
}

impl StubIndexModule {
    pub fn new(id: &str) -> Arc<StubIndexModule> {
        Arc::new(StubIndexModule {
            id: id.to_string(),
            added: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            fail_next_add: std::sync::atomic::AtomicBool::new(false),
            interrupt_on_add: Mutex::new(None),
        })
    }

    pub fn added_hashes(&self) -> Vec<ContentHash> {
        self.added.lock().unwrap().clone()
    }

    pub fn removed_hashes(&self) -> Vec<ContentHash> {
        self.removed.lock().unwrap().clone()
    }
}

impl Module for StubIndexModule {
    fn id(&self) -> &str {
        &self.id
    }
}

impl IndexModule for StubIndexModule {
    fn add(&self, addition: IndexAddition<'_>) -> ModuleResult<()> {
        if let Some(interruption) = self.interrupt_on_add.lock().unwrap().take() {
            interruption.interrupt();
            addition.interruption.check()?;
        }
        if self.fail_next_add.swap(false, Ordering::SeqCst) {
            return Err(anyhow::anyhow!("scripted index failure").into());
        }
        (addition.report_progress)(1.0);
        self.added.lock().unwrap().push(addition.document_hash.clone());
        Ok(())
    }

    fn remove(&self, removal: IndexRemoval<'_>) -> ModuleResult<()> {
        (removal.report_progress)(1.0);
        self.removed.lock().unwrap().push(removal.document_hash.clone());
        Ok(())
    }
}

pub(crate) fn machine_with(modules: Vec<ModuleHandle>) -> (StateMachine, TempDir) {
    let tempdir = TempDir::new().unwrap();
    let machine = StateMachine::new(&tempdir.path().join("db"), TEST_DB_SIZE, modules).unwrap();
    (machine, tempdir)
}

pub(crate) fn reopen_machine(tempdir: &TempDir, modules: Vec<ModuleHandle>) -> StateMachine {
    StateMachine::new(&tempdir.path().join("db"), TEST_DB_SIZE, modules).unwrap()
}

/// The default machine under test: one resource module driving one
/// preprocessing and one index module.
pub(crate) fn stub_machine() -> (
    StateMachine,
    Arc<StubResourceModule>,
    Arc<StubPreprocessingModule>,
    Arc<StubIndexModule>,
    TempDir,
) {
    let resource_module = StubResourceModule::new("stub-resources", &["stub-preproc"], &["stub-index"]);
    let preproc_module = StubPreprocessingModule::new("stub-preproc");
    let index_module = StubIndexModule::new("stub-index");
    let (machine, tempdir) = machine_with(vec![
        ModuleHandle::Resource(resource_module.clone()),
        ModuleHandle::Preprocessing(preproc_module.clone()),
        ModuleHandle::Index(index_module.clone()),
    ]);
    (machine, resource_module, preproc_module, index_module, tempdir)
}

pub(crate) struct EngineHandle {
    pub engine: Engine,
    pub resource_module: Arc<StubResourceModule>,
    pub preproc_module: Arc<StubPreprocessingModule>,
    pub index_module: Arc<StubIndexModule>,
    pub events: Arc<Mutex<Vec<Event>>>,
    pub tempdir: TempDir,
}

impl EngineHandle {
    pub fn new() -> EngineHandle {
        let tempdir = TempDir::new().unwrap();
        EngineHandle::with_tempdir(tempdir)
    }

    /// (Re)open an engine over the given directory with fresh stub
    /// modules, the way a restarted process would.
    pub fn with_tempdir(tempdir: TempDir) -> EngineHandle {
        let resource_module =
            StubResourceModule::new("stub-resources", &["stub-preproc"], &["stub-index"]);
        let preproc_module = StubPreprocessingModule::new("stub-preproc");
        let index_module = StubIndexModule::new("stub-index");
        let events = Arc::new(Mutex::new(Vec::new()));
        let listener: corpus_types::events::EventListener = {
            let events = events.clone();
            Arc::new(move |event| events.lock().unwrap().push(event))
        };

        let engine = Engine::new(EngineOptions {
            db_path: tempdir.path().join("db"),
            workspace_path: tempdir.path().join("workspace"),
            task_db_size: TEST_DB_SIZE,
            scan_workers: 2,
            process_workers: 2,
            modules: vec![
                ModuleHandle::Resource(resource_module.clone()),
                ModuleHandle::Preprocessing(preproc_module.clone()),
                ModuleHandle::Index(index_module.clone()),
            ],
            listener: Some(listener),
        })
        .unwrap();

        EngineHandle { engine, resource_module, preproc_module, index_module, events, tempdir }
    }

    /// Tear the engine down and reopen it over the same directories.
    pub fn restart(self) -> EngineHandle {
        let EngineHandle { engine, tempdir, .. } = self;
        drop(engine);
        EngineHandle::with_tempdir(tempdir)
    }
}
