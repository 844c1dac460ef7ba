//! Drains the three event streams exposed by the machine under
//! processing, dispatches each to the worker pool and applies the
//! returned continuations on the main thread.
//!
//! A round pumps events out of the machine until the three pops run dry,
//! then drains the pool results; the loop ends once a whole round leaves
//! both halves clean, which guarantees quiescence: the pool is idle, no
//! task is outstanding and the machine has nothing left to emit.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

use corpus_types::interruption::{Interrupted, Interruption};
use corpus_types::modules::{
    IndexAddition, IndexRemoval, ModuleError, PreprocessContext, PreprocessingOutcome,
};
use workspace_store::WorkspaceStore;

use crate::machine::{
    DocumentDescription, HandleIndexEvent, IndexOperation, PreprocessingEvent, StateMachine,
};
use crate::reporter::EventReporter;
use crate::thread_pool::{ExecuteResult, Job, ThreadPool};
use crate::{Error, Result};

/// What a worker hands back to the main thread. The main thread is the
/// only place persisted state is mutated; workers only compute.
enum Continuation {
    CompletePreprocessing { event: PreprocessingEvent, documents: Vec<DocumentDescription> },
    CompleteIndex { event: HandleIndexEvent },
    /// The popped task was skipped, failed or was interrupted; its row
    /// stays persisted for a later retry.
    AbandonPreprocessing,
    AbandonIndex,
    /// Disk cleanup only, nothing to apply.
    Nothing,
}

pub(crate) struct ProcessHub {
    workspace: WorkspaceStore,
    reporter: EventReporter,
    interruption: Interruption,
    pool: ThreadPool<Continuation>,
}

impl ProcessHub {
    pub fn new(
        workspace: WorkspaceStore,
        reporter: EventReporter,
        interruption: Interruption,
    ) -> ProcessHub {
        ProcessHub { workspace, reporter, interruption, pool: ThreadPool::new() }
    }

    /// Process the pending task graph to quiescence.
    pub fn run(&self, machine: &mut StateMachine, workers: usize) -> Result<()> {
        assert!(workers > 0, "the process hub needs at least one worker");
        machine.goto_processing()?;
        self.pool.set_workers(workers)?;
        let outcome = self.drain(machine);
        self.pool.set_workers(0)?;
        match outcome {
            // the pool stopping is a shutdown, not a failure
            Err(Error::WakerStopped) => Ok(()),
            other => other,
        }
    }

    fn drain(&self, machine: &mut StateMachine) -> Result<()> {
        let mut machine_clear = false;
        let mut results_clear = false;
        while !machine_clear || !results_clear {
            machine_clear = match self.pump_machine(machine) {
                Ok(clear) => clear,
                Err(e) if e.is_interrupted() => {
                    // apply what the workers already finished before unwinding
                    let _ = self.drain_results(machine);
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            results_clear = self.drain_results(machine)?;
        }
        Ok(())
    }

    /// Dispatch the machine's pending events to the pool. Returns whether
    /// the machine had nothing to emit.
    fn pump_machine(&self, machine: &mut StateMachine) -> Result<bool> {
        let mut clear = true;

        while let Some(event) = machine.pop_removed_resource_event() {
            let workspace = self.workspace.clone();
            self.pool.execute(Box::new(move || {
                workspace.remove_resource_dir(event.base, &event.hash)?;
                Ok(Continuation::Nothing)
            }))?;
            clear = false;
            self.interruption.check()?;
        }

        while let Some(event) = machine.pop_handle_index_event()? {
            let job = self.index_job(machine, event)?;
            self.pool.execute(job)?;
            clear = false;
            self.interruption.check()?;
        }

        if let Some(event) = machine.pop_preproc_event() {
            let job = self.preproc_job(machine, event)?;
            self.pool.execute(job)?;
            clear = false;
            self.interruption.check()?;
        }

        Ok(clear)
    }

    /// Apply the continuations of every finished worker. Returns whether
    /// the pool had nothing to report.
    fn drain_results(&self, machine: &mut StateMachine) -> Result<bool> {
        let mut clear = true;
        loop {
            match self.pool.pop_result() {
                ExecuteResult::NoMoreExecutions => break,
                ExecuteResult::Fail(e) => {
                    clear = false;
                    tracing::error!("a worker task failed: {e}");
                }
                ExecuteResult::Success(continuation) => {
                    clear = false;
                    match continuation {
                        Continuation::Nothing => (),
                        Continuation::AbandonPreprocessing => machine.abandon_preproc_task(),
                        Continuation::AbandonIndex => machine.abandon_index_task(),
                        Continuation::CompletePreprocessing { event, documents } => {
                            machine.complete_preproc_task(&event, documents)?
                        }
                        Continuation::CompleteIndex { event } => {
                            machine.complete_index_task(&event)?
                        }
                    }
                }
            }
        }
        Ok(clear)
    }

    fn preproc_job(
        &self,
        machine: &StateMachine,
        event: PreprocessingEvent,
    ) -> Result<Job<Continuation>> {
        let module = machine.preprocessing_module_handle(event.module)?;
        let module_id = module.id().to_string();
        let workspace = self.workspace.clone();
        let reporter = self.reporter.clone();
        let interruption = self.interruption.clone();

        Ok(Box::new(move || {
            let run = || -> Result<Continuation> {
                if !module.acceptant(
                    event.base,
                    &event.resource_hash,
                    &event.resource_path,
                    &event.content_type,
                ) {
                    return Ok(Continuation::AbandonPreprocessing);
                }

                let workspace_path =
                    workspace.module_workspace(event.base, &event.resource_hash, &module_id)?;
                let latest_cache_path = event
                    .from_resource_hash
                    .as_ref()
                    .and_then(|from| workspace.latest_cache(event.base, from, &module_id));

                let begin_id = reporter.report_preproc_begin(&event, &module_id);
                let outcome = module.preprocess(PreprocessContext {
                    workspace_path: &workspace_path,
                    latest_cache_path: latest_cache_path.as_deref(),
                    base: event.base,
                    resource_hash: &event.resource_hash,
                    resource_path: &event.resource_path,
                    content_type: &event.content_type,
                    report_progress: &|progress| reporter.report_preproc_progress(&event, progress),
                    interruption: &interruption,
                });
                let results = match outcome {
                    Ok(results) => results,
                    Err(ModuleError::Interrupted(_)) => {
                        reporter.report_preproc_fail(begin_id, &event, &module_id, &Interrupted);
                        return Ok(Continuation::AbandonPreprocessing);
                    }
                    Err(e) => {
                        tracing::error!(
                            "preprocessing of resource {} failed: {e}",
                            event.resource_hash
                        );
                        reporter.report_preproc_fail(begin_id, &event, &module_id, &e);
                        return Ok(Continuation::AbandonPreprocessing);
                    }
                };

                match resolve_documents(results, &workspace_path, latest_cache_path.as_deref()) {
                    Ok(documents) => {
                        reporter.report_preproc_complete(begin_id, &event, &module_id, &documents);
                        Ok(Continuation::CompletePreprocessing { event, documents })
                    }
                    Err(e) => {
                        tracing::error!(
                            "preprocessing of resource {} returned invalid results: {e}",
                            event.resource_hash
                        );
                        reporter.report_preproc_fail(begin_id, &event, &module_id, &e);
                        Ok(Continuation::AbandonPreprocessing)
                    }
                }
            };

            match catch_unwind(AssertUnwindSafe(run)) {
                Ok(Ok(continuation)) => Ok(continuation),
                Ok(Err(e)) => {
                    tracing::error!("a preprocessing task failed: {e}");
                    Ok(Continuation::AbandonPreprocessing)
                }
                Err(_) => {
                    tracing::error!("a preprocessing task panicked");
                    Ok(Continuation::AbandonPreprocessing)
                }
            }
        }))
    }

    fn index_job(&self, machine: &StateMachine, event: HandleIndexEvent) -> Result<Job<Continuation>> {
        let module = machine.index_module_handle(event.index_module)?;
        let module_id = module.id().to_string();
        let preproc_id = machine.module_string_id(event.preproc_module)?;
        let reporter = self.reporter.clone();
        let interruption = self.interruption.clone();

        Ok(Box::new(move || {
            let run = || -> Result<Continuation> {
                let begin_id = reporter.report_handle_index_begin(&event, &module_id);
                let applied = match event.operation {
                    IndexOperation::Create => module.add(IndexAddition {
                        base: event.base,
                        preproc_module: &preproc_id,
                        document_hash: &event.document_hash,
                        document_path: &event.document_path,
                        document_meta: &event.document_meta,
                        report_progress: &|progress| {
                            reporter.report_handle_index_progress(&event, &module_id, progress)
                        },
                        interruption: &interruption,
                    }),
                    IndexOperation::Remove => module.remove(IndexRemoval {
                        base: event.base,
                        preproc_module: &preproc_id,
                        document_hash: &event.document_hash,
                        report_progress: &|progress| {
                            reporter.report_handle_index_progress(&event, &module_id, progress)
                        },
                        interruption: &interruption,
                    }),
                };
                match applied {
                    Ok(()) => {
                        reporter.report_handle_index_complete(begin_id, &event, &module_id);
                        Ok(Continuation::CompleteIndex { event })
                    }
                    Err(ModuleError::Interrupted(_)) => {
                        reporter.report_handle_index_fail(begin_id, &event, &module_id, &Interrupted);
                        Ok(Continuation::AbandonIndex)
                    }
                    Err(e) => {
                        tracing::error!("indexing of document {} failed: {e}", event.document_hash);
                        reporter.report_handle_index_fail(begin_id, &event, &module_id, &e);
                        Ok(Continuation::AbandonIndex)
                    }
                }
            };

            match catch_unwind(AssertUnwindSafe(run)) {
                Ok(continuation) => continuation,
                Err(_) => {
                    tracing::error!("an index task panicked");
                    Ok(Continuation::AbandonIndex)
                }
            }
        }))
    }
}

/// Resolve the relative paths returned by a preprocessing run against the
/// workspace, or against the latest cache for results flagged
/// `from_cache`.
fn resolve_documents(
    results: Vec<PreprocessingOutcome>,
    workspace: &Path,
    latest_cache: Option<&Path>,
) -> Result<Vec<DocumentDescription>> {
    let mut documents = Vec::with_capacity(results.len());
    for (index, result) in results.into_iter().enumerate() {
        if result.path.is_absolute() {
            return Err(Error::AbsoluteDocumentPath { index, path: result.path });
        }
        let root = match result.from_cache {
            true => latest_cache.ok_or(Error::MissingLatestCache { index })?,
            false => workspace,
        };
        documents.push(DocumentDescription {
            document_hash: result.hash,
            path: root.join(&result.path),
            meta: result.meta,
        });
    }
    Ok(documents)
}
