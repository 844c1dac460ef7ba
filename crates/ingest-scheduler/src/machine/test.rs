use std::path::Path;

use big_s::S;
use corpus_types::hash::ContentHash;
use corpus_types::modules::ModuleHandle;
use corpus_types::BaseId;

use super::*;
use crate::test_utils::{
    document, hash, machine_with, reopen_machine, resource, stub_machine, StubIndexModule,
    StubPreprocessingModule, StubResourceModule, TEST_DB_SIZE,
};

/// Invariant 1: for every hash, the persisted reference count equals the
/// number of live resources plus the preprocessing tasks referencing it.
fn check_hash_ref_conservation(machine: &StateMachine, base: BaseId, hashes: &[ContentHash]) {
    let tasks = machine.dump_preproc_tasks().unwrap();
    for hash in hashes {
        let resources = machine.count_resources_by_hash(base, hash).unwrap();
        let task_refs = tasks
            .iter()
            .filter(|task| {
                task.base == base
                    && (task.resource_hash == *hash
                        || task.from_resource.as_ref().is_some_and(|from| from.hash == *hash))
            })
            .count() as u64;
        assert_eq!(machine.hash_refs(base, hash).unwrap(), resources + task_refs);
    }
}

#[test]
fn single_resource_lifecycle() {
    let (mut machine, _resource_module, _preproc_module, _index_module, _tempdir) = stub_machine();
    assert_eq!(machine.state(), MachineState::Setting);

    let base = machine.create_knowledge_base("stub-resources", serde_json::json!({})).unwrap();
    machine.goto_scanning();
    machine.put_resource(1, &resource(base.id, "a.pdf", &[0xaa]), Path::new("a.pdf")).unwrap();
    check_hash_ref_conservation(&machine, base.id, &[hash(&[0xaa])]);

    machine.goto_processing().unwrap();
    let event = machine.pop_preproc_event().unwrap();
    assert_eq!(event.resource_hash, hash(&[0xaa]));
    assert_eq!(event.from_resource_hash, None);
    assert_eq!(event.resource_path, Path::new("a.pdf"));
    assert!(machine.pop_preproc_event().is_none());
    assert!(machine.pop_handle_index_event().unwrap().is_none());
    assert!(machine.pop_removed_resource_event().is_none());

    machine.complete_preproc_task(&event, vec![document(&[0xd1], "p0.txt")]).unwrap();
    let index_event = machine.pop_handle_index_event().unwrap().unwrap();
    assert_eq!(index_event.operation, IndexOperation::Create);
    assert_eq!(index_event.document_hash, hash(&[0xd1]));
    machine.complete_index_task(&index_event).unwrap();
    assert!(machine.pop_handle_index_event().unwrap().is_none());

    machine.goto_setting();
    assert_eq!(machine.count_resources_by_hash(base.id, &hash(&[0xaa])).unwrap(), 1);
    assert_eq!(machine.dump_documents().unwrap().len(), 1);
    assert!(machine.dump_preproc_tasks().unwrap().is_empty());
    assert!(machine.dump_index_tasks().unwrap().is_empty());
    check_hash_ref_conservation(&machine, base.id, &[hash(&[0xaa])]);
}

/// Drive one resource through preprocessing and indexing, leaving the
/// machine in the setting state with one live document.
fn ingest_single_document(machine: &mut StateMachine, base: BaseId) {
    machine.goto_scanning();
    machine.put_resource(1, &resource(base, "a.pdf", &[0xaa]), Path::new("a.pdf")).unwrap();
    machine.goto_processing().unwrap();
    let event = machine.pop_preproc_event().unwrap();
    machine.complete_preproc_task(&event, vec![document(&[0xd1], "p0.txt")]).unwrap();
    let index_event = machine.pop_handle_index_event().unwrap().unwrap();
    machine.complete_index_task(&index_event).unwrap();
    machine.goto_setting();
}

#[test]
fn duplicate_content_is_deduplicated() {
    let (mut machine, _resource_module, _preproc_module, _index_module, _tempdir) = stub_machine();
    let base = machine.create_knowledge_base("stub-resources", serde_json::json!({})).unwrap();
    ingest_single_document(&mut machine, base.id);

    // a content-identical second resource produces no new work
    machine.goto_scanning();
    machine.put_resource(2, &resource(base.id, "b.pdf", &[0xaa]), Path::new("b.pdf")).unwrap();
    machine.goto_processing().unwrap();
    assert!(machine.pop_preproc_event().is_none());
    assert!(machine.pop_handle_index_event().unwrap().is_none());
    assert!(machine.pop_removed_resource_event().is_none());
    assert_eq!(machine.dump_documents().unwrap().len(), 1);

    // removing one of the two leaves the reference count at one
    machine.goto_scanning();
    machine.remove_resource(3, &resource(base.id, "a.pdf", &[0xaa])).unwrap();
    assert_eq!(machine.hash_refs(base.id, &hash(&[0xaa])).unwrap(), 1);
    machine.goto_processing().unwrap();
    assert!(machine.pop_handle_index_event().unwrap().is_none());

    // removing the last one schedules the index removal
    machine.goto_scanning();
    machine.remove_resource(4, &resource(base.id, "b.pdf", &[0xaa])).unwrap();
    machine.goto_processing().unwrap();
    let index_event = machine.pop_handle_index_event().unwrap().unwrap();
    assert_eq!(index_event.operation, IndexOperation::Remove);
    assert_eq!(index_event.document_hash, hash(&[0xd1]));
    machine.complete_index_task(&index_event).unwrap();
    assert!(machine.dump_documents().unwrap().is_empty());

    let removed = machine.pop_removed_resource_event().unwrap();
    assert_eq!(removed.hash, hash(&[0xaa]));
    assert!(machine.pop_removed_resource_event().is_none());
    machine.goto_setting();
}

#[test]
fn in_place_update_replaces_documents() {
    let (mut machine, _resource_module, _preproc_module, _index_module, _tempdir) = stub_machine();
    let base = machine.create_knowledge_base("stub-resources", serde_json::json!({})).unwrap();
    ingest_single_document(&mut machine, base.id);

    machine.goto_scanning();
    machine.put_resource(3, &resource(base.id, "a.pdf", &[0xbb]), Path::new("a.pdf")).unwrap();
    check_hash_ref_conservation(&machine, base.id, &[hash(&[0xaa]), hash(&[0xbb])]);

    machine.goto_processing().unwrap();
    let preproc_event = machine.pop_preproc_event().unwrap();
    assert_eq!(preproc_event.resource_hash, hash(&[0xbb]));
    assert_eq!(preproc_event.from_resource_hash, Some(hash(&[0xaa])));

    let remove_event = machine.pop_handle_index_event().unwrap().unwrap();
    assert_eq!(remove_event.operation, IndexOperation::Remove);
    assert_eq!(remove_event.document_hash, hash(&[0xd1]));

    machine.complete_preproc_task(&preproc_event, vec![document(&[0xd2], "p1.txt")]).unwrap();
    let create_event = machine.pop_handle_index_event().unwrap().unwrap();
    assert_eq!(create_event.operation, IndexOperation::Create);
    assert_eq!(create_event.document_hash, hash(&[0xd2]));

    machine.complete_index_task(&remove_event).unwrap();
    machine.complete_index_task(&create_event).unwrap();

    let documents = machine.dump_documents().unwrap();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].document_hash, hash(&[0xd2]));

    // the old content is gone, its workspace cleanup is queued exactly once
    let removed = machine.pop_removed_resource_event().unwrap();
    assert_eq!(removed.hash, hash(&[0xaa]));
    assert!(machine.pop_removed_resource_event().is_none());
    machine.goto_setting();
}

#[test]
fn create_then_remove_within_one_scan_cancels_everything() {
    let (mut machine, _resource_module, _preproc_module, _index_module, _tempdir) = stub_machine();
    let base = machine.create_knowledge_base("stub-resources", serde_json::json!({})).unwrap();

    machine.goto_scanning();
    machine.put_resource(4, &resource(base.id, "c.pdf", &[0xcc]), Path::new("c.pdf")).unwrap();
    assert_eq!(machine.dump_preproc_tasks().unwrap().len(), 1);

    machine.remove_resource(5, &resource(base.id, "c.pdf", &[0xcc])).unwrap();
    assert!(machine.dump_preproc_tasks().unwrap().is_empty());
    assert!(machine.dump_index_tasks().unwrap().is_empty());
    assert!(machine.dump_documents().unwrap().is_empty());
    assert!(machine.queued_removed_resource_hashes().is_empty());

    machine.goto_processing().unwrap();
    assert!(machine.pop_preproc_event().is_none());
    assert!(machine.pop_handle_index_event().unwrap().is_none());
    assert!(machine.pop_removed_resource_event().is_none());
    machine.goto_setting();
}

#[test]
fn a_recreated_hash_supersedes_its_pending_removal() {
    let (mut machine, _resource_module, _preproc_module, _index_module, _tempdir) = stub_machine();
    let base = machine.create_knowledge_base("stub-resources", serde_json::json!({})).unwrap();
    ingest_single_document(&mut machine, base.id);

    machine.goto_scanning();
    machine.remove_resource(2, &resource(base.id, "a.pdf", &[0xaa])).unwrap();
    assert_eq!(machine.queued_removed_resource_hashes(), vec![hash(&[0xaa])]);
    // the index removal was already emitted and stays: the stale document
    // must leave the index either way
    assert_eq!(machine.dump_index_tasks().unwrap().len(), 1);

    machine.put_resource(3, &resource(base.id, "a.pdf", &[0xaa]), Path::new("a.pdf")).unwrap();
    assert!(machine.queued_removed_resource_hashes().is_empty());
    assert_eq!(machine.dump_preproc_tasks().unwrap().len(), 1);
    check_hash_ref_conservation(&machine, base.id, &[hash(&[0xaa])]);
}

#[test]
fn pending_tasks_survive_restart() {
    let resource_module = StubResourceModule::new("stub-resources", &["stub-preproc"], &["stub-index"]);
    let preproc_module = StubPreprocessingModule::new("stub-preproc");
    let index_module = StubIndexModule::new("stub-index");
    let (mut machine, tempdir) = machine_with(vec![
        ModuleHandle::Resource(resource_module),
        ModuleHandle::Preprocessing(preproc_module),
        ModuleHandle::Index(index_module),
    ]);

    let base = machine.create_knowledge_base("stub-resources", serde_json::json!({})).unwrap();
    machine.goto_scanning();
    machine.put_resource(1, &resource(base.id, "a.pdf", &[0xaa]), Path::new("a.pdf")).unwrap();
    let pending = machine.dump_preproc_tasks().unwrap();
    assert_eq!(pending.len(), 1);
    drop(machine);

    let resource_module = StubResourceModule::new("stub-resources", &["stub-preproc"], &["stub-index"]);
    let preproc_module = StubPreprocessingModule::new("stub-preproc");
    let index_module = StubIndexModule::new("stub-index");
    let mut machine = reopen_machine(
        &tempdir,
        vec![
            ModuleHandle::Resource(resource_module),
            ModuleHandle::Preprocessing(preproc_module),
            ModuleHandle::Index(index_module),
        ],
    );

    // tasks were pending, so the machine wakes up processing
    assert_eq!(machine.state(), MachineState::Processing);
    let event = machine.pop_preproc_event().unwrap();
    assert_eq!(event.task_id, pending[0].id);
    assert_eq!(event.resource_hash, pending[0].resource_hash);
    assert_eq!(event.resource_path, pending[0].path);

    // the flow proceeds normally after the restart
    machine.complete_preproc_task(&event, vec![document(&[0xd1], "p0.txt")]).unwrap();
    let index_event = machine.pop_handle_index_event().unwrap().unwrap();
    machine.complete_index_task(&index_event).unwrap();
    machine.goto_setting();
    assert_eq!(machine.dump_documents().unwrap().len(), 1);
}

#[test]
fn a_new_create_cancels_the_pending_remove_of_the_same_document() {
    let (mut machine, _resource_module, _preproc_module, _index_module, _tempdir) = stub_machine();
    let base = machine.create_knowledge_base("stub-resources", serde_json::json!({})).unwrap();
    ingest_single_document(&mut machine, base.id);

    // the update schedules the removal of the old document
    machine.goto_scanning();
    machine.put_resource(3, &resource(base.id, "a.pdf", &[0xbb]), Path::new("a.pdf")).unwrap();
    machine.goto_processing().unwrap();
    assert_eq!(machine.dump_index_tasks().unwrap().len(), 1);

    // but preprocessing the new content yields the very same document, so
    // the pair cancels and nothing reaches the index module
    let preproc_event = machine.pop_preproc_event().unwrap();
    machine.complete_preproc_task(&preproc_event, vec![document(&[0xd1], "p0.txt")]).unwrap();
    assert!(machine.dump_index_tasks().unwrap().is_empty());
    assert!(machine.pop_handle_index_event().unwrap().is_none());

    let documents = machine.dump_documents().unwrap();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].document_hash, hash(&[0xd1]));

    let removed = machine.pop_removed_resource_event().unwrap();
    assert_eq!(removed.hash, hash(&[0xaa]));
    machine.goto_setting();
}

#[test]
fn a_document_hash_shared_by_two_resources_is_stored_once() {
    let (mut machine, _resource_module, _preproc_module, _index_module, _tempdir) = stub_machine();
    let base = machine.create_knowledge_base("stub-resources", serde_json::json!({})).unwrap();

    machine.goto_scanning();
    machine.put_resource(1, &resource(base.id, "x.pdf", &[0xa1]), Path::new("x.pdf")).unwrap();
    machine.put_resource(2, &resource(base.id, "y.pdf", &[0xa2]), Path::new("y.pdf")).unwrap();
    machine.goto_processing().unwrap();

    let first = machine.pop_preproc_event().unwrap();
    let second = machine.pop_preproc_event().unwrap();
    machine.complete_preproc_task(&first, vec![document(&[0xd7], "p0.txt")]).unwrap();
    machine.complete_preproc_task(&second, vec![document(&[0xd7], "p0.txt")]).unwrap();

    // one document row, two references, one CREATE task
    assert_eq!(machine.dump_documents().unwrap().len(), 1);
    assert_eq!(machine.dump_document_ref_counts().unwrap(), vec![(0, 2)]);
    let index_event = machine.pop_handle_index_event().unwrap().unwrap();
    machine.complete_index_task(&index_event).unwrap();
    assert!(machine.pop_handle_index_event().unwrap().is_none());

    // the document survives its first referencing hash
    machine.goto_scanning();
    machine.remove_resource(3, &resource(base.id, "x.pdf", &[0xa1])).unwrap();
    machine.goto_processing().unwrap();
    assert!(machine.pop_handle_index_event().unwrap().is_none());
    assert_eq!(machine.dump_documents().unwrap().len(), 1);

    // and dies with the second
    machine.goto_scanning();
    machine.remove_resource(4, &resource(base.id, "y.pdf", &[0xa2])).unwrap();
    machine.goto_processing().unwrap();
    let index_event = machine.pop_handle_index_event().unwrap().unwrap();
    assert_eq!(index_event.operation, IndexOperation::Remove);
    machine.complete_index_task(&index_event).unwrap();
    assert!(machine.dump_documents().unwrap().is_empty());
}

#[test]
fn documents_are_deleted_right_away_without_index_modules() {
    let resource_module = StubResourceModule::new("stub-resources", &["stub-preproc"], &[]);
    let preproc_module = StubPreprocessingModule::new("stub-preproc");
    let (mut machine, _tempdir) = machine_with(vec![
        ModuleHandle::Resource(resource_module),
        ModuleHandle::Preprocessing(preproc_module),
    ]);
    let base = machine.create_knowledge_base("stub-resources", serde_json::json!({})).unwrap();

    machine.goto_scanning();
    machine.put_resource(1, &resource(base.id, "a.pdf", &[0xaa]), Path::new("a.pdf")).unwrap();
    machine.goto_processing().unwrap();
    let event = machine.pop_preproc_event().unwrap();
    machine.complete_preproc_task(&event, vec![document(&[0xd1], "p0.txt")]).unwrap();
    assert_eq!(machine.dump_documents().unwrap().len(), 1);
    assert!(machine.dump_index_tasks().unwrap().is_empty());
    machine.goto_setting();

    machine.goto_scanning();
    machine.remove_resource(2, &resource(base.id, "a.pdf", &[0xaa])).unwrap();
    // no index module: the dead document is deleted on the spot
    assert!(machine.dump_documents().unwrap().is_empty());
    assert!(machine.dump_index_tasks().unwrap().is_empty());
    machine.goto_processing().unwrap();
    assert_eq!(machine.pop_removed_resource_event().unwrap().hash, hash(&[0xaa]));
    machine.goto_setting();
}

#[test]
fn tasks_are_popped_in_creation_order() {
    let (mut machine, _resource_module, _preproc_module, _index_module, _tempdir) = stub_machine();
    let base = machine.create_knowledge_base("stub-resources", serde_json::json!({})).unwrap();

    machine.goto_scanning();
    for (event_id, name) in [(1, "a.pdf"), (2, "b.pdf"), (3, "c.pdf")] {
        machine
            .put_resource(event_id, &resource(base.id, name, &[event_id as u8]), Path::new(name))
            .unwrap();
    }
    machine.goto_processing().unwrap();

    let popped: Vec<_> = std::iter::from_fn(|| machine.pop_preproc_event())
        .map(|event| event.resource_path)
        .collect();
    assert_eq!(popped, [Path::new("a.pdf"), Path::new("b.pdf"), Path::new("c.pdf")]);
    for _ in 0..3 {
        machine.abandon_preproc_task();
    }
    machine.goto_setting();
}

#[test]
fn cleaning_a_base_drains_it_for_removal() {
    let (mut machine, _resource_module, _preproc_module, _index_module, _tempdir) = stub_machine();
    let base = machine.create_knowledge_base("stub-resources", serde_json::json!({})).unwrap();
    ingest_single_document(&mut machine, base.id);

    // still holding a resource: refused
    match machine.remove_knowledge_base(&base) {
        Err(Error::KnowledgeBaseNotEmpty(id)) => assert_eq!(id, base.id),
        other => panic!("expected KnowledgeBaseNotEmpty, got {other:?}"),
    }

    machine.clean_resources(-1, &base).unwrap();
    assert_eq!(machine.state(), MachineState::Processing);

    let index_event = machine.pop_handle_index_event().unwrap().unwrap();
    assert_eq!(index_event.operation, IndexOperation::Remove);
    machine.complete_index_task(&index_event).unwrap();
    assert_eq!(machine.pop_removed_resource_event().unwrap().hash, hash(&[0xaa]));

    machine.goto_setting();
    machine.remove_knowledge_base(&base).unwrap();
    assert!(machine.knowledge_bases().unwrap().is_empty());
    assert!(machine.dump_documents().unwrap().is_empty());
}

#[test]
fn module_bindings_keep_their_ids_and_kinds_across_restarts() {
    let resource_module = StubResourceModule::new("stub-resources", &["stub-preproc"], &[]);
    let preproc_module = StubPreprocessingModule::new("stub-preproc");
    let (machine, tempdir) = machine_with(vec![
        ModuleHandle::Resource(resource_module),
        ModuleHandle::Preprocessing(preproc_module),
    ]);
    drop(machine);

    // reusing the stable id of the preprocessing module for an index
    // module must be rejected
    let resource_module = StubResourceModule::new("stub-resources", &["stub-preproc"], &[]);
    let retyped = StubIndexModule::new("stub-preproc");
    let result = StateMachine::new(
        &tempdir.path().join("db"),
        TEST_DB_SIZE,
        vec![ModuleHandle::Resource(resource_module), ModuleHandle::Index(retyped)],
    );
    match result {
        Err(Error::ModuleKindMismatch { id, .. }) => assert_eq!(id, S("stub-preproc")),
        other => panic!("expected ModuleKindMismatch, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn stats_report_the_pending_work() {
    let (mut machine, _resource_module, _preproc_module, _index_module, _tempdir) = stub_machine();
    let base = machine.create_knowledge_base("stub-resources", serde_json::json!({})).unwrap();
    machine.goto_scanning();
    machine.put_resource(1, &resource(base.id, "a.pdf", &[0xaa]), Path::new("a.pdf")).unwrap();

    insta::assert_json_snapshot!(machine.stats().unwrap(), @r###"
    {
      "createIndexTasks": 0,
      "knowledgeBases": 1,
      "preprocessingTasks": 1,
      "removeIndexTasks": 0
    }
    "###);
}

#[test]
fn resources_are_listed_newest_first() {
    let (mut machine, _resource_module, _preproc_module, _index_module, _tempdir) = stub_machine();
    let base = machine.create_knowledge_base("stub-resources", serde_json::json!({})).unwrap();

    machine.goto_scanning();
    let mut old = resource(base.id, "old.pdf", &[0xaa]);
    old.updated_at = 10;
    let mut new = resource(base.id, "new.pdf", &[0xaa]);
    new.updated_at = 20;
    machine.put_resource(1, &old, Path::new("old.pdf")).unwrap();
    machine.put_resource(2, &new, Path::new("new.pdf")).unwrap();

    let listed = machine.resources(base.id, &hash(&[0xaa])).unwrap();
    let ids: Vec<_> = listed.iter().map(|resource| resource.external_id.as_str()).collect();
    assert_eq!(ids, ["new.pdf", "old.pdf"]);
}
