//! Pseudo-quantified invariants of the reference counting, checked over
//! arbitrary command sequences.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use proptest::prelude::*;

use crate::test_utils::{hash, resource, stub_machine};

#[derive(Debug, Clone)]
enum Op {
    Put { slot: usize, content: u8 },
    Remove { slot: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..4usize, 0..3u8).prop_map(|(slot, content)| Op::Put { slot, content }),
        (0..4usize).prop_map(|slot| Op::Remove { slot }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 32, ..ProptestConfig::default() })]

    /// Invariant 1: `resource_hash_refs(b, h)` always equals the number of
    /// live resources carrying `h` plus the preprocessing tasks
    /// referencing `h`, and invariant 3: at most one preprocessing task
    /// exists per `(base, hash, preproc module)`.
    #[test]
    fn hash_references_are_conserved(ops in proptest::collection::vec(op_strategy(), 1..24)) {
        let (mut machine, _resource_module, _preproc_module, _index_module, _tempdir) =
            stub_machine();
        let base = machine
            .create_knowledge_base("stub-resources", serde_json::Value::Null)
            .unwrap();
        machine.goto_scanning();

        let mut model: HashMap<usize, u8> = HashMap::new();
        let mut event_id = 0;
        for op in ops {
            event_id += 1;
            match op {
                Op::Put { slot, content } => {
                    let resource = resource(base.id, &format!("file-{slot}"), &[content]);
                    machine.put_resource(event_id, &resource, Path::new("file")).unwrap();
                    model.insert(slot, content);
                }
                Op::Remove { slot } => {
                    if let Some(content) = model.remove(&slot) {
                        let resource = resource(base.id, &format!("file-{slot}"), &[content]);
                        machine.remove_resource(event_id, &resource).unwrap();
                    }
                }
            }
        }

        let tasks = machine.dump_preproc_tasks().unwrap();
        let mut keys = HashSet::new();
        for task in &tasks {
            prop_assert!(
                keys.insert((task.base, task.resource_hash.clone(), task.preproc_module)),
                "two pending preprocessing tasks share {:?}",
                (task.base, &task.resource_hash, task.preproc_module),
            );
        }

        for content in 0..3u8 {
            let content_hash = hash(&[content]);
            let live = model.values().filter(|&&c| c == content).count() as u64;
            prop_assert_eq!(
                machine.count_resources_by_hash(base.id, &content_hash).unwrap(),
                live
            );
            let task_refs = tasks
                .iter()
                .filter(|task| {
                    task.resource_hash == content_hash
                        || task
                            .from_resource
                            .as_ref()
                            .is_some_and(|from| from.hash == content_hash)
                })
                .count() as u64;
            prop_assert_eq!(
                machine.hash_refs(base.id, &content_hash).unwrap(),
                live + task_refs
            );
        }
    }
}
