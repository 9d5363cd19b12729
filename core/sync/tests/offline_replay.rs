use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use shopsync_common::{Entity, Payload};
use shopsync_remote::MemoryRemote;
use shopsync_store::{LocalStore, SortSpec};
use shopsync_sync::{RetryPolicy, SyncConfig, SyncEngine};

#[derive(Debug, Clone)]
enum Edit {
    Upsert { id: usize, stock: i64 },
    Delete { id: usize },
}

fn arb_edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => (0usize..5, 0i64..100).prop_map(|(id, stock)| Edit::Upsert { id, stock }),
        1 => (0usize..5).prop_map(|id| Edit::Delete { id }),
    ]
}

fn by_id(payloads: Vec<Payload>) -> BTreeMap<String, Payload> {
    payloads
        .into_iter()
        .map(|p| (p["id"].as_str().unwrap().to_string(), p))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_offline_replay_reproduces_local_state(edits in prop::collection::vec(arb_edit(), 1..30)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let store = Arc::new(LocalStore::in_memory().unwrap());
        let remote = Arc::new(MemoryRemote::new());
        let config = SyncConfig {
            retry: RetryPolicy::immediate(),
            ..SyncConfig::default()
        };
        let engine = SyncEngine::new(Arc::clone(&store), remote.clone(), config).unwrap();
        engine.set_offline_mode(true).unwrap();

        let mut queued = 0u64;
        for edit in &edits {
            match edit {
                Edit::Upsert { id, stock } => {
                    let record = json!({"id": format!("p{}", id), "stock": stock});
                    store
                        .upsert_record(Entity::Products, record.as_object().cloned().unwrap())
                        .unwrap();
                    queued += 1;
                }
                Edit::Delete { id } => {
                    if store.delete_record(Entity::Products, &format!("p{}", id)).is_ok() {
                        queued += 1;
                    }
                }
            }
        }
        prop_assert_eq!(store.pending_count().unwrap(), queued);

        engine.set_offline_mode(false).unwrap();
        let result = runtime.block_on(engine.sync_once());
        prop_assert!(result.error.is_none());
        prop_assert_eq!(result.failed, 0);
        prop_assert_eq!(store.pending_count().unwrap(), 0);

        let local = by_id(store.list_records(Entity::Products, &SortSpec::default()).unwrap());
        let replayed = by_id(
            remote
                .documents(Entity::Products)
                .into_iter()
                .map(|doc| doc.payload)
                .collect(),
        );
        prop_assert_eq!(local, replayed);
    }
}
