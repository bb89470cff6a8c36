mod common;

use std::sync::Arc;
use std::thread;

use common::{billing_records, engine, ScriptedProvider};
use finops_rag::{
    CancelToken, Dataset, HashProvider, IndexStore, ProviderError, RagError, SearchParams,
};
use tempfile::tempdir;

fn params() -> SearchParams {
    SearchParams {
        top_k: 5,
        threshold: -1.0,
    }
}

#[test]
fn unchanged_dataset_rebuilds_without_embedding() {
    let dir = tempdir().unwrap();
    let provider = ScriptedProvider::new();
    let engine = engine(provider.clone(), &dir.path().join("idx.sqlite"), params());
    let dataset = Dataset::new(billing_records(25)).unwrap();

    let first = engine.build_index(&dataset).unwrap();
    assert_eq!(first.embedded, 25);
    let texts_after_first = provider.embedded_texts();

    let second = engine.build_index(&dataset).unwrap();
    assert_eq!(second.embedded, 0);
    assert_eq!(second.reused, 25);
    assert_eq!(second.entries, first.entries);
    assert_eq!(second.dataset_hash, first.dataset_hash);
    assert_eq!(provider.embedded_texts(), texts_after_first);
}

#[test]
fn only_changed_records_are_embedded() {
    let dir = tempdir().unwrap();
    let provider = ScriptedProvider::new();
    let engine = engine(provider.clone(), &dir.path().join("idx.sqlite"), params());
    engine
        .build_index(&Dataset::new(billing_records(10)).unwrap())
        .unwrap();

    let mut records = billing_records(10);
    records[4] = records[4].clone().with_meta("cost", 4242);
    records.push(common::row("row-new", "Cloud Run", "2025-04", 12.5));
    let report = engine.build_index(&Dataset::new(records).unwrap()).unwrap();
    assert_eq!(report.embedded, 2);
    assert_eq!(report.reused, 9);
    assert_eq!(report.entries, 11);
}

#[test]
fn index_survives_engine_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("idx.sqlite");
    let dataset = Dataset::new(billing_records(12)).unwrap();
    let expected = {
        let engine = engine(ScriptedProvider::new(), &path, params());
        engine.build_index(&dataset).unwrap();
        engine.search("BigQuery", &dataset, params()).unwrap()
    };

    let provider = ScriptedProvider::new();
    let restarted = engine(provider.clone(), &path, params());
    assert_eq!(restarted.search("BigQuery", &dataset, params()).unwrap(), expected);
    // Only the query itself was embedded.
    assert_eq!(provider.embedded_texts(), 1);
    assert!(restarted.status().unwrap().loaded);
}

#[test]
fn failed_build_keeps_serving_previous_index() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("idx.sqlite");
    let provider = ScriptedProvider::new();
    let engine = engine(provider.clone(), &path, params());
    let dataset = Dataset::new(billing_records(8)).unwrap();
    engine.build_index(&dataset).unwrap();
    let before = engine.search("Cloud SQL", &dataset, params()).unwrap();

    // A transient failure is retried, then a permanent one aborts the build.
    let bigger = Dataset::new(billing_records(20)).unwrap();
    provider.push_failure(ProviderError::transient("slow"));
    provider.push_failure(ProviderError::permanent("bad request"));
    let err = engine.build_index(&bigger).unwrap_err();
    assert!(matches!(err, RagError::Provider(_)));

    assert_eq!(engine.search("Cloud SQL", &dataset, params()).unwrap(), before);
    let stored = IndexStore::open(&path).unwrap().load().unwrap().unwrap();
    assert_eq!(stored.dataset_hash(), dataset.hash());
    assert!(matches!(
        engine.search("Cloud SQL", &bigger, params()),
        Err(RagError::StaleIndex { .. })
    ));
}

#[test]
fn cancelled_build_leaves_published_index() {
    let dir = tempdir().unwrap();
    let engine = engine(ScriptedProvider::new(), &dir.path().join("idx.sqlite"), params());
    let dataset = Dataset::new(billing_records(6)).unwrap();
    let report = engine.build_index(&dataset).unwrap();

    let cancel = CancelToken::default();
    cancel.cancel();
    let err = engine
        .build_index_with_cancel(&Dataset::new(billing_records(9)).unwrap(), &cancel)
        .unwrap_err();
    assert!(matches!(err, RagError::Cancelled));
    let status = engine.status().unwrap();
    assert_eq!(status.entries, report.entries);
    assert_eq!(status.dataset_hash.as_deref(), Some(report.dataset_hash.as_str()));
}

#[test]
fn queries_run_while_index_is_rebuilt() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine(ScriptedProvider::new(), &dir.path().join("idx.sqlite"), params()));
    let dataset = Arc::new(Dataset::new(billing_records(30)).unwrap());
    engine.build_index(&dataset).unwrap();
    let expected = engine.search("Compute Engine 2025-02", &dataset, params()).unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let dataset = Arc::clone(&dataset);
            let expected = expected.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    let result = engine.search("Compute Engine 2025-02", &dataset, params()).unwrap();
                    assert_eq!(result, expected);
                }
            })
        })
        .collect();
    for _ in 0..5 {
        engine.build_index(&dataset).unwrap();
    }
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn changed_embedding_model_reembeds_everything() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("idx.sqlite");
    let dataset = Dataset::new(billing_records(10)).unwrap();
    engine(ScriptedProvider::new(), &path, params())
        .build_index(&dataset)
        .unwrap();

    let provider = ScriptedProvider::with_dimensions(12);
    let reconfigured = engine(provider.clone(), &path, params());
    let report = reconfigured.build_index(&dataset).unwrap();
    assert_eq!(report.reused, 0);
    assert_eq!(report.embedded, 10);
    assert_eq!(provider.embedded_texts(), 10);

    let status = reconfigured.status().unwrap();
    assert_eq!(status.dimensions, 12);
    assert_eq!(status.provider.as_deref(), Some("scripted:12"));
    let result = reconfigured.search("BigQuery", &dataset, params()).unwrap();
    assert_eq!(result.len(), 5);

    // Same configuration again: everything is carried over.
    let again = reconfigured.build_index(&dataset).unwrap();
    assert_eq!(again.reused, 10);
    assert_eq!(again.embedded, 0);
}

#[test]
fn changed_hash_dimensions_recover_after_partial_edit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("idx.sqlite");
    let dataset = Dataset::new(billing_records(6)).unwrap();
    engine(Arc::new(HashProvider::new(16)), &path, params())
        .build_index(&dataset)
        .unwrap();

    let mut records = billing_records(6);
    records[2] = records[2].clone().with_meta("cost", 999);
    let edited = Dataset::new(records).unwrap();
    let narrow = engine(Arc::new(HashProvider::new(8)), &path, params());
    let report = narrow.build_index(&edited).unwrap();
    assert_eq!(report.reused, 0);
    assert_eq!(report.embedded, 6);
    assert_eq!(narrow.status().unwrap().dimensions, 8);
    assert!(!narrow.search("Cloud Storage", &edited, params()).unwrap().is_empty());
}

#[test]
fn publish_hook_runs_only_for_committed_builds() {
    let dir = tempdir().unwrap();
    let provider = ScriptedProvider::new();
    let engine = engine(provider.clone(), &dir.path().join("idx.sqlite"), params());
    let dataset = Dataset::new(billing_records(4)).unwrap();

    let mut published = 0;
    engine
        .build_index_then(&dataset, &CancelToken::default(), || published += 1)
        .unwrap();
    assert_eq!(published, 1);

    provider.push_failure(ProviderError::permanent("unauthorized"));
    let bigger = Dataset::new(billing_records(7)).unwrap();
    assert!(engine
        .build_index_then(&bigger, &CancelToken::default(), || published += 1)
        .is_err());
    assert_eq!(published, 1);
    assert_eq!(engine.status().unwrap().entries, 4);
}
