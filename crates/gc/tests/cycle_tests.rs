//! End-to-end GC cycle tests against in-memory storage and SQLite stores.

mod common;

use common::{FakeVerifier, Harness};
use gleaner_cdc::ReferenceVerifier;
use gleaner_core::config::GcMode;
use gleaner_core::hash::ContentHash;
use gleaner_core::report::CycleStatus;
use gleaner_gc::GcError;
use gleaner_storage::ObjectStore;
use gleaner_vault::{Codec, decompress};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const BOB_BYTES: &[u8] = b"bob's avatar bytes";

/// Seed the canonical scenario: alice referenced, bob orphaned, both aged 30d.
async fn seed_orphan_scenario(harness: &Harness) {
    harness.reference("avatars/alice.jpg").await;
    harness.put_aged("avatars/alice.jpg", b"alice's avatar bytes", 30);
    harness.put_aged("avatars/bob.jpg", BOB_BYTES, 30);
}

#[tokio::test]
async fn dry_run_reports_orphans_without_side_effects() {
    let harness = Harness::new().await;
    seed_orphan_scenario(&harness).await;

    let engine = harness.engine(GcMode::DryRun, 7, &[], None);
    let result = engine.run_cycle(None).await.unwrap();

    assert_eq!(result.status, CycleStatus::Completed);
    assert_eq!(result.total_scanned, 2);
    assert_eq!(result.candidates_found, 1);
    assert_eq!(result.verified_orphans, 1);
    assert_eq!(result.deleted_count, 0);
    assert_eq!(result.orphan_keys, vec!["avatars/bob.jpg"]);

    // Nothing was touched.
    assert!(harness.storage.exists("avatars/alice.jpg").await.unwrap());
    assert!(harness.storage.exists("avatars/bob.jpg").await.unwrap());
    assert!(harness
        .vault
        .lookup_by_operation(&result.operation_id, true)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn execute_backs_up_then_deletes() {
    let harness = Harness::new().await;
    seed_orphan_scenario(&harness).await;

    let engine = harness.engine(GcMode::Execute, 7, &[], None);
    let result = engine.run_cycle(None).await.unwrap();

    assert_eq!(result.deleted_count, 1);
    assert_eq!(result.backed_up_count, 1);
    assert_eq!(result.deleted_keys, vec!["avatars/bob.jpg"]);
    assert!(result.errors.is_empty());

    // The referenced object survived; the orphan is gone.
    assert!(harness.storage.exists("avatars/alice.jpg").await.unwrap());
    assert!(!harness.storage.exists("avatars/bob.jpg").await.unwrap());

    // The vault record pairs with a readable blob whose decompressed bytes
    // hash to the recorded content hash.
    let records = harness
        .vault
        .lookup_by_operation(&result.operation_id, true)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.s3_key, "avatars/bob.jpg");
    assert_eq!(record.original_size, BOB_BYTES.len() as i64);
    assert_eq!(record.content_hash, ContentHash::compute(BOB_BYTES).to_hex());
    assert!(record.restored_at.is_none());

    let stored = harness.blobs.read(&record.blob_path).await.unwrap();
    let codec = Codec::from_str(&record.codec).unwrap();
    let original = decompress(codec, &stored).await.unwrap();
    assert_eq!(original.as_ref(), BOB_BYTES);
}

#[tokio::test]
async fn retention_floor_blocks_young_objects() {
    let harness = Harness::new().await;
    harness.put_aged("k1", b"young object", 2);

    let engine = harness.engine(GcMode::Execute, 7, &[], None);
    let result = engine.run_cycle(None).await.unwrap();
    assert_eq!(result.total_scanned, 1);
    assert_eq!(result.candidates_found, 0);
    assert_eq!(result.deleted_count, 0);
    assert!(harness.storage.exists("k1").await.unwrap());

    // Six days later the object clears the floor.
    harness.put_aged("k1", b"young object", 8);
    let result = engine.run_cycle(None).await.unwrap();
    assert_eq!(result.deleted_count, 1);
    assert!(!harness.storage.exists("k1").await.unwrap());
}

#[tokio::test]
async fn missing_last_modified_is_never_a_candidate() {
    let harness = Harness::new().await;
    harness
        .storage
        .put_without_modified("no-timestamp", bytes::Bytes::from_static(b"x"));

    let engine = harness.engine(GcMode::Execute, 7, &[], None);
    let result = engine.run_cycle(None).await.unwrap();

    assert_eq!(result.total_scanned, 1);
    assert_eq!(result.candidates_found, 0);
    assert!(harness.storage.exists("no-timestamp").await.unwrap());
}

#[tokio::test]
async fn excluded_prefixes_survive_any_number_of_cycles() {
    let harness = Harness::new().await;
    harness.put_aged("backups/snapshot.tar", b"precious", 30);

    let engine = harness.engine(GcMode::Execute, 7, &["backups/"], None);
    for _ in 0..3 {
        let result = engine.run_cycle(None).await.unwrap();
        assert_eq!(result.candidates_found, 0);
        assert_eq!(result.deleted_count, 0);
    }
    assert!(harness.storage.exists("backups/snapshot.tar").await.unwrap());
}

#[tokio::test]
async fn db_reverification_catches_registry_lag() {
    // A row referencing k2 is committed while CDC is paused: the registry
    // says orphan, the database says otherwise.
    let harness = Harness::new().await;
    harness.put_aged("k2", b"referenced but not yet counted", 30);

    let verifier = Arc::new(FakeVerifier::new());
    verifier.insert("k2");

    let engine = harness.engine(
        GcMode::Execute,
        7,
        &[],
        Some(verifier.clone() as Arc<dyn ReferenceVerifier>),
    );
    let result = engine.run_cycle(None).await.unwrap();

    assert_eq!(result.candidates_found, 1);
    assert_eq!(result.verified_orphans, 0);
    assert_eq!(result.deleted_count, 0);
    assert!(result.errors.iter().any(|e| e == "registry_stale(k2)"));
    assert_eq!(result.skipped_keys, vec!["k2"]);

    // The registry was repaired and the object untouched.
    assert_eq!(harness.registry.count_of("k2").await.unwrap(), 1);
    assert!(harness.storage.exists("k2").await.unwrap());

    // The repaired count keeps k2 out of the next cycle's candidates.
    let result = engine.run_cycle(None).await.unwrap();
    assert_eq!(result.candidates_found, 0);
}

#[tokio::test]
async fn referenced_keys_are_never_deleted_under_churn() {
    // Everything the verifier considers referenced must survive, whatever
    // the registry claims.
    let harness = Harness::new().await;
    let verifier = Arc::new(FakeVerifier::new());

    for i in 0..40 {
        let key = format!("objects/{i}");
        harness.put_aged(&key, format!("payload {i}").as_bytes(), 30);
        if i % 3 == 0 {
            verifier.insert(&key);
        }
        if i % 4 == 0 {
            harness.reference(&key).await;
        }
    }

    let engine = harness.engine(
        GcMode::Execute,
        7,
        &[],
        Some(verifier.clone() as Arc<dyn ReferenceVerifier>),
    );
    let result = engine.run_cycle(None).await.unwrap();

    for i in 0..40usize {
        let key = format!("objects/{i}");
        let exists = harness.storage.exists(&key).await.unwrap();
        if i % 3 == 0 || i % 4 == 0 {
            assert!(exists, "referenced key {key} was deleted");
        } else {
            assert!(!exists, "orphan {key} survived");
        }
    }
    assert_eq!(result.status, CycleStatus::Completed);
}

#[tokio::test]
async fn audit_only_records_without_deleting() {
    let harness = Harness::new().await;
    seed_orphan_scenario(&harness).await;

    let engine = harness.engine(GcMode::AuditOnly, 7, &[], None);
    let result = engine.run_cycle(None).await.unwrap();

    assert_eq!(result.verified_orphans, 1);
    assert_eq!(result.deleted_count, 0);
    assert!(harness.storage.exists("avatars/bob.jpg").await.unwrap());

    let records = harness
        .vault
        .lookup_by_operation(&result.operation_id, true)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].stored_size, 0);
    assert!(records[0].content_hash.is_empty());
    assert!(!records[0].has_blob());
}

#[tokio::test]
async fn overlapping_cycles_return_busy() {
    let harness = Harness::new().await;
    for i in 0..8 {
        harness.put_aged(&format!("k{i}"), b"x", 30);
    }

    // A slow verifier keeps the first cycle in flight.
    let verifier = Arc::new(FakeVerifier::with_delay(Duration::from_millis(200)));
    let engine = Arc::new(harness.engine(
        GcMode::DryRun,
        7,
        &[],
        Some(verifier as Arc<dyn ReferenceVerifier>),
    ));

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_cycle(None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = engine.run_cycle(None).await;
    assert!(matches!(second, Err(GcError::CycleBusy)));

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status, CycleStatus::Completed);

    // The busy rejection left no operation behind.
    let operations = harness.vault.list_operations(10, 0, None).await.unwrap();
    assert_eq!(operations.len(), 1);
    assert_eq!(operations[0].operation_id, first.operation_id);
}

#[tokio::test]
async fn deadline_cancels_cleanly_with_partial_results() {
    let harness = Harness::new().await;
    for i in 0..30 {
        harness.put_aged(&format!("k{i:02}"), b"x", 30);
    }

    let verifier = Arc::new(FakeVerifier::with_delay(Duration::from_millis(100)));
    let engine = harness.engine(
        GcMode::Execute,
        7,
        &[],
        Some(verifier as Arc<dyn ReferenceVerifier>),
    );

    let result = engine
        .run_cycle(Some(Duration::from_millis(150)))
        .await
        .unwrap();

    assert_eq!(result.status, CycleStatus::Cancelled);
    assert!(result.deleted_count < 30);

    // The operation still closed with counters.
    let operation = harness
        .vault
        .get_operation(&result.operation_id)
        .await
        .unwrap()
        .unwrap();
    assert!(operation.finished_at.is_some());
    assert!(operation.counters.unwrap().contains("cancelled"));
}

#[tokio::test]
async fn every_deleted_key_has_a_backup_record() {
    // No key may be absent from the bucket without a matching vault record.
    let harness = Harness::new().await;
    for i in 0..25 {
        harness.put_aged(&format!("data/{i}"), format!("payload {i}").as_bytes(), 30);
    }

    let engine = harness.engine(GcMode::Execute, 7, &[], None);
    let result = engine.run_cycle(None).await.unwrap();
    assert_eq!(result.deleted_count, 25);

    let records = harness
        .vault
        .lookup_by_operation(&result.operation_id, true)
        .await
        .unwrap();
    assert_eq!(records.len(), 25);
    for record in records {
        assert!(harness.blobs.exists(&record.blob_path).await.unwrap());
        let stored = harness.blobs.read(&record.blob_path).await.unwrap();
        let codec = Codec::from_str(&record.codec).unwrap();
        let original = decompress(codec, &stored).await.unwrap();
        assert_eq!(
            ContentHash::compute(&original).to_hex(),
            record.content_hash
        );
    }
}

#[tokio::test]
async fn cycle_counters_are_persisted_on_the_operation() {
    let harness = Harness::new().await;
    seed_orphan_scenario(&harness).await;

    let engine = harness.engine(GcMode::Execute, 7, &[], None);
    let result = engine.run_cycle(None).await.unwrap();

    let operation = harness
        .vault
        .get_operation(&result.operation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(operation.mode, "execute");
    assert!(operation.finished_at.is_some());
    assert!(operation.error.is_none());

    let counters: serde_json::Value =
        serde_json::from_str(operation.counters.as_deref().unwrap()).unwrap();
    assert_eq!(counters["deleted_count"], 1);
    assert_eq!(counters["total_scanned"], 2);
}
