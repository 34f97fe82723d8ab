//! Crash and recovery scenarios. A "crash" is dropping the engine without
//! `shutdown()`: the log drains (as the flush daemon would have) but no
//! buffer-pool page reaches disk, so redo and undo have real work to do.

mod common;

use serial_test::serial;
use shale::errors::EngineError;
use shale::failpoint;
use shale::{StorageEngine, TableHeap, Tuple};
use tempfile::tempdir;

fn open_heap(engine: &StorageEngine, first_page_id: shale::PageId) -> TableHeap {
    TableHeap::open(
        engine.buffer_pool.clone(),
        engine.lock_manager.clone(),
        engine.log_manager.clone(),
        first_page_id,
    )
}

fn create_heap(engine: &StorageEngine, txn: &mut shale::Transaction) -> TableHeap {
    TableHeap::create(
        engine.buffer_pool.clone(),
        engine.lock_manager.clone(),
        engine.log_manager.clone(),
        txn,
    )
    .unwrap()
}

#[test]
fn committed_insert_survives_a_crash() {
    let dir = tempdir().unwrap();
    let tuple = common::random_tuple();

    let (first_page_id, rid) = {
        let engine = common::boot(dir.path());
        let mut txn = engine.transaction_manager.begin().unwrap();
        let heap = create_heap(&engine, &mut txn);
        let rid = heap.insert_tuple(&tuple, &mut txn).unwrap();
        engine.transaction_manager.commit(&mut txn).unwrap();
        (heap.first_page_id(), rid)
        // Crash: dropped without shutdown, dirty pages are lost.
    };

    let engine = common::boot(dir.path());
    let heap = open_heap(&engine, first_page_id);
    let recovered = heap.get_tuple(rid, None).unwrap();
    assert_eq!(recovered, tuple);
}

#[test]
fn uncommitted_insert_is_rolled_back() {
    let dir = tempdir().unwrap();

    let (first_page_id, rid) = {
        let engine = common::boot(dir.path());
        let mut setup = engine.transaction_manager.begin().unwrap();
        let heap = create_heap(&engine, &mut setup);
        engine.transaction_manager.commit(&mut setup).unwrap();

        let mut txn = engine.transaction_manager.begin().unwrap();
        let rid = heap
            .insert_tuple(&common::random_tuple(), &mut txn)
            .unwrap();
        // No commit: the transaction is a loser.
        (heap.first_page_id(), rid)
    };

    let engine = common::boot(dir.path());
    let heap = open_heap(&engine, first_page_id);
    assert!(matches!(
        heap.get_tuple(rid, None),
        Err(EngineError::NotFound)
    ));
}

#[test]
fn uncommitted_delete_is_rolled_back() {
    let dir = tempdir().unwrap();
    let tuple = common::random_tuple();

    let (first_page_id, rid) = {
        let engine = common::boot(dir.path());
        let mut t1 = engine.transaction_manager.begin().unwrap();
        let heap = create_heap(&engine, &mut t1);
        let rid = heap.insert_tuple(&tuple, &mut t1).unwrap();
        engine.transaction_manager.commit(&mut t1).unwrap();

        let mut t2 = engine.transaction_manager.begin().unwrap();
        heap.mark_delete(rid, &mut t2).unwrap();
        heap.apply_delete(rid, &mut t2).unwrap();
        // Crash before t2 commits.
        (heap.first_page_id(), rid)
    };

    let engine = common::boot(dir.path());
    let heap = open_heap(&engine, first_page_id);
    let recovered = heap.get_tuple(rid, None).unwrap();
    assert_eq!(recovered, tuple);
}

#[test]
fn committed_delete_stays_deleted() {
    let dir = tempdir().unwrap();

    let (first_page_id, rid) = {
        let engine = common::boot(dir.path());
        let mut t1 = engine.transaction_manager.begin().unwrap();
        let heap = create_heap(&engine, &mut t1);
        let rid = heap
            .insert_tuple(&common::random_tuple(), &mut t1)
            .unwrap();
        engine.transaction_manager.commit(&mut t1).unwrap();

        let mut t2 = engine.transaction_manager.begin().unwrap();
        heap.mark_delete(rid, &mut t2).unwrap();
        heap.apply_delete(rid, &mut t2).unwrap();
        engine.transaction_manager.commit(&mut t2).unwrap();
        (heap.first_page_id(), rid)
    };

    let engine = common::boot(dir.path());
    let heap = open_heap(&engine, first_page_id);
    assert!(matches!(
        heap.get_tuple(rid, None),
        Err(EngineError::NotFound)
    ));
}

#[test]
fn aborted_update_is_invisible_after_restart() {
    let dir = tempdir().unwrap();
    let original = common::random_tuple();

    let (first_page_id, rid) = {
        let engine = common::boot(dir.path());
        let mut t1 = engine.transaction_manager.begin().unwrap();
        let heap = create_heap(&engine, &mut t1);
        let rid = heap.insert_tuple(&original, &mut t1).unwrap();
        engine.transaction_manager.commit(&mut t1).unwrap();

        let mut t2 = engine.transaction_manager.begin().unwrap();
        heap.update_tuple(rid, &Tuple::new(b"scribbled over".to_vec()), &mut t2)
            .unwrap();
        engine.transaction_manager.abort(&mut t2).unwrap();

        // The abort already restored the image in memory.
        assert_eq!(heap.get_tuple(rid, None).unwrap(), original);
        (heap.first_page_id(), rid)
    };

    // After the crash, redo replays both the update and its compensation.
    let engine = common::boot(dir.path());
    let heap = open_heap(&engine, first_page_id);
    assert_eq!(heap.get_tuple(rid, None).unwrap(), original);
}

#[test]
fn interleaved_winners_and_losers() {
    let dir = tempdir().unwrap();

    let (first_page_id, committed, lost) = {
        let engine = common::boot(dir.path());
        let mut setup = engine.transaction_manager.begin().unwrap();
        let heap = create_heap(&engine, &mut setup);
        engine.transaction_manager.commit(&mut setup).unwrap();

        let mut winner = engine.transaction_manager.begin().unwrap();
        let mut loser = engine.transaction_manager.begin().unwrap();

        let mut committed = Vec::new();
        let mut lost = Vec::new();
        for i in 0..10u8 {
            committed.push((
                heap.insert_tuple(&Tuple::new(vec![i; 20]), &mut winner).unwrap(),
                vec![i; 20],
            ));
            lost.push(
                heap.insert_tuple(&Tuple::new(vec![0xf0 | (i & 0x0f); 20]), &mut loser)
                    .unwrap(),
            );
        }
        engine.transaction_manager.commit(&mut winner).unwrap();
        // The loser never commits.
        (heap.first_page_id(), committed, lost)
    };

    let engine = common::boot(dir.path());
    let heap = open_heap(&engine, first_page_id);
    for (rid, bytes) in committed {
        assert_eq!(heap.get_tuple(rid, None).unwrap().as_slice(), &bytes[..]);
    }
    for rid in lost {
        assert!(matches!(
            heap.get_tuple(rid, None),
            Err(EngineError::NotFound)
        ));
    }
}

#[test]
fn recovery_survives_repeated_crashes() {
    let dir = tempdir().unwrap();
    let tuple = common::random_tuple();

    let (first_page_id, rid) = {
        let engine = common::boot(dir.path());
        let mut txn = engine.transaction_manager.begin().unwrap();
        let heap = create_heap(&engine, &mut txn);
        let rid = heap.insert_tuple(&tuple, &mut txn).unwrap();
        engine.transaction_manager.commit(&mut txn).unwrap();

        let mut loser = engine.transaction_manager.begin().unwrap();
        heap.mark_delete(rid, &mut loser).unwrap();
        (heap.first_page_id(), rid)
    };

    // Crash, recover, crash again immediately, recover again.
    for _ in 0..3 {
        let engine = common::boot(dir.path());
        let heap = open_heap(&engine, first_page_id);
        assert_eq!(heap.get_tuple(rid, None).unwrap(), tuple);
    }
}

#[test]
fn writes_after_recovery_are_recoverable_too() {
    let dir = tempdir().unwrap();
    let first = common::random_tuple();
    let second = common::random_tuple();

    let (first_page_id, rid1) = {
        let engine = common::boot(dir.path());
        let mut txn = engine.transaction_manager.begin().unwrap();
        let heap = create_heap(&engine, &mut txn);
        let rid = heap.insert_tuple(&first, &mut txn).unwrap();
        engine.transaction_manager.commit(&mut txn).unwrap();
        (heap.first_page_id(), rid)
    };

    // Recover once, write more, crash again.
    let rid2 = {
        let engine = common::boot(dir.path());
        let heap = open_heap(&engine, first_page_id);
        let mut txn = engine.transaction_manager.begin().unwrap();
        let rid2 = heap.insert_tuple(&second, &mut txn).unwrap();
        engine.transaction_manager.commit(&mut txn).unwrap();
        rid2
    };

    let engine = common::boot(dir.path());
    let heap = open_heap(&engine, first_page_id);
    assert_eq!(heap.get_tuple(rid1, None).unwrap(), first);
    assert_eq!(heap.get_tuple(rid2, None).unwrap(), second);
}

#[test]
#[serial]
fn failed_commit_leaves_no_trace() {
    let dir = tempdir().unwrap();

    let (first_page_id, rid) = {
        let engine = common::boot(dir.path());
        let mut setup = engine.transaction_manager.begin().unwrap();
        let heap = create_heap(&engine, &mut setup);
        engine.transaction_manager.commit(&mut setup).unwrap();

        let mut txn = engine.transaction_manager.begin().unwrap();
        let rid = heap
            .insert_tuple(&common::random_tuple(), &mut txn)
            .unwrap();

        failpoint::clear();
        failpoint::enable("transaction.commit.before_log");
        let result = engine.transaction_manager.commit(&mut txn);
        failpoint::clear();
        assert!(result.is_err(), "commit must fail at the failpoint");

        (heap.first_page_id(), rid)
        // Crash with the commit never logged.
    };

    let engine = common::boot(dir.path());
    let heap = open_heap(&engine, first_page_id);
    assert!(matches!(
        heap.get_tuple(rid, None),
        Err(EngineError::NotFound)
    ));
}

#[test]
fn clean_shutdown_then_restart_needs_no_redo() {
    let dir = tempdir().unwrap();
    let tuple = common::random_tuple();

    let (first_page_id, rid) = {
        let engine = common::boot(dir.path());
        let mut txn = engine.transaction_manager.begin().unwrap();
        let heap = create_heap(&engine, &mut txn);
        let rid = heap.insert_tuple(&tuple, &mut txn).unwrap();
        engine.transaction_manager.commit(&mut txn).unwrap();
        engine.shutdown().unwrap();
        (heap.first_page_id(), rid)
    };

    let engine = common::boot(dir.path());
    assert_eq!(engine.disk.log_len().unwrap(), 0);
    let heap = open_heap(&engine, first_page_id);
    assert_eq!(heap.get_tuple(rid, None).unwrap(), tuple);
}
