use serial_test::serial;
use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use stratum::{LockMode, StratumError};

mod common;

#[test]
#[serial]
fn test_shared_readers_proceed_together() {
    let fixture = common::setup(common::config(8, 50), 1);
    let db = &fixture.db;
    let page = fixture.page(0);
    let readers = 4;
    // Every reader must hold its lock at the barrier; a blocked reader
    // would hang the test.
    let barrier = Barrier::new(readers);

    thread::scope(|s| {
        for _ in 0..readers {
            s.spawn(|| {
                let tx = db.begin();
                db.pool().get_page(tx, page, LockMode::Shared).unwrap();
                barrier.wait();
                assert_eq!(db.pool().lock_manager().holders(page).len(), readers);
                barrier.wait();
                db.commit(tx).unwrap();
            });
        }
    });
    assert!(db.pool().lock_manager().holders(page).is_empty());
}

#[test]
#[serial]
fn test_writer_waits_for_reader() {
    let fixture = common::setup(common::config(8, 50), 1);
    let db = &fixture.db;
    let page = fixture.page(0);

    let reader = db.begin();
    db.pool().get_page(reader, page, LockMode::Shared).unwrap();

    thread::scope(|s| {
        let writer = s.spawn(|| {
            let tx = db.begin();
            db.pool()
                .insert_tuple(tx, fixture.table, &common::row(1))
                .unwrap();
            db.commit(tx).unwrap();
        });

        thread::sleep(Duration::from_millis(200));
        assert!(!writer.is_finished());
        let holders = db.pool().lock_manager().holders(page);
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].tx_id, reader);

        db.commit(reader).unwrap();
        writer.join().unwrap();
    });

    let rows = db
        .run_transaction(|pool, tx| pool.scan_table(tx, fixture.table))
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[test]
#[serial]
fn test_crossed_writers_one_aborts() {
    // Long polls: the first waiter sleeps until the victim's abort wakes it
    let fixture = common::setup(common::config(8, 5_000), 2);
    let db = &fixture.db;
    let (p0, p1) = (fixture.page(0), fixture.page(1));

    let t1 = db.begin();
    let t2 = db.begin();
    db.pool().with_page_mut(t1, p0, |page| page.data_mut()[0] = 1).unwrap();
    db.pool().with_page_mut(t2, p1, |page| page.data_mut()[0] = 1).unwrap();

    thread::scope(|s| {
        let first = s.spawn(|| {
            db.pool().get_page(t1, p1, LockMode::Exclusive)?;
            db.commit(t1)
        });
        thread::sleep(Duration::from_millis(100));
        assert_eq!(db.pool().lock_manager().waiting_on(t1), Some(p1));

        let err = db.pool().get_page(t2, p0, LockMode::Exclusive).unwrap_err();
        assert!(matches!(err, StratumError::DeadlockDetected { tx_id, page_id } if tx_id == t2 && page_id == p0));
        db.abort(t2).unwrap();

        first.join().unwrap().unwrap();
    });

    // t1's change is durable, t2's was rolled back
    let store = db.catalog().table_handle(fixture.table).unwrap();
    assert_eq!(store.read_page(p0).unwrap().data()[0], 1);
    assert_eq!(store.read_page(p1).unwrap().data()[0], 0);
    assert_eq!(db.transactions().active_count(), 0);
}

#[test]
#[serial]
fn test_upgrade_race_deadlock() {
    let fixture = common::setup(common::config(8, 5_000), 1);
    let db = &fixture.db;
    let page = fixture.page(0);

    let t1 = db.begin();
    let t2 = db.begin();
    db.pool().get_page(t1, page, LockMode::Shared).unwrap();
    db.pool().get_page(t2, page, LockMode::Shared).unwrap();

    thread::scope(|s| {
        let first = s.spawn(|| db.pool().get_page(t1, page, LockMode::Exclusive));
        thread::sleep(Duration::from_millis(100));

        let err = db.pool().get_page(t2, page, LockMode::Exclusive).unwrap_err();
        assert!(err.is_deadlock());
        db.abort(t2).unwrap();

        // The survivor upgrades in place once the victim's shared lock goes
        assert!(first.join().unwrap().is_ok());
    });
    let held = db.pool().lock_manager().held_locks(t1, page);
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].mode, LockMode::Exclusive);
    db.commit(t1).unwrap();
}

#[test]
#[serial]
fn test_concurrent_inserts_all_land() {
    let fixture = common::setup(common::config(16, 5), 0);
    let db = &fixture.db;
    let writers = 4;
    let per_writer = 40;

    thread::scope(|s| {
        for writer in 0..writers {
            s.spawn(move || {
                for i in 0..per_writer {
                    let byte = (writer * per_writer + i) as u8;
                    // Writers compete for the same pages; retry deadlock victims
                    loop {
                        let result = db.run_transaction(|pool, tx| {
                            pool.insert_tuple(tx, fixture.table, &common::row(byte))
                        });
                        match result {
                            Ok(_) => break,
                            Err(err) if err.is_transaction_abort() => continue,
                            Err(err) => panic!("insert failed: {err}"),
                        }
                    }
                }
            });
        }
    });

    let rows = db
        .run_transaction(|pool, tx| pool.scan_table(tx, fixture.table))
        .unwrap();
    assert_eq!(rows.len(), writers * per_writer);
    assert!(db.pool().cache_size() <= db.pool().capacity());
}
