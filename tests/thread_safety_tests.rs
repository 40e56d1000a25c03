use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kiwi::{Bitcask, Config};
use tempfile::tempdir;

fn open(dir: &std::path::Path) -> anyhow::Result<Arc<Bitcask>> {
    let db = Bitcask::open_with(Config {
        dir: dir.to_path_buf(),
        segment_bytes: 4 * 1024,
        compaction_interval: Duration::ZERO,
        ..Config::default()
    })?;
    Ok(Arc::new(db))
}

#[test]
fn test_concurrent_reads() -> anyhow::Result<()> {
    let temp = tempdir()?;
    let db = open(temp.path())?;

    // Setup test data
    db.put(b"key1".to_vec(), b"value1".to_vec())?;

    let mut handles = vec![];
    for _ in 0..10 {
        let db_clone = Arc::clone(&db);
        let handle = thread::spawn(move || {
            let value = db_clone.get(b"key1").unwrap();
            assert_eq!(value, Some(b"value1".to_vec()));
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.join().unwrap();
    }

    Ok(())
}

#[test]
fn test_concurrent_writes() -> anyhow::Result<()> {
    let temp = tempdir()?;
    let db = open(temp.path())?;
    let mut handles = vec![];

    // Create multiple writer threads, enough records to roll several segments
    for t in 0..8 {
        let db_clone = Arc::clone(&db);
        let handle = thread::spawn(move || {
            for i in 0..200 {
                let key = format!("key{}-{}", t, i).into_bytes();
                let value = format!("value{}-{}", t, i).into_bytes();
                db_clone.put(key, value).unwrap();
            }
        });
        handles.push(handle);
    }

    // Wait for all writes to complete
    for handle in handles {
        handle.join().unwrap();
    }

    // Verify all writes succeeded
    assert_eq!(db.size(), 8 * 200);
    for t in 0..8 {
        for i in 0..200 {
            let key = format!("key{}-{}", t, i).into_bytes();
            let expected = format!("value{}-{}", t, i).into_bytes();
            assert_eq!(db.get(&key)?, Some(expected));
        }
    }

    Ok(())
}

#[test]
fn test_concurrent_mixed_operations() -> anyhow::Result<()> {
    let temp = tempdir()?;
    let db = open(temp.path())?;
    let mut handles = vec![];

    // Setup initial data
    db.put(b"shared_key".to_vec(), b"initial_value".to_vec())?;

    // Create threads that do mixed operations
    for i in 0..10 {
        let db_clone = Arc::clone(&db);
        let handle = thread::spawn(move || {
            if i % 2 == 0 {
                // Even threads write
                let key = format!("key{}", i).into_bytes();
                let value = format!("value{}", i).into_bytes();
                db_clone.put(key, value).unwrap();
            } else {
                // Odd threads read
                let _ = db_clone.get(b"shared_key").unwrap();
            }
        });
        handles.push(handle);
    }

    // Wait for all operations to complete
    for handle in handles {
        handle.join().unwrap();
    }

    // Verify writes succeeded
    for i in (0..10).step_by(2) {
        let key = format!("key{}", i).into_bytes();
        let expected = format!("value{}", i).into_bytes();
        assert_eq!(db.get(&key)?, Some(expected));
    }

    Ok(())
}

#[test]
fn test_reads_during_compaction() -> anyhow::Result<()> {
    let temp = tempdir()?;
    let db = open(temp.path())?;

    for round in 0..20u32 {
        for i in 0..50u32 {
            db.put(
                format!("key{}", i).into_bytes(),
                format!("value{}-{}", i, round).into_bytes(),
            )?;
        }
    }

    let compactor = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for _ in 0..5 {
                db.compact().unwrap();
            }
        })
    };

    let mut readers = vec![];
    for _ in 0..4 {
        let db = Arc::clone(&db);
        readers.push(thread::spawn(move || {
            for _ in 0..20 {
                for i in 0..50u32 {
                    let value = db.get(format!("key{}", i).as_bytes()).unwrap();
                    assert_eq!(value, Some(format!("value{}-19", i).into_bytes()));
                }
            }
        }));
    }

    compactor.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    for i in 0..50u32 {
        assert_eq!(
            db.get(format!("key{}", i).as_bytes())?,
            Some(format!("value{}-19", i).into_bytes())
        );
    }
    Ok(())
}

#[test]
fn test_writes_during_compaction_are_not_lost() -> anyhow::Result<()> {
    let temp = tempdir()?;
    let db = open(temp.path())?;

    for i in 0..500u32 {
        db.put(format!("key{}", i % 50).into_bytes(), b"old".to_vec())?;
    }

    let compactor = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for _ in 0..5 {
                db.compact().unwrap();
            }
        })
    };

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for i in 0..50u32 {
                db.put(format!("key{}", i).into_bytes(), b"new".to_vec())
                    .unwrap();
            }
        })
    };

    compactor.join().unwrap();
    writer.join().unwrap();

    for i in 0..50u32 {
        assert_eq!(db.get(format!("key{}", i).as_bytes())?, Some(b"new".to_vec()));
    }
    Ok(())
}
