use super::*;
use buffer::BufferPoolManager;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use storage::DiskManager;

fn open_index(name: &str, frames: usize) -> (Arc<BufferPoolManager>, Fd, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let disk = Arc::new(DiskManager::new(dir.path()));
    disk.create_dir().unwrap();
    disk.create_file(name).unwrap();
    let fd = disk.open_file(name).unwrap();
    let pool = BufferPoolManager::new(frames, disk);
    (pool, fd, dir)
}

#[test]
fn insert_and_get_single_key() {
    let (pool, fd, _dir) = open_index("idx1", 16);
    let schema = vec![SqlType::Int32];
    let idx = BTreeIndex::create(pool, fd, schema).unwrap();

    assert_eq!(idx.get_value(&[Value::Int32(1)]).unwrap(), None);
    let outcome = idx.insert_entry(&[Value::Int32(1)], RecordId::new(0, 0)).unwrap();
    assert_eq!(outcome, InsertOutcome::Inserted);
    assert_eq!(idx.get_value(&[Value::Int32(1)]).unwrap(), Some(RecordId::new(0, 0)));
}

#[test]
fn duplicate_insert_is_rejected() {
    let (pool, fd, _dir) = open_index("idx2", 32);
    let idx = BTreeIndex::create(pool, fd, vec![SqlType::Int32]).unwrap();
    idx.insert_entry(&[Value::Int32(7)], RecordId::new(0, 0)).unwrap();
    let outcome = idx.insert_entry(&[Value::Int32(7)], RecordId::new(1, 1)).unwrap();
    assert_eq!(outcome, InsertOutcome::Duplicate);
}

#[test]
fn bulk_insert_builds_interior_root_and_scans_in_order() {
    let (pool, fd, _dir) = open_index("idx3", 64);
    let idx = BTreeIndex::create(pool, fd, vec![SqlType::Int32]).unwrap();

    for i in 1..1000i32 {
        let outcome = idx.insert_entry(&[Value::Int32(i)], RecordId::new(i as u32, 0)).unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
    }

    for i in 1..1000i32 {
        assert_eq!(idx.get_value(&[Value::Int32(i)]).unwrap(), Some(RecordId::new(i as u32, 0)));
    }

    let start = idx.lower_bound(&[Value::Int32(1)]).unwrap();
    let end = idx.leaf_end().unwrap();
    let collected: Vec<i32> = idx
        .range(start, end)
        .map(|r| r.unwrap())
        .map(|(key, _rid)| match key[0] {
            Value::Int32(v) => v,
            _ => unreachable!(),
        })
        .collect();
    let expected: Vec<i32> = (1..1000).collect();
    assert_eq!(collected, expected);
}

#[test]
fn delete_then_miss() {
    let (pool, fd, _dir) = open_index("idx4", 64);
    let idx = BTreeIndex::create(pool, fd, vec![SqlType::Int32]).unwrap();
    for i in 1..300i32 {
        idx.insert_entry(&[Value::Int32(i)], RecordId::new(i as u32, 0)).unwrap();
    }
    assert!(idx.delete_entry(&[Value::Int32(150)]).unwrap());
    assert_eq!(idx.get_value(&[Value::Int32(150)]).unwrap(), None);
    assert!(!idx.delete_entry(&[Value::Int32(150)]).unwrap());

    for i in 1..300i32 {
        if i != 150 {
            assert_eq!(idx.get_value(&[Value::Int32(i)]).unwrap(), Some(RecordId::new(i as u32, 0)));
        }
    }
}

#[test]
fn delete_all_collapses_to_empty_tree() {
    let (pool, fd, _dir) = open_index("idx5", 64);
    let idx = BTreeIndex::create(pool, fd, vec![SqlType::Int32]).unwrap();
    for i in 1..200i32 {
        idx.insert_entry(&[Value::Int32(i)], RecordId::new(i as u32, 0)).unwrap();
    }
    for i in 1..200i32 {
        assert!(idx.delete_entry(&[Value::Int32(i)]).unwrap());
    }
    for i in 1..200i32 {
        assert_eq!(idx.get_value(&[Value::Int32(i)]).unwrap(), None);
    }
    let start = idx.leaf_begin().unwrap();
    let end = idx.leaf_end().unwrap();
    assert_eq!(start, end);

    let outcome = idx.insert_entry(&[Value::Int32(42)], RecordId::new(0, 0)).unwrap();
    assert_eq!(outcome, InsertOutcome::Inserted);
    assert_eq!(idx.get_value(&[Value::Int32(42)]).unwrap(), Some(RecordId::new(0, 0)));
}

#[test]
fn interleaved_insert_and_delete_preserve_order() {
    let (pool, fd, _dir) = open_index("idx6", 64);
    let idx = BTreeIndex::create(pool, fd, vec![SqlType::Int32]).unwrap();

    for i in (0..500i32).step_by(2) {
        idx.insert_entry(&[Value::Int32(i)], RecordId::new(i as u32, 0)).unwrap();
    }
    for i in (0..500i32).step_by(4) {
        idx.delete_entry(&[Value::Int32(i)]).unwrap();
    }
    for i in (1..500i32).step_by(2) {
        idx.insert_entry(&[Value::Int32(i)], RecordId::new(i as u32, 1)).unwrap();
    }

    let start = idx.leaf_begin().unwrap();
    let end = idx.leaf_end().unwrap();
    let collected: Vec<i32> = idx
        .range(start, end)
        .map(|r| r.unwrap())
        .map(|(key, _)| match key[0] {
            Value::Int32(v) => v,
            _ => unreachable!(),
        })
        .collect();
    let mut sorted = collected.clone();
    sorted.sort();
    assert_eq!(collected, sorted, "range scan must be non-decreasing");

    for &v in &collected {
        assert!(idx.get_value(&[Value::Int32(v)]).unwrap().is_some());
    }
}

#[test]
fn reopen_after_split_preserves_header() {
    let dir = tempfile::tempdir().unwrap();
    let disk = Arc::new(DiskManager::new(dir.path()));
    disk.create_dir().unwrap();
    disk.create_file("idx7").unwrap();
    let fd = disk.open_file("idx7").unwrap();
    let pool = BufferPoolManager::new(32, disk);

    {
        let idx = BTreeIndex::create(pool.clone(), fd, vec![SqlType::Int32]).unwrap();
        for i in 1..400i32 {
            idx.insert_entry(&[Value::Int32(i)], RecordId::new(i as u32, 0)).unwrap();
        }
        pool.flush_all(fd).unwrap();
    }

    let idx = BTreeIndex::open(pool, fd, vec![SqlType::Int32]).unwrap();
    for i in 1..400i32 {
        assert_eq!(idx.get_value(&[Value::Int32(i)]).unwrap(), Some(RecordId::new(i as u32, 0)));
    }
}
