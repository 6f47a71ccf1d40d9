//! Transaction lifecycle: visibility, commit/abort, flush ordering.

use burrowdb::{CursorDir, DbConfig, Env, EnvConfig, Error, InsertMode, MatchMode};
use tempfile::tempdir;

fn env() -> (tempfile::TempDir, Env) {
    let dir = tempdir().unwrap();
    let env = Env::create(dir.path().join("txn.burrow"), EnvConfig::default()).unwrap();
    (dir, env)
}

#[test]
fn uncommitted_writes_are_read_your_own() {
    let (_dir, env) = env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let writer = env.begin().unwrap();
    db.insert(&writer, b"key", b"value", InsertMode::Insert)
        .unwrap();

    // the writer sees its own op
    assert_eq!(db.find(&writer, b"key", MatchMode::Exact).unwrap(), b"value");

    // an unrelated active transaction does not
    let reader = env.begin().unwrap();
    assert!(matches!(
        db.find(&reader, b"key", MatchMode::Exact),
        Err(Error::KeyNotFound)
    ));

    writer.commit().unwrap();
    // committed work is visible to everyone
    assert_eq!(db.find(&reader, b"key", MatchMode::Exact).unwrap(), b"value");
}

#[test]
fn aborted_writes_disappear() {
    let (_dir, env) = env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let writer = env.begin().unwrap();
    db.insert(&writer, b"gone", b"soon", InsertMode::Insert)
        .unwrap();
    writer.abort().unwrap();

    let reader = env.begin().unwrap();
    assert!(matches!(
        db.find(&reader, b"gone", MatchMode::Exact),
        Err(Error::KeyNotFound)
    ));
}

#[test]
fn drop_without_commit_aborts() {
    let (_dir, env) = env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    {
        let writer = env.begin().unwrap();
        db.insert(&writer, b"dropped", b"x", InsertMode::Insert)
            .unwrap();
    }

    let reader = env.begin().unwrap();
    assert!(db.find(&reader, b"dropped", MatchMode::Exact).is_err());
}

#[test]
fn commit_fails_while_cursor_open() {
    let (_dir, env) = env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let txn = env.begin().unwrap();
    db.insert(&txn, b"key", b"value", InsertMode::Insert).unwrap();

    let cursor = db.cursor(&txn).unwrap();
    assert!(matches!(txn.commit(), Err(Error::CursorStillOpen(1))));
    assert!(matches!(txn.abort(), Err(Error::CursorStillOpen(1))));

    cursor.close();
    txn.commit().unwrap();

    let reader = env.begin().unwrap();
    assert_eq!(db.find(&reader, b"key", MatchMode::Exact).unwrap(), b"value");
}

#[test]
fn committed_behind_active_stays_buffered_but_visible() {
    let (_dir, env) = env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    // an older active transaction blocks the flush of younger commits
    let blocker = env.begin().unwrap();

    let writer = env.begin().unwrap();
    db.insert(&writer, b"buffered", b"record", InsertMode::Insert)
        .unwrap();
    writer.commit().unwrap();

    // committed-but-unflushed work is visible to new readers
    let reader = env.begin().unwrap();
    assert_eq!(
        db.find(&reader, b"buffered", MatchMode::Exact).unwrap(),
        b"record"
    );
    drop(reader);

    // once the blocker finishes, the flush pass promotes the ops; the
    // view must not change
    blocker.commit().unwrap();
    env.flush().unwrap();
    env.check_integrity().unwrap();

    let reader = env.begin().unwrap();
    assert_eq!(
        db.find(&reader, b"buffered", MatchMode::Exact).unwrap(),
        b"record"
    );
}

#[test]
fn merged_view_equals_post_flush_view() {
    let (_dir, env) = env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let blocker = env.begin().unwrap();
    let writer = env.begin().unwrap();
    for i in 0..100u32 {
        let key = format!("key{i:03}");
        db.insert(&writer, key.as_bytes(), key.as_bytes(), InsertMode::Insert)
            .unwrap();
    }
    db.erase(&writer, b"key050").unwrap();
    writer.commit().unwrap();

    // scan the merged (unflushed) view
    let scan = |env: &Env| -> Vec<Vec<u8>> {
        let txn = env.begin().unwrap();
        let mut cursor = db.cursor(&txn).unwrap();
        let mut keys = Vec::new();
        let mut key = match cursor.move_to(CursorDir::First) {
            Ok(key) => key,
            Err(_) => return keys,
        };
        loop {
            keys.push(key.clone());
            match cursor.move_to(CursorDir::Next) {
                Ok(next) => key = next,
                Err(_) => break,
            }
        }
        keys
    };

    let merged = scan(&env);
    assert_eq!(merged.len(), 99);
    assert!(!merged.contains(&b"key050".to_vec()));

    blocker.commit().unwrap();
    env.flush().unwrap();

    let flushed = scan(&env);
    assert_eq!(merged, flushed);
}

#[test]
fn overwrite_chain_resolves_to_newest() {
    let (_dir, env) = env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let txn = env.begin().unwrap();
    db.insert(&txn, b"k", b"v1", InsertMode::Insert).unwrap();
    db.insert(&txn, b"k", b"v2", InsertMode::Overwrite).unwrap();
    db.insert(&txn, b"k", b"v3", InsertMode::Overwrite).unwrap();

    assert_eq!(db.find(&txn, b"k", MatchMode::Exact).unwrap(), b"v3");

    txn.commit().unwrap();
    env.flush().unwrap();

    let reader = env.begin().unwrap();
    assert_eq!(db.find(&reader, b"k", MatchMode::Exact).unwrap(), b"v3");
}

#[test]
fn erase_of_flushed_key_through_overlay() {
    let (_dir, env) = env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let writer = env.begin().unwrap();
    db.insert(&writer, b"key", b"value", InsertMode::Insert)
        .unwrap();
    writer.commit().unwrap();
    env.flush().unwrap();

    let eraser = env.begin().unwrap();
    db.erase(&eraser, b"key").unwrap();
    // tombstone hides the B-tree entry for the eraser
    assert!(db.find(&eraser, b"key", MatchMode::Exact).is_err());

    // but not for a concurrent reader
    let reader = env.begin().unwrap();
    assert_eq!(db.find(&reader, b"key", MatchMode::Exact).unwrap(), b"value");
    drop(reader);

    eraser.commit().unwrap();
    env.flush().unwrap();

    let reader = env.begin().unwrap();
    assert!(db.find(&reader, b"key", MatchMode::Exact).is_err());
}

#[test]
fn transaction_ids_are_monotonic_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("txn.burrow");

    let first_id;
    {
        let env = Env::create(&path, EnvConfig::default()).unwrap();
        env.create_db(1, DbConfig::default()).unwrap();
        let txn = env.begin().unwrap();
        first_id = txn.id();
        txn.commit().unwrap();
        env.flush().unwrap();
    }

    let env = Env::open(&path, None).unwrap();
    let txn = env.begin().unwrap();
    assert!(txn.id() > first_id);
}
