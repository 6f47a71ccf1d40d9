//! Merged cursor traversal across the B-tree and transaction sides.

use burrowdb::{CursorDir, DbConfig, Env, EnvConfig, Error, InsertMode, MatchMode};
use tempfile::tempdir;

fn env() -> (tempfile::TempDir, Env) {
    let dir = tempdir().unwrap();
    let env = Env::create(dir.path().join("cursor.burrow"), EnvConfig::default()).unwrap();
    (dir, env)
}

#[test]
fn traversal_interleaves_both_sides() {
    let (_dir, env) = env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    // even keys into the B-tree
    let seeder = env.begin().unwrap();
    for i in (0..10u32).step_by(2) {
        let key = format!("key{i}");
        db.insert(&seeder, key.as_bytes(), b"btree", InsertMode::Insert)
            .unwrap();
    }
    seeder.commit().unwrap();
    env.flush().unwrap();

    // odd keys in the reader's transaction
    let txn = env.begin().unwrap();
    for i in (1..10u32).step_by(2) {
        let key = format!("key{i}");
        db.insert(&txn, key.as_bytes(), b"txn", InsertMode::Insert)
            .unwrap();
    }

    let mut cursor = db.cursor(&txn).unwrap();
    let mut keys = Vec::new();
    let mut records = Vec::new();
    let mut key = cursor.move_to(CursorDir::First).unwrap();
    loop {
        keys.push(String::from_utf8(key).unwrap());
        records.push(cursor.record().unwrap());
        match cursor.move_to(CursorDir::Next) {
            Ok(next) => key = next,
            Err(Error::KeyNotFound) => break,
            Err(e) => panic!("unexpected {e}"),
        }
    }

    let expected: Vec<String> = (0..10u32).map(|i| format!("key{i}")).collect();
    assert_eq!(keys, expected);
    for (i, record) in records.iter().enumerate() {
        let want: &[u8] = if i % 2 == 0 { b"btree" } else { b"txn" };
        assert_eq!(record, want, "record of key{i}");
    }
}

#[test]
fn reverse_traversal_matches_forward() {
    let (_dir, env) = env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let seeder = env.begin().unwrap();
    for key in [b"20".as_ref(), b"40", b"60"] {
        db.insert(&seeder, key, key, InsertMode::Insert).unwrap();
    }
    seeder.commit().unwrap();
    env.flush().unwrap();

    let txn = env.begin().unwrap();
    for key in [b"10".as_ref(), b"30", b"50"] {
        db.insert(&txn, key, key, InsertMode::Insert).unwrap();
    }

    let mut cursor = db.cursor(&txn).unwrap();
    let mut forward = Vec::new();
    let mut key = cursor.move_to(CursorDir::First).unwrap();
    loop {
        forward.push(key);
        match cursor.move_to(CursorDir::Next) {
            Ok(next) => key = next,
            Err(_) => break,
        }
    }

    let mut backward = Vec::new();
    let mut key = cursor.move_to(CursorDir::Last).unwrap();
    loop {
        backward.push(key);
        match cursor.move_to(CursorDir::Previous) {
            Ok(next) => key = next,
            Err(_) => break,
        }
    }
    backward.reverse();

    assert_eq!(forward, backward);
    assert_eq!(
        forward,
        vec![
            b"10".to_vec(),
            b"20".to_vec(),
            b"30".to_vec(),
            b"40".to_vec(),
            b"50".to_vec(),
            b"60".to_vec()
        ]
    );
}

#[test]
fn tie_goes_to_the_transaction_side() {
    let (_dir, env) = env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let seeder = env.begin().unwrap();
    db.insert(&seeder, b"key", b"old", InsertMode::Insert).unwrap();
    seeder.commit().unwrap();
    env.flush().unwrap();

    let txn = env.begin().unwrap();
    db.insert(&txn, b"key", b"new", InsertMode::Overwrite).unwrap();

    let mut cursor = db.cursor(&txn).unwrap();
    cursor.move_to(CursorDir::First).unwrap();
    assert_eq!(cursor.key().unwrap(), b"key");
    // the txn side's record wins the tie
    assert_eq!(cursor.record().unwrap(), b"new");
}

#[test]
fn tombstones_are_skipped_in_traversal() {
    let (_dir, env) = env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let seeder = env.begin().unwrap();
    for key in [b"10".as_ref(), b"20", b"30"] {
        db.insert(&seeder, key, key, InsertMode::Insert).unwrap();
    }
    seeder.commit().unwrap();
    env.flush().unwrap();

    let txn = env.begin().unwrap();
    db.erase(&txn, b"20").unwrap();

    let mut cursor = db.cursor(&txn).unwrap();
    let first = cursor.move_to(CursorDir::First).unwrap();
    assert_eq!(first, b"10");
    let second = cursor.move_to(CursorDir::Next).unwrap();
    assert_eq!(second, b"30");
    assert!(matches!(
        cursor.move_to(CursorDir::Next),
        Err(Error::KeyNotFound)
    ));

    // erasing every key empties the merged view
    db.erase(&txn, b"10").unwrap();
    db.erase(&txn, b"30").unwrap();
    assert!(matches!(
        cursor.move_to(CursorDir::First),
        Err(Error::KeyNotFound)
    ));
}

#[test]
fn cursor_find_positions_for_further_movement() {
    let (_dir, env) = env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let txn = env.begin().unwrap();
    for key in [b"10".as_ref(), b"20", b"30", b"40"] {
        db.insert(&txn, key, key, InsertMode::Insert).unwrap();
    }

    let mut cursor = db.cursor(&txn).unwrap();
    let key = cursor.find(b"25", MatchMode::Gt).unwrap();
    assert_eq!(key, b"30");
    assert_eq!(cursor.move_to(CursorDir::Next).unwrap(), b"40");

    let key = cursor.find(b"25", MatchMode::Lt).unwrap();
    assert_eq!(key, b"20");
    assert_eq!(cursor.move_to(CursorDir::Previous).unwrap(), b"10");
}

#[test]
fn nil_cursor_movement_errors() {
    let (_dir, env) = env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let txn = env.begin().unwrap();
    let mut cursor = db.cursor(&txn).unwrap();

    assert!(matches!(cursor.key(), Err(Error::CursorIsNil)));
    assert!(matches!(cursor.record(), Err(Error::CursorIsNil)));
    assert!(matches!(
        cursor.move_to(CursorDir::Next),
        Err(Error::CursorIsNil)
    ));
}

#[test]
fn flush_uncouples_cursors_transparently() {
    let (_dir, env) = env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    // an old active transaction keeps the writer's commit buffered
    let blocker = env.begin().unwrap();

    let writer = env.begin().unwrap();
    db.insert(&writer, b"key", b"record", InsertMode::Insert)
        .unwrap();
    writer.commit().unwrap();

    // a reader's cursor couples to the committed-but-unflushed op
    let reader = env.begin().unwrap();
    let mut cursor = db.cursor(&reader).unwrap();
    let key = cursor.find(b"key", MatchMode::Exact).unwrap();
    assert_eq!(key, b"key");
    assert_eq!(cursor.record().unwrap(), b"record");

    // finishing the blocker flushes the op into the B-tree and uncouples
    // the cursor, which keeps a key copy and re-resolves through the tree
    blocker.commit().unwrap();
    env.flush().unwrap();

    assert_eq!(cursor.key().unwrap(), b"key");
    assert_eq!(cursor.record().unwrap(), b"record");

    cursor.close();
    reader.commit().unwrap();
}

#[test]
fn cursor_sees_writes_made_after_positioning() {
    let (_dir, env) = env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let txn = env.begin().unwrap();
    db.insert(&txn, b"10", b"a", InsertMode::Insert).unwrap();
    db.insert(&txn, b"30", b"c", InsertMode::Insert).unwrap();

    let mut cursor = db.cursor(&txn).unwrap();
    cursor.move_to(CursorDir::First).unwrap();

    // a key inserted between the position and the rest shows up
    db.insert(&txn, b"20", b"b", InsertMode::Insert).unwrap();
    assert_eq!(cursor.move_to(CursorDir::Next).unwrap(), b"20");
    assert_eq!(cursor.move_to(CursorDir::Next).unwrap(), b"30");
}
