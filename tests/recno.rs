//! Record-number databases.

use burrowdb::{DbConfig, Env, EnvConfig, MatchMode};
use tempfile::tempdir;

#[test]
fn append_assigns_sequential_numbers() {
    let dir = tempdir().unwrap();
    let env = Env::create(dir.path().join("recno.burrow"), EnvConfig::default()).unwrap();
    let db = env.create_db(1, DbConfig::recno()).unwrap();

    let txn = env.begin().unwrap();
    assert_eq!(db.append(&txn, b"first").unwrap(), 1);
    assert_eq!(db.append(&txn, b"second").unwrap(), 2);

    // keys are 8-byte record numbers
    let (key, record) = db
        .find_entry(&txn, &1u64.to_le_bytes(), MatchMode::Exact)
        .unwrap();
    assert_eq!(key.len(), 8);
    assert_eq!(record, b"first");
    let (key, record) = db
        .find_entry(&txn, &2u64.to_le_bytes(), MatchMode::Exact)
        .unwrap();
    assert_eq!(key.len(), 8);
    assert_eq!(record, b"second");
}

#[test]
fn recno_counter_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("recno.burrow");

    {
        let env = Env::create(&path, EnvConfig::default()).unwrap();
        let db = env.create_db(1, DbConfig::recno()).unwrap();
        let txn = env.begin().unwrap();
        assert_eq!(db.append(&txn, b"one").unwrap(), 1);
        assert_eq!(db.append(&txn, b"two").unwrap(), 2);
        txn.commit().unwrap();
        env.flush().unwrap();
    }

    let env = Env::open(&path, None).unwrap();
    let db = env.open_db(1).unwrap();
    let txn = env.begin().unwrap();
    assert_eq!(db.append(&txn, b"three").unwrap(), 3);
    assert_eq!(
        db.find(&txn, &1u64.to_le_bytes(), MatchMode::Exact).unwrap(),
        b"one"
    );
}

#[test]
fn recno_scans_in_numeric_order() {
    let dir = tempdir().unwrap();
    let env = Env::create(dir.path().join("recno.burrow"), EnvConfig::default()).unwrap();
    let db = env.create_db(1, DbConfig::recno()).unwrap();

    let txn = env.begin().unwrap();
    for i in 1..=300u64 {
        let assigned = db.append(&txn, format!("row{i}").as_bytes()).unwrap();
        assert_eq!(assigned, i);
    }
    txn.commit().unwrap();
    env.flush().unwrap();
    env.check_integrity().unwrap();

    let txn = env.begin().unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    let mut expected = 1u64;
    let mut key = cursor.move_to(burrowdb::CursorDir::First).unwrap();
    loop {
        assert_eq!(u64::from_le_bytes(key.clone().try_into().unwrap()), expected);
        expected += 1;
        match cursor.move_to(burrowdb::CursorDir::Next) {
            Ok(next) => key = next,
            Err(burrowdb::Error::KeyNotFound) => break,
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert_eq!(expected, 301);
}

#[test]
fn append_rejected_on_byte_key_database() {
    let dir = tempdir().unwrap();
    let env = Env::create(dir.path().join("plain.burrow"), EnvConfig::default()).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let txn = env.begin().unwrap();
    assert!(db.append(&txn, b"rec").is_err());
}
