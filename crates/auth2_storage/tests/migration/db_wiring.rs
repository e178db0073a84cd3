#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use auth2_contracts::common::SchemaVersion;
use auth2_contracts::token::{TokenAlg, TokenId};
use auth2_storage::token_store::{
    StorageError, TokenRecordInput, TokenStore, CURRENT_SCHEMA_VERSION,
};

const SCHEMA_V1_DOC: &str = r#"{
  "schema_version": 1,
  "next_id": 3,
  "tokens": [
    { "id": 1, "account": "alice", "service": "Example", "secret": "c2VhbGVk" },
    { "id": 2, "account": "bob", "service": null, "secret": "c2VhbGVk", "digits": 8 }
  ]
}"#;

fn temp_db(name: &str) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir()
        .join(format!("auth2-migration-test-{name}-{suffix}"))
        .join("database.json")
}

#[test]
fn at_migration_db_01_fresh_store_needs_migration() {
    let mut s = TokenStore::new_in_memory();
    assert_eq!(s.schema_version().unwrap(), SchemaVersion(0));
    assert!(s.is_migration_available().unwrap());

    assert_eq!(s.run_migration().unwrap(), CURRENT_SCHEMA_VERSION);
    assert!(!s.is_migration_available().unwrap());
    assert!(s.list_tokens().unwrap().is_empty());
}

#[test]
fn at_migration_db_02_rerun_is_noop() {
    let mut s = TokenStore::new_in_memory();
    s.run_migration().unwrap();
    let id = s
        .insert_token(TokenRecordInput {
            account: "alice".to_string(),
            service: None,
            sealed_secret: "c2VhbGVk".to_string(),
            algorithm: TokenAlg::Sha1,
            digits: 6,
            period: 30,
        })
        .unwrap();
    assert_eq!(s.run_migration().unwrap(), CURRENT_SCHEMA_VERSION);
    assert!(s.token(id).unwrap().is_some());
}

#[test]
fn at_migration_db_03_v1_rows_backfilled_with_defaults() {
    let mut s = TokenStore::from_raw_document(SCHEMA_V1_DOC);
    assert_eq!(s.schema_version().unwrap(), SchemaVersion(1));
    assert!(matches!(
        s.list_tokens(),
        Err(StorageError::MigrationRequired { found: 1, expected: 2 })
    ));

    s.run_migration().unwrap();
    let alice = s.token(TokenId(1)).unwrap().unwrap();
    assert_eq!(alice.digits, 6);
    assert_eq!(alice.period, 30);
    assert_eq!(alice.algorithm, TokenAlg::Sha1);

    // Columns already present are left alone.
    let bob = s.token(TokenId(2)).unwrap().unwrap();
    assert_eq!(bob.digits, 8);

    let next = s
        .insert_token(TokenRecordInput {
            account: "carol".to_string(),
            service: None,
            sealed_secret: "c2VhbGVk".to_string(),
            algorithm: TokenAlg::Sha1,
            digits: 6,
            period: 30,
        })
        .unwrap();
    assert_eq!(next, TokenId(3));
}

#[test]
fn at_migration_db_04_newer_schema_is_mismatch() {
    let mut s = TokenStore::from_raw_document(r#"{"schema_version": 9, "next_id": 1, "tokens": []}"#);
    assert!(matches!(
        s.is_migration_available(),
        Err(StorageError::SchemaMismatch { found: 9, expected: 2 })
    ));
    assert!(matches!(
        s.run_migration(),
        Err(StorageError::SchemaMismatch { .. })
    ));
}

#[test]
fn at_migration_db_05_reset_then_migrate_recovers_broken_store() {
    let path = temp_db("reset");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{ this is not json").unwrap();

    let mut s = TokenStore::open(path.clone());
    assert!(matches!(
        s.is_migration_available(),
        Err(StorageError::Json(_))
    ));

    s.reset().unwrap();
    assert!(s.is_migration_available().unwrap());
    s.run_migration().unwrap();
    assert!(s.list_tokens().unwrap().is_empty());

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn at_migration_db_06_reset_drops_all_tokens() {
    let mut s = TokenStore::from_raw_document(SCHEMA_V1_DOC);
    s.run_migration().unwrap();
    assert_eq!(s.list_tokens().unwrap().len(), 2);

    s.reset().unwrap();
    assert_eq!(s.schema_version().unwrap(), SchemaVersion(0));
    s.run_migration().unwrap();
    assert!(s.list_tokens().unwrap().is_empty());
}
