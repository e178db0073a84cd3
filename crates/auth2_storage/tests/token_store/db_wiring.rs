#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use auth2_contracts::token::{TokenAlg, TokenId};
use auth2_storage::token_store::{StorageError, TokenRecordInput, TokenStore};

fn migrated_memory_store() -> TokenStore {
    let mut s = TokenStore::new_in_memory();
    s.run_migration().unwrap();
    s
}

fn input(account: &str, service: Option<&str>) -> TokenRecordInput {
    TokenRecordInput {
        account: account.to_string(),
        service: service.map(ToString::to_string),
        sealed_secret: "c2VhbGVkLXNlY3JldC1ieXRlcw==".to_string(),
        algorithm: TokenAlg::Sha1,
        digits: 6,
        period: 30,
    }
}

fn temp_db(name: &str) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir()
        .join(format!("auth2-store-test-{name}-{suffix}"))
        .join("database.json")
}

#[test]
fn at_store_db_01_ids_are_monotonic_and_list_is_ordered() {
    let mut s = migrated_memory_store();
    let a = s.insert_token(input("alice", Some("Example"))).unwrap();
    let b = s.insert_token(input("bob", None)).unwrap();
    assert_eq!(a, TokenId(1));
    assert_eq!(b, TokenId(2));

    assert!(s.remove_token(a).unwrap());
    let c = s.insert_token(input("carol", None)).unwrap();
    assert_eq!(c, TokenId(3));

    let ids: Vec<TokenId> = s.list_tokens().unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![TokenId(2), TokenId(3)]);
}

#[test]
fn at_store_db_02_remove_unknown_id_is_false() {
    let mut s = migrated_memory_store();
    assert!(!s.remove_token(TokenId(42)).unwrap());
}

#[test]
fn at_store_db_03_token_row_keeps_parameters() {
    let mut s = migrated_memory_store();
    let mut row = input("alice", Some("Example"));
    row.algorithm = TokenAlg::Sha256;
    row.digits = 8;
    row.period = 60;
    let id = s.insert_token(row).unwrap();

    let rec = s.token(id).unwrap().unwrap();
    let detail = rec.detail();
    assert_eq!(detail.algorithm, TokenAlg::Sha256);
    assert_eq!(detail.digits, 8);
    assert_eq!(detail.period, 60);
    assert_eq!(rec.summary().service.as_deref(), Some("Example"));
    assert!(s.token(TokenId(99)).unwrap().is_none());
}

#[test]
fn at_store_db_04_invalid_rows_rejected() {
    let mut s = migrated_memory_store();
    let mut bad = input("alice", None);
    bad.digits = 5;
    assert!(matches!(
        s.insert_token(bad),
        Err(StorageError::ContractViolation(_))
    ));

    let mut bad = input("alice", None);
    bad.period = 0;
    assert!(matches!(
        s.insert_token(bad),
        Err(StorageError::ContractViolation(_))
    ));

    assert!(matches!(
        s.insert_token(input("   ", None)),
        Err(StorageError::ContractViolation(_))
    ));
    assert!(s.list_tokens().unwrap().is_empty());
}

#[test]
fn at_store_db_05_unmigrated_store_refuses_access() {
    let s = TokenStore::new_in_memory();
    assert!(matches!(
        s.list_tokens(),
        Err(StorageError::MigrationRequired { found: 0, .. })
    ));
}

#[test]
fn at_store_db_06_file_backend_survives_reopen() {
    let path = temp_db("reopen");
    {
        let mut s = TokenStore::open(path.clone());
        s.run_migration().unwrap();
        s.insert_token(input("alice", Some("Example"))).unwrap();
    }
    let mut s = TokenStore::open(path.clone());
    assert!(!s.is_migration_available().unwrap());
    let list = s.list_tokens().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].account, "alice");

    let next = s.insert_token(input("bob", None)).unwrap();
    assert_eq!(next, TokenId(2));

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}
