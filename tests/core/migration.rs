use agent_market::core::error::MarketError;
use agent_market::core::migration::{self, latest_version};
use agent_market::core::sqlite::SqliteStore;
use agent_market::core::store::MarketStore;
use rusqlite::Connection;
use tempfile::tempdir;

fn table_names(conn: &Connection) -> Vec<String> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .unwrap();
    stmt.query_map([], |row| row.get::<_, String>(0))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

#[test]
fn migrating_twice_is_a_no_op() {
    let mut conn = Connection::open_in_memory().unwrap();
    let first = migration::migrate(&mut conn, None).unwrap();
    assert_eq!(first.from_version, 0);
    assert_eq!(first.to_version, latest_version());
    let tables = table_names(&conn);

    let second = migration::migrate(&mut conn, None).unwrap();
    assert!(second.applied.is_empty());
    assert_eq!(second.from_version, latest_version());
    assert_eq!(table_names(&conn), tables);
    assert_eq!(
        migration::applied_versions(&conn).unwrap(),
        (1..=latest_version()).collect::<Vec<_>>()
    );
}

#[test]
fn migrated_schema_has_every_table() {
    let mut conn = Connection::open_in_memory().unwrap();
    migration::migrate(&mut conn, None).unwrap();
    let tables = table_names(&conn);
    for expected in [
        "cabr_scores",
        "distribution_posts",
        "events",
        "foundups",
        "payouts",
        "proofs",
        "schema_migrations",
        "tasks",
        "treasury_proposals",
        "treasury_states",
        "verifications",
    ] {
        assert!(tables.iter().any(|t| t == expected), "missing table {expected}");
    }
}

#[test]
fn file_store_uses_wal_and_reports_version() {
    let tmp = tempdir().unwrap();
    let store = SqliteStore::open(tmp.path().join("market.db")).unwrap();
    assert_eq!(store.journal_mode().unwrap(), "wal");
    assert_eq!(store.schema_version().unwrap(), latest_version());
    assert_eq!(store.backend_name(), "sqlite");
}

#[test]
fn unmigrated_store_steps_to_a_target() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("stepwise.db");
    let store = SqliteStore::open_unmigrated(&path).unwrap();
    assert_eq!(store.schema_version().unwrap(), 0);

    let partial = store.migrate(Some(2)).unwrap();
    assert_eq!(partial.applied, vec![1, 2]);
    assert_eq!(store.schema_version().unwrap(), 2);

    let err = store.migrate(Some(1)).unwrap_err();
    assert!(matches!(err, MarketError::ValidationError(_)));

    let err = store.migrate(Some(latest_version() + 1)).unwrap_err();
    assert!(matches!(err, MarketError::ValidationError(_)));
    assert_eq!(store.schema_version().unwrap(), 2);

    drop(store);
    let reopened = SqliteStore::open(&path).unwrap();
    assert_eq!(reopened.schema_version().unwrap(), latest_version());
}
